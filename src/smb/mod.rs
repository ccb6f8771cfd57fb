pub mod extract;
pub mod frames;
pub mod predictor;
pub mod probe;

pub use extract::{NegotiateReply, NtlmChallenge, SessionSetupReply};
pub use predictor::{hex_sequence, CounterPredictor, PredictorError};
pub use probe::{probe, ProbeReport, SMB_PORT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("i/o timeout")]
    Timeout,
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
    #[error("malformed reply: {0}")]
    BadReply(&'static str),
}
