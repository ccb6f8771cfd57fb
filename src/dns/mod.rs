pub mod client;
pub mod message;
pub mod server;
pub mod tsig;

pub use client::{format_line, sense_one, SenseOutcome, EXCHANGE_TIMEOUT};
pub use message::{fqdn, ClientSubnet, DnsError, Header, Message, Question, RData, Record};
pub use server::{handle_query, serve_tcp, serve_udp, ServerConfig, ANSWER_TTL};
pub use tsig::{TsigError, TsigKey};
