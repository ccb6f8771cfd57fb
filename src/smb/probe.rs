//! One TCP connection per probe: SMB1 negotiate, SMB2 negotiate, session
//! setup, collect what the server leaks. The stream is owned here, so every
//! exit path closes it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::extract::{NegotiateReply, NtlmChallenge, SessionSetupReply};
use super::frames::{
    self, NETBIOS_HEADER_LEN, SESSION_FLAG_BINDING, SESSION_ID_OFFSET,
    SESSION_SETUP_FLAGS_OFFSET, SMB2_FLAGS_SIGNED,
};
use super::ProbeError;

pub const SMB_PORT: u16 = 445;
/// Connect and per-frame read/write budget.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one probe learned, typed plus the rendered attribute map.
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub negotiate: Option<NegotiateReply>,
    pub session: Option<SessionSetupReply>,
    pub ntlm: Option<NtlmChallenge>,
}

impl ProbeReport {
    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.session_id)
    }

    pub fn status(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.status)
    }

    pub fn signature(&self) -> Option<String> {
        let session = self.session.as_ref()?;
        if session.signed() {
            Some(hex::encode(session.signature))
        } else {
            None
        }
    }

    pub fn dialect(&self) -> Option<u16> {
        self.negotiate.as_ref().map(|n| n.dialect)
    }

    /// The string-keyed view of everything collected, for display.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if let Some(negotiate) = &self.negotiate {
            negotiate.record(&mut attrs);
        }
        if let Some(ntlm) = &self.ntlm {
            ntlm.record(&mut attrs);
        }
        if let Some(session) = &self.session {
            session.record(&mut attrs);
        }
        attrs
    }
}

/// Runs one probe dialog against `<target>:445`. A `patch_sid` turns it
/// into a session-binding probe: the template is sent with the signed-PDU
/// flag, the binding flag, and the guessed SessionID in place.
pub async fn probe(target: &str, patch_sid: Option<u64>) -> Result<ProbeReport, ProbeError> {
    // Bare hosts get the well-known port; `host:port` targets pass through.
    let addr = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:{SMB_PORT}")
    };
    let mut stream = timeout(READ_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| ProbeError::Timeout)??;

    let mut report = ProbeReport::default();

    frames::send_data(&mut stream, &frames::build_smb1_negotiate(), READ_TIMEOUT).await?;
    frames::read_frame(&mut stream, READ_TIMEOUT).await?;

    frames::send_data(&mut stream, &frames::build_smb2_negotiate(), READ_TIMEOUT).await?;
    // A server that answers garbage here still gets the session setup; the
    // negotiate fields are just absent from the report.
    if let Ok(payload) = frames::read_frame(&mut stream, READ_TIMEOUT).await {
        report.negotiate = NegotiateReply::parse(&payload).ok();
    }

    let mut setup = frames::build_session_setup();
    patch_u16(&mut setup, frames::PROCESS_ID_OFFSET, 0xfeff);
    if let Some(sid) = patch_sid {
        setup[NETBIOS_HEADER_LEN + SESSION_SETUP_FLAGS_OFFSET] = SESSION_FLAG_BINDING;
        patch_u16(&mut setup, frames::HEADER_FLAGS_OFFSET, SMB2_FLAGS_SIGNED);
        setup[NETBIOS_HEADER_LEN + SESSION_ID_OFFSET..NETBIOS_HEADER_LEN + SESSION_ID_OFFSET + 8]
            .copy_from_slice(&sid.to_le_bytes());
    }
    frames::send_data(&mut stream, &setup, READ_TIMEOUT).await?;

    let payload = frames::read_frame(&mut stream, READ_TIMEOUT).await?;
    report.session = SessionSetupReply::parse(&payload).ok();
    report.ntlm = NtlmChallenge::parse(&payload);

    Ok(report)
}

fn patch_u16(framed: &mut [u8], offset: usize, value: u16) {
    framed[NETBIOS_HEADER_LEN + offset..NETBIOS_HEADER_LEN + offset + 2]
        .copy_from_slice(&value.to_le_bytes());
}
