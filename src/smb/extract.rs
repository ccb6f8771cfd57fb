//! Field extraction from SMB2 reply frames.
//!
//! Internally everything is typed; the string-keyed, hex-formatted
//! attribute map the CLI prints is rendered only by the `record` methods at
//! the output boundary.

use std::collections::BTreeMap;

use super::ProbeError;

pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xc000_0016;

const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// Negotiated server parameters from an SMB2 NEGOTIATE reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateReply {
    pub status: u32,
    pub security_mode: u16,
    pub dialect: u16,
    pub server_guid: [u8; 16],
    pub capabilities: u32,
    pub hash_alg: Option<u16>,
    pub hash_salt_len: Option<u16>,
    pub cipher: Option<u16>,
}

/// Session state from an SMB2 SESSION_SETUP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupReply {
    pub status: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

/// NTLMSSP CHALLENGE target information dug out of the security blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NtlmChallenge {
    pub target_name: String,
    pub flags: u32,
    pub netbios_computer: Option<String>,
    pub netbios_domain: Option<String>,
    pub dns_computer: Option<String>,
    pub dns_domain: Option<String>,
    pub dns_tree: Option<String>,
    pub timestamp: Option<u64>,
    /// (major, minor, build, ntlm revision)
    pub version: Option<(u8, u8, u16, u8)>,
}

fn le16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}

fn le32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes([
        *buf.get(at)?,
        *buf.get(at + 1)?,
        *buf.get(at + 2)?,
        *buf.get(at + 3)?,
    ]))
}

fn le64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn check_smb2(payload: &[u8], command: u16) -> Result<(), ProbeError> {
    if payload.len() < 64 || payload[0..4] != SMB2_MAGIC {
        return Err(ProbeError::BadReply("not an smb2 frame"));
    }
    if le16(payload, 12) != Some(command) {
        return Err(ProbeError::BadReply("unexpected command"));
    }
    Ok(())
}

impl NegotiateReply {
    /// Parses a NEGOTIATE reply payload (NetBIOS prefix already stripped).
    pub fn parse(payload: &[u8]) -> Result<Self, ProbeError> {
        check_smb2(payload, super::frames::SMB2_COMMAND_NEGOTIATE)?;
        if payload.len() < 128 {
            return Err(ProbeError::BadReply("short negotiate body"));
        }

        let status = le32(payload, 8).unwrap_or_default();
        let security_mode = le16(payload, 66).unwrap_or_default();
        let dialect = le16(payload, 68).unwrap_or_default();
        let context_count = le16(payload, 70).unwrap_or_default();
        let mut server_guid = [0u8; 16];
        server_guid.copy_from_slice(&payload[72..88]);
        let capabilities = le32(payload, 88).unwrap_or_default();
        let context_offset = le32(payload, 124).unwrap_or_default() as usize;

        let mut reply = Self {
            status,
            security_mode,
            dialect,
            server_guid,
            capabilities,
            hash_alg: None,
            hash_salt_len: None,
            cipher: None,
        };

        // Negotiate contexts only exist on 3.1.1.
        if dialect == 0x0311 {
            reply.parse_contexts(payload, context_offset, context_count);
        }
        Ok(reply)
    }

    fn parse_contexts(&mut self, payload: &[u8], mut at: usize, count: u16) {
        for _ in 0..count {
            let (ctx_type, data_len) = match (le16(payload, at), le16(payload, at + 2)) {
                (Some(t), Some(l)) => (t, l as usize),
                _ => return,
            };
            let data = at + 8;
            match ctx_type {
                // Preauth integrity: algorithm count, salt length, algorithms.
                1 => {
                    self.hash_salt_len = le16(payload, data + 2);
                    self.hash_alg = le16(payload, data + 4);
                }
                // Encryption: cipher count, then the server's pick.
                2 => {
                    self.cipher = le16(payload, data + 2);
                }
                _ => {}
            }
            // Contexts are 8-aligned; the pad is not part of DataLength.
            at = data + data_len;
            at += (8 - at % 8) % 8;
        }
    }

    pub fn signing_enabled(&self) -> bool {
        self.security_mode & 0x01 != 0
    }

    pub fn record(&self, attrs: &mut BTreeMap<String, String>) {
        attrs.insert("smb.Status".into(), format!("0x{:08x}", self.status));
        attrs.insert("smb.Dialect".into(), format!("0x{:04x}", self.dialect));
        attrs.insert(
            "smb.Capabilities".into(),
            format!("0x{:08x}", self.capabilities),
        );
        attrs.insert(
            "smb.Signing".into(),
            if self.signing_enabled() { "enabled" } else { "disabled" }.into(),
        );
        attrs.insert("smb.GUID".into(), format_guid(&self.server_guid));
        if let Some(alg) = self.hash_alg {
            attrs.insert("smb.HashAlg".into(), hash_name(alg));
        }
        if let Some(salt_len) = self.hash_salt_len {
            attrs.insert("smb.HashSaltLen".into(), salt_len.to_string());
        }
        if let Some(cipher) = self.cipher {
            attrs.insert("smb.CipherAlg".into(), cipher_name(cipher));
        }
    }
}

impl SessionSetupReply {
    pub fn parse(payload: &[u8]) -> Result<Self, ProbeError> {
        check_smb2(payload, super::frames::SMB2_COMMAND_SESSION_SETUP)?;
        let status = le32(payload, 8).unwrap_or_default();
        let session_id =
            le64(payload, super::frames::SESSION_ID_OFFSET).ok_or(ProbeError::BadReply("no session id"))?;
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&payload[48..64]);
        Ok(Self {
            status,
            session_id,
            signature,
        })
    }

    pub fn signed(&self) -> bool {
        self.signature.iter().any(|&b| b != 0)
    }

    pub fn record(&self, attrs: &mut BTreeMap<String, String>) {
        attrs.insert("smb.Status".into(), format!("0x{:08x}", self.status));
        attrs.insert(
            "smb.SessionID".into(),
            format!("0x{:016x}", self.session_id),
        );
        if self.signed() {
            attrs.insert("smb.Signature".into(), hex::encode(self.signature));
        }
    }
}

impl NtlmChallenge {
    /// Scans a reply for an embedded NTLMSSP CHALLENGE and pulls the target
    /// information pairs. Returns None when no challenge is present.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let sig = payload.windows(8).position(|w| w == b"NTLMSSP\0")?;
        let msg = &payload[sig..];
        if le32(msg, 8) != Some(2) {
            return None;
        }

        let mut challenge = Self {
            flags: le32(msg, 20).unwrap_or_default(),
            ..Self::default()
        };

        let name_len = le16(msg, 12)? as usize;
        let name_offset = le32(msg, 16)? as usize;
        if name_len > 0 {
            challenge.target_name = utf16le(msg.get(name_offset..name_offset + name_len)?);
        }

        // Version block is only present when the flag says so.
        if challenge.flags & 0x0200_0000 != 0 {
            if let Some(v) = msg.get(48..56) {
                challenge.version = Some((v[0], v[1], u16::from_le_bytes([v[2], v[3]]), v[7]));
            }
        }

        let info_len = le16(msg, 40)? as usize;
        let info_offset = le32(msg, 44)? as usize;
        let info = msg.get(info_offset..info_offset + info_len)?;

        let mut at = 0;
        while at + 4 <= info.len() {
            let av_id = le16(info, at)?;
            let av_len = le16(info, at + 2)? as usize;
            if av_id == 0 {
                break;
            }
            let value = info.get(at + 4..at + 4 + av_len)?;
            match av_id {
                1 => challenge.netbios_computer = Some(utf16le(value)),
                2 => challenge.netbios_domain = Some(utf16le(value)),
                3 => challenge.dns_computer = Some(utf16le(value)),
                4 => challenge.dns_domain = Some(utf16le(value)),
                5 => challenge.dns_tree = Some(utf16le(value)),
                7 => challenge.timestamp = le64(value, 0),
                _ => {}
            }
            at += 4 + av_len;
        }

        Some(challenge)
    }

    pub fn record(&self, attrs: &mut BTreeMap<String, String>) {
        if !self.target_name.is_empty() {
            attrs.insert("ntlmssp.TargetName".into(), self.target_name.clone());
        }
        attrs.insert(
            "ntlmssp.NegotiationFlags".into(),
            format!("0x{:08x}", self.flags),
        );
        let fields = [
            ("ntlmssp.NetbiosComputer", &self.netbios_computer),
            ("ntlmssp.NetbiosDomain", &self.netbios_domain),
            ("ntlmssp.DNSComputer", &self.dns_computer),
            ("ntlmssp.DNSDomain", &self.dns_domain),
            ("ntlmssp.DNSTree", &self.dns_tree),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                attrs.insert(key.into(), value.clone());
            }
        }
        if let Some(ts) = self.timestamp {
            attrs.insert("ntlmssp.Timestamp".into(), format!("0x{ts:016x}"));
        }
        if let Some((major, minor, build, revision)) = self.version {
            attrs.insert("ntlmssp.Version".into(), format!("{major}.{minor}.{build}"));
            attrs.insert("ntlmssp.NTLMRevision".into(), revision.to_string());
        }
    }
}

fn utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&guid[0..4]),
        hex::encode(&guid[4..6]),
        hex::encode(&guid[6..8]),
        hex::encode(&guid[8..10]),
        hex::encode(&guid[10..16]),
    )
}

fn cipher_name(cipher: u16) -> String {
    match cipher {
        0x0001 => "aes-128-ccm".into(),
        0x0002 => "aes-128-gcm".into(),
        0x0003 => "aes-256-ccm".into(),
        0x0004 => "aes-256-gcm".into(),
        other => format!("0x{other:04x}"),
    }
}

fn hash_name(alg: u16) -> String {
    match alg {
        0x0001 => "sha512".into(),
        other => format!("0x{other:04x}"),
    }
}
