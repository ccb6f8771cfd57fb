use std::net::{IpAddr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;

use crate::obfuscate::{xor_bytes, ObfuscationKeys};

/// Raw tracer payload: `[decode_key:4][ip16 ^ key:16][ts8 ^ key:8]`.
pub const PAYLOAD_LEN: usize = 28;
/// Payload label length on the wire: 2-char prefix + 56 hex digits.
pub const LABEL_LEN: usize = 58;

#[derive(Debug, Error, PartialEq)]
pub enum TracerError {
    #[error("invalid tracer label length ({0})")]
    BadLength(usize),
    #[error("invalid tracer label: {0}")]
    BadHex(#[from] hex::FromHexError),
    #[error("invalid tracer payload length ({0})")]
    BadPayloadLength(usize),
}

/// The decoded contents of a tracer label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerPayload {
    pub decode_key: u32,
    pub ip: IpAddr,
    pub ts_nanos: u64,
}

/// Nanoseconds since the Unix epoch, saturating at zero on clock skew.
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// IPv4 addresses travel in their IPv4-mapped 16-byte form so the payload
/// width is fixed regardless of family.
fn ip_to_16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn ip_from_16(bytes: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Builds the 28-byte payload for `ip` at `ts_nanos` under the 32-bit key.
pub fn encode_payload(ip: IpAddr, ts_nanos: u64, keys: &ObfuscationKeys) -> [u8; PAYLOAD_LEN] {
    let mut out = [0u8; PAYLOAD_LEN];
    out[0..4].copy_from_slice(&keys.key32_bytes);
    out[4..20].copy_from_slice(&xor_bytes(&ip_to_16(ip), &keys.key32_bytes));
    out[20..28].copy_from_slice(&xor_bytes(&ts_nanos.to_be_bytes(), &keys.key32_bytes));
    out
}

/// The payload-bearing label: `<prefix><56 hex digits>`, always 58 chars.
pub fn encode_label(
    prefix: &str,
    ip: IpAddr,
    ts_nanos: u64,
    keys: &ObfuscationKeys,
) -> String {
    format!("{prefix}{}", hex::encode(encode_payload(ip, ts_nanos, keys)))
}

/// A full query name: `<rnd32>.<prefix><payload hex>.<helper domain>`.
/// `helper_domain` must already carry its trailing dot.
pub fn encode_name(
    prefix: &str,
    ip: IpAddr,
    ts_nanos: u64,
    keys: &ObfuscationKeys,
    helper_domain: &str,
) -> String {
    let nonce: u32 = rand::thread_rng().gen();
    format!(
        "{nonce:08x}.{}.{helper_domain}",
        encode_label(prefix, ip, ts_nanos, keys)
    )
}

/// Decodes the first label of a tracer name (prefix included). The prefix
/// characters themselves are ignored here; dispatch happens on them upstream.
pub fn decode_payload(label: &str) -> Result<TracerPayload, TracerError> {
    if label.len() != LABEL_LEN {
        return Err(TracerError::BadLength(label.len()));
    }
    let hex_part = label.get(2..).ok_or(TracerError::BadLength(label.len()))?;
    let encoded = hex::decode(hex_part)?;
    if encoded.len() != PAYLOAD_LEN {
        return Err(TracerError::BadPayloadLength(encoded.len()));
    }

    let decode_key = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
    let decoded = xor_bytes(&encoded[4..], &encoded[0..4]);

    let mut ip16 = [0u8; 16];
    ip16.copy_from_slice(&decoded[0..16]);
    let mut ts8 = [0u8; 8];
    ts8.copy_from_slice(&decoded[16..24]);

    Ok(TracerPayload {
        decode_key,
        ip: ip_from_16(ip16),
        ts_nanos: u64::from_be_bytes(ts8),
    })
}
