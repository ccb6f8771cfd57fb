//! TSIG request verification and reply signing (RFC 2845, HMAC-MD5 only —
//! the one algorithm the companion tooling speaks).

use hmac::{Hmac, Mac};
use md5::Md5;
use thiserror::Error;

use super::message::{write_name, Message, RData, Record, TsigData, CLASS_ANY, TYPE_TSIG};

pub const HMAC_MD5_ALGORITHM: &str = "hmac-md5.sig-alg.reg.int.";
/// Allowed clock skew on signed replies, in seconds.
pub const FUDGE_SECONDS: u16 = 300;

type HmacMd5 = Hmac<Md5>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TsigError {
    #[error("invalid tsig spec, expected keyname:base64")]
    BadSpec,
    #[error("request is not signed")]
    NotSigned,
    #[error("unknown tsig key {0}")]
    BadKey(String),
    #[error("unsupported tsig algorithm {0}")]
    BadAlgorithm(String),
    #[error("tsig time outside fudge window")]
    BadTime,
    #[error("tsig signature mismatch")]
    BadSignature,
}

/// A shared TSIG secret, configured as `keyname:base64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigKey {
    /// Key name as an FQDN, lowercase.
    pub name: String,
    pub secret: Vec<u8>,
}

impl TsigKey {
    pub fn parse(spec: &str) -> Result<Self, TsigError> {
        let (name, secret) = spec.split_once(':').ok_or(TsigError::BadSpec)?;
        if name.is_empty() {
            return Err(TsigError::BadSpec);
        }
        let secret = base64_decode(secret).ok_or(TsigError::BadSpec)?;
        Ok(Self {
            name: super::message::fqdn(&name.to_lowercase()),
            secret,
        })
    }
}

/// Evidence that a request's TSIG checked out; carried into reply signing.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedRequest {
    pub key_name: String,
    pub mac: Vec<u8>,
}

/// Verifies the TSIG on a decoded request against its original wire form.
pub fn verify_request(
    wire: &[u8],
    request: &Message,
    key: &TsigKey,
    now_secs: u64,
) -> Result<VerifiedRequest, TsigError> {
    let (record, data) = request.tsig().ok_or(TsigError::NotSigned)?;
    let start = request.tsig_start.ok_or(TsigError::NotSigned)?;

    if !record.name.eq_ignore_ascii_case(&key.name) {
        return Err(TsigError::BadKey(record.name.clone()));
    }
    if !data.algorithm.eq_ignore_ascii_case(HMAC_MD5_ALGORITHM) {
        return Err(TsigError::BadAlgorithm(data.algorithm.clone()));
    }

    // Rebuild the message as it looked before signing: TSIG stripped,
    // ARCOUNT decremented, original ID restored.
    let mut unsigned = wire[..start].to_vec();
    unsigned[0..2].copy_from_slice(&data.original_id.to_be_bytes());
    let arcount = u16::from_be_bytes([wire[10], wire[11]]).saturating_sub(1);
    unsigned[10..12].copy_from_slice(&arcount.to_be_bytes());

    let expected = hmac_md5(&key.secret, &[&unsigned, &variables(&record.name, data)]);
    if expected != data.mac {
        return Err(TsigError::BadSignature);
    }

    if now_secs.abs_diff(data.time_signed) > u64::from(data.fudge) {
        return Err(TsigError::BadTime);
    }

    Ok(VerifiedRequest {
        key_name: record.name.clone(),
        mac: data.mac.clone(),
    })
}

/// Signs an encoded (unsigned) reply: computes the response MAC over the
/// request MAC, the reply, and the TSIG variables, then appends the TSIG
/// record with ARCOUNT bumped.
pub fn sign_reply(
    unsigned: &[u8],
    key: &TsigKey,
    request: &VerifiedRequest,
    now_secs: u64,
) -> Vec<u8> {
    let original_id = u16::from_be_bytes([unsigned[0], unsigned[1]]);
    let mut tsig = TsigData {
        algorithm: HMAC_MD5_ALGORITHM.to_string(),
        time_signed: now_secs,
        fudge: FUDGE_SECONDS,
        mac: Vec::new(),
        original_id,
        error: 0,
        other: Vec::new(),
    };

    let request_mac_len = (request.mac.len() as u16).to_be_bytes();
    tsig.mac = hmac_md5(
        &key.secret,
        &[
            &request_mac_len,
            &request.mac,
            unsigned,
            &variables(&request.key_name, &tsig),
        ],
    );

    let mut signed = unsigned.to_vec();
    let arcount = u16::from_be_bytes([signed[10], signed[11]]) + 1;
    signed[10..12].copy_from_slice(&arcount.to_be_bytes());
    Record {
        name: request.key_name.clone(),
        rtype: TYPE_TSIG,
        class: CLASS_ANY,
        ttl: 0,
        rdata: RData::Tsig(tsig),
    }
    .encode_into(&mut signed);
    signed
}

/// The TSIG variable block that joins the message in the digest: canonical
/// key name, class ANY, TTL 0, algorithm, time, fudge, error, other.
fn variables(key_name: &str, data: &TsigData) -> Vec<u8> {
    let mut out = Vec::new();
    write_name(&mut out, &key_name.to_lowercase());
    out.extend_from_slice(&CLASS_ANY.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    write_name(&mut out, &data.algorithm.to_lowercase());
    out.extend_from_slice(&data.time_signed.to_be_bytes()[2..8]);
    out.extend_from_slice(&data.fudge.to_be_bytes());
    out.extend_from_slice(&data.error.to_be_bytes());
    out.extend_from_slice(&(data.other.len() as u16).to_be_bytes());
    out.extend_from_slice(&data.other);
    out
}

fn hmac_md5(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts any key length, so new_from_slice cannot fail here.
    let mut mac = <HmacMd5 as Mac>::new_from_slice(secret).expect("hmac accepts any key size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Standard-alphabet base64 with optional padding. One call site (key
/// secrets), so a table beats a dependency.
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0u8;
    for &c in input.as_bytes() {
        if c == b'=' {
            break;
        }
        let v = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => return None,
        };
        acc = (acc << 6) | u32::from(v);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::{fqdn, Header, Question, CLASS_INET, TYPE_A};

    const NOW: u64 = 1_700_000_000;

    fn key() -> TsigKey {
        TsigKey {
            name: "probe-key.".to_string(),
            secret: b"shared-secret".to_vec(),
        }
    }

    fn base_request() -> Message {
        Message {
            header: Header {
                id: 0x4242,
                recursion_desired: true,
                ..Header::default()
            },
            questions: vec![Question {
                name: fqdn("t0test.v1.nxdomain.us"),
                qtype: TYPE_A,
                qclass: CLASS_INET,
            }],
            ..Message::default()
        }
    }

    /// Client-side signing, built from the same primitives the verifier
    /// uses; only tests need it.
    fn sign_request(msg: &Message, key: &TsigKey, time_signed: u64) -> Vec<u8> {
        let unsigned = msg.encode();
        let mut tsig = TsigData {
            algorithm: HMAC_MD5_ALGORITHM.to_string(),
            time_signed,
            fudge: FUDGE_SECONDS,
            mac: Vec::new(),
            original_id: msg.header.id,
            error: 0,
            other: Vec::new(),
        };
        tsig.mac = hmac_md5(&key.secret, &[&unsigned, &variables(&key.name, &tsig)]);

        let mut wire = unsigned;
        let arcount = u16::from_be_bytes([wire[10], wire[11]]) + 1;
        wire[10..12].copy_from_slice(&arcount.to_be_bytes());
        Record {
            name: key.name.clone(),
            rtype: TYPE_TSIG,
            class: CLASS_ANY,
            ttl: 0,
            rdata: RData::Tsig(tsig),
        }
        .encode_into(&mut wire);
        wire
    }

    #[test]
    fn parses_key_specs() {
        let parsed = TsigKey::parse("Probe-Key:c2hhcmVkLXNlY3JldA==").unwrap();
        assert_eq!(parsed.name, "probe-key.");
        assert_eq!(parsed.secret, b"shared-secret");

        assert_eq!(TsigKey::parse("no-colon"), Err(TsigError::BadSpec));
        assert_eq!(TsigKey::parse(":c2Vj"), Err(TsigError::BadSpec));
        assert_eq!(TsigKey::parse("k:!!!"), Err(TsigError::BadSpec));
    }

    #[test]
    fn verifies_a_signed_request() {
        let wire = sign_request(&base_request(), &key(), NOW);
        let decoded = Message::decode(&wire).unwrap();
        let verified = verify_request(&wire, &decoded, &key(), NOW + 10).unwrap();
        assert_eq!(verified.key_name, "probe-key.");
        assert!(!verified.mac.is_empty());
    }

    #[test]
    fn rejects_tampered_requests() {
        let mut wire = sign_request(&base_request(), &key(), NOW);
        let decoded_ok = Message::decode(&wire).unwrap();

        // Flip a question byte after signing.
        wire[14] ^= 0x01;
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(
            verify_request(&wire, &decoded, &key(), NOW),
            Err(TsigError::BadSignature)
        );

        // Stale timestamp.
        let wire = sign_request(&base_request(), &key(), NOW - 10_000);
        let decoded_old = Message::decode(&wire).unwrap();
        assert_eq!(
            verify_request(&wire, &decoded_old, &key(), NOW),
            Err(TsigError::BadTime)
        );

        // Wrong key name.
        let other = TsigKey {
            name: "someone-else.".to_string(),
            secret: key().secret,
        };
        let wire = sign_request(&base_request(), &key(), NOW);
        assert!(matches!(
            verify_request(&wire, &decoded_ok, &other, NOW),
            Err(TsigError::BadKey(_))
        ));
    }

    #[test]
    fn signed_replies_verify_under_the_response_digest() {
        let request_wire = sign_request(&base_request(), &key(), NOW);
        let request = Message::decode(&request_wire).unwrap();
        let verified = verify_request(&request_wire, &request, &key(), NOW).unwrap();

        let mut reply = Message::reply_to(&request);
        reply.header.authoritative = true;
        let unsigned = reply.encode();
        let signed = sign_reply(&unsigned, &key(), &verified, NOW + 1);

        let decoded = Message::decode(&signed).unwrap();
        let (record, data) = decoded.tsig().expect("reply unsigned");
        assert_eq!(record.name, "probe-key.");
        assert_eq!(data.fudge, FUDGE_SECONDS);
        assert_eq!(data.time_signed, NOW + 1);

        // Recompute the response digest by hand.
        let expected = hmac_md5(
            &key().secret,
            &[
                &(verified.mac.len() as u16).to_be_bytes(),
                &verified.mac,
                &unsigned,
                &variables("probe-key.", data),
            ],
        );
        assert_eq!(data.mac, expected);
    }

    #[test]
    fn base64_handles_padding_and_garbage() {
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(base64_decode("aGVsbG8h").unwrap(), b"hello!");
        assert_eq!(base64_decode("").unwrap(), b"");
        assert!(base64_decode("a b").is_none());
    }
}
