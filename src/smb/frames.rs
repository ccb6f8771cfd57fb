//! SMB request frames and NetBIOS session framing.
//!
//! Every frame starts with the 4-byte NetBIOS session header: a type byte
//! that must be zero and a 24-bit big-endian payload length. The SMB2 header
//! offsets below are relative to the end of that prefix.

use std::time::Duration;

use bytes::BufMut;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::ProbeError;

pub const NETBIOS_HEADER_LEN: usize = 4;

/// SMB2 header field offsets (from the SMB2 magic, i.e. after NetBIOS).
pub const HEADER_FLAGS_OFFSET: usize = 16;
pub const PROCESS_ID_OFFSET: usize = 32;
pub const SESSION_ID_OFFSET: usize = 40;
/// SESSION_SETUP body flags byte (header 64 + StructureSize 2).
pub const SESSION_SETUP_FLAGS_OFFSET: usize = 66;

/// SMB2 header flags bit: this PDU is (to be) signed.
pub const SMB2_FLAGS_SIGNED: u16 = 0x08;
/// SESSION_SETUP flags bit: bind this request to an existing session.
pub const SESSION_FLAG_BINDING: u8 = 0x01;

pub const SMB2_COMMAND_NEGOTIATE: u16 = 0;
pub const SMB2_COMMAND_SESSION_SETUP: u16 = 1;

const SMB2_DIALECTS: [u16; 5] = [0x0202, 0x0210, 0x0300, 0x0302, 0x0311];

/// Prefixes the NetBIOS session header.
pub fn frame(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(NETBIOS_HEADER_LEN + payload.len());
    out.push(0); // session message
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&payload);
    out
}

/// Writes one framed request, bounded by `limit`.
pub async fn send_data<S: AsyncWrite + Unpin>(
    stream: &mut S,
    data: &[u8],
    limit: Duration,
) -> Result<(), ProbeError> {
    timeout(limit, stream.write_all(data))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    Ok(())
}

/// Reads one NetBIOS-framed reply, bounded by `limit` per read. The header
/// type byte must be zero; the lower 24 bits carry the payload length.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    limit: Duration,
) -> Result<Vec<u8>, ProbeError> {
    let mut header = [0u8; 4];
    timeout(limit, stream.read_exact(&mut header))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    if header[0] != 0 {
        return Err(ProbeError::BadFrame("netbios session type"));
    }

    let len = u32::from_be_bytes(header) as usize & 0x00ff_ffff;
    let mut payload = vec![0u8; len];
    timeout(limit, stream.read_exact(&mut payload))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    Ok(payload)
}

/// The classic SMB1 NEGOTIATE opener. The dialect ladder ends with the
/// `SMB 2.???` wildcard so SMB2-only servers answer with an SMB2 frame.
pub fn build_smb1_negotiate() -> Vec<u8> {
    let mut smb = Vec::with_capacity(200);

    // SMB1 header, 32 bytes.
    smb.put_slice(&[0xFF, b'S', b'M', b'B']);
    smb.put_u8(0x72); // command: NEGOTIATE
    smb.put_u32_le(0); // status
    smb.put_u8(0x18); // flags: canonical paths, case insensitive
    smb.put_u16_le(0xc853); // flags2: unicode, NT status, extended security
    smb.put_u16_le(0); // PIDHigh
    smb.put_slice(&[0u8; 8]); // security features
    smb.put_u16_le(0); // reserved
    smb.put_u16_le(0); // TID
    smb.put_u16_le(0xfeff); // PIDLow
    smb.put_u16_le(0); // UID
    smb.put_u16_le(0); // MID

    smb.put_u8(0); // WordCount

    let dialects: [&[u8]; 8] = [
        b"PC NETWORK PROGRAM 1.0",
        b"LANMAN1.0",
        b"Windows for Workgroups 3.1a",
        b"LM1.2X002",
        b"LANMAN2.1",
        b"NT LM 0.12",
        b"SMB 2.002",
        b"SMB 2.???",
    ];
    let mut body = Vec::new();
    for dialect in dialects {
        body.put_u8(0x02); // buffer format: dialect
        body.put_slice(dialect);
        body.put_u8(0x00);
    }
    smb.put_u16_le(body.len() as u16); // ByteCount
    smb.put_slice(&body);

    frame(smb)
}

/// A 64-byte SMB2 header with zeroed credit/session state.
fn smb2_header(command: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(64);
    header.put_slice(&[0xFE, b'S', b'M', b'B']);
    header.put_u16_le(64); // StructureSize
    header.put_u16_le(0); // CreditCharge
    header.put_u32_le(0); // Status / ChannelSequence
    header.put_u16_le(command);
    header.put_u16_le(1); // CreditsRequested
    header.put_u32_le(0); // Flags
    header.put_u32_le(0); // NextCommand
    header.put_u64_le(0); // MessageId
    header.put_u32_le(0); // Reserved / ProcessId
    header.put_u32_le(0); // TreeId
    header.put_u64_le(0); // SessionId
    header.put_slice(&[0u8; 16]); // Signature
    header
}

/// SMB2 NEGOTIATE asking for every dialect through 3.1.1. The 3.1.1
/// negotiate contexts (preauth integrity, encryption) make the server hand
/// back its hash and cipher choices, which the extractor reports.
pub fn build_smb2_negotiate() -> Vec<u8> {
    let mut smb = smb2_header(SMB2_COMMAND_NEGOTIATE);

    // NEGOTIATE body (36 fixed bytes + dialects + contexts).
    smb.put_u16_le(36); // StructureSize
    smb.put_u16_le(SMB2_DIALECTS.len() as u16);
    smb.put_u16_le(1); // SecurityMode: signing enabled
    smb.put_u16_le(0); // Reserved
    smb.put_u32_le(0x7f); // Capabilities

    let mut guid = [0u8; 16];
    rand::thread_rng().fill(&mut guid);
    smb.put_slice(&guid); // ClientGuid

    // Dialect array lands at header(64) + 36 = 100; five dialects end at
    // 110, so the first context sits at the next 8-byte boundary, 112.
    smb.put_u32_le(112); // NegotiateContextOffset
    smb.put_u16_le(2); // NegotiateContextCount
    smb.put_u16_le(0); // Reserved2
    for dialect in SMB2_DIALECTS {
        smb.put_u16_le(dialect);
    }
    smb.put_slice(&[0u8; 2]); // pad to 8-byte alignment

    // Context: PREAUTH_INTEGRITY_CAPABILITIES, SHA-512 with a 32-byte salt.
    smb.put_u16_le(1); // ContextType
    smb.put_u16_le(38); // DataLength
    smb.put_u32_le(0); // Reserved
    smb.put_u16_le(1); // HashAlgorithmCount
    smb.put_u16_le(32); // SaltLength
    smb.put_u16_le(1); // SHA-512
    let mut salt = [0u8; 32];
    rand::thread_rng().fill(&mut salt);
    smb.put_slice(&salt);
    smb.put_slice(&[0u8; 2]); // pad to 8-byte alignment

    // Context: ENCRYPTION_CAPABILITIES, GCM preferred over CCM.
    smb.put_u16_le(2); // ContextType
    smb.put_u16_le(6); // DataLength
    smb.put_u32_le(0); // Reserved
    smb.put_u16_le(2); // CipherCount
    smb.put_u16_le(0x0002); // AES-128-GCM
    smb.put_u16_le(0x0001); // AES-128-CCM

    frame(smb)
}

/// SMB2 SESSION_SETUP template carrying an anonymous NTLMSSP NEGOTIATE
/// token. The probe driver patches ProcessID, and for binding probes the
/// header flags, SessionID, and the body binding flag, at the offsets
/// published above.
pub fn build_session_setup() -> Vec<u8> {
    let blob = spnego_wrap(&ntlmssp_negotiate());
    let mut smb = smb2_header(SMB2_COMMAND_SESSION_SETUP);

    smb.put_u16_le(25); // StructureSize
    smb.put_u8(0); // Flags (binding bit patched here)
    smb.put_u8(1); // SecurityMode: signing enabled
    smb.put_u32_le(1); // Capabilities: DFS
    smb.put_u32_le(0); // Channel
    smb.put_u16_le(88); // SecurityBufferOffset: 64 + 24
    smb.put_u16_le(blob.len() as u16);
    smb.put_u64_le(0); // PreviousSessionId
    smb.put_slice(&blob);

    frame(smb)
}

/// NTLMSSP NEGOTIATE (type 1) with no domain or workstation.
fn ntlmssp_negotiate() -> Vec<u8> {
    let mut msg = Vec::with_capacity(40);
    msg.put_slice(b"NTLMSSP\0");
    msg.put_u32_le(1); // MessageType
    // unicode | oem | request-target | sign | ntlm | always-sign |
    // extended session security | version | 128-bit | key-exch | 56-bit
    msg.put_u32_le(0xe208_8217);
    msg.put_slice(&[0, 0, 0, 0, 40, 0, 0, 0]); // DomainNameFields
    msg.put_slice(&[0, 0, 0, 0, 40, 0, 0, 0]); // WorkstationFields
    msg.put_slice(&[10, 0, 0x63, 0x45, 0, 0, 0, 15]); // Version 10.0.17763, rev 15
    msg
}

/// Wraps a raw NTLMSSP token in a SPNEGO NegTokenInit. The token is well
/// under 128 bytes, so every DER length fits in one byte.
fn spnego_wrap(ntlm: &[u8]) -> Vec<u8> {
    const SPNEGO_OID: &[u8] = &[0x06, 0x06, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
    const NTLMSSP_OID: &[u8] = &[
        0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a,
    ];

    fn der(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + content.len());
        out.push(tag);
        out.push(content.len() as u8);
        out.extend_from_slice(content);
        out
    }

    let mech_types = der(0xa0, &der(0x30, NTLMSSP_OID));
    let mech_token = der(0xa2, &der(0x04, ntlm));
    let inner = der(0x30, &[mech_types, mech_token].concat());
    let token = der(0xa0, &inner);
    der(0x60, &[SPNEGO_OID, &token].concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netbios_len(framed: &[u8]) -> usize {
        assert_eq!(framed[0], 0);
        ((framed[1] as usize) << 16) | ((framed[2] as usize) << 8) | framed[3] as usize
    }

    #[test]
    fn frames_carry_their_payload_length() {
        let framed = frame(vec![0xAB; 300]);
        assert_eq!(netbios_len(&framed), 300);
        assert_eq!(framed.len(), NETBIOS_HEADER_LEN + 300);
    }

    #[test]
    fn smb1_negotiate_offers_the_smb2_wildcard() {
        let framed = build_smb1_negotiate();
        assert_eq!(netbios_len(&framed), framed.len() - NETBIOS_HEADER_LEN);
        let payload = &framed[NETBIOS_HEADER_LEN..];
        assert_eq!(&payload[0..4], &[0xFF, b'S', b'M', b'B']);
        assert_eq!(payload[4], 0x72);

        let haystack = |needle: &[u8]| payload.windows(needle.len()).any(|w| w == needle);
        assert!(haystack(b"NT LM 0.12"));
        assert!(haystack(b"SMB 2.002"));
        assert!(haystack(b"SMB 2.???"));
    }

    #[test]
    fn smb2_negotiate_lists_all_dialects_with_contexts() {
        let framed = build_smb2_negotiate();
        let payload = &framed[NETBIOS_HEADER_LEN..];
        assert_eq!(&payload[0..4], &[0xFE, b'S', b'M', b'B']);
        assert_eq!(
            u16::from_le_bytes([payload[12], payload[13]]),
            SMB2_COMMAND_NEGOTIATE
        );

        // Dialect array at 100.
        for (i, dialect) in SMB2_DIALECTS.iter().enumerate() {
            let at = 100 + i * 2;
            assert_eq!(u16::from_le_bytes([payload[at], payload[at + 1]]), *dialect);
        }

        // First context at the advertised, 8-aligned offset.
        let ctx_offset = u32::from_le_bytes([payload[92], payload[93], payload[94], payload[95]]);
        assert_eq!(ctx_offset, 112);
        assert_eq!(ctx_offset % 8, 0);
        assert_eq!(u16::from_le_bytes([payload[112], payload[113]]), 1); // preauth
        let second = 112 + 8 + 38 + 2;
        assert_eq!(
            u16::from_le_bytes([payload[second], payload[second + 1]]),
            2 // encryption
        );
        assert_eq!(payload.len(), second + 8 + 6);
    }

    #[test]
    fn session_setup_patch_offsets_land_on_header_fields() {
        let framed = build_session_setup();
        let payload = &framed[NETBIOS_HEADER_LEN..];
        assert_eq!(
            u16::from_le_bytes([payload[12], payload[13]]),
            SMB2_COMMAND_SESSION_SETUP
        );

        // Untouched template: no flags, zero PID and session id.
        assert_eq!(payload[HEADER_FLAGS_OFFSET], 0);
        assert_eq!(
            u16::from_le_bytes([payload[PROCESS_ID_OFFSET], payload[PROCESS_ID_OFFSET + 1]]),
            0
        );
        assert_eq!(
            u64::from_le_bytes(
                payload[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 8]
                    .try_into()
                    .unwrap()
            ),
            0
        );
        assert_eq!(payload[SESSION_SETUP_FLAGS_OFFSET], 0);

        // Body structure size 25, blob where the offset field says.
        assert_eq!(u16::from_le_bytes([payload[64], payload[65]]), 25);
        let blob_offset = u16::from_le_bytes([payload[76], payload[77]]) as usize;
        assert_eq!(blob_offset, 88);
        let blob_len = u16::from_le_bytes([payload[78], payload[79]]) as usize;
        assert_eq!(payload.len(), blob_offset + blob_len);

        // SPNEGO around an NTLMSSP type-1 token.
        let blob = &payload[blob_offset..];
        assert_eq!(blob[0], 0x60);
        assert!(blob.windows(8).any(|w| w == b"NTLMSSP\0"));
    }

    #[test]
    fn patched_template_reads_back() {
        let mut framed = build_session_setup();
        let sid = 0x00002c32_8000002du64;
        framed[NETBIOS_HEADER_LEN + PROCESS_ID_OFFSET..NETBIOS_HEADER_LEN + PROCESS_ID_OFFSET + 2]
            .copy_from_slice(&0xfeffu16.to_le_bytes());
        framed[NETBIOS_HEADER_LEN + HEADER_FLAGS_OFFSET..NETBIOS_HEADER_LEN + HEADER_FLAGS_OFFSET + 2]
            .copy_from_slice(&SMB2_FLAGS_SIGNED.to_le_bytes());
        framed[NETBIOS_HEADER_LEN + SESSION_ID_OFFSET..NETBIOS_HEADER_LEN + SESSION_ID_OFFSET + 8]
            .copy_from_slice(&sid.to_le_bytes());
        framed[NETBIOS_HEADER_LEN + SESSION_SETUP_FLAGS_OFFSET] = SESSION_FLAG_BINDING;

        let payload = &framed[NETBIOS_HEADER_LEN..];
        assert_eq!(
            u64::from_le_bytes(
                payload[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 8]
                    .try_into()
                    .unwrap()
            ),
            sid
        );
        assert_eq!(payload[HEADER_FLAGS_OFFSET], 0x08);
        assert_eq!(payload[SESSION_SETUP_FLAGS_OFFSET], 0x01);
    }

    #[tokio::test]
    async fn read_frame_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let framed = frame(b"hello smb".to_vec());
        send_data(&mut client, &framed, Duration::from_secs(1))
            .await
            .unwrap();
        let payload = read_frame(&mut server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload, b"hello smb");
    }

    #[tokio::test]
    async fn read_frame_rejects_nonzero_session_type() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x85, 0, 0, 0]).await.unwrap();
        let err = read_frame(&mut server, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::BadFrame(_)));
    }
}
