//! Authoritative handler for the tracer helper domain, plus the UDP/TCP
//! serve loops. Handlers are stateless: every inbound query is answered (or
//! dropped) from its own bytes and the peer address alone.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::obfuscate::xor_bytes;
use crate::tracer::{self, TracerPayload};

use super::message::{Message, Question, Record, CLASS_CHAOS, RCODE_NXDOMAIN, TYPE_TXT};
use super::tsig::{self, TsigKey};

pub const ANSWER_TTL: u32 = 60;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Helper domain this server is authoritative for, with trailing dot.
    pub helper_domain: String,
    pub tsig: Option<TsigKey>,
}

/// Handles one query. `None` means drop (no response at all).
pub fn handle_query(
    cfg: &ServerConfig,
    wire: &[u8],
    peer: SocketAddr,
    proto: &str,
) -> Option<Vec<u8>> {
    let request = match Message::decode(wire) {
        Ok(request) => request,
        Err(err) => {
            warn!("{}:{}/{proto} sent an undecodable query: {err}", peer.ip(), peer.port());
            return None;
        }
    };

    let client_ip = peer.ip().to_canonical();
    let port = format!("{}/{proto}", peer.port());

    let question = match request.questions.first() {
        Some(question) => question.clone(),
        None => {
            info!("{client_ip}:{port} requested no questions");
            return None;
        }
    };

    info!(
        "{client_ip}:{port} requested {} (type:{}/class:{}) with XID {}",
        question.name, question.qtype, question.qclass, request.header.id
    );

    // Transport-layer TSIG check; a failure downgrades the reply to
    // unsigned rather than refusing service.
    let mut verified = None;
    if request.tsig().is_some() {
        match &cfg.tsig {
            Some(key) => match tsig::verify_request(wire, &request, key, unix_secs_now()) {
                Ok(v) => verified = Some(v),
                Err(err) => {
                    warn!(
                        "{client_ip}:{port} triggered tsig error for {}: {err}",
                        question.name
                    );
                }
            },
            None => {
                warn!(
                    "{client_ip}:{port} sent tsig for {} but no key is configured",
                    question.name
                );
            }
        }
    }

    let mut reply = Message::reply_to(&request);
    let qname = question.name.to_lowercase();

    match qname.get(..2) {
        // T0: reflect the resolver's egress address back at it.
        Some("t0") => {
            decode_and_log_tracer(client_ip, &port, &request, &qname);

            let rr = reflection_record(&question.name, client_ip);
            let txt = Record::txt(
                &question.name,
                CLASS_CHAOS,
                format!("{client_ip}:{port}"),
                ANSWER_TTL,
            );
            if question.qtype == TYPE_TXT {
                reply.answers.push(txt);
                reply.additionals.push(rr);
            } else {
                reply.answers.push(rr);
                reply.additionals.push(txt);
            }
        }

        // E0: echo the EDNS0 client-subnet as an obfuscated CNAME.
        Some("e0") => {
            let decode_key = decode_and_log_tracer(client_ip, &port, &request, &qname)
                .map(|payload| payload.decode_key);
            if let Some(dk) = decode_key {
                if let Some(subnet) = request.client_subnet() {
                    let obfuscated = xor_bytes(&subnet.pack(), &dk.to_be_bytes());
                    let target = format!(
                        "c0{dk:08x}{}.{}",
                        hex::encode(obfuscated),
                        cfg.helper_domain
                    );
                    reply
                        .answers
                        .push(Record::cname(&question.name, &target, ANSWER_TTL));
                }
            }
            if reply.answers.is_empty() {
                reply.header.rcode = RCODE_NXDOMAIN;
            }
        }

        // A0: answer with the address embedded in the name itself.
        Some("a0") => match referral_record(client_ip, &port, &qname, &request, &question) {
            Ok(rr) => reply.answers.push(rr),
            Err(err) => {
                warn!(
                    "{client_ip}:{port} returned error for {}: {err}",
                    question.name
                );
                return None;
            }
        },

        // S0 (anywhere in the name): refer the resolver to the a0 form of
        // the same payload. The rewrite swaps the single byte at the s0
        // index for an 'a', relying on the prefix starting the label.
        _ => {
            if let Some(idx) = qname.find("s0") {
                let ns_name = format!("a{}", &qname[idx + 1..]);
                reply.header.authoritative = true;
                reply
                    .authorities
                    .push(Record::ns(&question.name, &ns_name, ANSWER_TTL));

                match referral_record(client_ip, &port, &ns_name, &request, &question) {
                    Ok(rr) => reply.additionals.push(rr),
                    Err(err) => {
                        warn!("{client_ip}:{port} returned error for {ns_name}: {err}");
                        return None;
                    }
                }
            }
        }
    }

    let unsigned = reply.encode();
    match (&cfg.tsig, verified) {
        (Some(key), Some(verified)) => {
            Some(tsig::sign_reply(&unsigned, key, &verified, unix_secs_now()))
        }
        _ => Some(unsigned),
    }
}

fn unix_secs_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A or AAAA carrying the client's own source address.
fn reflection_record(name: &str, client_ip: IpAddr) -> Record {
    match client_ip {
        IpAddr::V4(v4) => Record::a(name, v4, ANSWER_TTL),
        IpAddr::V6(v6) => Record::aaaa(name, v6, ANSWER_TTL),
    }
}

/// Decodes the tracer payload from the first label for logging. Never fails
/// the response path; a bad payload just logs.
fn decode_and_log_tracer(
    client_ip: IpAddr,
    port: &str,
    request: &Message,
    qname: &str,
) -> Option<TracerPayload> {
    let label = qname.split('.').next().unwrap_or_default();
    match tracer::decode_payload(label) {
        Ok(payload) => {
            info!(
                "{client_ip}:{port} requested trace {qname} (type:{}/class:{}) with XID {} (ip:{} ts:{})",
                request.questions[0].qtype,
                request.questions[0].qclass,
                request.header.id,
                payload.ip,
                DateTime::from_timestamp_nanos(payload.ts_nanos as i64),
            );
            Some(payload)
        }
        Err(err) => {
            warn!(
                "{client_ip}:{port} requested invalid tracer name {qname} with XID {} ({err})",
                request.header.id
            );
            None
        }
    }
}

/// Synthesizes the A/AAAA referral target for an `a0`-form name. The A
/// branch names the decoded (lowercased) qname while the AAAA branch names
/// the original question name; resolvers have cached both shapes for years,
/// so the asymmetry stays.
fn referral_record(
    client_ip: IpAddr,
    port: &str,
    qname: &str,
    request: &Message,
    question: &Question,
) -> Result<Record, tracer::TracerError> {
    let label = qname.split('.').next().unwrap_or_default();
    let payload = tracer::decode_payload(label)?;

    info!(
        "{client_ip}:{port} requested referral {qname} (type:{}/class:{}) with XID {} (ip:{} ts:{})",
        question.qtype,
        question.qclass,
        request.header.id,
        payload.ip,
        DateTime::from_timestamp_nanos(payload.ts_nanos as i64),
    );

    Ok(match payload.ip {
        IpAddr::V4(v4) => Record::a(qname, v4, ANSWER_TTL),
        IpAddr::V6(v6) => Record::aaaa(&question.name, v6, ANSWER_TTL),
    })
}

/// Serves queries from a bound UDP socket until cancelled.
pub async fn serve_udp(cfg: Arc<ServerConfig>, socket: UdpSocket, cancel: CancellationToken) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("udp receive error: {err}");
                        continue;
                    }
                };
                let wire = buf[..len].to_vec();
                let cfg = Arc::clone(&cfg);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(reply) = handle_query(&cfg, &wire, peer, "udp") {
                        if let Err(err) = socket.send_to(&reply, peer).await {
                            warn!("{peer} triggered send error: {err}");
                        }
                    }
                });
            }
        }
    }
}

/// Serves queries from a bound TCP listener until cancelled. Each message is
/// framed by the RFC 1035 two-byte length prefix.
pub async fn serve_tcp(cfg: Arc<ServerConfig>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("tcp accept error: {err}");
                        continue;
                    }
                };
                let cfg = Arc::clone(&cfg);
                tokio::spawn(async move {
                    if let Err(err) = serve_tcp_conn(&cfg, stream, peer).await {
                        warn!("{peer} connection ended: {err}");
                    }
                });
            }
        }
    }
}

async fn serve_tcp_conn(
    cfg: &ServerConfig,
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // peer closed
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut wire = vec![0u8; len];
        stream.read_exact(&mut wire).await?;

        if let Some(reply) = handle_query(cfg, &wire, peer, "tcp") {
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&reply).await?;
        }
    }
}
