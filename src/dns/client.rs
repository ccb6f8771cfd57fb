//! Open-resolver remote sense: ask the resolver to chase an `s0` tracer
//! name and read reachability out of the rcode it comes back with.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::obfuscate;
use crate::tracer;

use super::message::{Header, Message, Question, CLASS_INET, RCODE_SERVFAIL, TYPE_A};

pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SenseOutcome {
    pub alive: bool,
    pub rtt_ms: u128,
    pub detail: String,
}

/// One probe: a recursive A query for an `s0` name encoding the probed
/// address, sent to the open resolver. A resolver that actually recursed
/// ends up at our referral with unresolvable glue and reports SERVFAIL, so
/// rcode 2 is the *alive* signal; everything else is unreachable.
pub async fn sense_one(
    resolver: SocketAddr,
    helper_domain: &str,
    ip: Ipv4Addr,
) -> SenseOutcome {
    let name = tracer::encode_name(
        "s0",
        IpAddr::V4(ip),
        tracer::unix_nanos_now(),
        obfuscate::keys(),
        helper_domain,
    );

    let query = Message {
        header: Header {
            id: rand::thread_rng().gen(),
            recursion_desired: true,
            ..Header::default()
        },
        questions: vec![Question {
            name,
            qtype: TYPE_A,
            qclass: CLASS_INET,
        }],
        ..Message::default()
    };

    let start = Instant::now();
    let outcome = exchange(resolver, &query).await;
    let rtt_ms = start.elapsed().as_millis();

    match outcome {
        Ok(reply) => {
            let rcode = reply.header.rcode;
            SenseOutcome {
                alive: rcode == RCODE_SERVFAIL,
                rtt_ms,
                detail: format!("code:{rcode}"),
            }
        }
        Err(err) => SenseOutcome {
            alive: false,
            rtt_ms,
            detail: format!("error:{err}"),
        },
    }
}

async fn exchange(resolver: SocketAddr, query: &Message) -> io::Result<Message> {
    let bind_addr: SocketAddr = if resolver.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(resolver).await?;
    socket.send(&query.encode()).await?;

    let mut buf = vec![0u8; 4096];
    let len = timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"))??;

    let reply = Message::decode(&buf[..len])
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if reply.header.id != query.header.id {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "mismatched message id",
        ));
    }
    Ok(reply)
}

/// One output line, matching the historical column widths.
pub fn format_line(addr: Ipv4Addr, resolver: &str, outcome: &SenseOutcome) -> String {
    let addr = addr.to_string();
    if outcome.alive {
        format!(
            "{addr:<20}       alive via {resolver:<25} {:>6}ms       {}",
            outcome.rtt_ms, outcome.detail
        )
    } else {
        format!(
            "{addr:<20} unreachable via {resolver:<25} {:>6}ms      {}",
            outcome.rtt_ms, outcome.detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::RCODE_NXDOMAIN;

    fn outcome(alive: bool, detail: &str) -> SenseOutcome {
        SenseOutcome {
            alive,
            rtt_ms: 60,
            detail: detail.to_string(),
        }
    }

    #[test]
    fn servfail_means_alive() {
        for (rcode, alive) in [(0u8, false), (2, true), (3, false), (5, false)] {
            let got = rcode == RCODE_SERVFAIL;
            assert_eq!(got, alive, "rcode {rcode}");
        }
        assert_ne!(RCODE_SERVFAIL, RCODE_NXDOMAIN);
    }

    #[test]
    fn lines_keep_the_historical_columns() {
        let ip = Ipv4Addr::new(192, 168, 30, 29);
        let line = format_line(ip, "192.168.0.3:53", &outcome(true, "code:2"));
        assert_eq!(
            line,
            "192.168.30.29              alive via 192.168.0.3:53                60ms       code:2"
        );

        let line = format_line(ip, "192.168.0.3:53", &outcome(false, "code:3"));
        assert!(line.contains(" unreachable via "));
        assert!(line.ends_with("code:3"));
    }

    #[tokio::test]
    async fn exchanges_against_a_local_stub() {
        // Stub resolver: answer everything with SERVFAIL.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::decode(&buf[..len]).unwrap();
            let mut reply = Message::reply_to(&request);
            reply.header.rcode = RCODE_SERVFAIL;
            server.send_to(&reply.encode(), peer).await.unwrap();
        });

        let outcome = sense_one(resolver, "v1.nxdomain.us.", Ipv4Addr::new(10, 1, 2, 3)).await;
        assert!(outcome.alive, "{}", outcome.detail);
        assert_eq!(outcome.detail, "code:2");
    }

    #[tokio::test]
    async fn timeouts_read_as_unreachable() {
        // Bound but silent socket.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = server.local_addr().unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            sense_one(resolver, "v1.nxdomain.us.", Ipv4Addr::new(10, 1, 2, 3)),
        )
        .await
        .expect("sense_one should time out on its own");
        assert!(!outcome.alive);
        assert!(outcome.detail.starts_with("error:"), "{}", outcome.detail);
    }
}
