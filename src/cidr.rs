use std::net::Ipv4Addr;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CidrError {
    #[error("invalid CIDR: empty")]
    Empty,
    #[error("invalid CIDR: {0}")]
    Invalid(String),
    #[error("invalid IPv4 CIDR: {0}")]
    Ipv6Unsupported(String),
}

/// A parsed IPv4 network: masked base address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Net {
    base: u32,
    prefix: u8,
}

impl Ipv4Net {
    fn size(self) -> u64 {
        1u64 << (32 - self.prefix)
    }
}

fn parse_cidr(cidr: &str) -> Result<Ipv4Net, CidrError> {
    if cidr.is_empty() {
        return Err(CidrError::Empty);
    }

    // Bare addresses are accepted with an implied host mask.
    let full;
    let text = if cidr.contains('/') {
        cidr
    } else if cidr.contains(':') {
        full = format!("{cidr}/128");
        &full
    } else {
        full = format!("{cidr}/32");
        &full
    };

    let (addr, prefix) = text
        .split_once('/')
        .ok_or_else(|| CidrError::Invalid(cidr.to_string()))?;

    // IPv6 is unsupported for now: the walk arithmetic is 32-bit.
    if addr.contains(':') {
        return Err(CidrError::Ipv6Unsupported(cidr.to_string()));
    }

    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| CidrError::Invalid(cidr.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| CidrError::Invalid(cidr.to_string()))?;
    if prefix > 32 {
        return Err(CidrError::Invalid(cidr.to_string()));
    }

    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok(Ipv4Net {
        base: u32::from(ip) & mask,
        prefix,
    })
}

/// Number of addresses covered by a CIDR (bare IPs count as one).
pub fn address_count_from_cidr(cidr: &str) -> Result<u64, CidrError> {
    Ok(parse_cidr(cidr)?.size())
}

/// Streams every address of `cidr` into `tx` exactly once, in a
/// pseudo-random order, stopping early when `cancel` fires or the receiver
/// goes away.
///
/// The order comes from stepping through the range with a random prime
/// stride strictly larger than the range size: gcd(p, s) = 1, so the walk
/// visits each offset once before repeating.
pub async fn addresses_from_cidr(
    cidr: &str,
    tx: &mpsc::Sender<Ipv4Addr>,
    cancel: &CancellationToken,
) -> Result<(), CidrError> {
    let net = parse_cidr(cidr)?;
    random_walk(net.base, net.size(), tx, cancel).await;
    Ok(())
}

async fn random_walk(
    base: u32,
    size: u64,
    tx: &mpsc::Sender<Ipv4Addr>,
    cancel: &CancellationToken,
) {
    if size == 0 {
        return;
    }

    let p = random_prime_above(size);
    let mut q = p % size;
    for _ in 0..size {
        let ip = Ipv4Addr::from(base.wrapping_add(q as u32));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(ip) => {
                if sent.is_err() {
                    return;
                }
                q = (q + p) % size;
            }
        }
    }
}

/// A random 63-bit prime strictly greater than `min`.
fn random_prime_above(min: u64) -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = rng.gen::<u64>() >> 1;
        if candidate > min && is_prime_u64(candidate) {
            return candidate;
        }
    }
}

/// Deterministic Miller-Rabin for u64; the listed bases are exact below 2^64.
fn is_prime_u64(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if n == p {
            return true;
        }
        if n % p == 0 {
            return false;
        }
    }

    let mut d = n - 1;
    let mut r = 0u32;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    'witness: for a in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 0..r - 1 {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut acc = 1u64;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn collect(cidr: &str) -> Vec<Ipv4Addr> {
        let (tx, mut rx) = mpsc::channel(70000);
        let cancel = CancellationToken::new();
        addresses_from_cidr(cidr, &tx, &cancel).await.unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Some(ip) = rx.recv().await {
            out.push(ip);
        }
        out
    }

    #[tokio::test]
    async fn slash_30_emits_exactly_the_four_hosts() {
        let got = collect("192.168.1.0/30").await;
        assert_eq!(got.len(), 4);
        let set: HashSet<_> = got.into_iter().collect();
        let want: HashSet<Ipv4Addr> = ["192.168.1.0", "192.168.1.1", "192.168.1.2", "192.168.1.3"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(set, want);
    }

    #[tokio::test]
    async fn base_address_is_masked() {
        let got = collect("192.168.1.77/30").await;
        let set: HashSet<_> = got.into_iter().collect();
        let want: HashSet<Ipv4Addr> = ["192.168.1.76", "192.168.1.77", "192.168.1.78", "192.168.1.79"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(set, want);
    }

    #[tokio::test]
    async fn slash_24_visits_every_address_once() {
        let got = collect("10.9.8.0/24").await;
        assert_eq!(got.len(), 256);
        let set: HashSet<_> = got.iter().copied().collect();
        assert_eq!(set.len(), 256);
        for ip in &set {
            assert_eq!(ip.octets()[..3], [10, 9, 8]);
        }
    }

    #[tokio::test]
    async fn bare_address_gets_a_host_mask() {
        let got = collect("10.1.2.3").await;
        assert_eq!(got, vec!["10.1.2.3".parse::<Ipv4Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn ipv6_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        for input in ["::1", "2001:db8::/64", "::/128"] {
            let err = addresses_from_cidr(input, &tx, &cancel).await.unwrap_err();
            assert!(matches!(err, CidrError::Ipv6Unsupported(_)), "{input}");
        }
    }

    #[tokio::test]
    async fn bad_inputs_are_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        assert!(matches!(
            addresses_from_cidr("", &tx, &cancel).await.unwrap_err(),
            CidrError::Empty
        ));
        for input in ["garbage", "1.2.3.4/33", "1.2.3/24", "1.2.3.4/x"] {
            let err = addresses_from_cidr(input, &tx, &cancel).await.unwrap_err();
            assert!(matches!(err, CidrError::Invalid(_)), "{input}");
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_walk() {
        let (tx, mut rx) = mpsc::channel(512);
        let cancel = CancellationToken::new();
        cancel.cancel();
        addresses_from_cidr("10.0.0.0/24", &tx, &cancel).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn address_counts() {
        assert_eq!(address_count_from_cidr("10.0.0.0/24").unwrap(), 256);
        assert_eq!(address_count_from_cidr("10.0.0.1").unwrap(), 1);
        assert_eq!(address_count_from_cidr("0.0.0.0/0").unwrap(), 1u64 << 32);
    }

    #[test]
    fn miller_rabin_agrees_with_trial_division() {
        let small: Vec<u64> = (2..500).filter(|&n| (2..n).all(|d| n % d != 0)).collect();
        for n in 2..500u64 {
            assert_eq!(is_prime_u64(n), small.contains(&n), "{n}");
        }
        assert!(is_prime_u64(0xffff_fffb)); // largest 32-bit prime
        assert!(!is_prime_u64((1 << 62) - 2));
    }
}
