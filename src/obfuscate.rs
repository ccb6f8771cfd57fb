use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;

/// Process-wide XOR keys used to obfuscate tracer payloads.
///
/// Both keys are carried as an integer and as its big-endian byte encoding;
/// the byte form is what gets XOR'd into wire payloads, the integer form is
/// what gets hex-printed into query names. The constructor derives the bytes
/// from the integer, so the two representations cannot disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfuscationKeys {
    pub key32: u32,
    pub key32_bytes: [u8; 4],
    pub key64: u64,
    pub key64_bytes: [u8; 8],
}

impl ObfuscationKeys {
    pub fn new(key32: u32, key64: u64) -> Self {
        Self {
            key32,
            key32_bytes: key32.to_be_bytes(),
            key64,
            key64_bytes: key64.to_be_bytes(),
        }
    }

    /// Draws both keys from the OS random source.
    pub fn random() -> Self {
        let mut rng = OsRng;
        Self::new(rng.next_u32(), rng.next_u64())
    }
}

impl Default for ObfuscationKeys {
    fn default() -> Self {
        Self::new(0x5050_5050, 0x5050_5050_5050_5050)
    }
}

static KEYS: OnceLock<ObfuscationKeys> = OnceLock::new();

/// Installs freshly randomized process-wide keys. Call once from main before
/// any worker starts; later calls keep the first installed value.
pub fn randomize_keys() {
    let _ = KEYS.set(ObfuscationKeys::random());
}

/// The process-wide keys. Falls back to the fixed default when
/// `randomize_keys` was never called.
pub fn keys() -> &'static ObfuscationKeys {
    KEYS.get_or_init(ObfuscationKeys::default)
}

/// XOR `src` against a repeating `key`. Symmetric: applying it twice with the
/// same key returns the input.
pub fn xor_bytes(src: &[u8], key: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len());
    for (i, b) in src.iter().enumerate() {
        dst.push(b ^ key[i % key.len()]);
    }
    dst
}
