//! Stable hashing for step input fingerprints.
//!
//! A step fires only when its inputs changed since it last ran. Inputs are
//! compared by a 64-bit FNV-1a fingerprint computed over a canonical walk of
//! the port values, so the result does not depend on process layout or on
//! `std`'s randomized hasher.
//!
//! NOTE: FNV-1a is **not** cryptographically secure.

use indexmap::IndexMap;

use crate::types::Value;

/// 64-bit FNV-1a offset basis.
pub const FNV1A_OFFSET_BASIS_64: u64 = 0xcbf29ce484222325;
/// 64-bit FNV-1a prime.
pub const FNV1A_PRIME_64: u64 = 0x0000_0100_0000_01B3;

/// Mix bytes into an existing FNV-1a 64-bit hash state.
#[inline]
pub const fn fnv1a64_mix(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0usize;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV1A_PRIME_64);
        i += 1;
    }
    hash
}

/// Hash a UTF-8 string with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64_str(s: &str) -> u64 {
    fnv1a64_mix(FNV1A_OFFSET_BASIS_64, s.as_bytes())
}

/// Mix a value into the hash state.
///
/// Every variant is prefixed with a tag byte and every variable-length item
/// with its length, so `["ab"]` and `["a", "b"]` hash differently.
pub fn mix_value(hash: u64, value: &Value) -> u64 {
    match value {
        Value::Null => fnv1a64_mix(hash, &[0]),
        Value::Boolean(b) => fnv1a64_mix(fnv1a64_mix(hash, &[1]), &[*b as u8]),
        Value::Integer(i) => fnv1a64_mix(fnv1a64_mix(hash, &[2]), &i.to_le_bytes()),
        Value::Float(f) => fnv1a64_mix(fnv1a64_mix(hash, &[3]), &f.to_bits().to_le_bytes()),
        Value::String(s) => mix_str(fnv1a64_mix(hash, &[4]), s),
        Value::List(items) => {
            let hash = fnv1a64_mix(fnv1a64_mix(hash, &[5]), &(items.len() as u64).to_le_bytes());
            items.iter().fold(hash, mix_value)
        }
        Value::Map(entries) => {
            let hash = fnv1a64_mix(fnv1a64_mix(hash, &[6]), &(entries.len() as u64).to_le_bytes());
            entries
                .iter()
                .fold(hash, |h, (k, v)| mix_value(mix_str(h, k), v))
        }
    }
}

fn mix_str(hash: u64, s: &str) -> u64 {
    let hash = fnv1a64_mix(hash, &(s.len() as u64).to_le_bytes());
    fnv1a64_mix(hash, s.as_bytes())
}

/// Fingerprint the port values a unit reads.
pub fn fingerprint_ports(ports: &IndexMap<String, Value>) -> u64 {
    ports
        .iter()
        .fold(FNV1A_OFFSET_BASIS_64, |h, (name, value)| {
            mix_value(mix_str(h, name), value)
        })
}
