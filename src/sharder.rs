//! Deterministic hashing used for rollout and variant assignment.

/// Maps hashing material onto `[0, 1)`.
///
/// Existing rollouts depend on repeatable assignment, so implementations must never change their
/// output for a given input.
pub trait Sharder {
    /// Hash `key` salted with `salt` into `[0, 1)`.
    fn normalized_hash(&self, key: &str, salt: &str) -> f64;
}

/// The default (and only) sharder. Shared with the other Mixpanel SDKs.
pub struct Fnv1aSharder;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

impl Sharder for Fnv1aSharder {
    fn normalized_hash(&self, key: &str, salt: &str) -> f64 {
        let hash = fnv1a64(key.as_bytes().iter().chain(salt.as_bytes()));
        (hash % 100) as f64 / 100.0
    }
}

fn fnv1a64<'a>(bytes: impl Iterator<Item = &'a u8>) -> u64 {
    bytes.fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, f64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn normalized_hash(&self, key: &str, salt: &str) -> f64 {
        self.0
            .get(&format!("{key}{salt}"))
            .copied()
            .unwrap_or(0.0)
    }
}
