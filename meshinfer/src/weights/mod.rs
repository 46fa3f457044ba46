//! Weight providers: name → host tensor maps the model loads from.

mod cache;
mod provider;
mod safetensors;
mod synthetic;

pub use cache::CachedWeights;
pub use provider::{HostTensor, WeightProvider};
pub use safetensors::SafeTensorsProvider;
pub use synthetic::{Init, SyntheticWeights};

/// 64-bit FNV-1a, stable across runs and platforms.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
