//! Seeded synthetic weights for tests, demos and benchmarks without a checkpoint.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::weights::{fnv1a64, HostTensor, WeightProvider};
use crate::{Error, Result};

/// How a synthetic tensor is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// All elements equal to the value (norm gains).
    Constant(f32),
    /// Uniform in `[-bound, bound]`.
    Uniform(f32),
}

/// Registry of named shapes, each generated on request from
/// `seed ^ hash(name)`. Request order does not affect the values.
pub struct SyntheticWeights {
    seed: u64,
    tensors: BTreeMap<String, (Vec<usize>, Init)>,
}

impl SyntheticWeights {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tensors: BTreeMap::new(),
        }
    }

    /// Register a tensor.
    #[must_use]
    pub fn with_tensor(mut self, name: impl Into<String>, shape: Vec<usize>, init: Init) -> Self {
        self.tensors.insert(name.into(), (shape, init));
        self
    }

    /// Register a tensor in place.
    pub fn insert(&mut self, name: impl Into<String>, shape: Vec<usize>, init: Init) {
        self.tensors.insert(name.into(), (shape, init));
    }
}

impl WeightProvider for SyntheticWeights {
    fn tensor(&self, name: &str) -> Result<HostTensor> {
        let (shape, init) = self
            .tensors
            .get(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))?;
        let numel: usize = shape.iter().product();
        let data = match *init {
            Init::Constant(v) => vec![v; numel],
            Init::Uniform(bound) => {
                let mut rng = StdRng::seed_from_u64(self.seed ^ fnv1a64(name.as_bytes()));
                (0..numel).map(|_| rng.gen_range(-bound..=bound)).collect()
            }
        };
        HostTensor::new(shape.clone(), data)
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn source_id(&self) -> String {
        format!("synthetic-{:016x}", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_is_idempotent_and_seeded() {
        let w = SyntheticWeights::new(1)
            .with_tensor("a", vec![4, 4], Init::Uniform(0.5))
            .with_tensor("b", vec![4], Init::Constant(1.0));
        let a1 = w.tensor("a").unwrap();
        let _ = w.tensor("b").unwrap();
        let a2 = w.tensor("a").unwrap();
        assert_eq!(a1, a2);
        assert!(a1.data.iter().all(|v| v.abs() <= 0.5));
        assert_eq!(w.tensor("b").unwrap().data, vec![1.0; 4]);

        let other = SyntheticWeights::new(2).with_tensor("a", vec![4, 4], Init::Uniform(0.5));
        assert_ne!(other.tensor("a").unwrap(), a1);
    }

    #[test]
    fn test_unknown_name() {
        let w = SyntheticWeights::new(0);
        assert!(!w.contains("x"));
        assert!(matches!(w.tensor("x"), Err(Error::WeightNotFound(_))));
    }
}
