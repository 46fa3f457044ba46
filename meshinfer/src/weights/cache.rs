//! Content-addressed on-disk cache in front of another weight provider.
//!
//! Each tensor is stored as `<dir>/<fnv64(source_id, name)>.bin`:
//! a `MSHW` magic, the rank and dims as little-endian `u64`, then the
//! little-endian f32 payload.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use crate::weights::{fnv1a64, HostTensor, WeightProvider};
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"MSHW";

/// Caches converted tensors from `inner` under `dir`.
pub struct CachedWeights<P> {
    inner: P,
    dir: PathBuf,
    hits: Cell<usize>,
}

impl<P: WeightProvider> CachedWeights<P> {
    /// # Errors
    /// Returns an error if the cache directory cannot be created.
    pub fn new(inner: P, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner,
            dir,
            hits: Cell::new(0),
        })
    }

    /// Number of tensors served from disk so far.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.get()
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let key = format!("{}\u{0}{name}", self.inner.source_id());
        self.dir
            .join(format!("{:016x}.bin", fnv1a64(key.as_bytes())))
    }
}

impl<P: WeightProvider> WeightProvider for CachedWeights<P> {
    fn tensor(&self, name: &str) -> Result<HostTensor> {
        let path = self.path_for(name);
        if path.exists() {
            match read_entry(&path) {
                Ok(t) => {
                    self.hits.set(self.hits.get() + 1);
                    return Ok(t);
                }
                Err(e) => log::warn!("weight cache entry {} unreadable ({e}); refetching", path.display()),
            }
        }
        let tensor = self.inner.tensor(name)?;
        write_entry(&path, &tensor)?;
        Ok(tensor)
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    fn source_id(&self) -> String {
        self.inner.source_id()
    }
}

fn write_entry(path: &Path, tensor: &HostTensor) -> Result<()> {
    let mut bytes = Vec::with_capacity(12 + tensor.shape.len() * 8 + tensor.data.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&(tensor.shape.len() as u64).to_le_bytes());
    for &d in &tensor.shape {
        bytes.extend_from_slice(&(d as u64).to_le_bytes());
    }
    bytes.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&tensor.data));
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_entry(path: &Path) -> Result<HostTensor> {
    let bytes = fs::read(path)?;
    let corrupt = || Error::Other(format!("corrupt weight cache entry {}", path.display()));
    if bytes.len() < 12 || &bytes[..4] != MAGIC {
        return Err(corrupt());
    }
    let read_u64 = |at: usize| -> Result<usize> {
        let raw: [u8; 8] = bytes
            .get(at..at + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(corrupt)?;
        usize::try_from(u64::from_le_bytes(raw)).map_err(|_| corrupt())
    };
    let rank = read_u64(4)?;
    let shape = (0..rank)
        .map(|i| read_u64(12 + i * 8))
        .collect::<Result<Vec<_>>>()?;
    let payload = &bytes[12 + rank * 8..];
    if payload.len() % 4 != 0 {
        return Err(corrupt());
    }
    let data = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    HostTensor::new(shape, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{Init, SyntheticWeights};

    #[test]
    fn test_second_fetch_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inner = SyntheticWeights::new(9).with_tensor("w", vec![3, 5], Init::Uniform(1.0));
        let expected = inner.tensor("w").unwrap();

        let cached = CachedWeights::new(inner, dir.path()).unwrap();
        assert_eq!(cached.tensor("w").unwrap(), expected);
        assert_eq!(cached.hits(), 0);
        assert_eq!(cached.tensor("w").unwrap(), expected);
        assert_eq!(cached.hits(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let inner = SyntheticWeights::new(1).with_tensor("w", vec![2], Init::Constant(4.0));
        let cached = CachedWeights::new(inner, dir.path()).unwrap();
        let path = cached.path_for("w");
        fs::write(&path, b"garbage").unwrap();
        assert_eq!(cached.tensor("w").unwrap().data, vec![4.0, 4.0]);
        assert_eq!(cached.hits(), 0);
        // the refetch rewrote a good entry
        assert_eq!(cached.tensor("w").unwrap().data, vec![4.0, 4.0]);
        assert_eq!(cached.hits(), 1);
    }
}
