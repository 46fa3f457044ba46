//! `SafeTensors` file loading with memory mapping

#![allow(clippy::doc_markdown)]

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use ::safetensors::tensor::SafeTensors;
use ::safetensors::Dtype;
use memmap2::Mmap;

use crate::weights::{HostTensor, WeightProvider};
use crate::{Error, Result};

/// Serves weights from SafeTensors files using memory mapping
///
/// Tensors are converted to f32 on request; nothing is read until asked for.
pub struct SafeTensorsProvider {
    /// Memory-mapped files (kept alive for the lifetime of the provider)
    mmaps: Vec<Mmap>,
    tensors: HashMap<String, TensorMeta>,
    source: String,
}

#[derive(Clone)]
struct TensorMeta {
    file_idx: usize,
    shape: Vec<usize>,
    dtype: Dtype,
    data_start: usize,
    data_len: usize,
}

impl SafeTensorsProvider {
    /// Load from a single SafeTensors file
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_files(&[path.as_ref().to_path_buf()])
    }

    /// Load from multiple SafeTensors files (sharded checkpoints)
    ///
    /// # Errors
    /// Returns an error if any file cannot be opened or parsed
    pub fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(paths.len());
        let mut tensors = HashMap::new();

        for (file_idx, path) in paths.iter().enumerate() {
            let file = File::open(path)?;
            // SAFETY: the file is opened read-only and the map lives as long as the provider.
            let mmap = unsafe { Mmap::map(&file)? };

            let st = SafeTensors::deserialize(&mmap)?;
            for (name, tensor) in st.tensors() {
                let data = tensor.data();
                let data_start = data.as_ptr() as usize - mmap.as_ptr() as usize;
                tensors.insert(
                    name.clone(),
                    TensorMeta {
                        file_idx,
                        shape: tensor.shape().to_vec(),
                        dtype: tensor.dtype(),
                        data_start,
                        data_len: data.len(),
                    },
                );
            }

            mmaps.push(mmap);
        }

        let source = paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(";");
        log::debug!("safetensors: indexed {} tensors from {source}", tensors.len());
        Ok(Self {
            mmaps,
            tensors,
            source,
        })
    }

    /// Load every `.safetensors` file in a directory
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read or files cannot be loaded
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "safetensors"))
            .collect();

        if paths.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No .safetensors files found in {}", dir.display()),
            )));
        }

        // Sort for deterministic loading order
        paths.sort();

        Self::from_files(&paths)
    }

    fn meta(&self, name: &str) -> Result<&TensorMeta> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }
}

impl WeightProvider for SafeTensorsProvider {
    fn tensor(&self, name: &str) -> Result<HostTensor> {
        let meta = self.meta(name)?;
        let bytes = &self.mmaps[meta.file_idx][meta.data_start..meta.data_start + meta.data_len];
        let data = decode_f32(meta.dtype, bytes)?;
        HostTensor::new(meta.shape.clone(), data)
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn source_id(&self) -> String {
        self.source.clone()
    }
}

/// Convert little-endian raw bytes to f32. Byte-wise so unaligned maps work.
fn decode_f32(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    match dtype {
        Dtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        Dtype::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(bytes
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        other => Err(Error::UnsupportedDtype(format!(
            "cannot convert {other:?} weights to f32"
        ))),
    }
}
