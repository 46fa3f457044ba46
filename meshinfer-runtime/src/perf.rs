//! Throughput report for one repeat-batch and the targets it is held to.
//!
//! Missing a target is reported with `log::warn!` and never fails a run.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use meshinfer::{MeshShape, Profiler, Result};

use crate::decode::DecodeRecord;

/// Expected decode throughput of one model on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfTarget {
    pub device: String,
    pub model: String,
    /// Decode tokens per second per user.
    pub decode_t_s_u: f64,
}

/// Lookup table of [`PerfTarget`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerfTargets {
    targets: Vec<PerfTarget>,
}

impl Default for PerfTargets {
    fn default() -> Self {
        let target = |device: &str, model: &str, decode_t_s_u: f64| PerfTarget {
            device: device.into(),
            model: model.into(),
            decode_t_s_u,
        };
        Self {
            targets: vec![
                target("N150", "1B", 60.0),
                target("N150", "3B", 30.0),
                target("N150", "8B", 20.0),
                target("N300", "8B", 28.0),
                target("T3K", "8B", 38.0),
                target("T3K", "70B", 15.0),
            ],
        }
    }
}

impl PerfTargets {
    /// Defaults overridden entry by entry from a JSON list.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let overrides: Vec<PerfTarget> = serde_json::from_str(&content)?;
        let mut targets = Self::default();
        for entry in overrides {
            targets.set(entry);
        }
        Ok(targets)
    }

    /// Insert or replace the entry for `target.device`/`target.model`.
    pub fn set(&mut self, target: PerfTarget) {
        match self
            .targets
            .iter_mut()
            .find(|t| t.device == target.device && t.model == target.model)
        {
            Some(existing) => *existing = target,
            None => self.targets.push(target),
        }
    }

    #[must_use]
    pub fn lookup(&self, device: &str, model: &str) -> Option<f64> {
        self.targets
            .iter()
            .find(|t| t.device == device && t.model == model)
            .map(|t| t.decode_t_s_u)
    }
}

/// Board name for a mesh shape, used as the target table's device key.
#[must_use]
pub fn device_name(shape: MeshShape) -> String {
    match (shape.rows, shape.cols) {
        (1, 1) => "N150".into(),
        (1, 2) => "N300".into(),
        (1, 8) | (2, 4) => "T3K".into(),
        _ => shape.to_string(),
    }
}

/// Derived metrics of one repeat-batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfReport {
    pub device: String,
    pub model: String,
    pub batch_size: usize,
    pub compile_prefill: f64,
    pub compile_decode: f64,
    pub inference_prefill: f64,
    pub inference_decode: f64,
    pub prefill_time_to_token: f64,
    #[serde(rename = "prefill_t/s")]
    pub prefill_t_s: f64,
    #[serde(rename = "decode_t/s/u")]
    pub decode_t_s_u: f64,
    #[serde(rename = "decode_t/s")]
    pub decode_t_s: f64,
    pub total_compile: f64,
    pub full_runtime: f64,
    /// Decode iterations counted in `inference_decode`.
    pub decode_iterations: usize,
}

/// Counts the report needs beyond the profiler spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCounts {
    pub batch_size: usize,
    /// Prompt tokens prefilled inside the `inference_prefill` span.
    pub prefill_tokens: usize,
    /// Decode iterations after the compile iteration.
    pub decode_iterations: usize,
}

#[allow(clippy::cast_precision_loss)]
fn rate(count: usize, seconds: f64) -> f64 {
    if seconds > 0.0 {
        count as f64 / seconds
    } else {
        0.0
    }
}

impl PerfReport {
    /// Build the report from the spans the generator recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(profiler: &Profiler, device: &str, model: &str, counts: RunCounts, full_runtime: f64) -> Self {
        let compile_prefill = profiler.seconds("compile_prefill", None);
        let compile_decode = profiler.seconds("compile_decode", None);
        let inference_prefill = profiler.seconds("inference_prefill", None);
        let inference_decode = profiler.seconds("inference_decode", None);
        let timed_users = counts.batch_size.saturating_sub(1).max(1);
        let decode_t_s_u = rate(counts.decode_iterations, inference_decode);
        Self {
            device: device.to_string(),
            model: model.to_string(),
            batch_size: counts.batch_size,
            compile_prefill,
            compile_decode,
            inference_prefill,
            inference_decode,
            prefill_time_to_token: inference_prefill / timed_users as f64,
            prefill_t_s: rate(counts.prefill_tokens, inference_prefill),
            decode_t_s_u,
            decode_t_s: decode_t_s_u * counts.batch_size as f64,
            total_compile: compile_prefill + compile_decode,
            full_runtime,
            decode_iterations: counts.decode_iterations,
        }
    }

    /// Compare against `targets`. Returns `None` when the table has no entry
    /// for this device and model, otherwise whether the target was met.
    pub fn check_targets(&self, targets: &PerfTargets) -> Option<bool> {
        let Some(target) = targets.lookup(&self.device, &self.model) else {
            log::info!("No decode target for {} on {}", self.model, self.device);
            return None;
        };
        let met = self.decode_t_s_u >= target;
        if met {
            log::info!(
                "{} on {}: {:.2} t/s/u meets the {target:.2} t/s/u target",
                self.model,
                self.device,
                self.decode_t_s_u
            );
        } else {
            log::warn!(
                "{} on {}: {:.2} t/s/u is below the {target:.2} t/s/u target",
                self.model,
                self.device,
                self.decode_t_s_u
            );
        }
        Some(met)
    }

    /// Column names of the benchmark CSV.
    pub const CSV_HEADER: &'static str = "compile_prefill,compile_decode,inference_prefill,inference_decode,\
prefill_t/s,decode_t/s,decode_t/s/u,Total compile time,Full demo runtime";

    #[must_use]
    pub fn csv_row(&self) -> String {
        let mut row = String::new();
        for (i, v) in [
            self.compile_prefill,
            self.compile_decode,
            self.inference_prefill,
            self.inference_decode,
            self.prefill_t_s,
            self.decode_t_s,
            self.decode_t_s_u,
            self.total_compile,
            self.full_runtime,
        ]
        .iter()
        .enumerate()
        {
            if i > 0 {
                row.push(',');
            }
            let _ = write!(row, "{v:.6}");
        }
        row
    }

    /// Append this report to `path`, writing the header if the file is new.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn append_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let is_new = !path.exists() || std::fs::metadata(path)?.len() == 0;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_new {
            writeln!(file, "{}", Self::CSV_HEADER)?;
        }
        writeln!(file, "{}", self.csv_row())?;
        Ok(())
    }

    /// Write the report as pretty JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Log the summary at info level.
    pub fn log(&self) {
        log::info!(
            "Prefill: {:.3}s compile, {:.1}ms to first token, {:.1} tok/s",
            self.compile_prefill,
            self.prefill_time_to_token * 1000.0,
            self.prefill_t_s
        );
        log::info!(
            "Decode: {:.3}s compile, {:.2} tok/s/user, {:.2} tok/s over {} iterations",
            self.compile_decode,
            self.decode_t_s_u,
            self.decode_t_s,
            self.decode_iterations
        );
        log::info!(
            "Total compile {:.3}s, full runtime {:.3}s",
            self.total_compile,
            self.full_runtime
        );
    }
}

/// Write one JSON line per decode iteration.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_iteration_log(path: impl AsRef<Path>, records: &[DecodeRecord]) -> Result<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}
