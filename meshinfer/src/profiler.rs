//! Named wall-clock spans with an optional iteration tag.
//!
//! The generator is the only caller: it opens and closes spans around each
//! phase and the perf reporter reads the durations back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

type Key = (String, Option<usize>);

/// Records `start`/`end` pairs keyed by `(name, iteration)`.
#[derive(Debug, Default)]
pub struct Profiler {
    open: HashMap<Key, Instant>,
    closed: HashMap<Key, Duration>,
}

impl Profiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a span. Re-opening an open span restarts it.
    pub fn start(&mut self, name: &str, iteration: Option<usize>) {
        self.open.insert((name.to_string(), iteration), Instant::now());
    }

    /// Close a span opened with [`Self::start`]. Closing a span that was
    /// never opened is ignored with a warning.
    pub fn end(&mut self, name: &str, iteration: Option<usize>) {
        let key = (name.to_string(), iteration);
        match self.open.remove(&key) {
            Some(started) => {
                self.closed.insert(key, started.elapsed());
            }
            None => log::warn!("profiler: end({name}, {iteration:?}) without start"),
        }
    }

    /// Store an externally measured duration.
    pub fn record(&mut self, name: &str, iteration: Option<usize>, duration: Duration) {
        self.closed.insert((name.to_string(), iteration), duration);
    }

    /// Duration of a closed span.
    #[must_use]
    pub fn duration(&self, name: &str, iteration: Option<usize>) -> Option<Duration> {
        self.closed.get(&(name.to_string(), iteration)).copied()
    }

    /// Duration in seconds, `0.0` for spans that were never closed.
    #[must_use]
    pub fn seconds(&self, name: &str, iteration: Option<usize>) -> f64 {
        self.duration(name, iteration)
            .map_or(0.0, |d| d.as_secs_f64())
    }

    /// Forget every span.
    pub fn clear(&mut self) {
        self.open.clear();
        self.closed.clear();
    }
}
