//! Stream source collaborators.
//!
//! The transport that discovers streams and delivers samples lives behind
//! the [`Source`] and [`Inlet`] traits; the engine only ever consumes this
//! interface. The crate ships one implementation, the synthetic signal
//! generator in [`synthetic`], so the binary runs and the engine is
//! testable without external hardware.

pub mod synthetic;

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Nominal-rate sentinel for irregular/unbounded streams. Disables
/// timeout-based stall detection.
pub const RATE_IRREGULAR: f64 = 0.0;

/// Descriptor for a resolvable stream, as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub name: String,
    pub nominal_rate: f64,
    pub channel_count: usize,
}

/// A batch of samples as delivered by an inlet. `samples[i]` carries the
/// channel values stamped by `timestamps[i]`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Chunk {
    pub samples: Vec<Vec<f64>>,
    pub timestamps: Vec<f64>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Transport-side stream directory: resolves names to stream descriptors
/// and opens inlets for them.
pub trait Source: Send + Sync + 'static {
    type Inlet: Inlet + Send + 'static;

    /// Returns every currently visible stream matching `name`, possibly none.
    fn resolve(&self, name: &str) -> Vec<StreamInfo>;

    /// Opens an inlet for a resolved stream.
    fn open(&self, info: &StreamInfo) -> Result<Self::Inlet>;
}

/// Live connection to one stream.
pub trait Inlet: Send {
    /// Steady-state sampling rate reported by the stream, or
    /// [`RATE_IRREGULAR`].
    fn nominal_rate(&self) -> f64;

    /// Correction subtracted from raw timestamps to align them to the
    /// local clock. Fetched once per session and assumed stable.
    fn clock_offset(&self) -> f64;

    /// Channels per sample; fixed for the inlet's lifetime.
    fn channel_count(&self) -> usize;

    /// Pulls a single sample, blocking up to `timeout` (`None` blocks
    /// indefinitely). Returns `None` when the timeout expires first.
    fn pull_one(
        &mut self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Option<(Vec<f64>, f64)>>> + Send;

    /// Pulls up to `max_samples`, blocking up to `timeout`. A short chunk
    /// means the stream could not keep up within the timeout.
    fn pull_chunk(
        &mut self,
        max_samples: usize,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Chunk>> + Send;
}

/// Resolves `name` against `source`, optionally retrying until a match
/// appears. The first matching descriptor wins. Returns `Ok(None)` when
/// cancelled mid-search; with `keep_searching` unset an empty resolution
/// is an error.
pub async fn discover_stream<S: Source>(
    source: &S,
    name: &str,
    keep_searching: bool,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<Option<StreamInfo>> {
    loop {
        if let Some(info) = source.resolve(name).into_iter().next() {
            return Ok(Some(info));
        }

        if !keep_searching {
            bail!("no stream named {name:?} found");
        }

        debug!(stream = name, "no match yet, retrying discovery");

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
