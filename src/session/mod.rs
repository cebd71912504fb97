//! Per-stream acquisition sessions.
//!
//! A [`StreamSession`] owns one stream's inlet, its cached nominal rate and
//! clock offset, the in-memory record buffer, and the liveness flag. One
//! worker drives the session; nothing else touches its buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::sink::{SinkError, SinkTarget};
use crate::source::{Inlet, RATE_IRREGULAR};

/// One clock-corrected sample: the corrected timestamp plus the channel
/// values in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: f64,
    pub channels: Vec<f64>,
}

/// Session liveness: `Active` until the first stall, then terminally
/// `Stalled`. Clones share the flag, so an external shutdown trigger can
/// stall a session its worker is still driving.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    stalled: Arc<AtomicBool>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self) -> bool {
        !self.stalled.load(Ordering::Relaxed)
    }

    /// Transition to `Stalled`. Idempotent; there is no way back.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::Relaxed);
    }
}

/// Computes how long a pull may block before the stream counts as stalled:
/// the expected wall-clock time to accumulate `chunk_size` samples,
/// inflated by the acceptance factor to tolerate jitter. `None` means
/// block indefinitely (irregular-rate streams). Recomputed on every pull.
pub fn pull_timeout(
    nominal_rate: f64,
    chunk_size: usize,
    acceptance_factor: f64,
) -> Option<Duration> {
    if nominal_rate == RATE_IRREGULAR {
        return None;
    }
    Some(Duration::from_secs_f64(
        (1.0 / nominal_rate) * chunk_size as f64 * acceptance_factor,
    ))
}

/// Samples and timestamps exactly as the inlet delivered them,
/// pre-correction, for optional console logging by the caller.
#[derive(Debug, Default)]
pub struct PulledRaw {
    pub samples: Vec<Vec<f64>>,
    pub timestamps: Vec<f64>,
}

impl PulledRaw {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Acquisition state for one configured stream.
pub struct StreamSession<I: Inlet> {
    name: String,
    inlet: I,
    chunk_size: usize,
    acceptance_factor: f64,
    nominal_rate: f64,
    clock_offset: f64,
    buffer: Vec<Record>,
    live: Liveness,
    target: SinkTarget,
}

impl<I: Inlet> StreamSession<I> {
    /// Builds a session, caching the inlet's nominal rate and clock offset
    /// for the session's lifetime.
    pub fn new(
        name: String,
        inlet: I,
        chunk_size: usize,
        acceptance_factor: f64,
        target: SinkTarget,
    ) -> Self {
        let nominal_rate = inlet.nominal_rate();
        let clock_offset = inlet.clock_offset();

        Self {
            name,
            inlet,
            chunk_size: chunk_size.max(1),
            acceptance_factor,
            nominal_rate,
            clock_offset,
            buffer: Vec::new(),
            live: Liveness::new(),
            target,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nominal_rate(&self) -> f64 {
        self.nominal_rate
    }

    pub fn channel_count(&self) -> usize {
        self.inlet.channel_count()
    }

    pub fn is_live(&self) -> bool {
        self.live.is_live()
    }

    /// Marks the session stalled, e.g. on global shutdown.
    pub fn stall(&self) {
        self.live.stall();
    }

    /// Shared handle onto this session's liveness flag.
    pub fn liveness(&self) -> Liveness {
        self.live.clone()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pulls up to the configured chunk of samples, blocking at most the
    /// policy timeout. Corrected records land in the buffer in arrival
    /// order; a short or empty result marks the session stalled after any
    /// partial data is appended. Returns the raw samples for logging.
    pub async fn pull(&mut self) -> Result<PulledRaw> {
        let timeout = pull_timeout(self.nominal_rate, self.chunk_size, self.acceptance_factor);

        // Single-sample polling skips the chunk API entirely.
        if self.chunk_size == 1 {
            return match self.inlet.pull_one(timeout).await? {
                Some((channels, timestamp)) => {
                    self.buffer.push(Record {
                        timestamp: timestamp - self.clock_offset,
                        channels: channels.clone(),
                    });
                    Ok(PulledRaw {
                        samples: vec![channels],
                        timestamps: vec![timestamp],
                    })
                }
                None => {
                    self.live.stall();
                    Ok(PulledRaw::default())
                }
            };
        }

        let chunk = self.inlet.pull_chunk(self.chunk_size, timeout).await?;

        for (channels, &timestamp) in chunk.samples.iter().zip(chunk.timestamps.iter()) {
            self.buffer.push(Record {
                timestamp: timestamp - self.clock_offset,
                channels: channels.clone(),
            });
        }

        if chunk.len() < self.chunk_size {
            self.live.stall();
        }

        Ok(PulledRaw {
            samples: chunk.samples,
            timestamps: chunk.timestamps,
        })
    }

    /// Persists the buffered records to the session's output target. The
    /// buffer is cleared only on success; on failure it is left intact so
    /// the next flush cycle retries. Flushing an empty buffer writes
    /// nothing and succeeds.
    pub fn flush(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.target.append(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Releases the session's output target, e.g. to close a shared
    /// contribution after the trailing flush.
    pub fn into_target(self) -> SinkTarget {
        self.target
    }
}
