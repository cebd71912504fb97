//! Built-in signal-generator source.
//!
//! Serves the streams declared in the `synthetic:` configuration section.
//! Each inlet paces sine samples against a start instant at the stream's
//! nominal rate and stamps them with local wall-clock seconds, so the
//! recorded output looks like a live acquisition. A stream with a sample
//! limit ends through the normal stall path: once the generator is
//! exhausted, pulls come back short and the session times out.

use std::f64::consts::TAU;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::time::Instant;

use crate::config::SyntheticStreamConfig;

use super::{Chunk, Inlet, Source, StreamInfo, RATE_IRREGULAR};

/// Pacing rate for streams declared irregular; they still produce at a
/// steady internal cadence but report no nominal rate.
const IRREGULAR_PACE_HZ: f64 = 100.0;

/// Base frequency of the generated sine; channel `i` runs at `(i + 1)`
/// times this.
const WAVE_HZ: f64 = 10.0;

/// Signal generator serving the configured synthetic streams.
pub struct SyntheticSource {
    streams: Vec<SyntheticStreamConfig>,
}

impl SyntheticSource {
    pub fn new(streams: Vec<SyntheticStreamConfig>) -> Self {
        Self { streams }
    }
}

impl Source for SyntheticSource {
    type Inlet = SyntheticInlet;

    fn resolve(&self, name: &str) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .filter(|stream| stream.name == name)
            .map(|stream| StreamInfo {
                name: stream.name.clone(),
                nominal_rate: stream.rate,
                channel_count: stream.channels,
            })
            .collect()
    }

    fn open(&self, info: &StreamInfo) -> Result<Self::Inlet> {
        let cfg = self
            .streams
            .iter()
            .find(|stream| stream.name == info.name)
            .with_context(|| format!("unknown synthetic stream {:?}", info.name))?;
        Ok(SyntheticInlet::new(cfg.clone()))
    }
}

/// One live synthetic stream.
pub struct SyntheticInlet {
    cfg: SyntheticStreamConfig,
    /// Effective generation rate, even for irregular streams.
    pace: f64,
    started: Instant,
    /// Wall-clock seconds at `started`; sample stamps are offsets from it.
    epoch: f64,
    produced: u64,
}

impl SyntheticInlet {
    fn new(cfg: SyntheticStreamConfig) -> Self {
        let pace = if cfg.rate == RATE_IRREGULAR {
            IRREGULAR_PACE_HZ
        } else {
            cfg.rate
        };
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();

        Self {
            cfg,
            pace,
            started: Instant::now(),
            epoch,
            produced: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.cfg.limit > 0 && self.produced >= self.cfg.limit
    }

    fn sample(&self, index: u64) -> (Vec<f64>, f64) {
        let t = index as f64 / self.pace;
        let channels = (0..self.cfg.channels)
            .map(|ch| (TAU * WAVE_HZ * (ch as f64 + 1.0) * t).sin())
            .collect();
        (channels, self.epoch + t)
    }

    /// Waits until sample `index` is due, bounded by `deadline`. Returns
    /// false when the deadline passes first.
    async fn wait_for(&self, index: u64, deadline: Option<Instant>) -> bool {
        let due = self.started + Duration::from_secs_f64(index as f64 / self.pace);
        match deadline {
            Some(deadline) if due > deadline => {
                tokio::time::sleep_until(deadline).await;
                false
            }
            _ => {
                tokio::time::sleep_until(due).await;
                true
            }
        }
    }
}

impl Inlet for SyntheticInlet {
    fn nominal_rate(&self) -> f64 {
        self.cfg.rate
    }

    fn clock_offset(&self) -> f64 {
        0.0
    }

    fn channel_count(&self) -> usize {
        self.cfg.channels
    }

    async fn pull_one(&mut self, timeout: Option<Duration>) -> Result<Option<(Vec<f64>, f64)>> {
        // An exhausted generator reports a timeout immediately rather than
        // blocking out the full window.
        if self.exhausted() {
            return Ok(None);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        if !self.wait_for(self.produced, deadline).await {
            return Ok(None);
        }

        let sample = self.sample(self.produced);
        self.produced += 1;
        Ok(Some(sample))
    }

    async fn pull_chunk(&mut self, max_samples: usize, timeout: Option<Duration>) -> Result<Chunk> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut chunk = Chunk::default();

        while chunk.len() < max_samples && !self.exhausted() {
            if !self.wait_for(self.produced, deadline).await {
                break;
            }
            let (channels, timestamp) = self.sample(self.produced);
            chunk.samples.push(channels);
            chunk.timestamps.push(timestamp);
            self.produced += 1;
        }

        Ok(chunk)
    }
}
