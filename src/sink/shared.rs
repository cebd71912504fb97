//! Shared multi-stream outputs keyed by aligned timestamp bins.
//!
//! Several sessions can report into one named output instead of writing
//! their own files. The output tracks the minimum nominal rate across its
//! contributors, which fixes the spacing of an approximate common sample
//! grid: bin key `k` represents time `k / min_rate`. Flushed records land
//! in the nearest bin within half a slot, or open a new bin.
//!
//! All aggregate state of one output sits behind a single mutex; workers
//! contend only when they flush into the same output.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::align;
use crate::config::Durability;
use crate::session::Record;
use crate::source::RATE_IRREGULAR;

use super::SinkError;

/// Grid rate used while every contributor reports an irregular rate.
const FALLBACK_GRID_HZ: f64 = 1.0;

#[derive(Debug, Default)]
struct SharedState {
    /// Minimum regular nominal rate across contributors; `None` until the
    /// first regular-rate session registers.
    min_rate: Option<f64>,
    /// Sum of contributors' channel counts.
    total_channels: usize,
    /// Contributors that registered and have not yet closed.
    open_contributors: usize,
    /// Bin key -> per-channel values, NaN where nothing landed yet.
    bins: BTreeMap<i64, Vec<f64>>,
    written: bool,
}

impl SharedState {
    fn grid_rate(&self) -> f64 {
        self.min_rate.unwrap_or(FALLBACK_GRID_HZ)
    }
}

/// One named shared output.
pub struct SharedOutput {
    name: String,
    path: PathBuf,
    durability: Durability,
    state: Mutex<SharedState>,
}

impl SharedOutput {
    fn new(name: String, path: PathBuf, durability: Durability) -> Self {
        Self {
            name,
            path,
            durability,
            state: Mutex::new(SharedState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Minimum regular nominal rate seen so far, or the fallback grid rate.
    pub fn grid_rate(&self) -> f64 {
        self.state.lock().grid_rate()
    }

    pub fn total_channels(&self) -> usize {
        self.state.lock().total_channels
    }

    pub fn bin_count(&self) -> usize {
        self.state.lock().bins.len()
    }

    /// Claims a channel range for a contributing session and returns its
    /// offset. Irregular-rate contributors never lower the grid rate.
    fn register(&self, nominal_rate: f64, channel_count: usize) -> usize {
        let mut state = self.state.lock();

        let offset = state.total_channels;
        state.total_channels += channel_count;
        state.open_contributors += 1;

        if nominal_rate != RATE_IRREGULAR {
            state.min_rate = Some(match state.min_rate {
                Some(rate) => rate.min(nominal_rate),
                None => nominal_rate,
            });
        }

        offset
    }

    /// Folds a batch of records into the bins under the contributor's
    /// channel range. Later records overwrite their range within a bin.
    fn absorb(
        &self,
        channel_offset: usize,
        channel_count: usize,
        records: &[Record],
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let grid_rate = state.grid_rate();
        let total = state.total_channels;

        // Key set snapshot for the aligner; kept sorted across inserts.
        let mut keys: Vec<i64> = state.bins.keys().copied().collect();

        for record in records {
            let position = record.timestamp * grid_rate;

            let key = match align::nearest(&keys, position) {
                Some(near) if (position - near as f64).abs() <= 0.5 => near,
                _ => {
                    let fresh = position.round() as i64;
                    if !state.bins.contains_key(&fresh) {
                        state.bins.insert(fresh, vec![f64::NAN; total]);
                        let at = keys.partition_point(|&key| key < fresh);
                        keys.insert(at, fresh);
                    }
                    fresh
                }
            };

            let bin = state
                .bins
                .get_mut(&key)
                .expect("aligned key exists in bins");
            if bin.len() < total {
                bin.resize(total, f64::NAN);
            }

            let range = &mut bin[channel_offset..channel_offset + channel_count];
            for (slot, value) in range.iter_mut().zip(record.channels.iter()) {
                *slot = *value;
            }
        }

        Ok(())
    }

    /// Releases one contributor. The last one out writes the CSV.
    fn close(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.open_contributors = state.open_contributors.saturating_sub(1);
        if state.open_contributors > 0 {
            return Ok(());
        }
        self.write_csv(&mut state)
    }

    /// Dumps the bins as CSV: bin time first, then every channel column,
    /// unpopulated positions left empty. Bins are retained on failure.
    fn write_csv(&self, state: &mut SharedState) -> Result<(), SinkError> {
        if state.written || state.bins.is_empty() {
            return Ok(());
        }

        let grid_rate = state.grid_rate();
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);

        for (key, values) in &state.bins {
            let mut row = String::new();
            let _ = write!(row, "{}", *key as f64 / grid_rate);
            for column in 0..state.total_channels {
                row.push(',');
                match values.get(column) {
                    Some(value) if !value.is_nan() => {
                        let _ = write!(row, "{value}");
                    }
                    _ => {}
                }
            }
            row.push('\n');
            writer.write_all(row.as_bytes())?;
        }
        writer.flush()?;

        if self.durability == Durability::Sync {
            writer.get_ref().sync_data()?;
        }

        state.written = true;
        info!(output = %self.name, bins = state.bins.len(), "shared output written");
        Ok(())
    }
}

/// Registry of named shared outputs, shared by all workers. Entries are
/// created at configuration load, before any session using them starts.
pub struct SharedRegistry {
    output_dir: PathBuf,
    durability: Durability,
    entries: DashMap<String, Arc<SharedOutput>>,
}

impl SharedRegistry {
    pub fn new(output_dir: PathBuf, durability: Durability) -> Self {
        Self {
            output_dir,
            durability,
            entries: DashMap::new(),
        }
    }

    /// Creates the entry on first sight of the name.
    pub fn ensure(&self, name: &str) -> Arc<SharedOutput> {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(SharedOutput::new(
                    name.to_string(),
                    self.output_dir.join(format!("{name}.csv")),
                    self.durability,
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<SharedOutput>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registers a contributing session and hands back its claim on the
    /// output's channel range.
    pub fn register(
        &self,
        name: &str,
        nominal_rate: f64,
        channel_count: usize,
    ) -> SharedHandle {
        let output = self.ensure(name);
        let channel_offset = output.register(nominal_rate, channel_count);
        SharedHandle {
            output,
            channel_offset,
            channel_count,
        }
    }
}

/// A session's claim on a shared output: its channel range plus the
/// contributor bookkeeping released by [`SharedHandle::close`].
pub struct SharedHandle {
    output: Arc<SharedOutput>,
    channel_offset: usize,
    channel_count: usize,
}

impl SharedHandle {
    pub fn output(&self) -> &Arc<SharedOutput> {
        &self.output
    }

    pub fn channel_offset(&self) -> usize {
        self.channel_offset
    }

    /// Folds a flushed batch into the shared bins.
    pub fn absorb(&mut self, records: &[Record]) -> Result<(), SinkError> {
        self.output
            .absorb(self.channel_offset, self.channel_count, records)
    }

    /// Releases this contributor; the last one out writes the CSV.
    pub fn close(self) -> Result<(), SinkError> {
        self.output.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: f64, channels: &[f64]) -> Record {
        Record {
            timestamp,
            channels: channels.to_vec(),
        }
    }

    fn registry(dir: &Path) -> SharedRegistry {
        SharedRegistry::new(dir.to_path_buf(), Durability::Flush)
    }

    #[test]
    fn test_register_tracks_min_rate_and_channel_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        let first = registry.register("merged", 256.0, 8);
        let second = registry.register("merged", 100.0, 2);
        let irregular = registry.register("merged", RATE_IRREGULAR, 1);

        assert_eq!(first.channel_offset(), 0);
        assert_eq!(second.channel_offset(), 8);
        assert_eq!(irregular.channel_offset(), 10);

        let output = registry.get("merged").expect("entry exists");
        assert_eq!(output.grid_rate(), 100.0);
        assert_eq!(output.total_channels(), 11);
    }

    #[test]
    fn test_all_irregular_contributors_fall_back_to_unit_grid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        registry.register("merged", RATE_IRREGULAR, 1);
        let output = registry.get("merged").expect("entry exists");
        assert_eq!(output.grid_rate(), FALLBACK_GRID_HZ);
    }

    #[test]
    fn test_absorb_reuses_bins_within_half_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        let mut handle = registry.register("merged", 1.0, 1);

        // 10.0 opens a bin; 10.4 is within half a slot of it; 10.6 is not.
        handle
            .absorb(&[
                record(10.0, &[1.0]),
                record(10.4, &[2.0]),
                record(10.6, &[3.0]),
            ])
            .expect("absorb succeeds");

        let output = registry.get("merged").expect("entry exists");
        assert_eq!(output.bin_count(), 2);

        let state = output.state.lock();
        // The second record overwrote the first within bin 10.
        assert_eq!(state.bins[&10], vec![2.0]);
        assert_eq!(state.bins[&11], vec![3.0]);
    }

    #[test]
    fn test_absorb_places_channels_at_registered_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        let mut left = registry.register("merged", 10.0, 2);
        let mut right = registry.register("merged", 10.0, 1);

        left.absorb(&[record(0.0, &[1.0, 2.0])]).expect("absorb");
        right.absorb(&[record(0.0, &[9.0])]).expect("absorb");

        let output = registry.get("merged").expect("entry exists");
        let state = output.state.lock();
        assert_eq!(state.bins[&0], vec![1.0, 2.0, 9.0]);
    }

    #[test]
    fn test_absorb_widens_bins_for_late_registrants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        let mut early = registry.register("merged", 10.0, 1);
        early.absorb(&[record(0.0, &[1.0])]).expect("absorb");

        // A later contributor widens the channel span of existing bins.
        let mut late = registry.register("merged", 10.0, 1);
        late.absorb(&[record(0.0, &[2.0])]).expect("absorb");

        let output = registry.get("merged").expect("entry exists");
        let state = output.state.lock();
        assert_eq!(state.bins[&0], vec![1.0, 2.0]);
    }

    #[test]
    fn test_last_close_writes_csv_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        let mut left = registry.register("merged", 10.0, 1);
        let mut right = registry.register("merged", 10.0, 1);

        left.absorb(&[record(0.0, &[1.0]), record(0.1, &[2.0])])
            .expect("absorb");
        right.absorb(&[record(0.0, &[5.0])]).expect("absorb");

        let output = registry.get("merged").expect("entry exists");
        let path = output.path().to_path_buf();

        left.close().expect("close succeeds");
        assert!(!path.exists(), "file appears only after the last close");

        right.close().expect("close succeeds");
        let written = std::fs::read_to_string(&path).expect("output exists");
        // Bin 0 holds both streams; bin 1 (t = 0.1) only the first.
        assert_eq!(written, "0,1,5\n0.1,2,\n");
    }

    #[test]
    fn test_close_without_data_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path());

        let handle = registry.register("merged", 10.0, 1);
        let output = registry.get("merged").expect("entry exists");
        let path = output.path().to_path_buf();

        handle.close().expect("close succeeds");
        assert!(!path.exists());
    }
}
