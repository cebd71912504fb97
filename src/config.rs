use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::flush::FlushPolicy;

/// Top-level configuration for the streamrec recorder.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Path to the line-oriented stream list.
    pub streams_file: PathBuf,

    /// Directory for output CSV files, created on startup. Default: "./data".
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Timeout leeway multiplier applied to the expected chunk duration.
    /// Must be >= 1. Default: 2.25.
    #[serde(default = "default_acceptance_factor")]
    pub acceptance_factor: f64,

    /// Wait between stream-discovery retries. Default: 1s.
    #[serde(default = "default_discovery_poll_interval", with = "humantime_serde")]
    pub discovery_poll_interval: Duration,

    /// Flush-trigger policy, one for the whole run.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Durability behavior at flush boundaries. Default: flush.
    #[serde(default)]
    pub durability: Durability,

    /// Streams served by the built-in signal generator.
    #[serde(default)]
    pub synthetic: Vec<SyntheticStreamConfig>,
}

/// Flush-trigger policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Policy selector. Default: count.
    #[serde(default)]
    pub mode: FlushMode,

    /// Samples per flush in count mode. Default: 100.
    #[serde(default = "default_count_threshold")]
    pub count_threshold: usize,

    /// Wall-clock period in interval mode. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl FlushConfig {
    /// Resolves the configured mode into a policy value.
    pub fn policy(&self) -> FlushPolicy {
        match self.mode {
            FlushMode::Count => FlushPolicy::Count {
                threshold: self.count_threshold,
            },
            FlushMode::Interval => FlushPolicy::Interval {
                every: self.interval,
            },
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            mode: FlushMode::default(),
            count_threshold: default_count_threshold(),
            interval: default_flush_interval(),
        }
    }
}

/// Flush policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    Count,
    Interval,
}

impl Default for FlushMode {
    fn default() -> Self {
        Self::Count
    }
}

/// Durability at flush boundaries: drain the buffered writer, or
/// additionally force the batch to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Flush,
    Sync,
}

impl Default for Durability {
    fn default() -> Self {
        Self::Flush
    }
}

/// One stream served by the built-in signal generator.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticStreamConfig {
    pub name: String,

    /// Nominal rate in Hz; 0 declares an irregular rate.
    #[serde(default = "default_synthetic_rate")]
    pub rate: f64,

    /// Channels per sample.
    pub channels: usize,

    /// Stop after this many samples; 0 = unlimited.
    #[serde(default)]
    pub limit: u64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_acceptance_factor() -> f64 {
    2.25
}

fn default_discovery_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_count_threshold() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_synthetic_rate() -> f64 {
    100.0
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.streams_file.as_os_str().is_empty() {
            bail!("streams_file is required");
        }

        if self.acceptance_factor < 1.0 {
            bail!("acceptance_factor must be >= 1");
        }

        if self.discovery_poll_interval.is_zero() {
            bail!("discovery_poll_interval must be positive");
        }

        if self.flush.count_threshold == 0 {
            bail!("flush.count_threshold must be positive");
        }

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        let mut names = HashSet::new();
        for stream in &self.synthetic {
            if stream.name.is_empty() {
                bail!("synthetic stream names must be non-empty");
            }
            if stream.channels == 0 {
                bail!(
                    "synthetic stream {:?} must have at least one channel",
                    stream.name
                );
            }
            if stream.rate < 0.0 {
                bail!("synthetic stream {:?} rate must be >= 0", stream.name);
            }
            if !names.insert(stream.name.as_str()) {
                bail!("duplicate synthetic stream name {:?}", stream.name);
            }
        }

        Ok(())
    }
}

// --- Stream list ---

/// One configured stream, parsed from a stream-list line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    /// Retry discovery until the stream appears.
    pub keep_searching: bool,
    /// Samples requested per pull.
    pub chunk_size: usize,
    /// Echo raw pulled samples to the log.
    pub log_to_console: bool,
    /// Report into this named shared output instead of an exclusive file.
    pub shared_output: Option<String>,
}

/// Parses one stream-list line:
/// `<name>;<keep_searching>[;<chunk_size>[;<log_to_console>[;<shared_output>]]]`.
pub fn parse_stream_line(line: &str) -> Result<StreamSpec> {
    let fields: Vec<&str> = line.split(';').map(str::trim).collect();

    if fields.len() < 2 || fields.len() > 5 {
        bail!("expected 2 to 5 ';'-separated fields, got {}", fields.len());
    }

    let name = fields[0];
    if name.is_empty() {
        bail!("empty stream name");
    }

    let mut spec = StreamSpec {
        name: name.to_string(),
        keep_searching: parse_bool(fields[1])?,
        chunk_size: 1,
        log_to_console: false,
        shared_output: None,
    };

    if let Some(raw) = fields.get(2) {
        let chunk: i64 = raw
            .parse()
            .with_context(|| format!("invalid chunk size {raw:?}"))?;
        // Nonsense chunk sizes are clamped rather than rejected.
        spec.chunk_size = chunk.max(1) as usize;
    }

    if let Some(raw) = fields.get(3) {
        spec.log_to_console = parse_bool(raw)?;
    }

    if let Some(raw) = fields.get(4) {
        if !raw.is_empty() {
            spec.shared_output = Some((*raw).to_string());
        }
    }

    Ok(spec)
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => bail!("expected true or false, got {other:?}"),
    }
}

/// Parses the stream list, skipping blank lines and reporting malformed
/// lines with their original text.
pub fn parse_stream_specs(data: &str) -> Vec<StreamSpec> {
    let mut specs = Vec::new();

    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_stream_line(line) {
            Ok(spec) => specs.push(spec),
            Err(e) => warn!(line = %line, error = %e, "skipping malformed stream line"),
        }
    }

    specs
}

/// Loads the stream list from disk.
pub fn load_stream_specs(path: &Path) -> Result<Vec<StreamSpec>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading streams file {}", path.display()))?;
    Ok(parse_stream_specs(&data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "streams_file: streams.txt\n"
    }

    #[test]
    fn test_config_defaults() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("parses");
        cfg.validate().expect("valid");

        assert_eq!(cfg.output_dir, PathBuf::from("./data"));
        assert_eq!(cfg.acceptance_factor, 2.25);
        assert_eq!(cfg.discovery_poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.flush.mode, FlushMode::Count);
        assert_eq!(cfg.flush.count_threshold, 100);
        assert_eq!(cfg.flush.interval, Duration::from_secs(1));
        assert_eq!(cfg.durability, Durability::Flush);
        assert!(cfg.synthetic.is_empty());
    }

    #[test]
    fn test_config_full_document() {
        let yaml = r#"
streams_file: /etc/streamrec/streams.txt
output_dir: /var/lib/streamrec
acceptance_factor: 3.0
discovery_poll_interval: 250ms
flush:
  mode: interval
  interval: 5s
durability: sync
synthetic:
  - name: eeg1
    rate: 256.0
    channels: 8
  - name: markers
    rate: 0
    channels: 1
    limit: 100
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");

        assert_eq!(cfg.discovery_poll_interval, Duration::from_millis(250));
        assert!(matches!(
            cfg.flush.policy(),
            FlushPolicy::Interval { every } if every == Duration::from_secs(5)
        ));
        assert_eq!(cfg.durability, Durability::Sync);
        assert_eq!(cfg.synthetic.len(), 2);
        assert_eq!(cfg.synthetic[1].rate, 0.0);
        assert_eq!(cfg.synthetic[1].limit, 100);
    }

    #[test]
    fn test_validate_rejects_low_acceptance_factor() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("parses");
        cfg.acceptance_factor = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_count_threshold() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("parses");
        cfg.flush.count_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_synthetic_names() {
        let yaml = r#"
streams_file: streams.txt
synthetic:
  - name: a
    channels: 1
  - name: a
    channels: 2
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_channels() {
        let yaml = r#"
streams_file: streams.txt
synthetic:
  - name: a
    channels: 0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_stream_line_minimal() {
        let spec = parse_stream_line("eeg1;false").expect("parses");
        assert_eq!(
            spec,
            StreamSpec {
                name: "eeg1".to_string(),
                keep_searching: false,
                chunk_size: 1,
                log_to_console: false,
                shared_output: None,
            }
        );
    }

    #[test]
    fn test_parse_stream_line_all_fields() {
        let spec = parse_stream_line("eeg1; TRUE ; 32 ; true ; merged").expect("parses");
        assert_eq!(spec.name, "eeg1");
        assert!(spec.keep_searching);
        assert_eq!(spec.chunk_size, 32);
        assert!(spec.log_to_console);
        assert_eq!(spec.shared_output.as_deref(), Some("merged"));
    }

    #[test]
    fn test_parse_stream_line_clamps_chunk_size() {
        let spec = parse_stream_line("eeg1;false;0").expect("parses");
        assert_eq!(spec.chunk_size, 1);

        let spec = parse_stream_line("eeg1;false;-4").expect("parses");
        assert_eq!(spec.chunk_size, 1);
    }

    #[test]
    fn test_parse_stream_line_malformed() {
        // Too few fields.
        assert!(parse_stream_line("eeg1").is_err());
        // Too many fields.
        assert!(parse_stream_line("a;true;1;false;shared;extra").is_err());
        // Non-boolean keep_searching.
        assert!(parse_stream_line("eeg1;yes").is_err());
        // Non-integer chunk size.
        assert!(parse_stream_line("eeg1;true;many").is_err());
        // Non-boolean log flag.
        assert!(parse_stream_line("eeg1;true;1;loudly").is_err());
        // Empty name.
        assert!(parse_stream_line(";true").is_err());
    }

    #[test]
    fn test_parse_stream_specs_skips_malformed_lines() {
        let data = "eeg1;false\n\nbroken line\nekg;true;8;false;merged\n";
        let specs = parse_stream_specs(data);

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "eeg1");
        assert_eq!(specs[1].name, "ekg");
        assert_eq!(specs[1].shared_output.as_deref(), Some("merged"));
    }
}
