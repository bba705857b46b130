//! Configuration records for the daemon and for individual sets.
//!
//! The global config is loaded from a TOML file with `HLLD_*`
//! environment overrides layered on top. Each set additionally persists
//! a small `config.ini` in its data directory holding the settings it
//! was created with plus the last flushed size estimate; that file uses
//! a fixed INI layout for compatibility with existing set directories.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::hll;
use crate::logging;
use crate::{HlldError, Result};

/// Global daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    /// Target error rate; always snapped to the achievable bound for
    /// `default_precision`.
    pub default_eps: f64,
    pub default_precision: u8,
    /// Seconds between scheduled flushes. 0 disables the flush worker.
    pub flush_interval: u64,
    /// Seconds between cold sweeps. 0 disables the cold-unmap worker.
    pub cold_interval: u64,
    pub in_memory: bool,
    pub worker_threads: usize,
    pub use_mmap: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            tcp_port: 4553,
            udp_port: 4554,
            bind_address: "0.0.0.0".to_string(),
            data_dir: PathBuf::from("/tmp/hlld"),
            log_level: "INFO".to_string(),
            default_eps: 0.01625,
            default_precision: 12,
            flush_interval: 60,
            cold_interval: 3600,
            in_memory: false,
            worker_threads: 1,
            use_mmap: false,
        }
    }
}

/// File/env representation: every field optional so absent keys keep
/// their defaults and precision/eps interplay can be resolved in order.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
    bind_address: Option<String>,
    data_dir: Option<PathBuf>,
    log_level: Option<String>,
    default_eps: Option<f64>,
    default_precision: Option<u8>,
    flush_interval: Option<u64>,
    cold_interval: Option<u64>,
    in_memory: Option<bool>,
    worker_threads: Option<usize>,
    use_mmap: Option<bool>,
}

impl GlobalConfig {
    /// Load configuration: defaults, then the TOML file (if given), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = GlobalConfig::default();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading config file");
            let contents = fs::read_to_string(path)?;
            let raw: RawConfig = toml::from_str(&contents)?;
            config.apply(raw);
        }

        config.apply(RawConfig::from_env());
        Ok(config)
    }

    fn apply(&mut self, raw: RawConfig) {
        if let Some(v) = raw.tcp_port {
            self.tcp_port = v;
        }
        if let Some(v) = raw.udp_port {
            self.udp_port = v;
        }
        if let Some(v) = raw.bind_address {
            self.bind_address = v;
        }
        if let Some(v) = raw.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = raw.log_level {
            self.log_level = v;
        }
        if let Some(v) = raw.flush_interval {
            self.flush_interval = v;
        }
        if let Some(v) = raw.cold_interval {
            self.cold_interval = v;
        }
        if let Some(v) = raw.in_memory {
            self.in_memory = v;
        }
        if let Some(v) = raw.worker_threads {
            self.worker_threads = v;
        }
        if let Some(v) = raw.use_mmap {
            self.use_mmap = v;
        }

        // Precision and epsilon are coupled. An explicit precision
        // derives the epsilon it achieves; an explicit epsilon derives
        // the precision needed, then snaps back to the achievable bound.
        // Epsilon wins when both are present.
        if let Some(p) = raw.default_precision {
            self.default_precision = p;
            if let Ok(eps) = hll::error_for_precision(p) {
                self.default_eps = eps;
            }
        }
        if let Some(eps) = raw.default_eps {
            self.default_eps = eps;
            if let Ok(p) = hll::precision_for_error(eps) {
                self.default_precision = p;
                // precision_for_error only returns in-range precisions.
                self.default_eps = hll::error_for_precision(p).unwrap();
            }
        }
    }

    /// Validates the configuration, creating the data directory if
    /// needed. Out-of-range values fail; risky-but-legal values warn.
    pub fn validate(&self) -> Result<()> {
        self.check_data_dir()?;
        logging::parse_level(&self.log_level)?;

        let max_eps = hll::error_for_precision(hll::MIN_PRECISION).unwrap();
        let min_eps = hll::error_for_precision(hll::MAX_PRECISION).unwrap();
        if self.default_eps > max_eps {
            return Err(HlldError::InvalidArgument(format!(
                "epsilon cannot be greater than {max_eps}"
            )));
        }
        if self.default_eps < min_eps {
            return Err(HlldError::InvalidArgument(format!(
                "epsilon cannot be less than {min_eps}"
            )));
        }
        if self.default_eps < 0.005 {
            warn!("Epsilon very low, could cause high memory usage");
        }

        if self.default_precision < hll::MIN_PRECISION
            || self.default_precision > hll::MAX_PRECISION
        {
            return Err(HlldError::InvalidArgument(format!(
                "precision must be in [{}, {}]",
                hll::MIN_PRECISION,
                hll::MAX_PRECISION
            )));
        }
        if self.default_precision > 15 {
            warn!("Precision very high, could cause high memory usage");
        }

        if self.flush_interval == 0 {
            warn!("Flushing is disabled! Increased risk of data loss.");
        } else if self.flush_interval >= 600 {
            warn!("Flushing set to be very infrequent! Increased risk of data loss.");
        }

        if self.cold_interval == 0 {
            warn!("Cold data unmapping is disabled! Memory usage may be high.");
        } else if self.cold_interval < 300 {
            warn!("Cold interval is less than 5 minutes. This may cause excessive unmapping.");
        }

        if self.in_memory {
            warn!("Default sets are in-memory only! Sets not persisted by default.");
        }
        if !self.use_mmap {
            warn!("Without use_mmap, a crash of hlld can result in data loss.");
        }

        if self.worker_threads == 0 {
            return Err(HlldError::InvalidArgument(
                "cannot have fewer than one worker thread".to_string(),
            ));
        }

        Ok(())
    }

    /// The data dir must be a writable directory; create it if absent.
    fn check_data_dir(&self) -> Result<()> {
        match fs::metadata(&self.data_dir) {
            Ok(md) if !md.is_dir() => {
                return Err(HlldError::InvalidArgument(format!(
                    "data directory {} exists and is not a directory",
                    self.data_dir.display()
                )));
            }
            Ok(_) => {}
            Err(_) => fs::create_dir_all(&self.data_dir)?,
        }

        // Probe for write permission the same way a set creation would.
        let probe = self.data_dir.join("PERMTEST");
        let res = fs::File::create(&probe);
        let _ = fs::remove_file(&probe);
        res?;
        Ok(())
    }
}

impl RawConfig {
    fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        Self {
            tcp_port: parse("HLLD_TCP_PORT"),
            udp_port: parse("HLLD_UDP_PORT"),
            bind_address: std::env::var("HLLD_BIND_ADDRESS").ok(),
            data_dir: std::env::var("HLLD_DATA_DIR").ok().map(PathBuf::from),
            log_level: std::env::var("HLLD_LOG_LEVEL").ok(),
            default_eps: parse("HLLD_DEFAULT_EPS"),
            default_precision: parse("HLLD_DEFAULT_PRECISION"),
            flush_interval: parse("HLLD_FLUSH_INTERVAL"),
            cold_interval: parse("HLLD_COLD_INTERVAL"),
            in_memory: parse("HLLD_IN_MEMORY"),
            worker_threads: parse("HLLD_WORKERS"),
            use_mmap: parse("HLLD_USE_MMAP"),
        }
    }
}

/// Per-set configuration, persisted alongside the registers.
#[derive(Debug, Clone, PartialEq)]
pub struct SetConfig {
    /// Last flushed size estimate; serves proxied size queries.
    pub size: u64,
    pub default_eps: f64,
    pub default_precision: u8,
    pub in_memory: bool,
}

impl SetConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            size: 0,
            default_eps: global.default_eps,
            default_precision: global.default_precision,
            in_memory: global.in_memory,
        }
    }

    /// Reads a `config.ini` and overlays recognized keys onto `self`.
    /// Unparseable values are skipped with a warning so one corrupt file
    /// never prevents a set from loading with merged defaults.
    pub fn merge_from_file(&mut self, path: &Path) -> io::Result<()> {
        let contents = fs::read_to_string(path)?;

        let mut in_section = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = section.eq_ignore_ascii_case("hlld");
                continue;
            }
            if !in_section {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(path = %path.display(), line, "Malformed line in set config");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            let parsed = if key.eq_ignore_ascii_case("size") {
                value.parse().map(|v| self.size = v).is_ok()
            } else if key.eq_ignore_ascii_case("default_eps") {
                value.parse().map(|v| self.default_eps = v).is_ok()
            } else if key.eq_ignore_ascii_case("default_precision") {
                value.parse().map(|v| self.default_precision = v).is_ok()
            } else if key.eq_ignore_ascii_case("in_memory") {
                match value {
                    "0" => {
                        self.in_memory = false;
                        true
                    }
                    "1" => {
                        self.in_memory = true;
                        true
                    }
                    _ => false,
                }
            } else {
                debug!(key, "Unrecognized set config parameter");
                continue;
            };
            if !parsed {
                warn!(path = %path.display(), key, value, "Bad value in set config");
            }
        }
        Ok(())
    }

    /// Writes the config in the fixed `[hlld]` INI layout.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let mut f = fs::File::create(path)?;
        write!(
            f,
            "[hlld]\nsize = {}\ndefault_eps = {}\ndefault_precision = {}\nin_memory = {}\n",
            self.size,
            self.default_eps,
            self.default_precision,
            if self.in_memory { 1 } else { 0 },
        )?;
        Ok(())
    }
}
