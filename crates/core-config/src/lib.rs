//! Configuration loading and parsing.
//!
//! Parses `kiln.toml` (or an override path provided by the binary) into a
//! tolerant [`ConfigFile`]: every section defaults, unknown fields are
//! ignored, and a file that fails to parse falls back to defaults so a bad
//! config can never stop a build. Raw parsed values are retained; the
//! machine-dependent clamps live in [`Config::apply_context`] so they can be
//! recomputed if the environment changes.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::info;

/// Environment variable that selects the job-cache root and enables the
/// cache-aware primitives.
pub const CACHE_ENV: &str = "KILN_JOB_CACHE";

/// Machine facts the effective limits are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigContext {
    pub cpus_online: usize,
    pub total_memory_bytes: u64,
}

impl ConfigContext {
    pub fn new(cpus_online: usize, total_memory_bytes: u64) -> Self {
        Self {
            cpus_online,
            total_memory_bytes,
        }
    }

    /// Best-effort probe of the current machine.
    pub fn detect() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpus_online: cpus,
            // Without a probe we provision 16 GiB; apply_context only uses
            // this when no explicit memory limit was configured.
            total_memory_bytes: 16 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeapConfig {
    /// Live-set multiplier for the post-collection semispace size.
    #[serde(default = "HeapConfig::default_factor")]
    pub factor: f64,
    /// 0 = off, 1 = peak statistics, 2 = ranked report each collection.
    #[serde(default)]
    pub profile: u8,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            factor: Self::default_factor(),
            profile: 0,
        }
    }
}

impl HeapConfig {
    const fn default_factor() -> f64 {
        4.0
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// CPU budget in threads; 0 means "use the machine's parallelism".
    #[serde(default)]
    pub cpus: f64,
    /// Memory budget in bytes; 0 means "90% of detected memory".
    #[serde(default)]
    pub memory_bytes: u64,
    /// File descriptors reserved for the runtime's own use.
    #[serde(default = "JobsConfig::default_reserved_fds")]
    pub reserved_fds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            cpus: 0.0,
            memory_bytes: 0,
            reserved_fds: Self::default_reserved_fds(),
        }
    }
}

impl JobsConfig {
    const fn default_reserved_fds() -> u64 {
        24
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Cache root; the `KILN_JOB_CACHE` environment variable overrides it.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "CacheConfig::default_low_bytes")]
    pub low_bytes: u64,
    #[serde(default = "CacheConfig::default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            low_bytes: Self::default_low_bytes(),
            max_bytes: Self::default_max_bytes(),
        }
    }
}

impl CacheConfig {
    const fn default_low_bytes() -> u64 {
        8 * 1024 * 1024 * 1024
    }
    const fn default_max_bytes() -> u64 {
        10 * 1024 * 1024 * 1024
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub heap: HeapConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub raw: Option<String>, // original file string (optional)
    pub file: ConfigFile,    // parsed (or default) data
    pub effective_heap_factor: f64,
    pub effective_cpus: f64,
    pub effective_memory_bytes: u64,
}

/// Best-effort config path: working directory only.
pub fn discover() -> PathBuf {
    PathBuf::from("kiln.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => Ok(Config {
                raw: Some(content),
                file,
                ..Config::default()
            }),
            Err(_e) => {
                // On parse error fall back to defaults.
                Ok(Config::default())
            }
        }
    } else {
        Ok(Config::default())
    }
}

impl Config {
    /// Resolve machine-dependent limits and clamp nonsense values.
    pub fn apply_context(&mut self, ctx: ConfigContext) {
        let raw_factor = self.file.heap.factor;
        self.effective_heap_factor = if raw_factor < 1.0 { 1.0 } else { raw_factor };
        if self.effective_heap_factor != raw_factor {
            info!(
                target: "config",
                raw = raw_factor,
                clamped = self.effective_heap_factor,
                "heap_factor_clamped"
            );
        }

        self.effective_cpus = if self.file.jobs.cpus > 0.0 {
            self.file.jobs.cpus
        } else {
            ctx.cpus_online as f64
        };

        self.effective_memory_bytes = if self.file.jobs.memory_bytes > 0 {
            self.file.jobs.memory_bytes
        } else {
            ctx.total_memory_bytes / 10 * 9
        };

        if self.file.cache.low_bytes > self.file.cache.max_bytes {
            info!(
                target: "config",
                low = self.file.cache.low_bytes,
                max = self.file.cache.max_bytes,
                "cache_watermarks_swapped"
            );
            std::mem::swap(
                &mut self.file.cache.low_bytes,
                &mut self.file.cache.max_bytes,
            );
        }
    }

    /// Cache root from the environment or the config file, if any.
    pub fn cache_root(&self) -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CACHE_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        self.file.cache.root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_hopefully__.toml"))).unwrap();
        assert_eq!(cfg.file.heap.factor, 4.0);
        assert_eq!(cfg.file.jobs.reserved_fds, 24);
    }

    #[test]
    fn parses_heap_and_jobs_sections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[heap]\nfactor = 2.5\nprofile = 2\n[jobs]\ncpus = 8.0\n",
        )
        .unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.heap.factor, 2.5);
        assert_eq!(cfg.file.heap.profile, 2);
        cfg.apply_context(ConfigContext::new(4, 1 << 30));
        assert_eq!(cfg.effective_cpus, 8.0);
        assert_eq!(cfg.effective_heap_factor, 2.5);
    }

    #[test]
    fn clamps_heap_factor_below_one() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[heap]\nfactor = 0.25\n").unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        cfg.apply_context(ConfigContext::new(2, 1 << 30));
        assert_eq!(cfg.effective_heap_factor, 1.0);
    }

    #[test]
    fn machine_defaults_resolve() {
        let mut cfg = Config::default();
        cfg.apply_context(ConfigContext::new(6, 10_000));
        assert_eq!(cfg.effective_cpus, 6.0);
        assert_eq!(cfg.effective_memory_bytes, 9_000);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[heap\nfactor = ").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert!(cfg.raw.is_none());
        assert_eq!(cfg.file.heap.factor, 4.0);
    }

    #[test]
    fn environment_overrides_cache_root() {
        let mut cfg = Config::default();
        cfg.file.cache.root = Some(PathBuf::from("/from/config"));
        std::env::remove_var(CACHE_ENV);
        assert_eq!(cfg.cache_root(), Some(PathBuf::from("/from/config")));
        std::env::set_var(CACHE_ENV, "/from/env");
        assert_eq!(cfg.cache_root(), Some(PathBuf::from("/from/env")));
        std::env::remove_var(CACHE_ENV);
    }

    #[test]
    fn swaps_inverted_cache_watermarks() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[cache]\nlow_bytes = 100\nmax_bytes = 50\n").unwrap();
        let mut cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        cfg.apply_context(ConfigContext::new(1, 1 << 20));
        assert_eq!(cfg.file.cache.low_bytes, 50);
        assert_eq!(cfg.file.cache.max_bytes, 100);
    }
}
