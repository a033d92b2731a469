use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

/// Configuration from `~/.config/earmark/config.toml`. The file is optional
/// and every field has a default.
///
/// DSP parameters are deliberately *not* configurable here: they are frozen
/// build-time constants recorded in the database header (see `dsp` and the
/// `meta` table), because ingest and query must agree on them bit-for-bit.
/// Only operational knobs live in the config file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Directories to scan for reference audio (used when `ingest` has no CLI args).
    pub music_dirs: Vec<PathBuf>,
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of extraction workers. 0 = all cores but one.
    pub workers: usize,
    /// Default `recognize` knobs, overridable per invocation.
    pub matcher: MatcherConfig,
}

/// Defaults for the query path. These only shape ranking and the time
/// budget, never the fingerprints themselves, so they are safe to vary
/// between runs against the same database.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Ranked candidates to return.
    pub topk: usize,
    /// Minimum histogram support for a candidate.
    pub min_support: u32,
    /// Per-query wall-clock budget in milliseconds. 0 = unlimited.
    pub timeout_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            topk: 3,
            min_support: 5,
            timeout_ms: 0,
        }
    }
}

impl AppConfig {
    /// Load the config file if one exists. A broken config file must not
    /// stop an ingest or recognition run, so any read or parse problem
    /// warns and falls back to defaults.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match Self::from_file(&path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            Err(msg) => {
                log::warn!("Ignoring {}: {}", path.display(), msg);
                Self::default()
            }
        }
    }

    fn from_file(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let config = toml::from_str(&contents).map_err(|e| e.to_string())?;
        log::info!("Loaded config from {}", path.display());
        Ok(Some(config))
    }

    /// Extraction worker count. The ingest driver serializes database
    /// writes on its own thread, so the default leaves one core for it and
    /// hands the rest to the FFT workers.
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Default database location under the XDG data directory, or the working
/// directory when no home is resolvable.
pub fn default_db_path() -> PathBuf {
    match ProjectDirs::from("", "", crate::APP_NAME) {
        Some(dirs) => {
            let dir = dirs.data_dir();
            std::fs::create_dir_all(dir).ok();
            dir.join("earmark.db")
        }
        None => PathBuf::from("earmark.db"),
    }
}
