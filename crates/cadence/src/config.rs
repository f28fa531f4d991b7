//! Host configuration
//!
//! Layered with figment: built-in defaults, then the TOML file, then
//! `CADENCE_` environment variables. Nested keys use `__`, so
//! `CADENCE_JOBS__BATCH_SIZE=64` sets `jobs.batch_size`.
//!
//! ```toml
//! [library]
//! db_path = "./data/library.redb"
//! media_roots = ["/srv/music"]
//!
//! [jobs]
//! concurrency = 4
//! scheduler_interval_secs = 900
//!
//! [plugins."library.covers"]
//! enabled = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cadence_runtime::{BatchMode, BatchOptions, SchedulerConfig};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "cadence.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CADENCE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] figment::Error),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub library: LibraryConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
    /// Per-plugin settings keyed by plugin id
    pub plugins: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub db_path: PathBuf,
    /// Directories imported by `scan` when none are given
    pub media_roots: Vec<PathBuf>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/library.redb"),
            media_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub batch_size: usize,
    /// Records in flight per concurrent job; unset means available parallelism
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    pub progress_every: usize,
    /// Seconds between scheduler triggers; 0 disables the trigger
    pub scheduler_interval_secs: u64,
    /// Run every job once when the daemon starts
    pub run_on_start: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            concurrency: None,
            progress_every: 100,
            scheduler_interval_secs: 15 * 60,
            run_on_start: false,
        }
    }
}

impl JobsConfig {
    /// Batch tuning for built-in jobs
    pub fn batch_options(&self) -> BatchOptions {
        let options = BatchOptions {
            mode: BatchMode::Concurrent,
            batch_size: self.batch_size,
            progress_every: self.progress_every,
            ..BatchOptions::default()
        };
        match self.concurrency {
            Some(concurrency) => options.with_concurrency(concurrency),
            None => options,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: (self.scheduler_interval_secs > 0)
                .then(|| Duration::from_secs(self.scheduler_interval_secs)),
            ..SchedulerConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "cadence=info,cadence_runtime=info,cadence_library=info".to_string(),
            json: false,
        }
    }
}

impl CadenceConfig {
    /// Load configuration
    ///
    /// An explicit `path` must exist. Without one, `cadence.toml` in the
    /// working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };

        let mut figment = Figment::from(Serialized::defaults(CadenceConfig::default()));
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading config file");
            figment = figment.merge(Toml::file(file));
        }

        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text over the defaults
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config = Figment::from(Serialized::defaults(CadenceConfig::default()))
            .merge(Toml::string(text))
            .extract()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Settings table for one plugin (`Null` when absent)
    pub fn plugin(&self, plugin_id: &str) -> serde_json::Value {
        self.plugins
            .get(plugin_id)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CadenceConfig::from_toml("").unwrap();

        assert_eq!(config, CadenceConfig::default());
        assert_eq!(config.jobs.batch_size, 256);
        assert_eq!(
            config.jobs.scheduler_config().interval,
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_sections_and_plugin_tables() {
        let config = CadenceConfig::from_toml(
            r#"
            [library]
            db_path = "/tmp/lib.redb"
            media_roots = ["/srv/music", "/srv/books"]

            [jobs]
            batch_size = 32
            concurrency = 2
            scheduler_interval_secs = 0

            [plugins."library.covers"]
            enabled = false
            concurrency = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.library.db_path, PathBuf::from("/tmp/lib.redb"));
        assert_eq!(config.library.media_roots.len(), 2);
        assert_eq!(config.jobs.scheduler_config().interval, None);

        let options = config.jobs.batch_options();
        assert_eq!(options.batch_size, 32);
        assert_eq!(options.concurrency, 2);
        assert_eq!(options.progress_every, 100);

        let covers = config.plugin("library.covers");
        assert_eq!(covers["enabled"], serde_json::json!(false));
        assert_eq!(covers["concurrency"], serde_json::json!(8));
        assert!(config.plugin("library.hashes").is_null());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\njson = true").unwrap();

        let config = CadenceConfig::load(Some(file.path())).unwrap();
        assert!(config.logging.json);
        assert_eq!(config.library, LibraryConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = CadenceConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_render_round_trips() {
        let mut config = CadenceConfig::default();
        config.plugins.insert("library.prune".into(), serde_json::json!({ "enabled": false }));

        let text = config.to_toml().unwrap();
        assert_eq!(CadenceConfig::from_toml(&text).unwrap(), config);
    }
}
