//! # Configuration
//!
//! Hierarchical configuration loading, layered in order:
//!
//! 1. `c4.toml` (checked-in defaults)
//! 2. `c4.local.toml` (git-ignored local overrides)
//! 3. `C4_`-prefixed environment variables (double-underscore nesting,
//!    e.g. `C4_LOGGING__LEVEL=debug`)
//!
//! Later layers win. None of the files need to exist — [`Config::load`]
//! falls back to [`Config::default`] values for anything absent.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Top-level configuration for a `c4` runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port `Client::make` binds by default; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Base directory under which each client's `c4_home/tcp_<port>/`
    /// persistent-state directory (§6) is created. `None` resolves to the
    /// process's `HOME` (or `USERPROFILE` on Windows) at `Client::make`
    /// time, matching the source's `get_user_home_dir`.
    #[serde(default)]
    pub home_dir: Option<PathBuf>,

    /// Routed-tuple budget per fixpoint before it aborts as an
    /// `Error::Invariant` rather than spinning forever on a runaway
    /// recursive program.
    #[serde(default = "default_fixpoint_soft_limit")]
    pub fixpoint_soft_limit: u64,

    /// Bound on the runtime thread's work queue (`mpsc::channel`
    /// capacity) — `Client` API calls that exceed it block in
    /// `blocking_send`.
    #[serde(default = "default_work_queue_capacity")]
    pub work_queue_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_port() -> u16 {
    0
}

fn default_fixpoint_soft_limit() -> u64 {
    3_000_000
}

fn default_work_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: default_log_level(), format: default_log_format() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_port: default_port(),
            home_dir: None,
            fixpoint_soft_limit: default_fixpoint_soft_limit(),
            work_queue_capacity: default_work_queue_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// `<home>/c4_home/tcp_<port>/`, creating it (and any missing
    /// parents) if absent. `home_dir` resolves explicit config first, then
    /// `HOME`/`USERPROFILE`, matching `get_user_home_dir` + `get_c4_base_dir`.
    pub fn base_dir(&self, port: u16) -> std::io::Result<PathBuf> {
        let home = self.home_dir.clone().or_else(resolve_env_home).unwrap_or_else(|| PathBuf::from("."));
        let base_dir = home.join("c4_home").join(format!("tcp_{port}"));
        std::fs::create_dir_all(&base_dir)?;
        Ok(base_dir)
    }
}

fn resolve_env_home() -> Option<PathBuf> {
    std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")).map(PathBuf::from)
}

impl Config {
    /// Loads from the default file locations plus environment overrides.
    /// Every layer is optional: a missing `c4.toml` just means every
    /// field falls back to its `#[serde(default)]`.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file("c4.toml"))
            .merge(Toml::file("c4.local.toml"))
            .merge(Env::prefixed("C4_").split("__"))
            .extract()
    }

    /// Loads from a specific file plus environment overrides, for tests
    /// and for embedders that manage their own config path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("C4_").split("__"))
            .extract()
    }

    /// Installs a `tracing_subscriber` global default per `self.logging`.
    /// Idempotent-ish in practice: a second call's `set_global_default`
    /// failure (another subscriber already installed) is swallowed,
    /// matching how short-lived test processes call this more than once.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        let result = if self.logging.format == "json" {
            subscriber.json().try_init()
        } else {
            subscriber.try_init()
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "tracing subscriber already installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.fixpoint_soft_limit, 3_000_000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn loads_toml_override_with_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c4.toml");
        std::fs::write(&path, "fixpoint_soft_limit = 42\n\n[logging]\nlevel = \"warn\"\n").unwrap();

        std::env::set_var("C4_LOGGING__LEVEL", "debug");
        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        std::env::remove_var("C4_LOGGING__LEVEL");

        assert_eq!(config.fixpoint_soft_limit, 42);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn base_dir_nests_under_tcp_port_and_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { home_dir: Some(dir.path().to_path_buf()), ..Config::default() };
        let base = config.base_dir(4242).unwrap();
        assert_eq!(base, dir.path().join("c4_home").join("tcp_4242"));
        assert!(base.is_dir());
    }
}
