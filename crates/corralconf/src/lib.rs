//! Minimal configuration loading for the corral daemon.
//!
//! This crate provides process-level configuration with minimal dependencies
//! so side tools (bundle import/export, future CLIs) can import it without
//! pulling in the daemon itself.
//!
//! Process configuration covers where the daemon keeps state, where it
//! listens, and how it alerts. It is distinct from *instance* configuration,
//! which lives in the registry and has its own schema inside the daemon.
//!
//! # Usage
//!
//! ```rust,no_run
//! use corralconf::CorralConfig;
//!
//! let config = CorralConfig::load().expect("Failed to load config");
//!
//! println!("state dir: {}", config.daemon.state_dir.display());
//! println!("REST port: {}", config.rest.port);
//! println!("dashboard port: {}", config.dashboard.port);
//! ```
//!
//! # File Locations
//!
//! Layers apply in order, later wins:
//! 1. `/etc/corral/corral.toml` (system)
//! 2. `~/.config/corral/corral.toml` (user)
//! 3. `./corral.toml` (local override)
//! 4. Environment variables (`CORRAL_*`)
//!
//! # Example Config
//!
//! ```toml
//! [daemon]
//! state_dir = "~/.local/share/corral"
//!
//! [rest]
//! bind = "0.0.0.0"
//! port = 7710
//!
//! [dashboard]
//! bind = "0.0.0.0"
//! port = 7711
//! media_max_mb = 64
//!
//! [autosave]
//! quiet_secs = 10
//! max_staleness_secs = 300
//!
//! [alerting]
//! syslog_target = "127.0.0.1:514"
//! cpu_threshold_pct = 85.0
//! cpu_sample_secs = 5
//!
//! [worker]
//! command = "corral-renderer"
//! args = ["--headless"]
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use sections::{
    AlertingConfig, AutosaveConfig, DaemonConfig, DashboardConfig, RestConfig, WorkerConfig,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Why loading the process config failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete corral process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorralConfig {
    /// State and media locations.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Command REST surface bind settings.
    #[serde(default)]
    pub rest: RestConfig,

    /// Dashboard API bind settings.
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Autosave scheduling knobs.
    #[serde(default)]
    pub autosave: AutosaveConfig,

    /// Syslog alerting and CPU watch settings.
    #[serde(default)]
    pub alerting: AlertingConfig,

    /// External renderer command, if any.
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl CorralConfig {
    /// Load the effective configuration from every layer.
    ///
    /// Later layers win:
    /// 1. Built-in defaults
    /// 2. `/etc/corral/corral.toml`
    /// 3. `~/.config/corral/corral.toml`
    /// 4. `./corral.toml`
    /// 5. `CORRAL_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load with an explicit config file standing in for the local
    /// `./corral.toml` override. System and user layers still apply first,
    /// and environment variables still win.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load and also report which files and variables contributed.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// The full loader: optional explicit file, plus source bookkeeping.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = CorralConfig::default();

        // Apply config files in order; each file only touches keys it names
        for path in loader::discover_config_files_with_override(config_path) {
            loader::apply_file(&mut config, &path)?;
            sources.files.push(path);
        }

        // Environment variables win over every file
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Path of the durable instance snapshot (`instances.json`).
    pub fn state_file(&self) -> PathBuf {
        self.daemon.state_dir.join("instances.json")
    }

    /// Path of the portable instance bundle (`instances.bundle`).
    pub fn bundle_file(&self) -> PathBuf {
        self.daemon.state_dir.join("instances.bundle")
    }

    /// Media asset directory; defaults to `<state_dir>/media`.
    pub fn media_dir(&self) -> PathBuf {
        match &self.daemon.media_dir {
            Some(dir) => dir.clone(),
            None => self.daemon.state_dir.join("media"),
        }
    }

    /// Render the effective config as TOML.
    pub fn to_toml(&self) -> String {
        // Rendered by hand so section order stays stable
        let mut output = String::new();

        output.push_str("# Corral Configuration\n\n");

        output.push_str("[daemon]\n");
        output.push_str(&format!(
            "state_dir = \"{}\"\n",
            self.daemon.state_dir.display()
        ));
        output.push_str(&format!("media_dir = \"{}\"\n", self.media_dir().display()));

        output.push_str("\n[rest]\n");
        output.push_str(&format!("bind = \"{}\"\n", self.rest.bind));
        output.push_str(&format!("port = {}\n", self.rest.port));

        output.push_str("\n[dashboard]\n");
        output.push_str(&format!("bind = \"{}\"\n", self.dashboard.bind));
        output.push_str(&format!("port = {}\n", self.dashboard.port));
        output.push_str(&format!(
            "media_max_mb = {}\n",
            self.dashboard.media_max_mb
        ));

        output.push_str("\n[autosave]\n");
        output.push_str(&format!("quiet_secs = {}\n", self.autosave.quiet_secs));
        output.push_str(&format!(
            "max_staleness_secs = {}\n",
            self.autosave.max_staleness_secs
        ));

        output.push_str("\n[alerting]\n");
        output.push_str(&format!(
            "syslog_target = \"{}\"\n",
            self.alerting.syslog_target
        ));
        output.push_str(&format!(
            "cpu_threshold_pct = {}\n",
            self.alerting.cpu_threshold_pct
        ));
        output.push_str(&format!(
            "cpu_sample_secs = {}\n",
            self.alerting.cpu_sample_secs
        ));

        output.push_str("\n[worker]\n");
        output.push_str(&format!("command = \"{}\"\n", self.worker.command));
        output.push_str("args = [\n");
        for arg in &self.worker.args {
            output.push_str(&format!("    \"{}\",\n", arg));
        }
        output.push_str("]\n");

        output
    }
}
