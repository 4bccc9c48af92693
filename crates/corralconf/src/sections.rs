//! Configuration sections - all fixed at process startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// State and media locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Base directory for the instance snapshot and bundle files.
    /// Default: ~/.local/share/corral
    #[serde(default = "DaemonConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Media asset directory. Unset means `<state_dir>/media`.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
}

impl DaemonConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/corral"))
            .unwrap_or_else(|| PathBuf::from(".local/share/corral"))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            media_dir: None,
        }
    }
}

/// Command REST surface bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Bind address.
    /// Default: 0.0.0.0
    #[serde(default = "RestConfig::default_bind")]
    pub bind: String,

    /// Port for the title-addressed command surface.
    /// Default: 7710
    #[serde(default = "RestConfig::default_port")]
    pub port: u16,
}

impl RestConfig {
    fn default_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        7710
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
        }
    }
}

/// Dashboard API bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Bind address.
    /// Default: 0.0.0.0
    #[serde(default = "DashboardConfig::default_bind")]
    pub bind: String,

    /// Port for the id-addressed CRUD + command surface.
    /// Default: 7711
    #[serde(default = "DashboardConfig::default_port")]
    pub port: u16,

    /// Upload size cap for media assets, in MiB.
    /// Default: 64
    #[serde(default = "DashboardConfig::default_media_max_mb")]
    pub media_max_mb: u64,
}

impl DashboardConfig {
    fn default_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        7711
    }

    fn default_media_max_mb() -> u64 {
        64
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
            media_max_mb: Self::default_media_max_mb(),
        }
    }
}

/// Autosave scheduling knobs.
///
/// The quiet period coalesces edit bursts; the staleness deadline bounds how
/// long a dirty registry may go unsaved even under continuous editing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveConfig {
    /// Seconds of quiet after the last mutation before a bundle save runs.
    /// Default: 10
    #[serde(default = "AutosaveConfig::default_quiet_secs")]
    pub quiet_secs: u64,

    /// Hard upper bound between bundle saves while dirty, in seconds.
    /// Default: 300
    #[serde(default = "AutosaveConfig::default_max_staleness_secs")]
    pub max_staleness_secs: u64,
}

impl AutosaveConfig {
    fn default_quiet_secs() -> u64 {
        10
    }

    fn default_max_staleness_secs() -> u64 {
        300
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            quiet_secs: Self::default_quiet_secs(),
            max_staleness_secs: Self::default_max_staleness_secs(),
        }
    }
}

/// Syslog alerting and CPU watch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// UDP target for syslog datagrams.
    /// Default: 127.0.0.1:514
    #[serde(default = "AlertingConfig::default_syslog_target")]
    pub syslog_target: String,

    /// Average process CPU percentage above which the watch counts a strike.
    /// Default: 85.0
    #[serde(default = "AlertingConfig::default_cpu_threshold_pct")]
    pub cpu_threshold_pct: f64,

    /// Seconds between CPU samples.
    /// Default: 5
    #[serde(default = "AlertingConfig::default_cpu_sample_secs")]
    pub cpu_sample_secs: u64,
}

impl AlertingConfig {
    fn default_syslog_target() -> String {
        "127.0.0.1:514".to_string()
    }

    fn default_cpu_threshold_pct() -> f64 {
        85.0
    }

    fn default_cpu_sample_secs() -> u64 {
        5
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            syslog_target: Self::default_syslog_target(),
            cpu_threshold_pct: Self::default_cpu_threshold_pct(),
            cpu_sample_secs: Self::default_cpu_sample_secs(),
        }
    }
}

/// External renderer command.
///
/// An empty command means instances run with in-process stub workers, which
/// track lifecycle state without rendering anything. Useful for development
/// and for driving the control plane in tests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    /// Renderer executable. Empty → stub workers.
    #[serde(default)]
    pub command: String,

    /// Extra arguments passed before the per-instance arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_defaults() {
        let daemon = DaemonConfig::default();
        assert!(daemon.state_dir.to_string_lossy().contains("corral"));
        assert!(daemon.media_dir.is_none());
    }

    #[test]
    fn test_bind_defaults() {
        let rest = RestConfig::default();
        let dash = DashboardConfig::default();
        assert_eq!(rest.port, 7710);
        assert_eq!(dash.port, 7711);
        assert_eq!(rest.bind, "0.0.0.0");
    }

    #[test]
    fn test_alerting_defaults() {
        let alerting = AlertingConfig::default();
        assert_eq!(alerting.syslog_target, "127.0.0.1:514");
        assert_eq!(alerting.cpu_sample_secs, 5);
    }
}
