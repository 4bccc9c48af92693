//! Finds config files, layers them, and applies environment overrides.

use crate::{ConfigError, CorralConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Records which files and environment variables shaped the final config.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Files applied, in application order
    pub files: Vec<PathBuf>,
    /// Names of the `CORRAL_*` variables that were set
    pub env_overrides: Vec<String>,
}

/// Existing config files in the standard locations, lowest precedence
/// first. Missing files are simply absent from the list.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Like [`discover_config_files`], but an explicit `cli_path` (when it
/// exists) displaces the local `./corral.toml` override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    // System-wide file first
    let system = PathBuf::from("/etc/corral/corral.toml");
    if system.exists() {
        files.push(system);
    }

    // Per-user file under the XDG config dir
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("corral/corral.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // An explicit --config path stands in for the local override
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    // corral.toml in the working directory wins over the shared layers
    let local = PathBuf::from("corral.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Apply one TOML file onto `config`. Keys the file does not name keep
/// whatever value earlier layers set.
pub fn apply_file(config: &mut CorralConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Apply a TOML string onto `config`.
fn apply_toml(config: &mut CorralConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    // Walk the raw table so absent keys leave earlier layers alone
    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if let Some(daemon) = table.get("daemon").and_then(|v| v.as_table()) {
        if let Some(v) = daemon.get("state_dir").and_then(|v| v.as_str()) {
            config.daemon.state_dir = expand_path(v);
        }
        if let Some(v) = daemon.get("media_dir").and_then(|v| v.as_str()) {
            if v.is_empty() {
                config.daemon.media_dir = None;
            } else {
                config.daemon.media_dir = Some(expand_path(v));
            }
        }
    }

    if let Some(rest) = table.get("rest").and_then(|v| v.as_table()) {
        if let Some(v) = rest.get("bind").and_then(|v| v.as_str()) {
            config.rest.bind = v.to_string();
        }
        if let Some(v) = rest.get("port").and_then(|v| v.as_integer()) {
            config.rest.port = v as u16;
        }
    }

    if let Some(dash) = table.get("dashboard").and_then(|v| v.as_table()) {
        if let Some(v) = dash.get("bind").and_then(|v| v.as_str()) {
            config.dashboard.bind = v.to_string();
        }
        if let Some(v) = dash.get("port").and_then(|v| v.as_integer()) {
            config.dashboard.port = v as u16;
        }
        if let Some(v) = dash.get("media_max_mb").and_then(|v| v.as_integer()) {
            config.dashboard.media_max_mb = v as u64;
        }
    }

    if let Some(autosave) = table.get("autosave").and_then(|v| v.as_table()) {
        if let Some(v) = autosave.get("quiet_secs").and_then(|v| v.as_integer()) {
            config.autosave.quiet_secs = v as u64;
        }
        if let Some(v) = autosave
            .get("max_staleness_secs")
            .and_then(|v| v.as_integer())
        {
            config.autosave.max_staleness_secs = v as u64;
        }
    }

    if let Some(alerting) = table.get("alerting").and_then(|v| v.as_table()) {
        if let Some(v) = alerting.get("syslog_target").and_then(|v| v.as_str()) {
            config.alerting.syslog_target = v.to_string();
        }
        if let Some(v) = alerting.get("cpu_threshold_pct").and_then(|v| v.as_float()) {
            config.alerting.cpu_threshold_pct = v;
        } else if let Some(v) = alerting
            .get("cpu_threshold_pct")
            .and_then(|v| v.as_integer())
        {
            config.alerting.cpu_threshold_pct = v as f64;
        }
        if let Some(v) = alerting.get("cpu_sample_secs").and_then(|v| v.as_integer()) {
            config.alerting.cpu_sample_secs = v as u64;
        }
    }

    if let Some(worker) = table.get("worker").and_then(|v| v.as_table()) {
        if let Some(v) = worker.get("command").and_then(|v| v.as_str()) {
            config.worker.command = v.to_string();
        }
        if let Some(args) = worker.get("args").and_then(|v| v.as_array()) {
            config.worker.args = args
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect();
        }
    }

    Ok(())
}

/// Overlay `CORRAL_*` environment variables, recording each one applied.
pub fn apply_env_overrides(config: &mut CorralConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("CORRAL_STATE_DIR") {
        config.daemon.state_dir = expand_path(&v);
        sources.env_overrides.push("CORRAL_STATE_DIR".to_string());
    }
    if let Ok(v) = env::var("CORRAL_MEDIA_DIR") {
        config.daemon.media_dir = Some(expand_path(&v));
        sources.env_overrides.push("CORRAL_MEDIA_DIR".to_string());
    }

    if let Ok(v) = env::var("CORRAL_REST_PORT") {
        if let Ok(port) = v.parse() {
            config.rest.port = port;
            sources.env_overrides.push("CORRAL_REST_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("CORRAL_DASH_PORT") {
        if let Ok(port) = v.parse() {
            config.dashboard.port = port;
            sources.env_overrides.push("CORRAL_DASH_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("CORRAL_SYSLOG_TARGET") {
        config.alerting.syslog_target = v;
        sources
            .env_overrides
            .push("CORRAL_SYSLOG_TARGET".to_string());
    }

    if let Ok(v) = env::var("CORRAL_WORKER_COMMAND") {
        config.worker.command = v;
        sources
            .env_overrides
            .push("CORRAL_WORKER_COMMAND".to_string());
    }
}

/// Expand a leading `~` or `$VAR` in a path value.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR followed by a path tail
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
