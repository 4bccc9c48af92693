//! Worker seam between the control plane and the renderer it drives.
//!
//! The registry only ever talks to [`CaptureWorker`], so the state machine
//! can be exercised end to end without spawning anything. Production wires
//! in [`ProcessWorker`], which runs one renderer process per instance;
//! tests and the default no-command config get [`StubWorker`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::instance::InstanceConfig;

/// How long a renderer gets to exit after SIGTERM before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// One instance's capture backend. Implementations own whatever heavy
/// resource backs the instance; the registry serializes all calls per
/// instance, so `&mut self` here never races with itself.
#[async_trait]
pub trait CaptureWorker: Send {
    /// Bring the capture up with the given config.
    async fn start(&mut self, config: &InstanceConfig) -> Result<()>;
    /// Tear the capture down.
    async fn stop(&mut self) -> Result<()>;
    /// Re-read config and re-render in place, without a session reset.
    async fn reload(&mut self) -> Result<()>;
    /// Wipe accumulated session state (cookies, caches, scratch files).
    /// Only legal while stopped.
    async fn clear_session(&mut self) -> Result<()>;
    /// Whether the capture is up right now. Takes `&mut self` so process
    /// workers can reap an exited child on the spot.
    fn running(&mut self) -> bool;
}

/// Builds one worker per instance id. Injected into the registry so tests
/// can substitute their own.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, id: &str) -> Box<dyn CaptureWorker>;
}

/// In-memory worker: tracks the running flag and nothing else.
#[derive(Debug, Default)]
pub struct StubWorker {
    running: bool,
}

#[async_trait]
impl CaptureWorker for StubWorker {
    async fn start(&mut self, _config: &InstanceConfig) -> Result<()> {
        if self.running {
            bail!("capture is already up");
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            bail!("capture is not up");
        }
        self.running = false;
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        if !self.running {
            bail!("capture is not up");
        }
        Ok(())
    }

    async fn clear_session(&mut self) -> Result<()> {
        if self.running {
            bail!("session is in use");
        }
        Ok(())
    }

    fn running(&mut self) -> bool {
        self.running
    }
}

pub struct StubWorkerFactory;

impl WorkerFactory for StubWorkerFactory {
    fn create(&self, _id: &str) -> Box<dyn CaptureWorker> {
        Box::<StubWorker>::default()
    }
}

/// Spawns and signals a renderer process for one instance.
///
/// Contract with the renderer binary: config arrives as command-line flags
/// (see [`renderer_args`]), SIGTERM means exit cleanly, SIGHUP means
/// re-read flags from the session dir's `config.json` and re-render.
pub struct ProcessWorker {
    id: String,
    command: String,
    base_args: Vec<String>,
    session_dir: PathBuf,
    child: Option<Child>,
}

impl ProcessWorker {
    fn new(id: &str, command: &str, base_args: &[String], session_root: &std::path::Path) -> Self {
        ProcessWorker {
            id: id.to_string(),
            command: command.to_string(),
            base_args: base_args.to_vec(),
            session_dir: session_root.join(id),
            child: None,
        }
    }

    #[cfg(unix)]
    fn signal(&self, child: &Child, signal: libc::c_int) -> Result<()> {
        let Some(pid) = child.id() else {
            bail!("renderer has already exited");
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            bail!("kill({pid}) failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureWorker for ProcessWorker {
    async fn start(&mut self, config: &InstanceConfig) -> Result<()> {
        if self.running() {
            bail!("renderer is already up");
        }

        let delay = config.number("delay") as u64;
        if delay > 0 {
            debug!(instance = %self.id, delay_ms = delay, "Delaying renderer start");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        tokio::fs::create_dir_all(&self.session_dir)
            .await
            .with_context(|| format!("failed to create session dir {}", self.session_dir.display()))?;
        // The renderer re-reads this on SIGHUP.
        tokio::fs::write(
            self.session_dir.join("config.json"),
            serde_json::to_vec_pretty(&config.to_value())?,
        )
        .await
        .context("failed to write renderer config")?;

        let args = renderer_args(&self.id, config, &self.session_dir);
        let child = Command::new(&self.command)
            .args(&self.base_args)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn renderer {}", self.command))?;

        info!(instance = %self.id, pid = child.id(), "Renderer spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            bail!("renderer is not up");
        };

        #[cfg(unix)]
        if let Err(e) = self.signal(&child, libc::SIGTERM) {
            debug!(instance = %self.id, "SIGTERM skipped: {e:#}");
        }
        #[cfg(not(unix))]
        child.start_kill().ok();

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status.context("waiting for renderer exit")?;
                debug!(instance = %self.id, %status, "Renderer exited");
            }
            Err(_) => {
                warn!(instance = %self.id, "Renderer ignored SIGTERM, killing");
                child.start_kill().context("killing renderer")?;
                let status = child.wait().await.context("waiting for killed renderer")?;
                debug!(instance = %self.id, %status, "Renderer killed");
            }
        }
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        if !self.running() {
            bail!("renderer is not up");
        }
        #[cfg(unix)]
        {
            let child = self.child.as_ref().context("renderer is not up")?;
            self.signal(child, libc::SIGHUP)?;
            debug!(instance = %self.id, "Sent SIGHUP for reload");
            Ok(())
        }
        #[cfg(not(unix))]
        bail!("in-place reload is not supported on this platform")
    }

    async fn clear_session(&mut self) -> Result<()> {
        if self.child.is_some() {
            bail!("session is in use");
        }
        match tokio::fs::remove_dir_all(&self.session_dir).await {
            Ok(()) => {
                debug!(instance = %self.id, "Session dir cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("failed to clear session dir {}", self.session_dir.display())
            }),
        }
    }

    fn running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(instance = %self.id, %status, "Renderer exited on its own");
                self.child = None;
                false
            }
            Err(e) => {
                warn!(instance = %self.id, "try_wait failed: {e}");
                self.child = None;
                false
            }
        }
    }
}

/// Flag set handed to the renderer binary. Kept as a free function so the
/// contract is testable without spawning anything.
pub fn renderer_args(id: &str, config: &InstanceConfig, session_dir: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        "--instance-id".to_string(),
        id.to_string(),
        "--session-dir".to_string(),
        session_dir.display().to_string(),
        "--size".to_string(),
        format!("{}x{}", config.number("w") as i64, config.number("h") as i64),
        "--fps".to_string(),
        format!("{}", config.number("fps") as i64),
        "--zoom".to_string(),
        format!("{}", config.number("zoom")),
    ];

    match config.string("input") {
        "media" => {
            args.push("--file".to_string());
            args.push(config.string("file").to_string());
            if config.flag("loop") {
                args.push("--loop".to_string());
            }
        }
        _ => {
            args.push("--url".to_string());
            args.push(config.string("url").to_string());
        }
    }

    if config.flag("gpu") {
        args.push("--gpu".to_string());
    }
    if config.flag("trans") {
        args.push("--transparent".to_string());
    }

    if config.flag("audio") {
        args.push("--audio-rate".to_string());
        args.push(format!("{}", config.number("arate") as i64));
        args.push("--audio-channels".to_string());
        args.push(format!("{}", config.number("ach") as i64));
    } else {
        args.push("--no-audio".to_string());
    }

    args.push("--sink".to_string());
    args.push(config.string("sink").to_string());
    if !config.string("sname").is_empty() {
        args.push("--stream-name".to_string());
        args.push(config.string("sname").to_string());
    }
    if config.flag("rec") {
        args.push("--record-dir".to_string());
        args.push(config.string("rdir").to_string());
        args.push("--record-format".to_string());
        args.push(config.string("rfmt").to_string());
    }

    args.push("--video-bitrate".to_string());
    args.push(format!("{}", config.number("vbr") as i64));
    args.push("--audio-bitrate".to_string());
    args.push(format!("{}", config.number("abr") as i64));

    if !config.string("ua").is_empty() {
        args.push("--user-agent".to_string());
        args.push(config.string("ua").to_string());
    }

    args
}

pub struct ProcessWorkerFactory {
    command: String,
    base_args: Vec<String>,
    session_root: PathBuf,
}

impl ProcessWorkerFactory {
    pub fn new(command: &str, base_args: &[String], session_root: PathBuf) -> Self {
        ProcessWorkerFactory {
            command: command.to_string(),
            base_args: base_args.to_vec(),
            session_root,
        }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, id: &str) -> Box<dyn CaptureWorker> {
        Box::new(ProcessWorker::new(
            id,
            &self.command,
            &self.base_args,
            &self.session_root,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(v: serde_json::Value) -> InstanceConfig {
        match v {
            serde_json::Value::Object(m) => InstanceConfig::new(m).0,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_stub_worker_lifecycle() {
        let mut worker = StubWorker::default();
        let cfg = config(json!({"title": "t"}));

        assert!(!worker.running());
        worker.start(&cfg).await.unwrap();
        assert!(worker.running());
        assert!(worker.start(&cfg).await.is_err());

        worker.reload().await.unwrap();
        assert!(worker.clear_session().await.is_err());

        worker.stop().await.unwrap();
        assert!(!worker.running());
        assert!(worker.stop().await.is_err());
        assert!(worker.reload().await.is_err());
        worker.clear_session().await.unwrap();
    }

    #[test]
    fn test_renderer_args_cover_the_basics() {
        let cfg = config(json!({
            "title": "t",
            "url": "https://overlay.example/scene",
            "w": 1920, "h": 1080, "fps": 60,
            "gpu": true,
            "sname": "scene-a",
        }));
        let args = renderer_args("abc", &cfg, std::path::Path::new("/tmp/sessions/abc"));
        let joined = args.join(" ");
        assert!(joined.contains("--instance-id abc"));
        assert!(joined.contains("--size 1920x1080"));
        assert!(joined.contains("--fps 60"));
        assert!(joined.contains("--url https://overlay.example/scene"));
        assert!(joined.contains("--gpu"));
        assert!(joined.contains("--stream-name scene-a"));
    }

    #[test]
    fn test_renderer_args_media_input() {
        let cfg = config(json!({
            "title": "t",
            "input": "media",
            "file": "/srv/clips/loop.mp4",
            "loop": true,
            "audio": false,
        }));
        let args = renderer_args("abc", &cfg, std::path::Path::new("/tmp/s"));
        let joined = args.join(" ");
        assert!(joined.contains("--file /srv/clips/loop.mp4"));
        assert!(joined.contains("--loop"));
        assert!(joined.contains("--no-audio"));
        assert!(!joined.contains("--url"));
    }

    #[tokio::test]
    async fn test_clear_session_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = ProcessWorkerFactory::new("/bin/false", &[], tmp.path().to_path_buf());
        let mut worker = factory.create("inst-1");

        let dir = tmp.path().join("inst-1");
        std::fs::create_dir_all(dir.join("cache")).unwrap();
        std::fs::write(dir.join("cache/blob"), b"x").unwrap();

        worker.clear_session().await.unwrap();
        assert!(!dir.exists());
        // Clearing an already-clean session is fine.
        worker.clear_session().await.unwrap();
    }
}
