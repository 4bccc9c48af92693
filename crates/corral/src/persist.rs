//! Durable state: the JSON snapshot and the debounced bundle autosaver.
//!
//! Two artifacts live in the state dir. `instances.json` is the machine
//! snapshot, rewritten synchronously on every registry mutation with a
//! monotonic revision counter. `instances.bundle` is the portable,
//! human-readable copy, refreshed in the background: a burst of edits
//! coalesces into one write once things go quiet, and a never-quiet
//! stream of edits still gets flushed by a staleness cap.
//!
//! Both files are written to a temp sibling and renamed into place, so a
//! crash mid-write leaves the previous version intact.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::instance::InstanceConfig;
use crate::registry::Registry;

#[derive(Serialize)]
struct SnapshotOut<'a> {
    revision: u64,
    instances: &'a [InstanceConfig],
}

#[derive(Deserialize)]
struct SnapshotIn {
    #[serde(default)]
    revision: u64,
    #[serde(default)]
    instances: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Owns the snapshot file and its revision counter.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    revision: AtomicU64,
}

impl SnapshotStore {
    /// Open the store and load whatever it holds. A missing file is an
    /// empty pool; an unreadable or corrupt file is an error the operator
    /// has to look at rather than silently starting over.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<InstanceConfig>)> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "No state file yet, starting empty");
            let store = SnapshotStore {
                path,
                revision: AtomicU64::new(0),
            };
            return Ok((store, Vec::new()));
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        let parsed: SnapshotIn = serde_json::from_str(&text)
            .with_context(|| format!("state file {} is not valid JSON", path.display()))?;

        let mut configs = Vec::with_capacity(parsed.instances.len());
        for record in parsed.instances {
            let (config, fixes) = InstanceConfig::new(record);
            if fixes > 0 {
                debug!(instance = %config.id(), fixes, "Sanitized persisted record");
            }
            configs.push(config);
        }
        info!(
            count = configs.len(),
            revision = parsed.revision,
            path = %path.display(),
            "Loaded instance state"
        );
        let store = SnapshotStore {
            path,
            revision: AtomicU64::new(parsed.revision),
        };
        Ok((store, configs))
    }

    /// Write a snapshot of the given configs, bumping the revision.
    pub fn save(&self, configs: &[InstanceConfig]) -> Result<u64> {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let out = SnapshotOut {
            revision,
            instances: configs,
        };
        let text = serde_json::to_string_pretty(&out).context("failed to encode state")?;
        write_atomic(&self.path, text.as_bytes())?;
        Ok(revision)
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // `.tmp` is appended to the whole name so the snapshot and the bundle
    // never share a scratch file.
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

/// Render the registry's current configs as a bundle and write it.
pub fn save_bundle(registry: &Registry, path: &Path) -> Result<()> {
    let text = registry.export_bundle();
    write_atomic(path, text.as_bytes())
}

#[derive(Debug, Clone, Copy)]
pub struct AutosavePolicy {
    /// How long the pool must stay untouched before a dirty bundle is
    /// written.
    pub quiet: Duration,
    /// Upper bound on how long a dirty bundle may wait, however busy the
    /// pool is.
    pub max_staleness: Duration,
}

/// Background task that keeps the bundle file fresh. Registry mutations
/// arrive as nudges on `dirty_rx`; the task debounces them and writes at
/// the earlier of quiet-period expiry and the staleness cap. Cancelling
/// the token stops the task without a write, since shutdown does its own
/// final save.
pub fn spawn_autosaver(
    registry: Arc<Registry>,
    path: PathBuf,
    policy: AutosavePolicy,
    mut dirty_rx: mpsc::UnboundedReceiver<()>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut first_dirty: Option<Instant> = None;
        let mut last_dirty = Instant::now();
        loop {
            match first_dirty {
                None => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        msg = dirty_rx.recv() => match msg {
                            Some(()) => {
                                let now = Instant::now();
                                first_dirty = Some(now);
                                last_dirty = now;
                            }
                            None => break,
                        },
                    }
                }
                Some(since) => {
                    let deadline = std::cmp::min(last_dirty + policy.quiet, since + policy.max_staleness);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => {
                            match save_bundle(&registry, &path) {
                                Ok(()) => debug!(path = %path.display(), "Bundle autosaved"),
                                Err(e) => error!("Bundle autosave failed: {e:#}"),
                            }
                            first_dirty = None;
                        }
                        msg = dirty_rx.recv() => match msg {
                            Some(()) => last_dirty = Instant::now(),
                            None => break,
                        },
                    }
                }
            }
        }
        debug!("Autosaver stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle;
    use crate::worker::StubWorkerFactory;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(v: serde_json::Value) -> InstanceConfig {
        match v {
            serde_json::Value::Object(m) => InstanceConfig::new(m).0,
            other => panic!("expected object, got {other}"),
        }
    }

    fn registry_in(tmp: &TempDir) -> (Arc<Registry>, mpsc::UnboundedReceiver<()>) {
        let (store, _) = SnapshotStore::open(tmp.path().join("instances.json")).unwrap();
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new(Box::new(StubWorkerFactory), store, dirty_tx));
        (registry, dirty_rx)
    }

    #[test]
    fn test_open_missing_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, configs) = SnapshotStore::open(tmp.path().join("instances.json")).unwrap();
        assert!(configs.is_empty());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/instances.json");

        let a = config(json!({"title": "a", "w": 1920}));
        let b = config(json!({"title": "b"}));
        {
            let (store, _) = SnapshotStore::open(&path).unwrap();
            assert_eq!(store.save(&[a.clone(), b.clone()]).unwrap(), 1);
            assert_eq!(store.save(&[a.clone(), b.clone()]).unwrap(), 2);
        }

        let (store, loaded) = SnapshotStore::open(&path).unwrap();
        assert_eq!(store.revision(), 2);
        assert_eq!(loaded, vec![a, b]);
        // The counter keeps climbing across restarts.
        assert_eq!(store.save(&loaded).unwrap(), 3);
    }

    #[test]
    fn test_open_rejects_corrupt_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("instances.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let err = SnapshotStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_load_sanitizes_hand_edited_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("instances.json");
        std::fs::write(
            &path,
            r#"{"revision": 7, "instances": [{"id": "x", "title": "edited", "w": "1920", "bogus": 1}]}"#,
        )
        .unwrap();

        let (store, loaded) = SnapshotStore::open(&path).unwrap();
        assert_eq!(store.revision(), 7);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), "x");
        assert_eq!(loaded[0].number("w"), 1920.0);
        assert!(!loaded[0].as_record().contains_key("bogus"));
        // Missing fields got defaults.
        assert_eq!(loaded[0].number("fps"), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosaver_waits_for_quiet() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, dirty_rx) = registry_in(&tmp);
        let bundle_path = tmp.path().join("instances.bundle");
        let token = CancellationToken::new();
        let handle = spawn_autosaver(
            Arc::clone(&registry),
            bundle_path.clone(),
            AutosavePolicy {
                quiet: Duration::from_secs(10),
                max_staleness: Duration::from_secs(300),
            },
            dirty_rx,
            token.clone(),
        );

        registry.add(crate::schema::default_record()).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!bundle_path.exists(), "debounce should still be holding");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(bundle_path.exists(), "quiet period elapsed, bundle due");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosaver_staleness_cap_beats_endless_edits() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, dirty_rx) = registry_in(&tmp);
        let bundle_path = tmp.path().join("instances.bundle");
        let token = CancellationToken::new();
        let handle = spawn_autosaver(
            Arc::clone(&registry),
            bundle_path.clone(),
            AutosavePolicy {
                quiet: Duration::from_secs(10),
                max_staleness: Duration::from_secs(30),
            },
            dirty_rx,
            token.clone(),
        );

        // Edit every 5s so the quiet period never expires.
        for i in 0..6 {
            let mut record = crate::schema::default_record();
            record.insert(
                "title".to_string(),
                serde_json::Value::String(format!("cam {i}")),
            );
            registry.add(record).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        // t=30 just passed; the staleness cap has forced a write even
        // though the last edit was 5s ago.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(bundle_path.exists());
        let text = std::fs::read_to_string(&bundle_path).unwrap();
        assert!(bundle::parse(&text).unwrap().len() >= 6);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_autosaver_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, dirty_rx) = registry_in(&tmp);
        let token = CancellationToken::new();
        let handle = spawn_autosaver(
            registry,
            tmp.path().join("instances.bundle"),
            AutosavePolicy {
                quiet: Duration::from_secs(10),
                max_staleness: Duration::from_secs(300),
            },
            dirty_rx,
            token.clone(),
        );
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_save_bundle_writes_parseable_text() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, _rx) = registry_in(&tmp);
        registry.add(crate::schema::default_record()).unwrap();

        let path = tmp.path().join("out.bundle");
        save_bundle(&registry, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(bundle::parse(&text).unwrap().len(), 1);
    }
}
