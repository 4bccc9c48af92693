//! Integration tests for the daemon's state lifecycle.
//!
//! Exercises the public API the way `serve` does: registry over a snapshot
//! store, shutdown, and a fresh process picking the state back up.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use corral::bundle;
use corral::persist::SnapshotStore;
use corral::worker::StubWorkerFactory;
use corral::{ControlError, Registry};

fn record(title: &str) -> Map<String, Value> {
    let mut record = corral::schema::default_record();
    record.insert("title".to_string(), Value::String(title.to_string()));
    record
}

/// Build a registry over `state_file` the way the daemon does, dropping
/// the dirty receiver since these tests drive saves synchronously.
fn open_pool(state_file: &Path) -> (Arc<Registry>, Vec<corral::InstanceConfig>) {
    let (store, seeded) = SnapshotStore::open(state_file).unwrap();
    let (dirty_tx, _dirty_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(Registry::new(Box::new(StubWorkerFactory), store, dirty_tx));
    (registry, seeded)
}

#[tokio::test]
async fn test_snapshot_survives_daemon_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let state_file = tmp.path().join("instances.json");

    // First run: two instances, one running, then a clean shutdown.
    let id = {
        let (registry, seeded) = open_pool(&state_file);
        assert!(seeded.is_empty());
        registry.restore(seeded);

        let id = registry.add(record("Lobby Wall")).unwrap().id().to_string();
        registry.add(record("Studio B")).unwrap();
        registry.start(&id).await.unwrap();

        registry.begin_shutdown();
        registry.stop_all().await;
        registry.prune().await;
        id
    };

    // Second run: both come back in order, nothing is running.
    let (registry, seeded) = open_pool(&state_file);
    assert_eq!(seeded.len(), 2);
    registry.restore(seeded);
    assert!(registry.revision() >= 2);
    assert_eq!(
        registry.titles(),
        vec!["Lobby Wall".to_string(), "Studio B".to_string()]
    );

    let overview = registry.get(&id).await.unwrap();
    assert!(!overview.running);

    // The restored instance is fully operable under its old id.
    registry.start(&id).await.unwrap();
    assert_eq!(registry.running_count().await, 1);
}

#[tokio::test]
async fn test_auto_start_resumes_flagged_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let state_file = tmp.path().join("instances.json");

    let auto_id = {
        let (registry, _) = open_pool(&state_file);
        let mut flagged = record("Always On");
        flagged.insert("auto".to_string(), Value::Bool(true));
        let auto_id = registry.add(flagged).unwrap().id().to_string();
        registry.add(record("Manual")).unwrap();
        auto_id
    };

    let (registry, seeded) = open_pool(&state_file);
    registry.restore(seeded);
    let boot = registry.start_auto().await;
    assert_eq!(boot.ok, 1);

    assert!(registry.get(&auto_id).await.unwrap().running);
    assert_eq!(registry.running_count().await, 1);
}

#[tokio::test]
async fn test_bundle_file_round_trip_between_pools() {
    let tmp = tempfile::tempdir().unwrap();

    let (source, _) = open_pool(&tmp.path().join("a.json"));
    let mut wall = record("Lobby Wall");
    wall.insert("w".to_string(), json!(1920));
    wall.insert("h".to_string(), json!(1080));
    wall.insert("url".to_string(), json!("https://example.com/wall"));
    source.add(wall).unwrap();
    source.add(record("Studio B")).unwrap();

    // Export to a file, as `corral export -o` does.
    let bundle_path = tmp.path().join("pool.bundle");
    std::fs::write(&bundle_path, source.export_bundle()).unwrap();

    // A second pool with unrelated state takes the bundle wholesale.
    let (target, _) = open_pool(&tmp.path().join("b.json"));
    target.add(record("doomed")).unwrap();

    let text = std::fs::read_to_string(&bundle_path).unwrap();
    let count = target.import_replace(&text).await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(
        target.titles(),
        vec!["Lobby Wall".to_string(), "Studio B".to_string()]
    );

    // Typed values survive the text round trip.
    let id = target.resolve_title("Lobby Wall").unwrap();
    let overview = target.get(&id).await.unwrap();
    assert_eq!(overview.config["w"], 1920);
    assert_eq!(overview.config["url"], "https://example.com/wall");
}

#[tokio::test]
async fn test_legacy_snapshot_is_migrated_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let state_file = tmp.path().join("instances.json");

    // A snapshot from an older daemon: retired input kind, stringly
    // numbers, a field nobody remembers.
    let legacy = json!({
        "revision": 41,
        "instances": [{
            "id": "cam-1",
            "title": "Old Cam",
            "input": "swf",
            "w": "1024",
            "bogus": true,
        }]
    });
    std::fs::write(&state_file, legacy.to_string()).unwrap();

    let (registry, seeded) = open_pool(&state_file);
    assert_eq!(registry.revision(), 41);
    assert_eq!(seeded.len(), 1);

    let record = seeded[0].as_record().clone();
    assert_eq!(record["id"], "cam-1");
    assert_eq!(record["input"], "web");
    assert_eq!(record["w"], 1024);
    assert!(!record.contains_key("bogus"));
    assert_eq!(record["fps"], 30);

    // And it runs.
    registry.restore(seeded);
    registry.start("cam-1").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_admit_exactly_one() {
    let tmp = tempfile::tempdir().unwrap();
    let (registry, _) = open_pool(&tmp.path().join("instances.json"));
    let id = registry.add(record("Contended")).unwrap().id().to_string();

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        set.spawn(async move { registry.start(&id).await });
    }

    let mut started = 0;
    let mut already = 0;
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(()) => started += 1,
            Err(ControlError::AlreadyRunning(_)) => already += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(already, 7);
}

#[tokio::test]
async fn test_export_parse_matches_live_state() {
    let tmp = tempfile::tempdir().unwrap();
    let (registry, _) = open_pool(&tmp.path().join("instances.json"));

    let mut noisy = record("Weird \"Title\"\nWith Newline");
    noisy.insert("note".to_string(), json!("tabs\tand\\slashes"));
    registry.add(noisy).unwrap();

    let parsed = bundle::parse(&registry.export_bundle()).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].title(), "Weird \"Title\"\nWith Newline");
    assert_eq!(parsed[0].as_record()["note"], "tabs\tand\\slashes");
}
