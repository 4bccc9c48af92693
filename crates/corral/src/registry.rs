//! The instance registry: the one place control-plane state lives.
//!
//! Layout is two-level. A `std` mutex guards the id map and creation
//! order and is only ever held for quick, non-awaiting sections, so
//! config snapshots (export, persistence, title lookup) never wait on a
//! slow worker. Each slot then carries its own async mutex around the
//! worker handle; holding that gate across worker awaits is what
//! serializes start/stop/reload/clear (and config replacement and
//! removal) per instance. Operations on different instances never
//! contend. Status reads never queue on a gate either: each slot keeps
//! the run state last seen under its gate, and a view that finds the
//! gate busy reports that instead of waiting out the command.
//!
//! Removal marks the slot `gone` under its gate before unlinking it from
//! the map, so an operation that was already queued on the gate wakes
//! up, sees the tombstone, and reports the instance as unknown instead
//! of acting on a corpse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::bundle;
use crate::error::ControlError;
use crate::instance::{InstanceConfig, InstanceId};
use crate::persist::SnapshotStore;
use crate::worker::{CaptureWorker, WorkerFactory};

/// Hard ceiling on how long a surface waits for a single-instance
/// command. The command itself keeps running past this; only the caller
/// stops waiting.
pub const COMMAND_DEADLINE: Duration = Duration::from_secs(12);

/// The four lifecycle verbs both HTTP surfaces accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Reload,
    Clear,
}

impl Command {
    pub fn parse(name: &str) -> Option<Command> {
        match name {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "reload" => Some(Command::Reload),
            "clear" => Some(Command::Clear),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Reload => "reload",
            Command::Clear => "clear",
        }
    }
}

/// Broadcast to in-process listeners (the serve loop logs these and
/// forwards start failures to the notifier).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added { id: InstanceId },
    Updated { id: InstanceId },
    Removed { id: InstanceId },
    Started { id: InstanceId },
    StartFailed { id: InstanceId, error: String },
    Stopped { id: InstanceId },
    Replaced { count: usize },
}

/// Tally of a fan-out command. Skipped means the instance was not
/// eligible (already in the target state, invalid, or disappeared
/// mid-flight); its worker was never invoked.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BulkOutcome {
    pub ok: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One instance as the surfaces see it.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceOverview {
    pub id: InstanceId,
    pub title: String,
    pub running: bool,
    pub valid: bool,
    pub config: Value,
}

struct WorkerCell {
    worker: Box<dyn CaptureWorker>,
}

struct Slot {
    config: StdMutex<InstanceConfig>,
    cell: AsyncMutex<WorkerCell>,
    /// Run state as of the last check under the gate. Status views read
    /// this while a command holds the gate.
    running: AtomicBool,
    /// Tombstone, set under the gate during removal so queued operations
    /// resolve to unknown.
    gone: AtomicBool,
}

impl Slot {
    fn new(config: InstanceConfig, worker: Box<dyn CaptureWorker>) -> Arc<Slot> {
        Arc::new(Slot {
            config: StdMutex::new(config),
            cell: AsyncMutex::new(WorkerCell { worker }),
            running: AtomicBool::new(false),
            gone: AtomicBool::new(false),
        })
    }

    /// Ask the worker whether it is up, remembering the answer for the
    /// views. Callers hold the gate.
    fn check_running(&self, cell: &mut WorkerCell) -> bool {
        let running = cell.worker.running();
        self.running.store(running, Ordering::SeqCst);
        running
    }

    /// One instance's overview without queuing on its gate. A free gate
    /// means the worker answers live; a busy one means a command is in
    /// flight, and the state last seen under the gate stands in.
    fn overview(&self, id: InstanceId) -> Option<InstanceOverview> {
        if self.gone.load(Ordering::SeqCst) {
            return None;
        }
        let running = match self.cell.try_lock() {
            Ok(mut cell) => self.check_running(&mut cell),
            Err(_) => self.running.load(Ordering::SeqCst),
        };
        let config = lock_unpoisoned(&self.config).clone();
        Some(InstanceOverview {
            id,
            title: config.title().to_string(),
            running,
            valid: config.is_valid(),
            config: config.to_value(),
        })
    }
}

#[derive(Default)]
struct Shelf {
    slots: HashMap<InstanceId, Arc<Slot>>,
    order: Vec<InstanceId>,
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Registry {
    inner: StdMutex<Shelf>,
    factory: Box<dyn WorkerFactory>,
    store: SnapshotStore,
    dirty_tx: mpsc::UnboundedSender<()>,
    events: broadcast::Sender<RegistryEvent>,
    shutting_down: AtomicBool,
}

impl Registry {
    /// The dirty sender feeds the autosaver; callers that run without one
    /// (offline tools, tests) can drop the receiver and nudges go nowhere.
    pub fn new(
        factory: Box<dyn WorkerFactory>,
        store: SnapshotStore,
        dirty_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Registry {
            inner: StdMutex::new(Shelf::default()),
            factory,
            store,
            dirty_tx,
            events,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Monotonic revision of the persisted state, bumped on every write.
    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    /// After this, mutations and new starts are refused; stop remains
    /// available so the shutdown sequence can drain.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("Registry now refusing new work");
    }

    fn refuse_if_shutting_down(&self) -> Result<(), ControlError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(ControlError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Seed the registry from persisted configs at startup. No snapshot
    /// write and no events; this is the load half of the load/save cycle.
    pub fn restore(&self, configs: Vec<InstanceConfig>) {
        let mut shelf = self.shelf();
        for config in configs {
            let id = config.id().to_string();
            if shelf.slots.contains_key(&id) {
                warn!(instance = %id, "Duplicate id in persisted state, keeping the first");
                continue;
            }
            let worker = self.factory.create(&id);
            shelf.slots.insert(id.clone(), Slot::new(config, worker));
            shelf.order.push(id);
        }
    }

    fn shelf(&self) -> MutexGuard<'_, Shelf> {
        lock_unpoisoned(&self.inner)
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>, ControlError> {
        self.shelf()
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::UnknownInstance(id.to_string()))
    }

    fn ordered_slots(&self) -> Vec<(InstanceId, Arc<Slot>)> {
        let shelf = self.shelf();
        shelf
            .order
            .iter()
            .filter_map(|id| shelf.slots.get(id).map(|s| (id.clone(), Arc::clone(s))))
            .collect()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.shelf().order.clone()
    }

    pub fn len(&self) -> usize {
        self.shelf().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shelf().slots.is_empty()
    }

    /// Config snapshot in creation order. Never waits on worker gates.
    pub fn configs(&self) -> Vec<InstanceConfig> {
        self.ordered_slots()
            .into_iter()
            .map(|(_, slot)| lock_unpoisoned(&slot.config).clone())
            .collect()
    }

    pub fn titles(&self) -> Vec<String> {
        self.configs()
            .into_iter()
            .map(|c| c.title().to_string())
            .collect()
    }

    /// Titles are a human convenience and not unique; the first instance
    /// (in creation order) with an exactly matching title wins.
    pub fn resolve_title(&self, title: &str) -> Result<InstanceId, ControlError> {
        self.configs()
            .into_iter()
            .find(|c| c.title() == title)
            .map(|c| c.id().to_string())
            .ok_or_else(|| ControlError::UnknownInstance(title.to_string()))
    }

    // ---- mutations ------------------------------------------------------

    /// Insert a new instance. The record is sanitized and gets a fresh id
    /// unless it brought a usable one; a colliding id is replaced rather
    /// than trusted.
    pub fn add(&self, record: Map<String, Value>) -> Result<InstanceConfig, ControlError> {
        self.refuse_if_shutting_down()?;
        let (mut config, fixes) = InstanceConfig::new(record);
        {
            let mut shelf = self.shelf();
            if shelf.slots.contains_key(config.id()) {
                let old = config.id().to_string();
                config.regenerate_id();
                warn!(old = %old, new = %config.id(), "Supplied id already in use, assigned a fresh one");
            }
            let id = config.id().to_string();
            let worker = self.factory.create(&id);
            shelf.slots.insert(id.clone(), Slot::new(config.clone(), worker));
            shelf.order.push(id);
        }
        if fixes > 0 {
            debug!(instance = %config.id(), fixes, "Sanitized incoming record");
        }
        info!(instance = %config.id(), title = %config.title(), "Instance added");
        self.persist_after_change();
        self.emit(RegistryEvent::Added { id: config.id().to_string() });
        Ok(config)
    }

    /// Replace an instance's config wholesale. The id is pinned; whatever
    /// id the incoming record claims is ignored.
    pub async fn modify(
        &self,
        id: &str,
        record: Map<String, Value>,
    ) -> Result<InstanceConfig, ControlError> {
        self.refuse_if_shutting_down()?;
        let slot = self.slot(id)?;
        let gate = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }
        let config = {
            let mut cfg = lock_unpoisoned(&slot.config);
            cfg.replace_record(record);
            cfg.clone()
        };
        drop(gate);
        info!(instance = %id, title = %config.title(), "Instance config replaced");
        self.persist_after_change();
        self.emit(RegistryEvent::Updated { id: id.to_string() });
        Ok(config)
    }

    /// Merge a partial record into an instance's config. If the instance
    /// was running it is stopped first and started again on the new
    /// config afterwards; a restart failure leaves the config change in
    /// place and the instance stopped.
    pub async fn patch(
        &self,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<(InstanceConfig, bool), ControlError> {
        self.refuse_if_shutting_down()?;
        let slot = self.slot(id)?;
        let mut cell = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }

        let was_running = slot.check_running(&mut cell);
        if was_running {
            if let Err(e) = cell.worker.stop().await {
                warn!(instance = %id, "Stop before config patch failed: {e:#}");
            }
            slot.check_running(&mut cell);
        }

        let config = {
            let mut cfg = lock_unpoisoned(&slot.config);
            cfg.merge_patch(patch);
            cfg.clone()
        };
        self.persist_after_change();
        self.emit(RegistryEvent::Updated { id: id.to_string() });

        let mut restarted = false;
        if was_running {
            if let Some(reason) = config.validity_error() {
                warn!(instance = %id, %reason, "Patched config is not startable, leaving instance stopped");
            } else {
                let result = cell.worker.start(&config).await;
                slot.check_running(&mut cell);
                match result {
                    Ok(()) => {
                        restarted = true;
                        info!(instance = %id, "Instance restarted on patched config");
                        self.emit(RegistryEvent::Started { id: id.to_string() });
                    }
                    Err(e) => {
                        let error = format!("{e:#}");
                        warn!(instance = %id, %error, "Restart on patched config failed");
                        self.emit(RegistryEvent::StartFailed {
                            id: id.to_string(),
                            error,
                        });
                    }
                }
            }
        }
        Ok((config, restarted))
    }

    /// Drop an instance, stopping it first if needed. Queued operations on
    /// the same instance resolve to unknown once this wins the gate.
    pub async fn remove(&self, id: &str) -> Result<(), ControlError> {
        self.refuse_if_shutting_down()?;
        let slot = self.slot(id)?;
        let mut cell = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }
        if slot.check_running(&mut cell) {
            if let Err(e) = cell.worker.stop().await {
                warn!(instance = %id, "Stop during removal failed: {e:#}");
            }
        }
        slot.gone.store(true, Ordering::SeqCst);
        drop(cell);
        {
            let mut shelf = self.shelf();
            shelf.slots.remove(id);
            shelf.order.retain(|x| x != id);
        }
        info!(instance = %id, "Instance removed");
        self.persist_after_change();
        self.emit(RegistryEvent::Removed { id: id.to_string() });
        Ok(())
    }

    // ---- lifecycle ------------------------------------------------------

    pub async fn start(&self, id: &str) -> Result<(), ControlError> {
        self.refuse_if_shutting_down()?;
        let slot = self.slot(id)?;
        let mut cell = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }
        if slot.check_running(&mut cell) {
            return Err(ControlError::AlreadyRunning(id.to_string()));
        }
        let config = lock_unpoisoned(&slot.config).clone();
        if let Some(reason) = config.validity_error() {
            return Err(ControlError::InvalidConfig {
                id: id.to_string(),
                reason,
            });
        }
        let result = cell.worker.start(&config).await;
        slot.check_running(&mut cell);
        match result {
            Ok(()) => {
                info!(instance = %id, title = %config.title(), "Instance started");
                self.emit(RegistryEvent::Started { id: id.to_string() });
                Ok(())
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(instance = %id, %error, "Instance failed to start");
                self.emit(RegistryEvent::StartFailed {
                    id: id.to_string(),
                    error: error.clone(),
                });
                Err(ControlError::Worker(error))
            }
        }
    }

    /// Stop stays available during shutdown; the drain depends on it.
    pub async fn stop(&self, id: &str) -> Result<(), ControlError> {
        let slot = self.slot(id)?;
        let mut cell = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }
        if !slot.check_running(&mut cell) {
            return Err(ControlError::NotRunning(id.to_string()));
        }
        let result = cell.worker.stop().await;
        slot.check_running(&mut cell);
        result.map_err(ControlError::worker)?;
        info!(instance = %id, "Instance stopped");
        self.emit(RegistryEvent::Stopped { id: id.to_string() });
        Ok(())
    }

    pub async fn reload(&self, id: &str) -> Result<(), ControlError> {
        self.refuse_if_shutting_down()?;
        let slot = self.slot(id)?;
        let mut cell = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }
        if !slot.check_running(&mut cell) {
            return Err(ControlError::NotRunning(id.to_string()));
        }
        let result = cell.worker.reload().await;
        slot.check_running(&mut cell);
        result.map_err(ControlError::worker)?;
        info!(instance = %id, "Instance reloaded");
        Ok(())
    }

    pub async fn clear_session(&self, id: &str) -> Result<(), ControlError> {
        self.refuse_if_shutting_down()?;
        let slot = self.slot(id)?;
        let mut cell = slot.cell.lock().await;
        if slot.gone.load(Ordering::SeqCst) {
            return Err(ControlError::UnknownInstance(id.to_string()));
        }
        if slot.check_running(&mut cell) {
            return Err(ControlError::AlreadyRunning(id.to_string()));
        }
        cell.worker
            .clear_session()
            .await
            .map_err(ControlError::worker)?;
        info!(instance = %id, "Session cleared");
        Ok(())
    }

    pub async fn command(&self, id: &str, command: Command) -> Result<(), ControlError> {
        match command {
            Command::Start => self.start(id).await,
            Command::Stop => self.stop(id).await,
            Command::Reload => self.reload(id).await,
            Command::Clear => self.clear_session(id).await,
        }
    }

    /// Run a command but give up waiting after [`COMMAND_DEADLINE`]. The
    /// command itself is spawned and keeps running to completion either
    /// way, so a stalled worker cannot wedge a surface handler while the
    /// state machine still settles eventually.
    pub async fn command_with_deadline(
        self: &Arc<Self>,
        id: &str,
        command: Command,
    ) -> Result<(), ControlError> {
        let registry = Arc::clone(self);
        let task_id = id.to_string();
        let task = tokio::spawn(async move { registry.command(&task_id, command).await });
        match tokio::time::timeout(COMMAND_DEADLINE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ControlError::Worker(format!(
                "command task failed: {join_err}"
            ))),
            Err(_) => {
                warn!(
                    instance = %id,
                    command = command.as_str(),
                    "Command still in flight after deadline, detaching"
                );
                Err(ControlError::Timeout(COMMAND_DEADLINE.as_secs()))
            }
        }
    }

    // ---- fan-out --------------------------------------------------------

    pub async fn start_all(&self) -> BulkOutcome {
        self.bulk_over(self.ids(), Command::Start).await
    }

    pub async fn stop_all(&self) -> BulkOutcome {
        self.bulk_over(self.ids(), Command::Stop).await
    }

    pub async fn reload_all(&self) -> BulkOutcome {
        self.bulk_over(self.ids(), Command::Reload).await
    }

    /// Startup pass over instances flagged auto-start.
    pub async fn start_auto(&self) -> BulkOutcome {
        let ids = self
            .configs()
            .into_iter()
            .filter(|c| c.auto_start())
            .map(|c| c.id().to_string())
            .collect();
        self.bulk_over(ids, Command::Start).await
    }

    async fn bulk_over(&self, ids: Vec<InstanceId>, command: Command) -> BulkOutcome {
        let futures: Vec<_> = ids.iter().map(|id| self.command(id, command)).collect();
        let results = join_all(futures).await;

        let mut outcome = BulkOutcome::default();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => outcome.ok += 1,
                Err(
                    ControlError::AlreadyRunning(_)
                    | ControlError::NotRunning(_)
                    | ControlError::InvalidConfig { .. }
                    | ControlError::UnknownInstance(_)
                    | ControlError::ShuttingDown,
                ) => outcome.skipped += 1,
                Err(e) => {
                    outcome.failed += 1;
                    debug!(instance = %id, command = command.as_str(), "Bulk command failed: {e}");
                }
            }
        }
        info!(
            command = command.as_str(),
            ok = outcome.ok,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Bulk command finished"
        );
        outcome
    }

    // ---- bundle ---------------------------------------------------------

    pub fn export_bundle(&self) -> String {
        bundle::render(&self.configs())
    }

    /// Atomic full replace from bundle text. Parse failures happen before
    /// anything is touched; once parsing succeeds the old set is stopped
    /// and dropped and the new set installed stopped.
    pub async fn import_replace(&self, text: &str) -> Result<usize, ControlError> {
        self.refuse_if_shutting_down()?;
        let incoming = bundle::parse(text)?;

        for (id, slot) in self.ordered_slots() {
            let mut cell = slot.cell.lock().await;
            if slot.gone.load(Ordering::SeqCst) {
                continue;
            }
            if slot.check_running(&mut cell) {
                if let Err(e) = cell.worker.stop().await {
                    warn!(instance = %id, "Stop during import failed: {e:#}");
                }
            }
            slot.gone.store(true, Ordering::SeqCst);
        }

        let count = incoming.len();
        {
            let mut shelf = self.shelf();
            shelf.slots.clear();
            shelf.order.clear();
            for mut config in incoming {
                if shelf.slots.contains_key(config.id()) {
                    let old = config.id().to_string();
                    config.regenerate_id();
                    warn!(old = %old, new = %config.id(), "Duplicate id in bundle, assigned a fresh one");
                }
                let id = config.id().to_string();
                let worker = self.factory.create(&id);
                shelf.slots.insert(id.clone(), Slot::new(config, worker));
                shelf.order.push(id);
            }
        }
        info!(count, "Instance set replaced from bundle");
        self.persist_after_change();
        self.emit(RegistryEvent::Replaced { count });
        Ok(count)
    }

    // ---- views ----------------------------------------------------------

    /// Overviews in creation order. Never waits on a busy gate.
    pub async fn list(&self) -> Vec<InstanceOverview> {
        self.ordered_slots()
            .into_iter()
            .filter_map(|(id, slot)| slot.overview(id))
            .collect()
    }

    pub async fn get(&self, id: &str) -> Result<InstanceOverview, ControlError> {
        let slot = self.slot(id)?;
        slot.overview(id.to_string())
            .ok_or_else(|| ControlError::UnknownInstance(id.to_string()))
    }

    pub async fn running_count(&self) -> usize {
        self.list().await.into_iter().filter(|o| o.running).count()
    }

    /// Stop everything and empty the registry. Shutdown path only; does
    /// not write a snapshot, the final bundle save happens before this.
    pub async fn prune(&self) {
        for (id, slot) in self.ordered_slots() {
            let mut cell = slot.cell.lock().await;
            if slot.gone.load(Ordering::SeqCst) {
                continue;
            }
            if slot.check_running(&mut cell) {
                if let Err(e) = cell.worker.stop().await {
                    warn!(instance = %id, "Stop during prune failed: {e:#}");
                }
            }
            slot.gone.store(true, Ordering::SeqCst);
        }
        let mut shelf = self.shelf();
        let count = shelf.slots.len();
        shelf.slots.clear();
        shelf.order.clear();
        drop(shelf);
        if count > 0 {
            info!(count, "Pruned instance registry");
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn persist_after_change(&self) {
        match self.store.save(&self.configs()) {
            Ok(revision) => debug!(revision, "State snapshot written"),
            Err(e) => error!("State snapshot write failed: {e:#}"),
        }
        let _ = self.dirty_tx.send(());
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}
