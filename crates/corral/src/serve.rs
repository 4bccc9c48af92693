//! Daemon assembly: wires the registry, persistence, telemetry and both
//! HTTP surfaces together, then runs until SIGINT/SIGTERM.
//!
//! Shutdown order matters: refuse new work, stop every capture, write the
//! final bundle, then unwind background tasks and listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use corralconf::CorralConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dashboard::{self, DashState};
use crate::media::MediaStore;
use crate::notify::{Notifier, Severity};
use crate::persist::{self, AutosavePolicy, SnapshotStore};
use crate::registry::{Registry, RegistryEvent};
use crate::rest;
use crate::telemetry::{self, ProcessCpuProbe};
use crate::worker::{ProcessWorkerFactory, StubWorkerFactory, WorkerFactory};

pub async fn run(config: CorralConfig) -> Result<()> {
    std::fs::create_dir_all(&config.daemon.state_dir)
        .context("Failed to create state directory")?;
    info!(
        "Using state directory: {}",
        config.daemon.state_dir.display()
    );

    info!("📋 Loading instance snapshot...");
    let (store, seeded) = SnapshotStore::open(config.state_file())?;
    info!(
        "   {} instance(s) at revision {}",
        seeded.len(),
        store.revision()
    );

    let factory: Box<dyn WorkerFactory> = if config.worker.command.trim().is_empty() {
        warn!("worker.command is empty, captures run as stubs and render nothing");
        Box::new(StubWorkerFactory)
    } else {
        info!("🎥 Renderer: {}", config.worker.command);
        Box::new(ProcessWorkerFactory::new(
            &config.worker.command,
            &config.worker.args,
            config.daemon.state_dir.join("sessions"),
        ))
    };

    let (dirty_tx, dirty_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Arc::new(Registry::new(factory, store, dirty_tx));
    registry.restore(seeded);

    let notifier = Arc::new(Notifier::new(&config.alerting.syslog_target, "corral"));

    // `token` stops background tasks; the listeners get their own token so
    // both surfaces stay up until the final bundle is on disk.
    let token = CancellationToken::new();
    let listener_token = CancellationToken::new();

    let autosaver = persist::spawn_autosaver(
        Arc::clone(&registry),
        config.bundle_file(),
        AutosavePolicy {
            quiet: Duration::from_secs(config.autosave.quiet_secs),
            max_staleness: Duration::from_secs(config.autosave.max_staleness_secs),
        },
        dirty_rx,
        token.clone(),
    );
    info!("🧺 Autosaver on: {}", config.bundle_file().display());

    let cpu_watch = match ProcessCpuProbe::new() {
        Ok(probe) => Some(telemetry::spawn_cpu_watch(
            Box::new(probe),
            config.alerting.cpu_threshold_pct as f32,
            Duration::from_secs(config.alerting.cpu_sample_secs),
            Arc::clone(&notifier),
            token.clone(),
        )),
        Err(e) => {
            warn!("CPU watch unavailable: {e:#}");
            None
        }
    };

    let event_log = spawn_event_log(registry.subscribe(), Arc::clone(&notifier), token.clone());

    info!("🖼️  Opening media store...");
    let media = Arc::new(MediaStore::open(
        config.media_dir(),
        config.dashboard.media_max_mb * 1024 * 1024,
    )?);
    info!(
        "   Media dir: {} (cap {} MB)",
        config.media_dir().display(),
        config.dashboard.media_max_mb
    );

    let rest_addr: SocketAddr = format!("{}:{}", config.rest.bind, config.rest.port)
        .parse()
        .context("Failed to parse REST bind address")?;
    let dash_addr: SocketAddr = format!("{}:{}", config.dashboard.bind, config.dashboard.port)
        .parse()
        .context("Failed to parse dashboard bind address")?;

    let rest_listener = TcpListener::bind(rest_addr)
        .await
        .with_context(|| format!("Failed to bind REST controller on {rest_addr}"))?;
    let dash_listener = TcpListener::bind(dash_addr)
        .await
        .with_context(|| format!("Failed to bind dashboard on {dash_addr}"))?;

    let rest_server = spawn_server(
        "rest",
        rest_listener,
        rest::router(Arc::clone(&registry)),
        listener_token.clone(),
    );
    let dash_server = spawn_server(
        "dashboard",
        dash_listener,
        dashboard::router(DashState {
            registry: Arc::clone(&registry),
            media,
            started_at: Instant::now(),
        }),
        listener_token.clone(),
    );

    info!("🎛️  REST controller: http://{rest_addr}/<title|all>/<command>");
    info!("📺 Dashboard API: http://{dash_addr}/api/");

    let boot = registry.start_auto().await;
    if boot.ok + boot.failed > 0 {
        info!(
            "🚀 Auto-start: {} started, {} failed, {} skipped",
            boot.ok, boot.failed, boot.skipped
        );
    }

    info!("🤠 Corral ready, {} instance(s) penned", registry.len());

    wait_for_shutdown_signal().await;

    registry.begin_shutdown();
    let stopped = registry.stop_all().await;
    info!(
        "Stopped {} instance(s), {} already idle",
        stopped.ok, stopped.skipped
    );
    if let Err(e) = persist::save_bundle(&registry, &config.bundle_file()) {
        error!("Final bundle save failed: {e:#}");
    }

    token.cancel();
    listener_token.cancel();
    let tasks = [
        Some(autosaver),
        cpu_watch,
        Some(event_log),
        Some(rest_server),
        Some(dash_server),
    ];
    for handle in tasks.into_iter().flatten() {
        let _ = handle.await;
    }
    registry.prune().await;

    info!("Shutdown complete");
    Ok(())
}

fn spawn_server(
    name: &'static str,
    listener: TcpListener,
    app: axum::Router,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            token.cancelled().await;
        });
        if let Err(e) = server.await {
            error!("{name} server error: {e}");
        }
    })
}

/// Mirrors registry events into the log and pushes start failures to
/// syslog, where wallbox operators actually look.
fn spawn_event_log(
    mut events: broadcast::Receiver<RegistryEvent>,
    notifier: Arc<Notifier>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(RegistryEvent::StartFailed { id, error }) => {
                        warn!(id, error, "Instance start failed");
                        notifier.alert(
                            Severity::Error,
                            "instance",
                            &format!("instance {id} failed to start: {error}"),
                        );
                    }
                    Ok(event) => debug!(?event, "Registry event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event log fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

// Handle both SIGINT (Ctrl+C) and SIGTERM (systemd, container runtimes).
async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await
}
