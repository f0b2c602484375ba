//! Mnema memory daemon.
//!
//! Long-running process that owns the graph store and keeps the autonomous
//! scheduler working between conversations. Conversational surfaces use
//! [`mnema_core::MemoryService`] against the same store in-process; this
//! binary exists so the memory keeps growing when nobody is talking to it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mnema_core::{
    create_generation_service, create_similarity_search, init_scheduler_loop, ActivityTracker,
    AutonomousScheduler, GraphStore, MemoryService, MnemaConfig, RetrievalEngine, SchedulerHandle,
    TaskQueue,
};

const STATUS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() {
    // Load .env if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!(
            "[mnema-daemon] .env not loaded: {} (using system environment)",
            e
        );
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MnemaConfig::load().expect("load mnema config");
    seed_starter_config(&config);

    // NOTE: sled is single-writer; anything else using this store must run
    // in-process, not against the same path from another process.
    let store = Arc::new(
        GraphStore::open_with(&config.store.data_dir, config.store.journal_fsync)
            .expect("open graph store"),
    );

    let search = create_similarity_search(&config.similarity, store.clone());
    let generation = create_generation_service(&config.generation);
    let retrieval = Arc::new(RetrievalEngine::new(
        store.clone(),
        search.clone(),
        config.retrieval.clone(),
    ));
    let queue = Arc::new(TaskQueue::new());
    let activity = ActivityTracker::new();

    let scheduler = Arc::new(AutonomousScheduler::new(
        store.clone(),
        queue.clone(),
        retrieval.clone(),
        search.clone(),
        generation.clone(),
        activity.clone(),
        &config,
    ));
    forward_pulses(&scheduler);

    let (handle, control_rx) = SchedulerHandle::channel();
    let loop_handle = init_scheduler_loop(scheduler.clone(), control_rx);

    let service = MemoryService::new(store, queue, retrieval, activity, &config);
    service.attach_control(handle.clone());

    tracing::info!(
        target: "mnema::daemon",
        mode = scheduler.mode().label(),
        data_dir = %config.store.data_dir,
        generation = %generation.describe(),
        similarity = %search.status(),
        "mnema daemon started"
    );

    let mut status = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = status.tick() => {
                let snap = service.queue_snapshot(5);
                tracing::info!(
                    target: "mnema::daemon",
                    total = snap.total,
                    queued = snap.counts.queued,
                    deferred = snap.counts.deferred,
                    completed = snap.counts.completed,
                    cycles = scheduler.cycles_run(),
                    "queue status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    // Dropping every control handle closes the channel and stops the loop.
    drop(service);
    drop(handle);
    let _ = loop_handle.await;
}

/// Write a starter config file on first run so the knobs are discoverable.
fn seed_starter_config(config: &MnemaConfig) {
    let path = std::env::var("MNEMA_CONFIG").unwrap_or_else(|_| "config/mnema".to_string());
    let base = Path::new(&path);
    let file = base.with_extension("toml");
    if base.exists() || file.exists() {
        return;
    }
    match config.save_to_path(&file) {
        Ok(()) => tracing::info!(path = %file.display(), "wrote starter config"),
        Err(e) => tracing::warn!(error = %e, "could not write starter config"),
    }
}

/// Mirror scheduler pulses into the log so background work is visible.
fn forward_pulses(scheduler: &Arc<AutonomousScheduler>) {
    let mut pulses = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match pulses.recv().await {
                Ok(line) => {
                    tracing::debug!(target: "mnema::scheduler", pulse = %line, "pulse")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
}
