//! Metrics module
//!
//! Aggregates orchestrator events and system load into a [`MetricsSnapshot`] that
//! the metrics server exposes as JSON.

use crate::events::{CompletionStatus, JobEvent, WorkerId};
use crate::orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

/// How often system load and queue length are refreshed
const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Per-worker progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerMetrics {
    pub id: WorkerId,
    pub source: String,
    pub percent: f64,
    pub elapsed_secs: f64,
    pub eta_secs: f64,
    pub speed: String,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including workers, system, and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub workers: Vec<WorkerMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub skipped_jobs: u64,
    pub stopped_jobs: u64,
}

/// Shared metrics state, written by the tracker and read by the server
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Fold one orchestrator event into the snapshot
pub fn apply_event(snapshot: &mut MetricsSnapshot, event: &JobEvent) {
    match event {
        JobEvent::Started { id, source } => {
            snapshot.workers.push(WorkerMetrics {
                id: *id,
                source: source.to_string_lossy().into_owned(),
                percent: 0.0,
                elapsed_secs: 0.0,
                eta_secs: 0.0,
                speed: String::new(),
            });
        }
        JobEvent::Progress(update) => {
            if let Some(worker) = snapshot.workers.iter_mut().find(|w| w.id == update.id) {
                worker.percent = update.percent;
                worker.elapsed_secs = update.elapsed_secs;
                worker.eta_secs = update.eta_secs;
                worker.speed = update.speed.clone();
            }
        }
        JobEvent::Log { .. } => return,
        JobEvent::Finished(completion) => {
            snapshot.workers.retain(|w| w.id != completion.id);
            match completion.status {
                CompletionStatus::Converted => snapshot.completed_jobs += 1,
                CompletionStatus::Skipped => snapshot.skipped_jobs += 1,
                CompletionStatus::Failed => snapshot.failed_jobs += 1,
                CompletionStatus::Stopped => snapshot.stopped_jobs += 1,
            }
        }
    }
    snapshot.running_jobs = snapshot.workers.len();
    snapshot.timestamp_unix_ms = now_unix_ms();
}

/// Keep `metrics` up to date with `orchestrator` until the task is aborted.
///
/// Events update worker progress and counters; a periodic refresh samples system
/// load and reconciles the worker list with the queue snapshot.
pub fn track(orchestrator: Orchestrator, metrics: SharedMetrics) -> JoinHandle<()> {
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => apply_event(&mut *metrics.write().await, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics tracker fell behind the event stream");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = refresh.tick() => {
                    let system = tokio::task::spawn_blocking(collect_system_metrics)
                        .await
                        .unwrap_or_default();
                    let queue = orchestrator.snapshot().await.ok();

                    let mut snapshot = metrics.write().await;
                    snapshot.system = system;
                    if let Some(queue) = queue {
                        snapshot.queue_len = queue.pending;
                        snapshot
                            .workers
                            .retain(|w| queue.active.iter().any(|a| a.id == w.id));
                        snapshot.running_jobs = queue.active.len();
                    }
                    snapshot.timestamp_unix_ms = now_unix_ms();
                }
            }
        }
    })
}
