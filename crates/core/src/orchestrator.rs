//! Job orchestrator
//!
//! A single actor task owns the pending queue and the active worker map. Callers
//! talk to it through an [`Orchestrator`] handle; workers report back over an
//! internal channel, and every lifecycle event is re-broadcast to subscribers.
//!
//! Admission is FIFO and bounded by `max_parallel`. When the last handle is
//! dropped, pending jobs are discarded and running workers are stopped.

use crate::concurrency::ConcurrencyPlan;
use crate::encode::CommandBuilder;
use crate::events::{Completion, CompletionStatus, JobEvent, WorkerId};
use crate::job::Job;
use crate::worker::{DestinationRegistry, Worker, WorkerControl, WorkerSettings};
use handforge_config::{Config, ThreadsConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

/// Events buffered per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator has shut down")]
    Closed,
}

/// Settings snapshot taken when the orchestrator starts
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// At least 1
    pub max_parallel: u32,
    pub threads: ThreadsConfig,
    pub worker: WorkerSettings,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let plan = ConcurrencyPlan::derive(cfg);
        Self {
            max_parallel: plan.max_parallel,
            threads: cfg.threads.clone(),
            worker: WorkerSettings::from_config(cfg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveWorker {
    pub id: WorkerId,
    pub source: PathBuf,
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    /// Running workers in admission order
    pub active: Vec<ActiveWorker>,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.active.is_empty()
    }
}

enum Command {
    Submit(Vec<Job>),
    Pause(WorkerId),
    Resume(WorkerId),
    Stop(WorkerId),
    PauseAll,
    ResumeAll,
    StopAll(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    WaitIdle(oneshot::Sender<()>),
}

/// Handle to a running orchestrator
#[derive(Debug, Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<JobEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Submit(jobs) => write!(f, "Submit({} jobs)", jobs.len()),
            Command::Pause(id) => write!(f, "Pause({})", id),
            Command::Resume(id) => write!(f, "Resume({})", id),
            Command::Stop(id) => write!(f, "Stop({})", id),
            Command::PauseAll => write!(f, "PauseAll"),
            Command::ResumeAll => write!(f, "ResumeAll"),
            Command::StopAll(_) => write!(f, "StopAll"),
            Command::Snapshot(_) => write!(f, "Snapshot"),
            Command::WaitIdle(_) => write!(f, "WaitIdle"),
        }
    }
}

impl Orchestrator {
    /// Start the actor task on the current tokio runtime
    pub fn spawn(settings: OrchestratorSettings, builder: CommandBuilder) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            max_parallel: settings.max_parallel.max(1) as usize,
            threads: settings.threads,
            worker_settings: Arc::new(settings.worker),
            builder: Arc::new(builder),
            registry: DestinationRegistry::new(),
            pending: VecDeque::new(),
            active: BTreeMap::new(),
            next_id: 0,
            worker_tx,
            events: events.clone(),
            stop_waiters: Vec::new(),
            idle_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(command_rx, worker_rx));

        Self { commands, events }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.commands
            .send(command)
            .map_err(|_| OrchestratorError::Closed)
    }

    /// Append jobs to the queue and admit as many as the bound allows
    pub fn submit(&self, jobs: Vec<Job>) -> Result<(), OrchestratorError> {
        self.send(Command::Submit(jobs))
    }

    pub fn pause(&self, id: WorkerId) -> Result<(), OrchestratorError> {
        self.send(Command::Pause(id))
    }

    pub fn resume(&self, id: WorkerId) -> Result<(), OrchestratorError> {
        self.send(Command::Resume(id))
    }

    pub fn stop(&self, id: WorkerId) -> Result<(), OrchestratorError> {
        self.send(Command::Stop(id))
    }

    pub fn pause_all(&self) -> Result<(), OrchestratorError> {
        self.send(Command::PauseAll)
    }

    pub fn resume_all(&self) -> Result<(), OrchestratorError> {
        self.send(Command::ResumeAll)
    }

    /// Drop pending jobs, stop every worker and wait for their completions.
    ///
    /// Completions are broadcast before this returns.
    pub async fn stop_all(&self) -> Result<(), OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StopAll(tx))?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }

    /// Resolve once nothing is pending or running
    pub async fn wait_idle(&self) -> Result<(), OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::WaitIdle(tx))?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }
}

struct ActiveEntry {
    source: PathBuf,
    control: WorkerControl,
}

struct Actor {
    max_parallel: usize,
    threads: ThreadsConfig,
    worker_settings: Arc<WorkerSettings>,
    builder: Arc<CommandBuilder>,
    registry: DestinationRegistry,
    pending: VecDeque<Job>,
    active: BTreeMap<WorkerId, ActiveEntry>,
    next_id: WorkerId,
    worker_tx: mpsc::UnboundedSender<JobEvent>,
    events: broadcast::Sender<JobEvent>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut worker_events: mpsc::UnboundedReceiver<JobEvent>,
    ) {
        let mut closed = false;

        loop {
            tokio::select! {
                command = commands.recv(), if !closed => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All orchestrator handles dropped, stopping workers");
                        closed = true;
                        self.pending.clear();
                        self.stop_active();
                    }
                },
                Some(event) = worker_events.recv() => self.on_worker_event(event),
            }

            if closed && self.active.is_empty() {
                break;
            }
        }
    }

    fn handle(&mut self, command: Command) {
        debug!(command = ?command, "Orchestrator command");
        match command {
            Command::Submit(jobs) => {
                self.pending.extend(jobs);
                self.admit();
            }
            Command::Pause(id) => {
                if let Some(entry) = self.active.get(&id) {
                    entry.control.pause();
                }
            }
            Command::Resume(id) => {
                if let Some(entry) = self.active.get(&id) {
                    entry.control.resume();
                }
            }
            Command::Stop(id) => {
                if let Some(entry) = self.active.get(&id) {
                    entry.control.stop();
                }
            }
            Command::PauseAll => self.active.values().for_each(|e| e.control.pause()),
            Command::ResumeAll => self.active.values().for_each(|e| e.control.resume()),
            Command::StopAll(done) => {
                self.pending.clear();
                self.stop_active();
                self.stop_waiters.push(done);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::WaitIdle(reply) => self.idle_waiters.push(reply),
        }
        self.notify_waiters();
    }

    fn stop_active(&self) {
        for entry in self.active.values() {
            entry.control.stop();
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending.len(),
            active: self
                .active
                .iter()
                .map(|(id, entry)| ActiveWorker {
                    id: *id,
                    source: entry.source.clone(),
                })
                .collect(),
        }
    }

    fn on_worker_event(&mut self, event: JobEvent) {
        let finished = match &event {
            JobEvent::Finished(completion) => Some(completion.id),
            _ => None,
        };
        if let Some(id) = finished {
            self.active.remove(&id);
        }

        // No subscribers is not an error
        let _ = self.events.send(event);

        if finished.is_some() {
            self.admit();
            self.notify_waiters();
        }
    }

    fn admit(&mut self) {
        while self.active.len() < self.max_parallel {
            let Some(mut job) = self.pending.pop_front() else {
                break;
            };

            self.next_id += 1;
            let id = self.next_id;
            job.threads = self.threads.threads_for(&job.format);

            info!(
                worker = id,
                source = %job.source.display(),
                format = %job.format,
                threads = job.threads,
                "Starting job"
            );

            let control = WorkerControl::new();
            self.active.insert(
                id,
                ActiveEntry {
                    source: job.source.clone(),
                    control: control.clone(),
                },
            );
            let _ = self.events.send(JobEvent::Started {
                id,
                source: job.source.clone(),
            });

            let worker = Worker::new(
                id,
                job,
                self.builder.clone(),
                self.worker_settings.clone(),
                self.registry.clone(),
                control.subscribe(),
                self.worker_tx.clone(),
            );
            let report = self.worker_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::spawn(worker.run()).await {
                    // A crashed worker still frees its slot
                    let _ = report.send(JobEvent::Finished(Completion {
                        id,
                        success: false,
                        status: CompletionStatus::Failed,
                        message: format!("Worker crashed: {}", e),
                        output: None,
                    }));
                }
            });
        }
    }

    fn notify_waiters(&mut self) {
        if self.active.is_empty() {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(());
            }
            if self.pending.is_empty() {
                for waiter in self.idle_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use handforge_config::{DuplicatePolicy, EncoderConfig};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fake ffmpeg that echoes its arguments, then writes 2 KiB to its last argument
    /// after `delay`. With `hang`, it never exits on its own.
    fn fake_encoder(dir: &TempDir, delay: &str, hang: bool) -> PathBuf {
        let program = dir.path().join("ffmpeg");
        let ending = if hang {
            "exec sleep 30"
        } else {
            "exit 0"
        };
        let script = format!(
            r#"#!/bin/sh
for last in "$@"; do :; done
echo "args: $@" >&2
echo "  Duration: 00:00:01.00, start: 0.000000" >&2
head -c 2048 /dev/zero > "$last"
sleep {delay}
{ending}
"#
        );
        fs::write(&program, script).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        program
    }

    fn jobs(dir: &TempDir, names: &[&str]) -> Vec<Job> {
        names
            .iter()
            .map(|name| {
                let source = dir.path().join(name);
                fs::write(&source, b"fake").unwrap();
                Job::new(source, dir.path().join("out"), "mp3")
            })
            .collect()
    }

    fn start(dir: &TempDir, max_parallel: u32, delay: &str, hang: bool) -> Orchestrator {
        let mut threads = ThreadsConfig::default();
        threads.codec_threads.insert("mp3".to_string(), 3);
        let settings = OrchestratorSettings {
            max_parallel,
            threads,
            worker: WorkerSettings {
                on_exists: DuplicatePolicy::Overwrite,
                encoder: EncoderConfig {
                    poll_interval_ms: 20,
                    heartbeat_secs: 1,
                    ..EncoderConfig::default()
                },
            },
        };
        Orchestrator::spawn(
            settings,
            CommandBuilder::with_program(fake_encoder(dir, delay, hang)),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_admission_is_bounded_and_fifo() {
        let dir = TempDir::new().unwrap();
        let orchestrator = start(&dir, 2, "0.5", false);
        let mut rx = orchestrator.subscribe();

        orchestrator
            .submit(jobs(&dir, &["a.flac", "b.flac", "c.flac"]))
            .unwrap();

        let snapshot = orchestrator.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(
            snapshot.active.iter().map(|w| w.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(snapshot.active[0].source, dir.path().join("a.flac"));

        tokio::time::timeout(Duration::from_secs(20), orchestrator.wait_idle())
            .await
            .expect("queue drains")
            .unwrap();

        let events = drain(&mut rx);
        let mut running = 0;
        let mut max_running = 0;
        let mut started = Vec::new();
        let mut finished_before_third = 0;
        for event in &events {
            match event {
                JobEvent::Started { id, .. } => {
                    running += 1;
                    max_running = max_running.max(running);
                    if *id == 3 {
                        finished_before_third = 3 - running;
                    }
                    started.push(*id);
                }
                JobEvent::Finished(c) => {
                    assert!(c.success, "{}", c.message);
                    running -= 1;
                }
                _ => {}
            }
        }
        assert_eq!(started, vec![1, 2, 3]);
        assert_eq!(max_running, 2);
        assert_eq!(running, 0);
        assert!(finished_before_third >= 1);

        // Per-format thread count reaches the encoder
        assert!(events.iter().any(
            |e| matches!(e, JobEvent::Log { line, .. } if line.contains("-threads 3"))
        ));
        assert!(orchestrator.snapshot().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_stop_all_clears_queue() {
        let dir = TempDir::new().unwrap();
        let orchestrator = start(&dir, 2, "0", true);
        let mut rx = orchestrator.subscribe();

        orchestrator
            .submit(jobs(&dir, &["a.flac", "b.flac", "c.flac"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(15), orchestrator.stop_all())
            .await
            .expect("workers stop")
            .unwrap();
        assert!(orchestrator.snapshot().await.unwrap().is_idle());

        let events = drain(&mut rx);
        let started = events
            .iter()
            .filter(|e| matches!(e, JobEvent::Started { .. }))
            .count();
        let stopped: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Finished(c) => Some(c.status),
                _ => None,
            })
            .collect();
        assert_eq!(started, 2);
        assert_eq!(stopped, vec![CompletionStatus::Stopped; 2]);
    }

    #[tokio::test]
    async fn test_pause_all_then_stop_all() {
        let dir = TempDir::new().unwrap();
        let orchestrator = start(&dir, 1, "0", true);

        orchestrator.submit(jobs(&dir, &["a.flac"])).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        orchestrator.pause_all().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(15), orchestrator.stop_all())
            .await
            .expect("paused worker wakes")
            .unwrap();
        assert!(orchestrator.snapshot().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_ignored() {
        let dir = TempDir::new().unwrap();
        let orchestrator = start(&dir, 2, "0", false);

        orchestrator.pause(42).unwrap();
        orchestrator.resume(42).unwrap();
        orchestrator.stop(42).unwrap();
        orchestrator.resume_all().unwrap();

        assert_eq!(
            orchestrator.snapshot().await.unwrap(),
            QueueSnapshot::default()
        );
        // Nothing queued: resolves immediately
        tokio::time::timeout(Duration::from_secs(1), orchestrator.wait_idle())
            .await
            .expect("idle")
            .unwrap();
    }
}
