//! HandForge
//!
//! Batch media conversion on top of ffmpeg: a command builder that turns jobs into
//! argument vectors, workers that run and supervise one encode each, and an
//! orchestrator that schedules them under a parallelism bound.

pub mod concurrency;
pub mod encode;
pub mod events;
pub mod job;
pub mod media;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod output_gate;
pub mod probe;
pub mod progress;
pub mod scan;
pub mod startup;
pub mod worker;

pub use handforge_config as config;
pub use handforge_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use encode::{CommandBuilder, EncodeError, PassSpec};
pub use events::{Completion, CompletionStatus, JobEvent, ProgressUpdate, WorkerId};
pub use job::{Crop, EncodeMode, Job, QualityPreset, Tags};
pub use metrics::{
    apply_event, collect_system_metrics, new_shared_metrics, track, MetricsSnapshot,
    SharedMetrics, SystemMetrics, WorkerMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use orchestrator::{
    ActiveWorker, Orchestrator, OrchestratorError, OrchestratorSettings, QueueSnapshot,
};
pub use output_gate::{check_output, check_output_size, OutputGateResult};
pub use probe::{MediaInfo, ProbeError, Prober, Track, TrackKind};
pub use progress::{ProgressBand, ProgressSample, ProgressTracker};
pub use scan::collect_sources;
pub use startup::{check_ffmpeg, parse_ffmpeg_version, run_startup_checks, FfmpegInfo, StartupError};
pub use worker::{Worker, WorkerControl, WorkerError, WorkerSettings};
