//! Lifecycle events emitted by workers and relayed by the orchestrator

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Worker identifier, assigned at admission and never reused
pub type WorkerId = u64;

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Converted,
    /// Destination existed and the duplicate policy was `skip`
    Skipped,
    Failed,
    Stopped,
}

/// Terminal result of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: WorkerId,
    pub success: bool,
    pub status: CompletionStatus,
    /// Short human-readable summary; the full encoder log travels as log events
    pub message: String,
    pub output: Option<PathBuf>,
}

/// Progress report for a running worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: WorkerId,
    pub percent: f64,
    pub elapsed_secs: f64,
    pub eta_secs: f64,
    pub speed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started { id: WorkerId, source: PathBuf },
    Progress(ProgressUpdate),
    Log { id: WorkerId, line: String },
    Finished(Completion),
}

impl JobEvent {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            JobEvent::Started { id, .. } | JobEvent::Log { id, .. } => *id,
            JobEvent::Progress(p) => p.id,
            JobEvent::Finished(c) => c.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Finished(_))
    }
}
