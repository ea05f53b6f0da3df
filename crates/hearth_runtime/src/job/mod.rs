//! Jobs
//!
//! A [`Job`] tracks one action or action-set execution: identity, timeout and
//! asynchronous completion state. Actions report back through the job's inbox;
//! the job forwards each message to whichever action owns the cursor.
//!
//! # Lifecycle
//!
//! `Created -> Started -> (InProgress) -> Complete | Failed`
//!
//! [`Job::start`] runs the first action synchronously and drains every message
//! posted during that call, so a job whose actions all complete synchronously
//! is already `Complete` when `start` returns. Otherwise the job is
//! `InProgress` and a task waits on its inbox until completion or timeout.

mod action;
mod engine;
mod window;

pub use action::{Action, ActionContext, COMPLETE, CompositeAction, FAILED, JobAction};
pub use engine::*;
pub use window::*;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use action::{JobMessage, Progress};

// ─────────────────────────────────────────────────────────────────────────────
// Identity & Status
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Why a job failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum JobFailure {
    /// The job exceeded its timeout
    Timeout,
    /// An action returned an error or called `fail`
    Error(String),
}

/// Current state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Started,
    /// Waiting for an asynchronous completion
    InProgress,
    Complete,
    Failed(JobFailure),
}

impl JobStatus {
    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed(_))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::InProgress => write!(f, "in-progress"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed(JobFailure::Timeout) => write!(f, "failed (timeout)"),
            JobStatus::Failed(JobFailure::Error(e)) => write!(f, "failed ({})", e),
        }
    }
}

/// Snapshot of a job for observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Step owning the cursor
    pub step: usize,
    pub steps: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared job state
// ─────────────────────────────────────────────────────────────────────────────

struct JobShared {
    id: JobId,
    description: String,
    created_at: DateTime<Utc>,
    timeout: Duration,
    steps: usize,
    step: AtomicUsize,
    status: watch::Sender<JobStatus>,
}

impl JobShared {
    /// Apply a transition unless the job is already terminal
    fn transition(&self, next: JobStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

/// Cheap, cloneable view of a job
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn status(&self) -> JobStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.status() == JobStatus::Complete
    }

    pub fn is_in_progress(&self) -> bool {
        self.status() == JobStatus::InProgress
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status(), JobStatus::Failed(_))
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.shared.id,
            description: self.shared.description.clone(),
            created_at: self.shared.created_at,
            status: self.status(),
            step: self.shared.step.load(Ordering::SeqCst),
            steps: self.shared.steps,
        }
    }

    /// Wait until the job reaches a terminal status
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.shared.status.subscribe();
        match rx.wait_for(JobStatus::is_terminal).await {
            Ok(status) => status.clone(),
            // The sender lives in `shared`, which we hold
            Err(_) => self.status(),
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job
// ─────────────────────────────────────────────────────────────────────────────

/// A not-yet-finished job together with its action and inbox
pub struct Job {
    shared: Arc<JobShared>,
    action: JobAction,
    inbox_tx: mpsc::UnboundedSender<JobMessage>,
    inbox_rx: mpsc::UnboundedReceiver<JobMessage>,
    deadline: Instant,
}

impl Job {
    /// Create a job. The timeout is measured from `created_at`, so a job
    /// created in the past has already spent part of it.
    pub fn new(
        action: JobAction,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::Created);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let elapsed = Utc::now()
            .signed_duration_since(created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Self {
            shared: Arc::new(JobShared {
                id: JobId::new(),
                description: description.into(),
                created_at,
                timeout,
                steps: action.steps(),
                step: AtomicUsize::new(0),
                status,
            }),
            action,
            inbox_tx,
            inbox_rx,
            deadline: Instant::now() + timeout.saturating_sub(elapsed),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the job.
    ///
    /// Returns once the job is in a stable state: complete, failed, or waiting
    /// on its inbox. Must be called within a tokio runtime when any action
    /// completes asynchronously.
    pub fn start(mut self) -> JobHandle {
        let handle = self.handle();
        let id = self.shared.id;
        self.shared.transition(JobStatus::Started);
        tracing::debug!(job_id = %id, description = %self.shared.description, "Job started");

        if self.deadline <= Instant::now() {
            tracing::warn!(
                job_id = %id,
                created_at = %self.shared.created_at,
                timeout = ?self.shared.timeout,
                "Job expired before it started"
            );
            self.finish(JobStatus::Failed(JobFailure::Timeout));
            return handle;
        }

        match self.action.start(id, &self.inbox_tx) {
            Ok(Progress::Started) => {}
            Ok(Progress::Done) => {
                self.finish(JobStatus::Complete);
                return handle;
            }
            Err(e) => {
                self.finish(JobStatus::Failed(JobFailure::Error(e.to_string())));
                return handle;
            }
        }

        if let Some(status) = self.drain() {
            self.finish(status);
            return handle;
        }

        self.shared.transition(JobStatus::InProgress);
        tokio::spawn(self.run());
        handle
    }

    /// Process every message already queued. Returns a terminal status if one
    /// was reached.
    fn drain(&mut self) -> Option<JobStatus> {
        while let Ok(msg) = self.inbox_rx.try_recv() {
            if let Some(status) = self.dispatch(msg) {
                return Some(status);
            }
        }
        None
    }

    async fn run(mut self) {
        let id = self.shared.id;
        loop {
            tokio::select! {
                msg = self.inbox_rx.recv() => {
                    let Some(msg) = msg else { return };
                    if let Some(status) = self.dispatch(msg) {
                        self.finish(status);
                        return;
                    }
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    tracing::warn!(
                        job_id = %id,
                        step = self.action.cursor(),
                        timeout = ?self.shared.timeout,
                        "Job timed out"
                    );
                    self.finish(JobStatus::Failed(JobFailure::Timeout));
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, msg: JobMessage) -> Option<JobStatus> {
        let id = self.shared.id;
        let cursor = self.action.cursor();
        if msg.step != cursor {
            tracing::debug!(job_id = %id, step = msg.step, cursor, name = %msg.name, "Ignoring stale message");
            return None;
        }

        match msg.name.as_str() {
            COMPLETE => match self.action.advance(id, &self.inbox_tx) {
                Ok(Progress::Done) => Some(JobStatus::Complete),
                Ok(Progress::Started) => {
                    self.shared.step.store(self.action.cursor(), Ordering::SeqCst);
                    None
                }
                Err(e) => Some(JobStatus::Failed(JobFailure::Error(e.to_string()))),
            },
            FAILED => {
                let reason = msg
                    .payload
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("action failed")
                    .to_string();
                Some(JobStatus::Failed(JobFailure::Error(reason)))
            }
            name => match self.action.forward(id, &self.inbox_tx, name, &msg.payload) {
                Ok(()) => None,
                Err(e) => Some(JobStatus::Failed(JobFailure::Error(e.to_string()))),
            },
        }
    }

    fn finish(&mut self, status: JobStatus) {
        let id = self.shared.id;
        // No further messages are accepted once the job is terminal
        self.inbox_rx.close();
        match &status {
            JobStatus::Complete => tracing::debug!(job_id = %id, "Job complete"),
            JobStatus::Failed(reason) => tracing::warn!(job_id = %id, ?reason, "Job failed"),
            _ => {}
        }
        self.shared.transition(status);
    }
}
