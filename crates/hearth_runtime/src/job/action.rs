//! Actions
//!
//! An [`Action`] is a single unit of externally visible work. It reports back
//! to its owning job only through the [`ActionContext`] it is started with:
//! `complete()` when done (synchronously inside `start`, or later from any
//! thread), or `message(name, payload)` for anything else.

use tokio::sync::mpsc;
use tracing::debug;

use super::JobId;

/// Message name that signals completion of the current step
pub const COMPLETE: &str = "complete";

/// Message name that signals failure of the current step
pub const FAILED: &str = "failed";

/// A unit of work run inside a job
pub trait Action: Send {
    /// Begin executing.
    ///
    /// Call `ctx.complete()` before returning for synchronous actions, or keep
    /// a clone of the context and call it later. Returning an error fails the
    /// job.
    fn start(&mut self, ctx: &ActionContext) -> anyhow::Result<()>;

    /// Handle a non-completion message addressed to this action
    fn on_message(
        &mut self,
        _ctx: &ActionContext,
        _name: &str,
        _payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A message posted to a job's inbox by an action context
#[derive(Debug)]
pub(crate) struct JobMessage {
    /// Cursor position of the context that posted the message
    pub step: usize,
    pub name: String,
    pub payload: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Action Context
// ─────────────────────────────────────────────────────────────────────────────

/// Capability handle given to a running action.
///
/// Bound to one job and one step of that job; messages from a step that no
/// longer owns the cursor are ignored by the job.
#[derive(Debug, Clone)]
pub struct ActionContext {
    job_id: JobId,
    step: usize,
    inbox: mpsc::UnboundedSender<JobMessage>,
}

impl ActionContext {
    pub(crate) fn new(job_id: JobId, step: usize, inbox: mpsc::UnboundedSender<JobMessage>) -> Self {
        Self {
            job_id,
            step,
            inbox,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Position of this action within its job
    pub fn step(&self) -> usize {
        self.step
    }

    /// Signal that this action has finished.
    ///
    /// Returns false if the job no longer accepts messages (it finished or
    /// timed out).
    pub fn complete(&self) -> bool {
        self.message(COMPLETE, serde_json::Value::Null)
    }

    /// Signal that this action failed; the job fails with `reason`
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.message(FAILED, serde_json::json!({ "reason": reason.into() }))
    }

    /// Post a message to the owning job
    pub fn message(&self, name: &str, payload: serde_json::Value) -> bool {
        let sent = self
            .inbox
            .send(JobMessage {
                step: self.step,
                name: name.to_string(),
                payload,
            })
            .is_ok();
        if !sent {
            debug!(job_id = %self.job_id, step = self.step, name, "Job no longer accepts messages");
        }
        sent
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Composite Action
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a job's action has more work after a step completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The next step was started
    Started,
    /// Nothing left to run
    Done,
}

/// An ordered sequence of actions run one after another.
///
/// The cursor only advances once the current child signals completion.
pub struct CompositeAction {
    children: Vec<Box<dyn Action>>,
    cursor: usize,
}

impl CompositeAction {
    pub fn new(children: Vec<Box<dyn Action>>) -> Self {
        Self {
            children,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Index of the child currently owning the cursor
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn start_current(
        &mut self,
        job_id: JobId,
        inbox: &mpsc::UnboundedSender<JobMessage>,
    ) -> anyhow::Result<Progress> {
        match self.children.get_mut(self.cursor) {
            Some(child) => {
                let ctx = ActionContext::new(job_id, self.cursor, inbox.clone());
                child.start(&ctx)?;
                Ok(Progress::Started)
            }
            None => Ok(Progress::Done),
        }
    }
}

impl std::fmt::Debug for CompositeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeAction")
            .field("children", &self.children.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job Action
// ─────────────────────────────────────────────────────────────────────────────

/// What a job runs: one action, or a composite of several
pub enum JobAction {
    Single(Box<dyn Action>),
    Composite(CompositeAction),
}

impl JobAction {
    /// Number of steps
    pub fn steps(&self) -> usize {
        match self {
            JobAction::Single(_) => 1,
            JobAction::Composite(c) => c.len(),
        }
    }

    /// Step currently owning the cursor
    pub(crate) fn cursor(&self) -> usize {
        match self {
            JobAction::Single(_) => 0,
            JobAction::Composite(c) => c.cursor,
        }
    }

    pub(crate) fn start(
        &mut self,
        job_id: JobId,
        inbox: &mpsc::UnboundedSender<JobMessage>,
    ) -> anyhow::Result<Progress> {
        match self {
            JobAction::Single(action) => {
                action.start(&ActionContext::new(job_id, 0, inbox.clone()))?;
                Ok(Progress::Started)
            }
            JobAction::Composite(c) => c.start_current(job_id, inbox),
        }
    }

    /// The current step completed: move on
    pub(crate) fn advance(
        &mut self,
        job_id: JobId,
        inbox: &mpsc::UnboundedSender<JobMessage>,
    ) -> anyhow::Result<Progress> {
        match self {
            JobAction::Single(_) => Ok(Progress::Done),
            JobAction::Composite(c) => {
                c.cursor += 1;
                c.start_current(job_id, inbox)
            }
        }
    }

    /// Forward a non-completion message to the action owning the cursor
    pub(crate) fn forward(
        &mut self,
        job_id: JobId,
        inbox: &mpsc::UnboundedSender<JobMessage>,
        name: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let step = self.cursor();
        let ctx = ActionContext::new(job_id, step, inbox.clone());
        match self {
            JobAction::Single(action) => action.on_message(&ctx, name, payload),
            JobAction::Composite(c) => match c.children.get_mut(step) {
                Some(child) => child.on_message(&ctx, name, payload),
                None => Ok(()),
            },
        }
    }
}

impl std::fmt::Debug for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobAction::Single(_) => f.write_str("Single"),
            JobAction::Composite(c) => c.fmt(f),
        }
    }
}
