//! Sliding-window admission control for jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{JobHandle, JobId};
use crate::error::{HubError, HubResult};

/// Rate limiter state shared by every job the engine starts.
///
/// Completion does not remove an entry; only elapsed time does, measured
/// against the `created_at` of the job asking for admission.
#[derive(Debug)]
pub struct JobWindow {
    window: chrono::Duration,
    max_active: usize,
    entries: Vec<JobHandle>,
}

impl JobWindow {
    pub fn new(window: Duration, max_active: usize) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            max_active,
            entries: Vec::new(),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Total entries, terminal or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose job has not reached a terminal status
    pub fn active(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_terminal()).count()
    }

    /// Drop entries older than the window relative to `now`.
    ///
    /// Returns the ids of purged jobs.
    pub fn purge(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let cutoff = now.checked_sub_signed(self.window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut purged = Vec::new();
        self.entries.retain(|entry| {
            let keep = entry.created_at() >= cutoff;
            if !keep {
                purged.push(entry.id());
            }
            keep
        });
        purged
    }

    /// Purge, then admit `job` unless the window already holds `max_active`
    /// non-terminal entries.
    ///
    /// Returns the ids purged on the way, whether or not the job was admitted.
    pub fn admit(&mut self, job: &JobHandle) -> (Vec<JobId>, HubResult<()>) {
        let purged = self.purge(job.created_at());
        let active = self.active();
        if active >= self.max_active {
            return (
                purged,
                Err(HubError::AdmissionRejected {
                    active,
                    max_active: self.max_active,
                }),
            );
        }
        self.entries.push(job.clone());
        (purged, Ok(()))
    }
}
