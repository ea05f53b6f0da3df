//! Automation tasks
//!
//! Tasks are stored rules: conditions plus the actions to run when they hold.
//! [`TaskSource`] provides the current task list; the
//! [`TaskRegistrationCoordinator`] hands fully resolved tasks to the plugin
//! owning their trigger.

mod coordinator;

pub use coordinator::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::HubResult;
use crate::event::{Event, EventBus, event_ids, topics};
use crate::job::{JobEngine, JobHandle};
use crate::types::{PropertyValues, Task, TaskContext};

/// Provides the full current task list
pub trait TaskSource: Send + Sync {
    fn tasks(&self) -> Vec<Task>;
}

/// Volatile task store that announces changes on `hub/tasks`
pub struct InMemoryTaskStore {
    bus: Arc<EventBus>,
    tasks: RwLock<BTreeMap<TaskContext, Task>>,
}

impl InMemoryTaskStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add or replace a task
    pub fn add_task(&self, task: Task) {
        let context = task.context.clone();
        self.tasks.write().insert(context.clone(), task);
        tracing::debug!(task = %context, "Task stored");
        self.announce(&context, "added");
    }

    /// Remove a task. Returns the removed task, if any.
    pub fn remove_task(&self, context: &TaskContext) -> Option<Task> {
        let removed = self.tasks.write().remove(context);
        if removed.is_some() {
            tracing::debug!(task = %context, "Task removed");
            self.announce(context, "removed");
        }
        removed
    }

    pub fn get(&self, context: &TaskContext) -> Option<Task> {
        self.tasks.read().get(context).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    fn announce(&self, context: &TaskContext, change: &str) {
        let mut payload = PropertyValues::new();
        payload.insert("task".into(), context.id().into());
        payload.insert("change".into(), change.into());
        self.bus
            .publish(Event::new(topics::TASKS, event_ids::TASKS_CHANGED, payload));
    }
}

impl TaskSource for InMemoryTaskStore {
    fn tasks(&self) -> Vec<Task> {
        self.tasks.read().values().cloned().collect()
    }
}

/// Run a task's actions as one job
pub fn fire_task(task: &Task, engine: &JobEngine) -> HubResult<JobHandle> {
    tracing::info!(task = %task.context, name = %task.name, "Firing task");
    engine.execute_action_set(&task.actions)
}
