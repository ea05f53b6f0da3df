//! Task Registration Coordinator
//!
//! Each sweep finds tasks whose every condition and action class is published,
//! groups them by the plugin owning their trigger condition and delivers each
//! group in one `on_create_tasks` call. A group is `Registered` only once the
//! plugin accepted it; any failure returns it to `Unregistered` for the next
//! sweep.
//!
//! A registration holds only for the plugin run that accepted it and for the
//! task as it was delivered. Once the owner stops or restarts, or the task is
//! replaced, the next sweep delivers it again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use super::TaskSource;
use crate::error::{HubError, HubResult};
use crate::event::{Event, EventBus, EventListener, SubscriptionId, topics};
use crate::plugin::{PluginCall, PluginManager};
use crate::registry::{CapabilityRegistry, ConditionKind};
use crate::types::{Task, TaskContext};

/// Registration progress of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRegistrationState {
    Unregistered,
    PendingRegistration,
    Registered,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks registered by this sweep
    pub registered: Vec<TaskContext>,
    /// Tasks whose delivery failed and will be retried
    pub failed: Vec<TaskContext>,
}

#[derive(Debug, Clone)]
struct Registration {
    state: TaskRegistrationState,
    /// Runtime instance that accepted the task, and the task as delivered
    accepted: Option<(u64, Task)>,
}

impl Registration {
    fn pending() -> Self {
        Self {
            state: TaskRegistrationState::PendingRegistration,
            accepted: None,
        }
    }
}

/// Delivers resolved tasks to their trigger plugins
pub struct TaskRegistrationCoordinator {
    source: Arc<dyn TaskSource>,
    registry: Arc<CapabilityRegistry>,
    plugins: Arc<PluginManager>,
    callback_timeout: Duration,
    /// Held for the whole sweep; sweeps never overlap
    sweep_lock: tokio::sync::Mutex<()>,
    /// Only mutated while `sweep_lock` is held
    states: parking_lot::Mutex<HashMap<TaskContext, Registration>>,
    wake: Notify,
}

impl TaskRegistrationCoordinator {
    pub fn new(
        source: Arc<dyn TaskSource>,
        registry: Arc<CapabilityRegistry>,
        plugins: Arc<PluginManager>,
        callback_timeout: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            plugins,
            callback_timeout,
            sweep_lock: tokio::sync::Mutex::new(()),
            states: parking_lot::Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    /// Current state of a task; unknown tasks are `Unregistered`
    pub fn state(&self, task: &TaskContext) -> TaskRegistrationState {
        self.states
            .lock()
            .get(task)
            .map(|r| r.state)
            .unwrap_or(TaskRegistrationState::Unregistered)
    }

    /// Every registered task, sorted
    pub fn registered(&self) -> Vec<TaskContext> {
        let mut tasks: Vec<_> = self
            .states
            .lock()
            .iter()
            .filter(|(_, r)| r.state == TaskRegistrationState::Registered)
            .map(|(ctx, _)| ctx.clone())
            .collect();
        tasks.sort();
        tasks
    }

    /// Ask the background loop for a sweep as soon as possible
    pub fn request_sweep(&self) {
        self.wake.notify_one();
    }

    /// Run one registration sweep
    pub async fn sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let tasks = self.source.tasks();

        let groups = {
            let mut states = self.states.lock();
            let listed: HashSet<&TaskContext> = tasks.iter().map(|t| &t.context).collect();
            states.retain(|ctx, _| listed.contains(ctx));

            let mut groups: BTreeMap<String, Vec<Task>> = BTreeMap::new();
            for task in &tasks {
                let state = match states.get(&task.context) {
                    Some(r) if r.state == TaskRegistrationState::Registered => {
                        if self.still_registered(task, r) {
                            continue;
                        }
                        tracing::debug!(task = %task.context, "Task registration lapsed");
                        TaskRegistrationState::Unregistered
                    }
                    Some(r) => r.state,
                    None => TaskRegistrationState::Unregistered,
                };
                if state != TaskRegistrationState::Unregistered {
                    continue;
                }
                states.remove(&task.context);
                if !self.is_resolved(task) {
                    continue;
                }
                let Some(owner) = self.trigger_owner(task) else {
                    tracing::debug!(task = %task.context, "Task has no trigger condition");
                    continue;
                };
                states.insert(task.context.clone(), Registration::pending());
                groups.entry(owner).or_default().push(task.clone());
            }
            groups
        };

        let mut report = SweepReport::default();
        for (plugin_id, group) in groups {
            let contexts: Vec<TaskContext> = group.iter().map(|t| t.context.clone()).collect();
            let count = contexts.len();

            let outcome = self.deliver(&plugin_id, group.clone()).await;
            let mut states = self.states.lock();
            match &outcome {
                Ok(instance) => {
                    tracing::info!(plugin_id = %plugin_id, tasks = count, "Tasks registered");
                    for task in group {
                        let registration = Registration {
                            state: TaskRegistrationState::Registered,
                            accepted: Some((*instance, task.clone())),
                        };
                        states.insert(task.context, registration);
                    }
                }
                Err(e) => {
                    tracing::warn!(plugin_id = %plugin_id, tasks = count, error = %e, "Task registration failed; will retry");
                    for ctx in &contexts {
                        states.remove(ctx);
                    }
                }
            }
            drop(states);

            match outcome {
                Ok(_) => report.registered.extend(contexts),
                Err(_) => report.failed.extend(contexts),
            }
        }
        report
    }

    /// Sweep every `interval` and whenever a sweep is requested, until
    /// `shutdown` fires
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = timer.tick() => {}
                    _ = coordinator.wake.notified() => {}
                }
                coordinator.sweep().await;
            }
            tracing::debug!("Task coordinator stopped");
        })
    }

    /// Request a sweep whenever capabilities, tasks or plugins change
    pub fn listen(self: &Arc<Self>, bus: &EventBus) -> SubscriptionId {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let listener: Arc<dyn EventListener> = Arc::new(move |_: &Event| {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.request_sweep();
            }
        });
        bus.subscribe(listener, [topics::REGISTRY, topics::TASKS, topics::PLUGINS])
    }

    /// A registration lapses when the accepting runtime is gone or no longer
    /// owns the trigger, or when the stored task changed since delivery
    fn still_registered(&self, task: &Task, registration: &Registration) -> bool {
        let Some((instance, delivered)) = &registration.accepted else {
            return false;
        };
        if delivered != task {
            return false;
        }
        self.trigger_owner(task)
            .and_then(|owner| self.plugins.get(&owner))
            .is_some_and(|runtime| runtime.is_running() && runtime.instance() == *instance)
    }

    fn is_resolved(&self, task: &Task) -> bool {
        task.dependencies().all(|class| self.registry.is_published(class))
    }

    /// Plugin owning the first trigger condition of a task
    fn trigger_owner(&self, task: &Task) -> Option<String> {
        task.conditions.iter().find_map(|condition| {
            self.registry
                .lookup_condition(&condition.class)
                .ok()
                .filter(|class| class.kind == ConditionKind::Trigger)
                .map(|class| class.context.plugin_id.clone())
        })
    }

    /// Hand tasks to a plugin; returns the instance that accepted them
    async fn deliver(&self, plugin_id: &str, tasks: Vec<Task>) -> HubResult<u64> {
        let runtime = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| HubError::NotFound(format!("plugin {}", plugin_id)))?;
        runtime
            .request(PluginCall::CreateTasks(tasks), self.callback_timeout)
            .await?;
        Ok(runtime.instance())
    }
}
