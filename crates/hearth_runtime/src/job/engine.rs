//! Job Engine
//!
//! Turns action requests into admitted, running jobs. Every request is
//! resolved and validated against the capability registry before a job exists;
//! admission then goes through the shared [`JobWindow`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{CompositeAction, Job, JobAction, JobHandle, JobId, JobInfo, JobWindow};
use crate::error::{HubError, HubResult};
use crate::registry::CapabilityRegistry;
use crate::types::PropertyContainer;

/// Job engine limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Admission window length
    pub window: Duration,
    /// Non-terminal jobs allowed within the window
    pub max_active: usize,
    /// Timeout applied to every job
    pub default_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_active: 25,
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Rate-limited, timeout-bounded action execution
pub struct JobEngine {
    registry: Arc<CapabilityRegistry>,
    config: JobConfig,
    window: Mutex<JobWindow>,
    jobs: DashMap<JobId, JobHandle>,
}

impl JobEngine {
    /// Create a new job engine resolving actions through `registry`
    pub fn new(registry: Arc<CapabilityRegistry>, config: JobConfig) -> Self {
        Self {
            registry,
            window: Mutex::new(JobWindow::new(config.window, config.max_active)),
            config,
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run a single action now
    pub fn execute_action(&self, spec: &PropertyContainer) -> HubResult<JobHandle> {
        self.execute_action_at(spec, Utc::now())
    }

    /// Run a single action as if requested at `created_at`
    pub fn execute_action_at(
        &self,
        spec: &PropertyContainer,
        created_at: DateTime<Utc>,
    ) -> HubResult<JobHandle> {
        let action = self.instantiate(spec)?;
        self.submit(JobAction::Single(action), spec.class.to_string(), created_at)
    }

    /// Run several actions in order as one job
    pub fn execute_action_set(&self, specs: &[PropertyContainer]) -> HubResult<JobHandle> {
        self.execute_action_set_at(specs, Utc::now())
    }

    /// Run several actions in order as one job requested at `created_at`
    pub fn execute_action_set_at(
        &self,
        specs: &[PropertyContainer],
        created_at: DateTime<Utc>,
    ) -> HubResult<JobHandle> {
        if specs.is_empty() {
            return Err(HubError::Validation("Action set is empty".into()));
        }

        let children = specs
            .iter()
            .map(|spec| self.instantiate(spec))
            .collect::<HubResult<Vec<_>>>()?;
        let description = specs
            .iter()
            .map(|s| s.class.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        self.submit(
            JobAction::Composite(CompositeAction::new(children)),
            format!("[{}]", description),
            created_at,
        )
    }

    /// Observability snapshot of a job still held in the window
    pub fn job_info(&self, id: JobId) -> Option<JobInfo> {
        self.jobs.get(&id).map(|job| job.info())
    }

    /// Handle to a job still held in the window
    pub fn job(&self, id: JobId) -> Option<JobHandle> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    /// Total window entries, terminal or not
    pub fn job_count(&self) -> usize {
        self.window.lock().len()
    }

    /// Window entries that have not reached a terminal status
    pub fn active_count(&self) -> usize {
        self.window.lock().active()
    }

    /// Snapshots of every job held in the window, oldest first
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.iter().map(|e| e.value().info()).collect();
        jobs.sort_by_key(|info| info.created_at);
        jobs
    }

    fn instantiate(&self, spec: &PropertyContainer) -> HubResult<Box<dyn super::Action>> {
        let class = self.registry.lookup_action(&spec.class)?;
        class.instantiate(&spec.values)
    }

    fn submit(
        &self,
        action: JobAction,
        description: String,
        created_at: DateTime<Utc>,
    ) -> HubResult<JobHandle> {
        let job = Job::new(action, description, created_at, self.config.default_timeout);
        let handle = job.handle();

        let (purged, admitted) = self.window.lock().admit(&handle);
        for id in purged {
            self.jobs.remove(&id);
        }
        if let Err(e) = admitted {
            tracing::warn!(error = %e, "Job rejected");
            return Err(e);
        }

        self.jobs.insert(handle.id(), handle.clone());
        tracing::info!(job_id = %handle.id(), steps = handle.info().steps, "Job admitted");
        Ok(job.start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::job::{Action, ActionContext, JobFailure, JobStatus};
    use crate::property::{PropertyKind, TypedProperty};
    use crate::registry::{ActionClass, FnActionFactory};
    use crate::types::{PropertyContainerClassContext, PropertyValues};
    use serde_json::json;

    /// Completes synchronously and records its label
    struct Record {
        label: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Action for Record {
        fn start(&mut self, ctx: &ActionContext) -> anyhow::Result<()> {
            self.log.lock().push(self.label.clone());
            ctx.complete();
            Ok(())
        }
    }

    /// Hands its context to the test for later completion
    struct Deferred {
        contexts: Arc<Mutex<Vec<ActionContext>>>,
    }

    impl Action for Deferred {
        fn start(&mut self, ctx: &ActionContext) -> anyhow::Result<()> {
            self.contexts.lock().push(ctx.clone());
            Ok(())
        }
    }

    struct Fixture {
        engine: JobEngine,
        log: Arc<Mutex<Vec<String>>>,
        contexts: Arc<Mutex<Vec<ActionContext>>>,
    }

    fn fixture(config: JobConfig) -> Fixture {
        let registry = Arc::new(CapabilityRegistry::new(Arc::new(EventBus::new())));
        let log = Arc::new(Mutex::new(Vec::new()));
        let contexts = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&log);
        registry.publish_action(ActionClass::new(
            PropertyContainerClassContext::new("test", "record"),
            "Record",
            vec![TypedProperty::required("label", "Label", PropertyKind::String)],
            Arc::new(FnActionFactory::new(move |values: &PropertyValues| {
                Ok(Record {
                    label: values
                        .get("label")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    log: Arc::clone(&sink),
                })
            })),
        ));

        let handed = Arc::clone(&contexts);
        registry.publish_action(ActionClass::new(
            PropertyContainerClassContext::new("test", "deferred"),
            "Deferred",
            Vec::new(),
            Arc::new(FnActionFactory::new(move |_: &PropertyValues| {
                Ok(Deferred {
                    contexts: Arc::clone(&handed),
                })
            })),
        ));

        Fixture {
            engine: JobEngine::new(registry, config),
            log,
            contexts,
        }
    }

    fn record(label: &str) -> PropertyContainer {
        PropertyContainer::new(PropertyContainerClassContext::new("test", "record"))
            .with_value("label", json!(label))
    }

    fn deferred() -> PropertyContainer {
        PropertyContainer::new(PropertyContainerClassContext::new("test", "deferred"))
    }

    #[tokio::test]
    async fn test_sync_action_set_completes_in_order() {
        let f = fixture(JobConfig::default());
        let job = f
            .engine
            .execute_action_set(&[record("one"), record("two"), record("three")])
            .unwrap();

        assert!(job.is_complete());
        assert!(!job.is_in_progress());
        assert_eq!(*f.log.lock(), vec!["one", "two", "three"]);

        let info = f.engine.job_info(job.id()).unwrap();
        assert_eq!(info.status, JobStatus::Complete);
        assert_eq!(info.steps, 3);
    }

    #[tokio::test]
    async fn test_async_children_need_one_completion_each() {
        let f = fixture(JobConfig::default());
        let job = f
            .engine
            .execute_action_set(&[deferred(), deferred(), deferred()])
            .unwrap();
        assert!(job.is_in_progress());

        for k in 0..3 {
            assert_eq!(f.contexts.lock().len(), k + 1);
            let ctx = f.contexts.lock()[k].clone();
            ctx.complete();
            if k < 2 {
                tokio::time::timeout(Duration::from_secs(5), async {
                    while f.contexts.lock().len() < k + 2 {
                        tokio::task::yield_now().await;
                    }
                })
                .await
                .unwrap();
                assert!(!job.is_complete());
            }
        }

        assert_eq!(job.wait().await, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_mixed_sync_and_async_children() {
        let f = fixture(JobConfig::default());
        let job = f
            .engine
            .execute_action_set(&[record("a"), deferred(), record("b")])
            .unwrap();

        // "a" ran synchronously, the deferred child holds the cursor
        assert_eq!(*f.log.lock(), vec!["a"]);
        assert_eq!(job.info().step, 1);

        let ctx = f.contexts.lock()[0].clone();
        ctx.complete();
        assert_eq!(job.wait().await, JobStatus::Complete);
        assert_eq!(*f.log.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_admission_window_max_active_two() {
        let f = fixture(JobConfig {
            window: Duration::from_secs(60),
            max_active: 2,
            default_timeout: Duration::from_secs(300),
        });
        let t = Utc::now();

        let first = f.engine.execute_action_at(&deferred(), t).unwrap();
        let _second = f.engine.execute_action_at(&deferred(), t).unwrap();
        assert_eq!(f.engine.job_count(), 2);

        let third = f.engine.execute_action_at(&deferred(), t);
        assert!(matches!(
            third,
            Err(HubError::AdmissionRejected {
                active: 2,
                max_active: 2
            })
        ));
        assert_eq!(f.engine.job_count(), 2);

        // Completing one frees a slot; the entry itself stays
        let ctx = f.contexts.lock()[0].clone();
        ctx.complete();
        assert_eq!(first.wait().await, JobStatus::Complete);

        let fourth = f.engine.execute_action_at(&deferred(), t).unwrap();
        assert!(fourth.is_in_progress());
        assert_eq!(f.engine.job_count(), 3);
        assert_eq!(f.engine.active_count(), 2);
        assert!(f.engine.execute_action_at(&deferred(), t).is_err());

        // A job created an hour later purges every earlier entry
        let later = t + chrono::Duration::hours(1);
        f.engine.execute_action_at(&deferred(), later).unwrap();
        assert_eq!(f.engine.job_count(), 1);
        assert!(f.engine.job_info(first.id()).is_none());
    }

    #[tokio::test]
    async fn test_validation_before_job_exists() {
        let f = fixture(JobConfig::default());

        let missing_label =
            PropertyContainer::new(PropertyContainerClassContext::new("test", "record"));
        assert!(matches!(
            f.engine.execute_action(&missing_label),
            Err(HubError::Validation(_))
        ));

        let unknown = PropertyContainer::new(PropertyContainerClassContext::new("test", "nope"));
        assert!(matches!(
            f.engine.execute_action_set(&[record("x"), unknown]),
            Err(HubError::NotFound(_))
        ));

        assert!(matches!(
            f.engine.execute_action_set(&[]),
            Err(HubError::Validation(_))
        ));

        assert_eq!(f.engine.job_count(), 0);
        assert!(f.log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recorded_on_job() {
        let f = fixture(JobConfig {
            default_timeout: Duration::from_secs(10),
            ..JobConfig::default()
        });
        let job = f
            .engine
            .execute_action_set(&[record("done"), deferred(), record("never")])
            .unwrap();

        assert_eq!(job.wait().await, JobStatus::Failed(JobFailure::Timeout));
        let info = f.engine.job_info(job.id()).unwrap();
        assert_eq!(info.status, JobStatus::Failed(JobFailure::Timeout));

        // Completed children are not rolled back; later ones never start
        assert_eq!(*f.log.lock(), vec!["done"]);
        let ctx = f.contexts.lock()[0].clone();
        assert!(!ctx.complete());
        tokio_test::assert_ok!(f.engine.execute_action(&record("after")));
    }

    #[tokio::test]
    async fn test_backdated_job_times_out_at_once() {
        let f = fixture(JobConfig {
            default_timeout: Duration::from_secs(10),
            ..JobConfig::default()
        });
        let job = f
            .engine
            .execute_action_at(&deferred(), Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        assert_eq!(job.status(), JobStatus::Failed(JobFailure::Timeout));
        assert!(f.contexts.lock().is_empty());
        assert_eq!(f.engine.active_count(), 0);
    }
}
