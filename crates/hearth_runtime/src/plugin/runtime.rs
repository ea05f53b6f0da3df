//! Plugin Runtime
//!
//! Starting, stopping and the mailbox loop that serializes every call into a
//! plugin.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    HubServices, Plugin, PluginCall, PluginContext, PluginRuntime, PluginShared, PluginStatus,
    WorkItem, device_event, handle::next_instance,
};
use crate::error::{HubError, HubResult};
use crate::event::{Event, EventListener, HubEvent, event_ids, topics};
use crate::types::PropertyValues;

/// Bounds on the start and stop handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginTimeouts {
    pub startup: Duration,
    pub shutdown: Duration,
}

impl Default for PluginTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            shutdown: Duration::from_secs(30),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Start / Stop
// ─────────────────────────────────────────────────────────────────────────────

impl PluginRuntime {
    /// Start a plugin.
    ///
    /// Returns once `on_startup` ran on the plugin's mailbox, bounded by
    /// `timeouts.startup`. If it fails the plugin is left `Failed` and its
    /// mailbox is shut down.
    pub async fn start(
        plugin: Box<dyn Plugin>,
        config: PropertyValues,
        services: HubServices,
        timeouts: PluginTimeouts,
    ) -> HubResult<Self> {
        let spec = plugin.spec();
        if spec.id.is_empty() {
            return Err(HubError::Validation("Plugin id must not be empty".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let published = Arc::new(Mutex::new(BTreeSet::new()));
        let shared = Arc::new(PluginShared {
            id: spec.id.clone(),
            instance: next_instance(),
            name: spec.name.clone(),
            status: AtomicU8::new(PluginStatus::Starting as u8),
            mailbox: tx.clone(),
            subscription: Mutex::new(None),
            refresh: Mutex::new(None),
            published: Arc::clone(&published),
            shutdown_timeout: timeouts.shutdown,
        });

        let ctx = PluginContext::new(spec.id.clone(), services.clone(), tx, published);
        tokio::spawn(run_mailbox(plugin, ctx, rx, Arc::clone(&shared)));

        let runtime = Self { shared, services };

        // Startup is queued ahead of any event the subscription delivers
        tracing::debug!(plugin_id = %spec.id, "Plugin starting");
        let startup = runtime.enqueue(PluginCall::Startup(config))?;
        runtime.subscribe(&spec.topics);

        if let Err(e) = runtime
            .await_reply("startup", startup, timeouts.startup)
            .await
        {
            tracing::error!(plugin_id = %spec.id, error = %e, "Plugin failed to start");
            runtime.shared.set_status(PluginStatus::Failed);
            runtime.unsubscribe();
            runtime.services.registry.unpublish_plugin(&spec.id);
            let _ = runtime.submit(PluginCall::Shutdown);
            return Err(e);
        }

        if !runtime
            .shared
            .transition(PluginStatus::Starting, PluginStatus::Running)
        {
            return Err(HubError::NotRunning(spec.id));
        }

        if let Some(interval) = spec.refresh_interval {
            runtime.spawn_refresh(interval);
        }

        runtime.lifecycle_event(event_ids::PLUGIN_STARTED);
        tracing::info!(plugin_id = %spec.id, name = %spec.name, "Plugin started");
        Ok(runtime)
    }

    /// Stop the plugin.
    ///
    /// Unsubscribes immediately, withdraws its capabilities, queues device
    /// shutdown for every published device and finally `on_shutdown`. Waits for
    /// the final item at most the shutdown timeout; on expiry returns
    /// [`HubError::Timeout`] while teardown carries on in the background.
    pub async fn stop(&self) -> HubResult<()> {
        let id = self.shared.id.clone();
        if !self
            .shared
            .transition(PluginStatus::Running, PluginStatus::Stopping)
            && !self
                .shared
                .transition(PluginStatus::Starting, PluginStatus::Stopping)
        {
            return Err(HubError::NotRunning(id));
        }
        tracing::debug!(plugin_id = %id, "Plugin stopping");

        self.unsubscribe();
        if let Some(refresh) = self.shared.refresh.lock().take() {
            refresh.abort();
        }
        self.services.registry.unpublish_plugin(&id);

        let devices = std::mem::take(&mut *self.shared.published.lock());
        for device in devices {
            if let Err(e) = self.submit(PluginCall::DeviceShutdown(device.clone())) {
                tracing::warn!(plugin_id = %id, device = %device, error = %e, "Device shutdown not queued");
            }
            self.services
                .bus
                .publish(device_event(event_ids::DEVICE_STOPPED, &device));
        }

        let result = self
            .request(PluginCall::Shutdown, self.shared.shutdown_timeout)
            .await;
        if matches!(result, Err(HubError::NotRunning(_))) {
            self.shared.set_status(PluginStatus::Stopped);
        }
        self.lifecycle_event(event_ids::PLUGIN_STOPPED);

        match result {
            Ok(()) => {
                tracing::info!(plugin_id = %id, "Plugin stopped");
                Ok(())
            }
            // on_shutdown failed, but the plugin is stopped regardless
            Err(HubError::Callback { .. }) => Ok(()),
            Err(HubError::NotRunning(_)) => {
                tracing::warn!(plugin_id = %id, "Plugin mailbox already closed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(plugin_id = %id, error = %e, "Plugin did not stop cleanly");
                Err(e)
            }
        }
    }

    fn subscribe(&self, extra: &[String]) {
        let shared = Arc::clone(&self.shared);
        let listener: Arc<dyn EventListener> = Arc::new(move |event: &Event| {
            if shared.status().accepts_events() {
                let _ = shared.mailbox.send(WorkItem {
                    call: PluginCall::Event(event.clone()),
                    reply: None,
                });
            }
        });

        let patterns = std::iter::once(topics::HUB_STATE.to_string()).chain(extra.iter().cloned());
        let id = self.services.bus.subscribe(listener, patterns);
        *self.shared.subscription.lock() = Some(id);
    }

    fn unsubscribe(&self) {
        if let Some(id) = self.shared.subscription.lock().take() {
            self.services.bus.unsubscribe(id);
        }
    }

    fn spawn_refresh(&self, interval: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(shared) = shared.upgrade() else { break };
                let queued = shared.mailbox.send(WorkItem {
                    call: PluginCall::Refresh,
                    reply: None,
                });
                if queued.is_err() {
                    break;
                }
            }
        });
        *self.shared.refresh.lock() = Some(handle);
    }

    fn lifecycle_event(&self, event_id: &str) {
        let mut payload = PropertyValues::new();
        payload.insert("plugin_id".into(), self.shared.id.as_str().into());
        payload.insert("status".into(), self.status().to_string().into());
        self.services
            .bus
            .publish(Event::new(topics::PLUGINS, event_id, payload));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mailbox Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_mailbox(
    mut plugin: Box<dyn Plugin>,
    ctx: PluginContext,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    shared: Arc<PluginShared>,
) {
    while let Some(WorkItem { call, reply }) = rx.recv().await {
        let name = call.name();
        let last = matches!(call, PluginCall::Shutdown);

        if matches!(call, PluginCall::Event(_)) && !shared.status().accepts_events() {
            continue;
        }

        let result = match AssertUnwindSafe(dispatch(plugin.as_mut(), &ctx, call))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref()))),
        };

        if let Err(e) = &result {
            tracing::warn!(plugin_id = %ctx.plugin_id(), call = name, error = %e, "Plugin callback failed");
        }

        if last {
            shared.transition(PluginStatus::Stopping, PluginStatus::Stopped);
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        if last {
            break;
        }
    }

    tracing::debug!(plugin_id = %ctx.plugin_id(), "Plugin mailbox closed");
}

async fn dispatch(
    plugin: &mut dyn Plugin,
    ctx: &PluginContext,
    call: PluginCall,
) -> anyhow::Result<()> {
    match call {
        PluginCall::Startup(config) => plugin.on_startup(ctx, &config).await,
        PluginCall::Shutdown => plugin.on_shutdown(ctx).await,
        PluginCall::Refresh => plugin.on_refresh(ctx).await,
        PluginCall::Event(event) => deliver(plugin, ctx, &event).await,
        PluginCall::CreateTasks(tasks) => plugin.on_create_tasks(ctx, &tasks).await,
        PluginCall::DeviceStartup(device) => plugin.on_device_startup(ctx, &device).await,
        PluginCall::DeviceShutdown(device) => plugin.on_device_shutdown(ctx, &device).await,
    }
}

/// Route an event to its typed callback. Updates addressed to another plugin
/// or another plugin's device are dropped.
async fn deliver(plugin: &mut dyn Plugin, ctx: &PluginContext, event: &Event) -> anyhow::Result<()> {
    let own = ctx.plugin_id();
    match event.kind() {
        HubEvent::PluginConfigUpdate { plugin_id, config } => {
            if plugin_id == own {
                plugin.on_plugin_config_update(ctx, &config).await
            } else {
                Ok(())
            }
        }
        HubEvent::DeviceConfigUpdate { device, config } => {
            if device.plugin_id == own {
                plugin.on_device_config_update(ctx, &device, &config).await
            } else {
                Ok(())
            }
        }
        HubEvent::VariableUpdateRequest {
            device,
            name,
            value,
        } => {
            if device.plugin_id == own {
                plugin.on_set_variable(ctx, &device, &name, &value).await
            } else {
                Ok(())
            }
        }
        _ => plugin.on_hub_event(ctx, event).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginSpec, testing};
    use crate::registry::ConditionClass;
    use crate::types::{DeviceContext, DeviceDescriptor, PropertyContainerClassContext};
    use async_trait::async_trait;
    use serde_json::json;

    const BARRIER: &str = "barrier";

    /// Logs every callback; fails on `boom` events and panics on `panic` events
    struct Recorder {
        id: String,
        log: Arc<Mutex<Vec<String>>>,
        refresh: Option<Duration>,
        fail_startup: bool,
        slow_shutdown: Option<Duration>,
    }

    impl Recorder {
        fn new(id: &str) -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    id: id.to_string(),
                    log: Arc::clone(&log),
                    refresh: None,
                    fail_startup: false,
                    slow_shutdown: None,
                },
                log,
            )
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn spec(&self) -> PluginSpec {
            let mut spec = PluginSpec::new(&self.id, "Recorder").subscribe("sensors/#");
            if let Some(interval) = self.refresh {
                spec = spec.with_refresh_interval(interval);
            }
            spec
        }

        async fn on_startup(
            &mut self,
            ctx: &PluginContext,
            config: &PropertyValues,
        ) -> anyhow::Result<()> {
            ctx.publish_condition_class(ConditionClass::trigger(
                PropertyContainerClassContext::new(&self.id, "motion"),
                "Motion",
            ))?;
            if self.fail_startup {
                anyhow::bail!("missing credentials");
            }
            self.log.lock().push(format!("startup {}", config.len()));
            Ok(())
        }

        async fn on_shutdown(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            if let Some(delay) = self.slow_shutdown {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().push("shutdown".into());
            Ok(())
        }

        async fn on_refresh(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.log.lock().push("refresh".into());
            Ok(())
        }

        async fn on_hub_event(&mut self, _ctx: &PluginContext, event: &Event) -> anyhow::Result<()> {
            match event.event_id() {
                BARRIER => Ok(()),
                "boom" => anyhow::bail!("handler error"),
                "panic" => panic!("handler bug"),
                other => {
                    self.log.lock().push(other.to_string());
                    Ok(())
                }
            }
        }

        async fn on_plugin_config_update(
            &mut self,
            _ctx: &PluginContext,
            config: &PropertyValues,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("config {}", json!(config)));
            Ok(())
        }

        async fn on_set_variable(
            &mut self,
            _ctx: &PluginContext,
            device: &DeviceContext,
            name: &str,
            value: &serde_json::Value,
        ) -> anyhow::Result<()> {
            self.log
                .lock()
                .push(format!("set {} {}={}", device.device_id, name, value));
            Ok(())
        }

        async fn on_device_startup(
            &mut self,
            _ctx: &PluginContext,
            device: &DeviceContext,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("device up {}", device.device_id));
            Ok(())
        }

        async fn on_device_shutdown(
            &mut self,
            _ctx: &PluginContext,
            device: &DeviceContext,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("device down {}", device.device_id));
            Ok(())
        }
    }

    async fn barrier(runtime: &PluginRuntime) {
        runtime
            .request(
                PluginCall::Event(Event::empty(topics::HUB_STATE, BARRIER)),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_waits_for_startup() {
        let services = testing::services();
        let (plugin, log) = Recorder::new("hue");

        let mut config = PropertyValues::new();
        config.insert("bridge".into(), json!("10.0.0.2"));
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            config,
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        assert_eq!(runtime.status(), PluginStatus::Running);
        assert_eq!(*log.lock(), vec!["startup 1"]);
        assert!(
            services
                .registry
                .is_published(&PropertyContainerClassContext::new("hue", "motion"))
        );
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let services = testing::services();
        let (plugin, log) = Recorder::new("hue");
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        for i in 0..20 {
            services
                .bus
                .publish(Event::empty("sensors/kitchen", format!("e{}", i)));
        }
        // Not subscribed
        services.bus.publish(Event::empty("other/topic", "ignored"));
        barrier(&runtime).await;

        let expected: Vec<String> = std::iter::once("startup 0".to_string())
            .chain((0..20).map(|i| format!("e{}", i)))
            .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_isolated() {
        let services = testing::services();
        let (a, log_a) = Recorder::new("a");
        let (b, log_b) = Recorder::new("b");
        let a = PluginRuntime::start(
            Box::new(a),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();
        let b = PluginRuntime::start(
            Box::new(b),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        for id in ["first", "boom", "panic", "second"] {
            services.bus.publish(Event::empty(topics::HUB_STATE, id));
        }
        barrier(&a).await;
        barrier(&b).await;

        assert_eq!(*log_a.lock(), vec!["startup 0", "first", "second"]);
        assert_eq!(*log_b.lock(), vec!["startup 0", "first", "second"]);
        assert!(a.is_running());
    }

    #[tokio::test]
    async fn test_updates_filtered_by_identity() {
        let services = testing::services();
        let (plugin, log) = Recorder::new("hue");
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        let mut config = PropertyValues::new();
        config.insert("poll".into(), json!(5));
        services
            .bus
            .publish(Event::plugin_config_update("zwave", config.clone()));
        services
            .bus
            .publish(Event::plugin_config_update("hue", config));
        services.bus.publish(Event::variable_update_request(
            &DeviceContext::new("zwave", "7"),
            "on",
            json!(true),
        ));
        services.bus.publish(Event::variable_update_request(
            &DeviceContext::new("hue", "lamp"),
            "on",
            json!(true),
        ));
        barrier(&runtime).await;

        assert_eq!(
            *log.lock(),
            vec!["startup 0", "config {\"poll\":5}", "set lamp on=true"]
        );
    }

    #[tokio::test]
    async fn test_stop_tears_down_in_order() {
        let services = testing::services();
        let (plugin, log) = Recorder::new("hue");
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        runtime
            .submit(PluginCall::DeviceStartup(DeviceContext::new("hue", "ignored")))
            .unwrap();
        runtime.shared.published.lock().insert(DeviceContext::new("hue", "lamp"));

        runtime.stop().await.unwrap();
        assert_eq!(runtime.status(), PluginStatus::Stopped);
        assert!(services.registry.is_empty());

        // Events after stop are dropped and the mailbox is gone
        services.bus.publish(Event::empty(topics::HUB_STATE, "late"));
        assert!(runtime.submit(PluginCall::Refresh).is_err());
        assert!(matches!(runtime.stop().await, Err(HubError::NotRunning(_))));

        assert_eq!(
            *log.lock(),
            vec![
                "startup 0",
                "device up ignored",
                "device down lamp",
                "shutdown"
            ]
        );
    }

    #[tokio::test]
    async fn test_published_device_lifecycle() {
        let services = testing::services();
        let (plugin, log) = Recorder::new("hue");
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = PluginContext::new(
            "hue".into(),
            services.clone(),
            tx,
            Arc::clone(&runtime.shared.published),
        );
        ctx.publish_device(DeviceDescriptor::new(
            DeviceContext::new("hue", "lamp"),
            "Lamp",
            "light",
        ))
        .unwrap();
        assert_eq!(runtime.published_devices(), vec![DeviceContext::new("hue", "lamp")]);

        runtime.stop().await.unwrap();
        assert!(log.lock().contains(&"device down lamp".to_string()));
        assert!(runtime.published_devices().is_empty());
    }

    #[tokio::test]
    async fn test_failed_startup() {
        let services = testing::services();
        let (mut plugin, log) = Recorder::new("hue");
        plugin.fail_startup = true;

        let result = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await;

        assert!(matches!(result, Err(HubError::Callback { .. })));
        assert_eq!(services.bus.stats().subscriptions, 0);
        assert!(log.lock().iter().all(|l| !l.starts_with("startup")));

        // Classes published before the failure are withdrawn
        assert!(
            !services
                .registry
                .is_published(&PropertyContainerClassContext::new("hue", "motion"))
        );
        assert!(services.registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_runs_before_first_event() {
        let services = testing::services();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let bus = Arc::clone(&services.bus);
        let stop = Arc::clone(&done);
        let publisher = tokio::spawn(async move {
            while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                bus.publish(Event::empty("sensors/hall", "motion"));
                tokio::task::yield_now().await;
            }
        });

        let (plugin, log) = Recorder::new("hue");
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        publisher.await.unwrap();
        barrier(&runtime).await;

        assert_eq!(log.lock()[0], "startup 0");
    }

    #[tokio::test]
    async fn test_stop_continues_after_mailbox_closed() {
        let services = testing::services();
        let (plugin, log) = Recorder::new("hue");
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services.clone(),
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        // A shutdown queued behind the runtime's back ends the mailbox loop
        runtime.request(PluginCall::Shutdown, Duration::from_secs(5)).await.unwrap();
        assert!(runtime.submit(PluginCall::Refresh).is_err());
        runtime.shared.published.lock().insert(DeviceContext::new("hue", "lamp"));

        runtime.stop().await.unwrap();
        assert_eq!(runtime.status(), PluginStatus::Stopped);
        assert_eq!(services.bus.stats().subscriptions, 0);
        assert!(services.registry.is_empty());
        assert!(runtime.published_devices().is_empty());
        assert_eq!(*log.lock(), vec!["startup 0", "shutdown"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_runs_on_interval() {
        let services = testing::services();
        let (mut plugin, log) = Recorder::new("hue");
        plugin.refresh = Some(Duration::from_secs(10));
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services,
            PluginTimeouts::default(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        barrier(&runtime).await;
        let refreshes = log.lock().iter().filter(|l| *l == "refresh").count();
        assert_eq!(refreshes, 2);

        runtime.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let refreshes = log.lock().iter().filter(|l| *l == "refresh").count();
        assert_eq!(refreshes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_does_not_abort_teardown() {
        let services = testing::services();
        let (mut plugin, log) = Recorder::new("hue");
        plugin.slow_shutdown = Some(Duration::from_secs(60));
        let runtime = PluginRuntime::start(
            Box::new(plugin),
            PropertyValues::new(),
            services,
            PluginTimeouts {
                startup: Duration::from_secs(5),
                shutdown: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

        assert!(matches!(runtime.stop().await, Err(HubError::Timeout(_))));
        assert_eq!(runtime.status(), PluginStatus::Stopping);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runtime.status(), PluginStatus::Stopped);
        assert_eq!(log.lock().last().map(String::as_str), Some("shutdown"));
    }
}
