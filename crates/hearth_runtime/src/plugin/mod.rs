//! Plugin Lifecycle Management
//!
//! A plugin is an independently developed device integration. The runtime
//! gives every plugin its own mailbox: all calls into plugin code run one at a
//! time, in submission order, on that plugin's task.
//!
//! # Lifecycle
//!
//! - `on_startup`: first work item; `start` returns once it ran
//! - `on_refresh`: periodically if `refresh_interval` is set
//! - `on_hub_event` and the typed update callbacks: for matching events
//! - `on_create_tasks`: when tasks triggered by this plugin are resolved
//! - `on_shutdown`: last work item

mod handle;
mod manager;
mod runtime;

pub use handle::*;
pub use manager::*;
pub use runtime::*;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::availability::DeviceAvailabilityMonitor;
use crate::device::DeviceCache;
use crate::error::{HubError, HubResult};
use crate::event::{Event, EventBus, event_ids, topics};
use crate::registry::{ActionClass, CapabilityRegistry, ConditionClass};
use crate::types::{DeviceContext, DeviceDescriptor, PropertyValues, Task};

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Unique plugin identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Interval for periodic `on_refresh` calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<Duration>,

    /// Topic patterns in addition to the global state topic
    #[serde(default)]
    pub topics: Vec<String>,
}

impl PluginSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set refresh interval; zero disables refresh
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Subscribe to an additional topic pattern
    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.topics.push(pattern.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared hub services
// ─────────────────────────────────────────────────────────────────────────────

/// Hub-wide collaborators injected into every plugin
#[derive(Clone)]
pub struct HubServices {
    pub bus: Arc<EventBus>,
    pub registry: Arc<CapabilityRegistry>,
    pub devices: Arc<DeviceCache>,
    pub availability: Arc<DeviceAvailabilityMonitor>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to every plugin callback
pub struct PluginContext {
    plugin_id: String,
    services: HubServices,
    mailbox: mpsc::UnboundedSender<WorkItem>,
    published: Arc<Mutex<BTreeSet<DeviceContext>>>,
}

impl PluginContext {
    pub(crate) fn new(
        plugin_id: String,
        services: HubServices,
        mailbox: mpsc::UnboundedSender<WorkItem>,
        published: Arc<Mutex<BTreeSet<DeviceContext>>>,
    ) -> Self {
        Self {
            plugin_id,
            services,
            mailbox,
            published,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.services.registry
    }

    pub fn devices(&self) -> &Arc<DeviceCache> {
        &self.services.devices
    }

    pub fn availability(&self) -> &Arc<DeviceAvailabilityMonitor> {
        &self.services.availability
    }

    /// Publish an event on the hub bus
    pub fn publish(&self, event: Event) -> usize {
        self.services.bus.publish(event)
    }

    /// Publish an action class owned by this plugin
    pub fn publish_action_class(&self, class: ActionClass) -> HubResult<()> {
        self.require_owned(&class.context.plugin_id, "action class")?;
        self.services.registry.publish_action(class);
        Ok(())
    }

    /// Publish a condition class owned by this plugin
    pub fn publish_condition_class(&self, class: ConditionClass) -> HubResult<()> {
        self.require_owned(&class.context.plugin_id, "condition class")?;
        self.services.registry.publish_condition(class);
        Ok(())
    }

    /// Save a device owned by this plugin, mark it alive and queue its
    /// `on_device_startup` behind the current work item.
    pub fn publish_device(&self, descriptor: DeviceDescriptor) -> HubResult<()> {
        self.require_owned(&descriptor.context.plugin_id, "device")?;
        let device = descriptor.context.clone();
        self.services.devices.save(descriptor)?;
        self.services.availability.check_in(&device, Utc::now());

        if self.published.lock().insert(device.clone()) {
            self.enqueue(PluginCall::DeviceStartup(device.clone()))?;
            self.publish(device_event(event_ids::DEVICE_STARTED, &device));
        }
        Ok(())
    }

    /// Stop a published device; queues its `on_device_shutdown`
    pub fn unpublish_device(&self, device: &DeviceContext) -> HubResult<()> {
        if !self.published.lock().remove(device) {
            return Err(HubError::NotFound(format!("device {}", device)));
        }
        self.enqueue(PluginCall::DeviceShutdown(device.clone()))?;
        self.publish(device_event(event_ids::DEVICE_STOPPED, device));
        Ok(())
    }

    /// Record that a device was heard from
    pub fn check_in(&self, device: &DeviceContext) {
        self.services.availability.check_in(device, Utc::now());
    }

    /// Devices this plugin published and has not stopped
    pub fn published_devices(&self) -> Vec<DeviceContext> {
        self.published.lock().iter().cloned().collect()
    }

    fn require_owned(&self, owner: &str, what: &str) -> HubResult<()> {
        if owner == self.plugin_id {
            Ok(())
        } else {
            Err(HubError::Validation(format!(
                "Plugin '{}' cannot publish {} owned by '{}'",
                self.plugin_id, what, owner
            )))
        }
    }

    fn enqueue(&self, call: PluginCall) -> HubResult<()> {
        self.mailbox
            .send(WorkItem { call, reply: None })
            .map_err(|_| HubError::NotRunning(self.plugin_id.clone()))
    }
}

pub(crate) fn device_event(event_id: &str, device: &DeviceContext) -> Event {
    let mut payload = PropertyValues::new();
    payload.insert("device".into(), device.key().into());
    Event::new(topics::DEVICES, event_id, payload)
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Callback surface implemented by plugin authors.
///
/// Every method runs on the plugin's mailbox, never concurrently with another
/// method of the same plugin. Errors and panics are logged by the runtime.
#[async_trait]
pub trait Plugin: Send + 'static {
    fn spec(&self) -> PluginSpec;

    /// First call after the plugin is started
    async fn on_startup(&mut self, ctx: &PluginContext, config: &PropertyValues)
    -> anyhow::Result<()>;

    /// Last call before the plugin is stopped
    async fn on_shutdown(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_refresh(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Any subscribed event without a dedicated callback
    async fn on_hub_event(&mut self, _ctx: &PluginContext, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }

    /// Configuration for this plugin changed
    async fn on_plugin_config_update(
        &mut self,
        _ctx: &PluginContext,
        _config: &PropertyValues,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Configuration for one of this plugin's devices changed
    async fn on_device_config_update(
        &mut self,
        _ctx: &PluginContext,
        _device: &DeviceContext,
        _config: &PropertyValues,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A variable on one of this plugin's devices should change
    async fn on_set_variable(
        &mut self,
        _ctx: &PluginContext,
        _device: &DeviceContext,
        _name: &str,
        _value: &serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tasks triggered by this plugin are fully resolved
    async fn on_create_tasks(&mut self, _ctx: &PluginContext, _tasks: &[Task]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_device_startup(
        &mut self,
        _ctx: &PluginContext,
        _device: &DeviceContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_device_shutdown(
        &mut self,
        _ctx: &PluginContext,
        _device: &DeviceContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Work items
// ─────────────────────────────────────────────────────────────────────────────

/// A call into plugin code, queued on the plugin's mailbox
#[derive(Debug, Clone)]
pub enum PluginCall {
    Startup(PropertyValues),
    Shutdown,
    Refresh,
    Event(Event),
    CreateTasks(Vec<Task>),
    DeviceStartup(DeviceContext),
    DeviceShutdown(DeviceContext),
}

impl PluginCall {
    pub fn name(&self) -> &'static str {
        match self {
            PluginCall::Startup(_) => "startup",
            PluginCall::Shutdown => "shutdown",
            PluginCall::Refresh => "refresh",
            PluginCall::Event(_) => "event",
            PluginCall::CreateTasks(_) => "create_tasks",
            PluginCall::DeviceStartup(_) => "device_startup",
            PluginCall::DeviceShutdown(_) => "device_shutdown",
        }
    }
}

pub(crate) struct WorkItem {
    pub call: PluginCall,
    pub reply: Option<tokio::sync::oneshot::Sender<anyhow::Result<()>>>,
}
