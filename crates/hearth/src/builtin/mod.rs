//! Built-in `hub` plugin
//!
//! Publishes the hub's own capabilities and runs tasks triggered by hub
//! state and device availability.

mod actions;

pub use actions::*;

use std::sync::Arc;

use async_trait::async_trait;

use hearth_runtime::event::topics;
use hearth_runtime::property::{PropertyKind, TypedProperty};
use hearth_runtime::task::fire_task;
use hearth_runtime::{
    ConditionClass, DeviceContext, Event, HubEvent, JobEngine, Plugin, PluginContext, PluginSpec,
    PropertyContainer, PropertyContainerClassContext, PropertyValues, Task,
};

/// Plugin id of the built-in plugin
pub const PLUGIN_ID: &str = "hub";

/// Class ids published by the built-in plugin
pub mod classes {
    pub const SET_VARIABLE: &str = "set-variable";
    pub const PUBLISH_EVENT: &str = "publish-event";
    pub const DELAY: &str = "delay";
    /// Trigger: the hub finished starting
    pub const HUB_STARTED: &str = "hub-started";
    /// Trigger: a device (optionally a specific one) went silent
    pub const DEVICE_UNAVAILABLE: &str = "device-unavailable";
    /// Filter: a device is currently available
    pub const DEVICE_AVAILABLE: &str = "device-available";
}

/// The hub's own plugin
pub struct HubPlugin {
    engine: Arc<JobEngine>,
    tasks: Vec<Task>,
}

impl HubPlugin {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self {
            engine,
            tasks: Vec::new(),
        }
    }

    /// Fire every registered task whose trigger matches
    fn fire_matching(&self, ctx: &PluginContext, matches: impl Fn(&PropertyContainer) -> bool) {
        for task in &self.tasks {
            let Some(trigger) = trigger_of(task) else {
                continue;
            };
            if !matches(trigger) || !filters_hold(ctx, task) {
                continue;
            }
            if let Err(e) = fire_task(task, &self.engine) {
                tracing::warn!(task = %task.context, error = %e, "Task not fired");
            }
        }
    }
}

#[async_trait]
impl Plugin for HubPlugin {
    fn spec(&self) -> PluginSpec {
        PluginSpec::new(PLUGIN_ID, "Hub").subscribe(topics::DEVICES)
    }

    async fn on_startup(&mut self, ctx: &PluginContext, _config: &PropertyValues) -> anyhow::Result<()> {
        register_builtin_actions(ctx)?;

        let device = TypedProperty::optional("device", "Device", PropertyKind::Device);
        ctx.publish_condition_class(ConditionClass::trigger(
            PropertyContainerClassContext::new(PLUGIN_ID, classes::HUB_STARTED),
            "Hub started",
        ))?;
        ctx.publish_condition_class(
            ConditionClass::trigger(
                PropertyContainerClassContext::new(PLUGIN_ID, classes::DEVICE_UNAVAILABLE),
                "Device unavailable",
            )
            .with_schema(vec![device]),
        )?;
        ctx.publish_condition_class(
            ConditionClass::filter(
                PropertyContainerClassContext::new(PLUGIN_ID, classes::DEVICE_AVAILABLE),
                "Device available",
            )
            .with_schema(vec![TypedProperty::required("device", "Device", PropertyKind::Device)]),
        )?;
        Ok(())
    }

    async fn on_create_tasks(&mut self, _ctx: &PluginContext, tasks: &[Task]) -> anyhow::Result<()> {
        for task in tasks {
            self.tasks.retain(|t| t.context != task.context);
            self.tasks.push(task.clone());
        }
        tracing::info!(plugin_id = PLUGIN_ID, tasks = self.tasks.len(), "Hub tasks updated");
        Ok(())
    }

    async fn on_hub_event(&mut self, ctx: &PluginContext, event: &Event) -> anyhow::Result<()> {
        match event.kind() {
            HubEvent::HubStateChanged { state } if state == "started" => {
                self.fire_matching(ctx, |trigger| trigger.class.class_id == classes::HUB_STARTED);
            }
            HubEvent::DeviceUnavailable { device } => {
                self.fire_matching(ctx, |trigger| {
                    trigger.class.class_id == classes::DEVICE_UNAVAILABLE
                        && device_value(trigger).is_none_or(|d| d == device)
                });
            }
            _ => {}
        }
        Ok(())
    }
}

/// The first condition of a task that is one of our triggers
fn trigger_of(task: &Task) -> Option<&PropertyContainer> {
    task.conditions.iter().find(|c| {
        c.class.plugin_id == PLUGIN_ID
            && matches!(
                c.class.class_id.as_str(),
                classes::HUB_STARTED | classes::DEVICE_UNAVAILABLE
            )
    })
}

/// Evaluate the task's hub filters. Filters owned by other plugins hold.
fn filters_hold(ctx: &PluginContext, task: &Task) -> bool {
    task.conditions
        .iter()
        .filter(|c| c.class.plugin_id == PLUGIN_ID && c.class.class_id == classes::DEVICE_AVAILABLE)
        .all(|c| device_value(c).is_some_and(|d| ctx.availability().is_available(&d)))
}

fn device_value(container: &PropertyContainer) -> Option<DeviceContext> {
    container
        .values
        .get("device")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hearth_runtime::event::event_ids;
    use hearth_runtime::{
        CapabilityRegistry, DeviceAvailabilityMonitor, DeviceCache, EventBus, EventListener,
        HubServices, InMemoryDeviceStore, JobConfig, PluginManager, PluginTimeouts,
    };
    use parking_lot::Mutex;

    fn services() -> HubServices {
        let bus = Arc::new(EventBus::new());
        HubServices {
            registry: Arc::new(CapabilityRegistry::new(Arc::clone(&bus))),
            devices: Arc::new(DeviceCache::open(Arc::new(InMemoryDeviceStore::new()), 16).unwrap()),
            availability: Arc::new(DeviceAvailabilityMonitor::new(
                Arc::clone(&bus),
                Duration::from_secs(60),
            )),
            bus,
        }
    }

    fn set_variable(device: &str, value: serde_json::Value) -> PropertyContainer {
        PropertyContainer::new(PropertyContainerClassContext::new(PLUGIN_ID, classes::SET_VARIABLE))
            .with_value("device", device.into())
            .with_value("name", "power".into())
            .with_value("value", value)
    }

    fn condition(class_id: &str) -> PropertyContainer {
        PropertyContainer::new(PropertyContainerClassContext::new(PLUGIN_ID, class_id))
    }

    fn record_variable_requests(bus: &EventBus) -> Arc<Mutex<Vec<serde_json::Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn EventListener> = Arc::new(move |e: &Event| {
            if e.event_id() == event_ids::VARIABLE_UPDATE_REQUEST {
                sink.lock().push(e.get("value").cloned().unwrap_or_default());
            }
        });
        bus.subscribe(listener, [topics::HUB_STATE]);
        seen
    }

    #[tokio::test]
    async fn test_publishes_capabilities() {
        let services = services();
        let engine = Arc::new(JobEngine::new(Arc::clone(&services.registry), JobConfig::default()));
        let manager = PluginManager::new(services.clone(), PluginTimeouts::default());
        manager
            .start_plugin(HubPlugin::new(engine), PropertyValues::new())
            .await
            .unwrap();

        for class in [classes::SET_VARIABLE, classes::PUBLISH_EVENT, classes::DELAY] {
            assert!(services
                .registry
                .lookup_action(&PropertyContainerClassContext::new(PLUGIN_ID, class))
                .is_ok());
        }
        assert!(services.registry.is_published(&PropertyContainerClassContext::new(
            PLUGIN_ID,
            classes::DEVICE_UNAVAILABLE
        )));
    }

    #[tokio::test]
    async fn test_set_variable_action() {
        let services = services();
        let requests = record_variable_requests(&services.bus);
        let engine = Arc::new(JobEngine::new(Arc::clone(&services.registry), JobConfig::default()));
        let manager = PluginManager::new(services.clone(), PluginTimeouts::default());
        manager
            .start_plugin(HubPlugin::new(Arc::clone(&engine)), PropertyValues::new())
            .await
            .unwrap();

        let job = engine
            .execute_action(&set_variable("hue:lamp-1", serde_json::json!(true)))
            .unwrap();
        assert!(job.is_complete());
        assert_eq!(*requests.lock(), vec![serde_json::json!(true)]);

        // Malformed device reference is rejected before any job exists
        assert!(engine.execute_action(&set_variable("lamp", serde_json::json!(1))).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_completes_later() {
        let services = services();
        let engine = Arc::new(JobEngine::new(Arc::clone(&services.registry), JobConfig::default()));
        let manager = PluginManager::new(services.clone(), PluginTimeouts::default());
        manager
            .start_plugin(HubPlugin::new(Arc::clone(&engine)), PropertyValues::new())
            .await
            .unwrap();

        let delay = PropertyContainer::new(PropertyContainerClassContext::new(PLUGIN_ID, classes::DELAY))
            .with_value("seconds", serde_json::json!(2));
        let job = engine.execute_action(&delay).unwrap();
        assert!(job.is_in_progress());

        let status = job.wait().await;
        assert!(status.is_terminal());
        assert!(job.is_complete());
    }

    #[tokio::test]
    async fn test_fires_tasks_on_matching_trigger() {
        let services = services();
        let requests = record_variable_requests(&services.bus);
        let engine = Arc::new(JobEngine::new(Arc::clone(&services.registry), JobConfig::default()));
        let manager = PluginManager::new(services.clone(), PluginTimeouts::default());
        let runtime = manager
            .start_plugin(HubPlugin::new(Arc::clone(&engine)), PropertyValues::new())
            .await
            .unwrap();

        let on_start = Task::new("on-start", "Lights on at boot")
            .with_condition(condition(classes::HUB_STARTED))
            .with_action(set_variable("hue:lamp-1", serde_json::json!("boot")));
        let on_silence = Task::new("on-silence", "Alarm when sensor drops")
            .with_condition(
                condition(classes::DEVICE_UNAVAILABLE).with_value("device", "zwave:door".into()),
            )
            .with_action(set_variable("hue:lamp-1", serde_json::json!("silence")));
        runtime
            .request(
                hearth_runtime::plugin::PluginCall::CreateTasks(vec![on_start, on_silence]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        services.bus.publish(Event::hub_state_changed("started"));
        services
            .bus
            .publish(Event::device_unavailable(&DeviceContext::new("zwave", "other"), chrono::Utc::now()));
        services
            .bus
            .publish(Event::device_unavailable(&DeviceContext::new("zwave", "door"), chrono::Utc::now()));

        // Events are queued behind each other on the mailbox; a request
        // queued after them returns once they ran.
        runtime
            .request(hearth_runtime::plugin::PluginCall::Refresh, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            *requests.lock(),
            vec![serde_json::json!("boot"), serde_json::json!("silence")]
        );
    }

    #[tokio::test]
    async fn test_availability_filter() {
        let services = services();
        let requests = record_variable_requests(&services.bus);
        let engine = Arc::new(JobEngine::new(Arc::clone(&services.registry), JobConfig::default()));
        let manager = PluginManager::new(services.clone(), PluginTimeouts::default());
        let runtime = manager
            .start_plugin(HubPlugin::new(Arc::clone(&engine)), PropertyValues::new())
            .await
            .unwrap();

        let task = Task::new("guarded", "Only while hub sensor is up")
            .with_condition(condition(classes::HUB_STARTED))
            .with_condition(
                condition(classes::DEVICE_AVAILABLE).with_value("device", "zwave:hall".into()),
            )
            .with_action(set_variable("hue:lamp-1", serde_json::json!(1)));
        runtime
            .request(
                hearth_runtime::plugin::PluginCall::CreateTasks(vec![task]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        // Never checked in: filter does not hold
        services.bus.publish(Event::hub_state_changed("started"));
        runtime
            .request(hearth_runtime::plugin::PluginCall::Refresh, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(requests.lock().is_empty());

        services
            .availability
            .check_in(&DeviceContext::new("zwave", "hall"), chrono::Utc::now());
        services.bus.publish(Event::hub_state_changed("started"));
        runtime
            .request(hearth_runtime::plugin::PluginCall::Refresh, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(requests.lock().len(), 1);
    }
}
