//! Built-in Actions
//!
//! Action classes published by the `hub` plugin: variable writes, event
//! publication and delays.

use std::sync::Arc;
use std::time::Duration;

use hearth_runtime::property::{PropertyKind, TypedProperty};
use hearth_runtime::{
    Action, ActionClass, ActionContext, DeviceContext, Event, EventBus, FnActionFactory,
    HubResult, PluginContext, PropertyContainerClassContext, PropertyValues,
};

use super::{PLUGIN_ID, classes};

/// Publish every built-in action class
pub fn register_builtin_actions(ctx: &PluginContext) -> HubResult<()> {
    let bus = Arc::clone(ctx.bus());
    ctx.publish_action_class(ActionClass::new(
        PropertyContainerClassContext::new(PLUGIN_ID, classes::SET_VARIABLE),
        "Set variable",
        vec![
            TypedProperty::required("device", "Device", PropertyKind::Device),
            TypedProperty::required("name", "Variable", PropertyKind::String),
            TypedProperty::required("value", "Value", PropertyKind::Any),
        ],
        Arc::new(FnActionFactory::new(move |values: &PropertyValues| {
            SetVariable::from_values(Arc::clone(&bus), values)
        })),
    ))?;

    let bus = Arc::clone(ctx.bus());
    ctx.publish_action_class(ActionClass::new(
        PropertyContainerClassContext::new(PLUGIN_ID, classes::PUBLISH_EVENT),
        "Publish event",
        vec![
            TypedProperty::required("topic", "Topic", PropertyKind::String),
            TypedProperty::required("event_id", "Event", PropertyKind::String),
            TypedProperty::optional("payload", "Payload", PropertyKind::Object),
        ],
        Arc::new(FnActionFactory::new(move |values: &PropertyValues| {
            PublishEvent::from_values(Arc::clone(&bus), values)
        })),
    ))?;

    ctx.publish_action_class(ActionClass::new(
        PropertyContainerClassContext::new(PLUGIN_ID, classes::DELAY),
        "Delay",
        vec![TypedProperty::required("seconds", "Seconds", PropertyKind::Number)],
        Arc::new(FnActionFactory::new(Delay::from_values)),
    ))?;

    tracing::debug!(plugin_id = PLUGIN_ID, "Registered built-in actions");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Set Variable
// ─────────────────────────────────────────────────────────────────────────────

/// Asks the owning plugin to change a device variable
pub struct SetVariable {
    bus: Arc<EventBus>,
    device: DeviceContext,
    name: String,
    value: serde_json::Value,
}

impl SetVariable {
    fn from_values(bus: Arc<EventBus>, values: &PropertyValues) -> anyhow::Result<Self> {
        let device = required_str(values, "device")?.parse::<DeviceContext>()?;
        Ok(Self {
            bus,
            device,
            name: required_str(values, "name")?.to_string(),
            value: values.get("value").cloned().unwrap_or_default(),
        })
    }
}

impl Action for SetVariable {
    fn start(&mut self, ctx: &ActionContext) -> anyhow::Result<()> {
        self.bus.publish(Event::variable_update_request(
            &self.device,
            &self.name,
            self.value.clone(),
        ));
        ctx.complete();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publish Event
// ─────────────────────────────────────────────────────────────────────────────

pub struct PublishEvent {
    bus: Arc<EventBus>,
    topic: String,
    event_id: String,
    payload: PropertyValues,
}

impl PublishEvent {
    fn from_values(bus: Arc<EventBus>, values: &PropertyValues) -> anyhow::Result<Self> {
        let payload = values
            .get("payload")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            bus,
            topic: required_str(values, "topic")?.to_string(),
            event_id: required_str(values, "event_id")?.to_string(),
            payload,
        })
    }
}

impl Action for PublishEvent {
    fn start(&mut self, ctx: &ActionContext) -> anyhow::Result<()> {
        self.bus.publish(Event::new(
            self.topic.clone(),
            self.event_id.clone(),
            self.payload.clone(),
        ));
        ctx.complete();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delay
// ─────────────────────────────────────────────────────────────────────────────

/// Completes after a fixed time
pub struct Delay {
    duration: Duration,
}

impl Delay {
    fn from_values(values: &PropertyValues) -> anyhow::Result<Self> {
        let seconds = values
            .get("seconds")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("missing 'seconds'"))?;
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|_| anyhow::anyhow!("invalid delay: {}", seconds))?;
        Ok(Self { duration })
    }
}

impl Action for Delay {
    fn start(&mut self, ctx: &ActionContext) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let ctx = ctx.clone();
        let duration = self.duration;
        runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            ctx.complete();
        });
        Ok(())
    }
}

fn required_str<'a>(values: &'a PropertyValues, key: &str) -> anyhow::Result<&'a str> {
    values
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing '{}'", key))
}
