//! Hub Events
//!
//! Events are the primary communication mechanism between plugins and the
//! runtime. An [`Event`] is immutable once built; its `event_id` names the
//! kind of event so dispatchers can decode it into a [`HubEvent`] without
//! inspecting the payload shape first.

mod bus;

pub use bus::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceContext, PropertyValues};

/// Well-known topics
pub mod topics {
    /// Global state topic every plugin is implicitly subscribed to
    pub const HUB_STATE: &str = "hub/state";
    /// Device lifecycle and availability
    pub const DEVICES: &str = "hub/devices";
    /// Plugin lifecycle
    pub const PLUGINS: &str = "hub/plugins";
    /// Task store changes
    pub const TASKS: &str = "hub/tasks";
    /// Capability publication
    pub const REGISTRY: &str = "hub/registry";
}

/// Well-known event ids
pub mod event_ids {
    pub const PLUGIN_CONFIG_UPDATE: &str = "pluginConfigUpdate";
    pub const DEVICE_CONFIG_UPDATE: &str = "deviceConfigUpdate";
    pub const VARIABLE_UPDATE_REQUEST: &str = "variableUpdateRequest";
    pub const DEVICE_UNAVAILABLE: &str = "deviceUnavailable";
    pub const DEVICE_AVAILABLE: &str = "deviceAvailable";
    pub const DEVICE_STARTED: &str = "deviceStarted";
    pub const DEVICE_STOPPED: &str = "deviceStopped";
    pub const PLUGIN_STARTED: &str = "pluginStarted";
    pub const PLUGIN_STOPPED: &str = "pluginStopped";
    pub const TASKS_CHANGED: &str = "tasksChanged";
    pub const CAPABILITY_PUBLISHED: &str = "capabilityPublished";
    pub const CAPABILITIES_WITHDRAWN: &str = "capabilitiesWithdrawn";
    pub const HUB_STARTED: &str = "hubStarted";
    pub const HUB_STOPPING: &str = "hubStopping";
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// An immutable event routed by the [`EventBus`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    topic: String,
    event_id: String,
    timestamp: DateTime<Utc>,
    payload: PropertyValues,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(topic: impl Into<String>, event_id: impl Into<String>, payload: PropertyValues) -> Self {
        Self::at(topic, event_id, payload, Utc::now())
    }

    /// Create a new event with an explicit timestamp
    pub fn at(
        topic: impl Into<String>,
        event_id: impl Into<String>,
        payload: PropertyValues,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_id: event_id.into(),
            timestamp,
            payload,
        }
    }

    /// Create an event with no payload
    pub fn empty(topic: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self::new(topic, event_id, PropertyValues::new())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &PropertyValues {
        &self.payload
    }

    /// Get a field from the payload
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// Get a string field from the payload
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Get a number field from the payload
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }

    /// Get a boolean field from the payload
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(|v| v.as_bool())
    }

    /// Deserialize the payload to a specific type
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    // ── Typed constructors ──────────────────────────────────────────────────

    pub fn plugin_config_update(plugin_id: &str, config: PropertyValues) -> Self {
        let mut payload = PropertyValues::new();
        payload.insert("plugin_id".into(), plugin_id.into());
        payload.insert("config".into(), serde_json::Value::Object(config));
        Self::new(topics::HUB_STATE, event_ids::PLUGIN_CONFIG_UPDATE, payload)
    }

    pub fn device_config_update(device: &DeviceContext, config: PropertyValues) -> Self {
        let mut payload = device_payload(device);
        payload.insert("config".into(), serde_json::Value::Object(config));
        Self::new(topics::HUB_STATE, event_ids::DEVICE_CONFIG_UPDATE, payload)
    }

    pub fn variable_update_request(
        device: &DeviceContext,
        name: &str,
        value: serde_json::Value,
    ) -> Self {
        let mut payload = device_payload(device);
        payload.insert("name".into(), name.into());
        payload.insert("value".into(), value);
        Self::new(topics::HUB_STATE, event_ids::VARIABLE_UPDATE_REQUEST, payload)
    }

    pub fn device_unavailable(device: &DeviceContext, at: DateTime<Utc>) -> Self {
        Self::at(
            topics::DEVICES,
            event_ids::DEVICE_UNAVAILABLE,
            device_payload(device),
            at,
        )
    }

    pub fn device_available(device: &DeviceContext, at: DateTime<Utc>) -> Self {
        Self::at(
            topics::DEVICES,
            event_ids::DEVICE_AVAILABLE,
            device_payload(device),
            at,
        )
    }

    pub fn hub_state_changed(state: &str) -> Self {
        let mut payload = PropertyValues::new();
        payload.insert("state".into(), state.into());
        let event_id = match state {
            "stopping" => event_ids::HUB_STOPPING,
            _ => event_ids::HUB_STARTED,
        };
        Self::new(topics::HUB_STATE, event_id, payload)
    }

    /// Decode this event into its typed form
    pub fn kind(&self) -> HubEvent {
        match self.event_id.as_str() {
            event_ids::PLUGIN_CONFIG_UPDATE => match (self.get_str("plugin_id"), self.config()) {
                (Some(plugin_id), Some(config)) => HubEvent::PluginConfigUpdate {
                    plugin_id: plugin_id.to_string(),
                    config,
                },
                _ => HubEvent::Other,
            },
            event_ids::DEVICE_CONFIG_UPDATE => match (self.device(), self.config()) {
                (Some(device), Some(config)) => HubEvent::DeviceConfigUpdate { device, config },
                _ => HubEvent::Other,
            },
            event_ids::VARIABLE_UPDATE_REQUEST => {
                match (self.device(), self.get_str("name"), self.get("value")) {
                    (Some(device), Some(name), Some(value)) => HubEvent::VariableUpdateRequest {
                        device,
                        name: name.to_string(),
                        value: value.clone(),
                    },
                    _ => HubEvent::Other,
                }
            }
            event_ids::DEVICE_UNAVAILABLE => match self.device() {
                Some(device) => HubEvent::DeviceUnavailable { device },
                None => HubEvent::Other,
            },
            event_ids::DEVICE_AVAILABLE => match self.device() {
                Some(device) => HubEvent::DeviceAvailable { device },
                None => HubEvent::Other,
            },
            event_ids::HUB_STARTED | event_ids::HUB_STOPPING => match self.get_str("state") {
                Some(state) => HubEvent::HubStateChanged {
                    state: state.to_string(),
                },
                None => HubEvent::Other,
            },
            _ => HubEvent::Other,
        }
    }

    fn device(&self) -> Option<DeviceContext> {
        self.get_str("device").and_then(|s| s.parse().ok())
    }

    fn config(&self) -> Option<PropertyValues> {
        self.get("config").and_then(|v| v.as_object()).cloned()
    }
}

fn device_payload(device: &DeviceContext) -> PropertyValues {
    let mut payload = PropertyValues::new();
    payload.insert("device".into(), device.key().into());
    payload
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed view
// ─────────────────────────────────────────────────────────────────────────────

/// Typed view of an [`Event`], as decoded by [`Event::kind`]
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    PluginConfigUpdate {
        plugin_id: String,
        config: PropertyValues,
    },
    DeviceConfigUpdate {
        device: DeviceContext,
        config: PropertyValues,
    },
    VariableUpdateRequest {
        device: DeviceContext,
        name: String,
        value: serde_json::Value,
    },
    DeviceUnavailable {
        device: DeviceContext,
    },
    DeviceAvailable {
        device: DeviceContext,
    },
    /// The hub started or is shutting down
    HubStateChanged {
        state: String,
    },
    /// Anything without a typed form; delivered verbatim
    Other,
}
