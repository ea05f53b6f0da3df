//! Identity and descriptor types shared across the runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Property values keyed by property id
pub type PropertyValues = serde_json::Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Device Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of a device: the plugin that owns it plus the plugin-local id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceContext {
    pub plugin_id: String,
    pub device_id: String,
}

impl DeviceContext {
    pub fn new(plugin_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Storage key, `plugin:device`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plugin_id, self.device_id)
    }
}

impl FromStr for DeviceContext {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((plugin, device)) if !plugin.is_empty() && !device.is_empty() => {
                Ok(Self::new(plugin, device))
            }
            _ => Err(HubError::Validation(format!("Invalid device context: '{}'", s))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability & Task Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of an action or condition class published by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyContainerClassContext {
    pub plugin_id: String,
    pub class_id: String,
}

impl PropertyContainerClassContext {
    pub fn new(plugin_id: impl Into<String>, class_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            class_id: class_id.into(),
        }
    }
}

impl fmt::Display for PropertyContainerClassContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin_id, self.class_id)
    }
}

/// Identity of a stored automation task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskContext(pub String);

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self(task_id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to a published class together with concrete property values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyContainer {
    pub class: PropertyContainerClassContext,
    #[serde(default)]
    pub values: PropertyValues,
}

impl PropertyContainer {
    pub fn new(class: PropertyContainerClassContext) -> Self {
        Self {
            class,
            values: PropertyValues::new(),
        }
    }

    /// Set a property value
    pub fn with_value(mut self, id: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(id.into(), value);
        self
    }
}

/// A stored automation rule: conditions plus the actions to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub context: TaskContext,
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<PropertyContainer>,
    #[serde(default)]
    pub actions: Vec<PropertyContainer>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            context: TaskContext::new(id),
            name: name.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: PropertyContainer) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: PropertyContainer) -> Self {
        self.actions.push(action);
        self
    }

    /// Every class this task depends on, conditions first
    pub fn dependencies(&self) -> impl Iterator<Item = &PropertyContainerClassContext> {
        self.conditions
            .iter()
            .chain(self.actions.iter())
            .map(|c| &c.class)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Persistent description of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub context: DeviceContext,
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceDescriptor {
    pub fn new(
        context: DeviceContext,
        name: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            context,
            name: name.into(),
            device_type: device_type.into(),
            tags: BTreeSet::new(),
            manufacturer: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}
