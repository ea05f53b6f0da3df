// Capability Registry - Stores action and condition classes published by plugins
//
// Plugins publish the classes they provide when they start and the registry
// withdraws them when the plugin stops. The job engine resolves action classes
// here before admitting a job; the task coordinator checks condition and action
// classes here to decide whether a task is fully resolved.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::event::{Event, EventBus, event_ids, topics};
use crate::job::Action;
use crate::property::{self, TypedProperty};
use crate::types::{PropertyContainerClassContext, PropertyValues};

// ─────────────────────────────────────────────────────────────────────────────
// Action Factory Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Builds action instances from validated property values
pub trait ActionFactory: Send + Sync {
    fn create(&self, values: &PropertyValues) -> anyhow::Result<Box<dyn Action>>;
}

/// Function-based action factory
pub struct FnActionFactory<F> {
    func: F,
}

impl<F, A> FnActionFactory<F>
where
    F: Fn(&PropertyValues) -> anyhow::Result<A> + Send + Sync,
    A: Action + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, A> ActionFactory for FnActionFactory<F>
where
    F: Fn(&PropertyValues) -> anyhow::Result<A> + Send + Sync,
    A: Action + 'static,
{
    fn create(&self, values: &PropertyValues) -> anyhow::Result<Box<dyn Action>> {
        Ok(Box::new((self.func)(values)?))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classes
// ─────────────────────────────────────────────────────────────────────────────

/// An action class published by a plugin
#[derive(Clone)]
pub struct ActionClass {
    pub context: PropertyContainerClassContext,
    pub name: String,
    pub schema: Vec<TypedProperty>,
    factory: Arc<dyn ActionFactory>,
}

impl ActionClass {
    pub fn new(
        context: PropertyContainerClassContext,
        name: impl Into<String>,
        schema: Vec<TypedProperty>,
        factory: Arc<dyn ActionFactory>,
    ) -> Self {
        Self {
            context,
            name: name.into(),
            schema,
            factory,
        }
    }

    /// Validate `values` against the schema, then build an action
    pub fn instantiate(&self, values: &PropertyValues) -> HubResult<Box<dyn Action>> {
        property::validate(&self.schema, values)?;
        self.factory.create(values).map_err(|e| {
            HubError::Validation(format!("Cannot create action '{}': {}", self.context, e))
        })
    }
}

impl std::fmt::Debug for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionClass")
            .field("context", &self.context)
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Whether a condition starts a task or only narrows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Trigger,
    Filter,
}

/// A condition class published by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionClass {
    pub context: PropertyContainerClassContext,
    pub name: String,
    pub kind: ConditionKind,
    pub schema: Vec<TypedProperty>,
}

impl ConditionClass {
    pub fn trigger(context: PropertyContainerClassContext, name: impl Into<String>) -> Self {
        Self {
            context,
            name: name.into(),
            kind: ConditionKind::Trigger,
            schema: Vec::new(),
        }
    }

    pub fn filter(context: PropertyContainerClassContext, name: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Filter,
            ..Self::trigger(context, name)
        }
    }

    pub fn with_schema(mut self, schema: Vec<TypedProperty>) -> Self {
        self.schema = schema;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of every action and condition class currently published
pub struct CapabilityRegistry {
    bus: Arc<EventBus>,
    actions: RwLock<HashMap<PropertyContainerClassContext, Arc<ActionClass>>>,
    conditions: RwLock<HashMap<PropertyContainerClassContext, Arc<ConditionClass>>>,
}

impl CapabilityRegistry {
    /// Create a new empty registry publishing changes on `bus`
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            actions: RwLock::new(HashMap::new()),
            conditions: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an action class, replacing any previous class with the same context
    pub fn publish_action(&self, class: ActionClass) {
        let context = class.context.clone();
        self.actions.write().insert(context.clone(), Arc::new(class));
        tracing::debug!(class = %context, "Action class published");
        self.announce(&context, "action");
    }

    /// Publish a condition class
    pub fn publish_condition(&self, class: ConditionClass) {
        let context = class.context.clone();
        self.conditions.write().insert(context.clone(), Arc::new(class));
        tracing::debug!(class = %context, "Condition class published");
        self.announce(&context, "condition");
    }

    pub fn lookup_action(&self, context: &PropertyContainerClassContext) -> HubResult<Arc<ActionClass>> {
        self.actions
            .read()
            .get(context)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("action class {}", context)))
    }

    pub fn lookup_condition(
        &self,
        context: &PropertyContainerClassContext,
    ) -> HubResult<Arc<ConditionClass>> {
        self.conditions
            .read()
            .get(context)
            .cloned()
            .ok_or_else(|| HubError::NotFound(format!("condition class {}", context)))
    }

    /// Check if an action or condition class with this context is published
    pub fn is_published(&self, context: &PropertyContainerClassContext) -> bool {
        self.actions.read().contains_key(context) || self.conditions.read().contains_key(context)
    }

    /// All published action classes
    pub fn action_classes(&self) -> Vec<Arc<ActionClass>> {
        self.actions.read().values().cloned().collect()
    }

    /// All published condition classes
    pub fn condition_classes(&self) -> Vec<Arc<ConditionClass>> {
        self.conditions.read().values().cloned().collect()
    }

    /// Withdraw every class a plugin published. Returns how many were removed.
    pub fn unpublish_plugin(&self, plugin_id: &str) -> usize {
        let removed = {
            let mut actions = self.actions.write();
            let mut conditions = self.conditions.write();
            let before = actions.len() + conditions.len();
            actions.retain(|ctx, _| ctx.plugin_id != plugin_id);
            conditions.retain(|ctx, _| ctx.plugin_id != plugin_id);
            before - actions.len() - conditions.len()
        };

        if removed > 0 {
            tracing::debug!(plugin_id, removed, "Capabilities withdrawn");
            let mut payload = PropertyValues::new();
            payload.insert("plugin_id".into(), plugin_id.into());
            payload.insert("removed".into(), removed.into());
            self.bus.publish(Event::new(
                topics::REGISTRY,
                event_ids::CAPABILITIES_WITHDRAWN,
                payload,
            ));
        }
        removed
    }

    /// Total published classes
    pub fn len(&self) -> usize {
        self.actions.read().len() + self.conditions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn announce(&self, context: &PropertyContainerClassContext, kind: &str) {
        let mut payload = PropertyValues::new();
        payload.insert("plugin_id".into(), context.plugin_id.as_str().into());
        payload.insert("class_id".into(), context.class_id.as_str().into());
        payload.insert("kind".into(), kind.into());
        self.bus.publish(Event::new(
            topics::REGISTRY,
            event_ids::CAPABILITY_PUBLISHED,
            payload,
        ));
    }
}
