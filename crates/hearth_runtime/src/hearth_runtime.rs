//! Hearth Runtime - core of the home-automation hub
//!
//! This crate contains the event bus, plugin runtimes, the job engine,
//! task registration, device availability tracking and the device cache.

pub mod availability;
pub mod device;
pub mod error;
pub mod event;
pub mod job;
pub mod plugin;
pub mod property;
pub mod registry;
pub mod task;
pub mod types;

pub use availability::{DeviceAvailabilityMonitor, DeviceAvailabilityRecord};
pub use device::{DeviceCache, DeviceStore, InMemoryDeviceStore};
pub use error::{HubError, HubResult};
pub use event::{Event, EventBus, EventListener, HubEvent, SubscriptionId};
pub use job::{Action, ActionContext, JobConfig, JobEngine, JobHandle, JobId, JobInfo, JobStatus};
pub use plugin::{
    HubServices, Plugin, PluginContext, PluginManager, PluginRuntime, PluginSpec, PluginStatus,
    PluginTimeouts,
};
pub use registry::{ActionClass, CapabilityRegistry, ConditionClass, ConditionKind, FnActionFactory};
pub use task::{InMemoryTaskStore, TaskRegistrationCoordinator, TaskRegistrationState, TaskSource};
pub use types::*;
