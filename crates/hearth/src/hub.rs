//! Hub assembly
//!
//! [`Hub`] owns every engine of the runtime and wires them together: one
//! event bus, capability registry, device cache, availability monitor, plugin
//! manager, job engine and task coordinator per process.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hearth_runtime::device::DeviceStore;
use hearth_runtime::{
    CapabilityRegistry, DeviceAvailabilityMonitor, DeviceCache, Event, EventBus, HubResult,
    HubServices, InMemoryDeviceStore, InMemoryTaskStore, JobEngine, Plugin, PluginManager,
    PluginRuntime, SubscriptionId, Task, TaskContext, TaskRegistrationCoordinator,
};

use crate::builtin::HubPlugin;
use crate::config::HubConfig;
use crate::store::RedbDeviceStore;

/// A running hub
pub struct Hub {
    config: HubConfig,
    services: HubServices,
    plugins: Arc<PluginManager>,
    engine: Arc<JobEngine>,
    tasks: Arc<InMemoryTaskStore>,
    coordinator: Arc<TaskRegistrationCoordinator>,
    coordinator_subscription: SubscriptionId,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build every component and start the background sweeps and the
    /// built-in plugin
    pub async fn start(config: HubConfig) -> anyhow::Result<Self> {
        tracing::info!(name = %config.hub.name, "Starting hub");

        let store: Arc<dyn DeviceStore> = match &config.hub.data_dir {
            Some(dir) => Arc::new(RedbDeviceStore::open(dir.join(&config.devices.database))?),
            None => {
                tracing::warn!("No data directory configured; devices are kept in memory");
                Arc::new(InMemoryDeviceStore::new())
            }
        };

        let bus = Arc::new(EventBus::new());
        let services = HubServices {
            registry: Arc::new(CapabilityRegistry::new(Arc::clone(&bus))),
            devices: Arc::new(DeviceCache::open(store, config.devices.max_resident)?),
            availability: Arc::new(DeviceAvailabilityMonitor::new(
                Arc::clone(&bus),
                config.availability.timeout(),
            )),
            bus,
        };

        let plugins = Arc::new(PluginManager::new(
            services.clone(),
            config.plugins.timeouts(),
        ));
        let engine = Arc::new(JobEngine::new(
            Arc::clone(&services.registry),
            config.jobs.to_job_config(),
        ));
        let tasks = Arc::new(InMemoryTaskStore::new(Arc::clone(&services.bus)));
        let coordinator = Arc::new(TaskRegistrationCoordinator::new(
            tasks.clone(),
            Arc::clone(&services.registry),
            Arc::clone(&plugins),
            config.tasks.callback_timeout(),
        ));
        let coordinator_subscription = coordinator.listen(&services.bus);

        let (shutdown_tx, _) = broadcast::channel(1);
        let background = vec![
            services.availability.spawn_sweeper(shutdown_tx.subscribe()),
            coordinator.spawn(config.tasks.sweep_interval(), shutdown_tx.subscribe()),
        ];

        let hub = Self {
            config,
            services,
            plugins,
            engine,
            tasks,
            coordinator,
            coordinator_subscription,
            shutdown_tx,
            background: Mutex::new(background),
        };

        if hub.config.plugins.builtin {
            hub.start_plugin(HubPlugin::new(Arc::clone(&hub.engine)))
                .await?;
        }

        hub.services.bus.publish(Event::hub_state_changed("started"));
        tracing::info!(
            devices = hub.services.devices.len(),
            plugins = hub.plugins.len(),
            "Hub started"
        );
        Ok(hub)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
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

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn engine(&self) -> &Arc<JobEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<TaskRegistrationCoordinator> {
        &self.coordinator
    }

    /// Start a plugin with its configured startup values
    pub async fn start_plugin<P: Plugin>(&self, plugin: P) -> HubResult<PluginRuntime> {
        let config = self.config.plugins.config_for(&plugin.spec().id);
        self.plugins.start_plugin(plugin, config).await
    }

    pub fn add_task(&self, task: Task) {
        self.tasks.add_task(task);
    }

    pub fn remove_task(&self, task: &TaskContext) -> Option<Task> {
        self.tasks.remove_task(task)
    }

    /// Stop background sweeps, then every plugin, then drain device writes
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Shutting down hub");
        self.services.bus.publish(Event::hub_state_changed("stopping"));

        let _ = self.shutdown_tx.send(());
        let background: Vec<_> = std::mem::take(&mut *self.background.lock());
        for result in futures::future::join_all(background).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.services.bus.unsubscribe(self.coordinator_subscription);

        if let Err(e) = self.plugins.shutdown_all().await {
            tracing::warn!(error = %e, "Some plugins did not shut down cleanly");
        }

        // Both block on the writer thread
        let devices = Arc::clone(&self.services.devices);
        tokio::task::spawn_blocking(move || {
            let flushed = devices.flush();
            devices.shutdown();
            flushed
        })
        .await??;

        let stats = self.services.bus.stats();
        tracing::info!(
            events = stats.total_published,
            jobs = self.engine.job_count(),
            "Hub shutdown complete"
        );
        Ok(())
    }
}
