//! Plugin Manager
//!
//! Owns the runtime of every installed plugin.

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{HubServices, Plugin, PluginRuntime, PluginStatus, PluginTimeouts};
use crate::error::{HubError, HubResult};
use crate::types::PropertyValues;

/// Central registry of plugin runtimes
///
/// Responsible for:
/// - Starting plugins with the shared hub services
/// - Looking up a plugin's runtime by id
/// - Ordered shutdown of every plugin
pub struct PluginManager {
    plugins: DashMap<String, PluginRuntime>,
    /// Ids with a start in flight
    starting: Mutex<HashSet<String>>,
    services: HubServices,
    timeouts: PluginTimeouts,
}

impl PluginManager {
    /// Create a new plugin manager
    pub fn new(services: HubServices, timeouts: PluginTimeouts) -> Self {
        Self {
            plugins: DashMap::new(),
            starting: Mutex::new(HashSet::new()),
            services,
            timeouts,
        }
    }

    pub fn services(&self) -> &HubServices {
        &self.services
    }

    pub fn timeouts(&self) -> PluginTimeouts {
        self.timeouts
    }

    /// Start a plugin. A plugin with the same id may only be started again once
    /// it is stopped or failed.
    pub async fn start_plugin<P: Plugin>(
        &self,
        plugin: P,
        config: PropertyValues,
    ) -> HubResult<PluginRuntime> {
        let id = plugin.spec().id;
        let _reservation = self.reserve(&id)?;

        let result = PluginRuntime::start(
            Box::new(plugin),
            config,
            self.services.clone(),
            self.timeouts,
        )
        .await;

        match result {
            Ok(runtime) => {
                self.plugins.insert(id, runtime.clone());
                Ok(runtime)
            }
            Err(e) => {
                self.plugins.remove(&id);
                Err(e)
            }
        }
    }

    /// Claim `id` for one start; released when the guard drops
    fn reserve(&self, id: &str) -> HubResult<Reservation<'_>> {
        let mut starting = self.starting.lock();
        let active = self
            .plugins
            .get(id)
            .is_some_and(|existing| !existing.status().is_terminal());
        if active || !starting.insert(id.to_string()) {
            return Err(HubError::AlreadyRunning(id.to_string()));
        }
        Ok(Reservation {
            starting: &self.starting,
            id: id.to_string(),
        })
    }

    /// Stop a plugin and wait for its teardown
    pub async fn stop_plugin(&self, plugin_id: &str) -> HubResult<()> {
        let runtime = self
            .get(plugin_id)
            .ok_or_else(|| HubError::NotFound(format!("plugin {}", plugin_id)))?;
        runtime.stop().await
    }

    /// Get a plugin runtime by id
    pub fn get(&self, plugin_id: &str) -> Option<PluginRuntime> {
        self.plugins.get(plugin_id).map(|r| r.clone())
    }

    /// Check if a plugin is running
    pub fn is_running(&self, plugin_id: &str) -> bool {
        self.plugins
            .get(plugin_id)
            .map(|r| r.is_running())
            .unwrap_or(false)
    }

    /// List all plugins with their status, sorted by id
    pub fn list(&self) -> Vec<(String, PluginStatus)> {
        let mut plugins: Vec<_> = self
            .plugins
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect();
        plugins.sort_by(|a, b| a.0.cmp(&b.0));
        plugins
    }

    /// Stop every running plugin, one after another.
    ///
    /// Returns the last error encountered; every plugin is still asked to stop.
    pub async fn shutdown_all(&self) -> HubResult<()> {
        tracing::info!("Initiating shutdown of all plugins");

        let runtimes: Vec<PluginRuntime> = {
            let mut runtimes: Vec<_> = self.plugins.iter().map(|e| e.value().clone()).collect();
            runtimes.sort_by(|a, b| a.id().cmp(b.id()));
            runtimes
        };

        let mut outcome = Ok(());
        for runtime in runtimes {
            if runtime.status().is_terminal() {
                continue;
            }
            if let Err(e) = runtime.stop().await {
                tracing::warn!(plugin_id = %runtime.id(), error = %e, "Plugin shutdown failed");
                outcome = Err(e);
            }
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

struct Reservation<'a> {
    starting: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginContext, PluginSpec, testing};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        id: String,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Counting {
        fn spec(&self) -> PluginSpec {
            PluginSpec::new(&self.id, "Counting")
        }

        async fn on_startup(
            &mut self,
            _ctx: &PluginContext,
            _config: &PropertyValues,
        ) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_shutdown(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(id: &str, starts: &Arc<AtomicUsize>, stops: &Arc<AtomicUsize>) -> Counting {
        Counting {
            id: id.to_string(),
            starts: Arc::clone(starts),
            stops: Arc::clone(stops),
        }
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let manager = PluginManager::new(testing::services(), PluginTimeouts::default());
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        manager
            .start_plugin(counting("hue", &starts, &stops), PropertyValues::new())
            .await
            .unwrap();
        assert!(manager.is_running("hue"));
        assert!(matches!(
            manager
                .start_plugin(counting("hue", &starts, &stops), PropertyValues::new())
                .await,
            Err(HubError::AlreadyRunning(_))
        ));

        manager.stop_plugin("hue").await.unwrap();
        assert_eq!(manager.list(), vec![("hue".to_string(), PluginStatus::Stopped)]);

        // Stopped -> Starting is allowed
        manager
            .start_plugin(counting("hue", &starts, &stops), PropertyValues::new())
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let manager = PluginManager::new(testing::services(), PluginTimeouts::default());
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        for id in ["a", "b", "c"] {
            manager
                .start_plugin(counting(id, &starts, &stops), PropertyValues::new())
                .await
                .unwrap();
        }
        manager.stop_plugin("b").await.unwrap();

        manager.shutdown_all().await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        assert!(
            manager
                .list()
                .iter()
                .all(|(_, status)| *status == PluginStatus::Stopped)
        );
        assert!(matches!(
            manager.stop_plugin("missing").await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_one() {
        let manager = PluginManager::new(testing::services(), PluginTimeouts::default());
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            manager.start_plugin(counting("hue", &starts, &stops), PropertyValues::new()),
            manager.start_plugin(counting("hue", &starts, &stops), PropertyValues::new()),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(
            [&a, &b]
                .iter()
                .any(|r| matches!(r, Err(HubError::AlreadyRunning(_))))
        );
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.services().bus.stats().subscriptions, 1);

        // The losing start leaves no reservation behind
        manager.stop_plugin("hue").await.unwrap();
        manager
            .start_plugin(counting("hue", &starts, &stops), PropertyValues::new())
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_list_sorted_by_id() {
        let manager = PluginManager::new(testing::services(), PluginTimeouts::default());
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        for id in ["zwave", "hue", "mqtt"] {
            manager
                .start_plugin(counting(id, &starts, &stops), PropertyValues::new())
                .await
                .unwrap();
        }
        manager.stop_plugin("mqtt").await.unwrap();

        assert_eq!(
            manager.list(),
            vec![
                ("hue".to_string(), PluginStatus::Running),
                ("mqtt".to_string(), PluginStatus::Stopped),
                ("zwave".to_string(), PluginStatus::Running),
            ]
        );
    }
}
