//! Device persistence
//!
//! [`DeviceStore`] is the backing point-store for device descriptors. The
//! runtime never writes to it directly: every write goes through
//! [`DeviceCache`], which orders them on a single worker thread.

mod cache;

pub use cache::*;

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::HubResult;
use crate::types::{DeviceContext, DeviceDescriptor};

/// Backing store for device descriptors, keyed by device identity
pub trait DeviceStore: Send + Sync + 'static {
    fn get(&self, device: &DeviceContext) -> HubResult<Option<DeviceDescriptor>>;

    fn put(&self, descriptor: &DeviceDescriptor) -> HubResult<()>;

    fn delete(&self, device: &DeviceContext) -> HubResult<()>;

    /// Every stored device identity
    fn keys(&self) -> HubResult<Vec<DeviceContext>>;
}

/// Volatile store, used when no data directory is configured and in tests
#[derive(Debug, Default)]
pub struct InMemoryDeviceStore {
    devices: Mutex<BTreeMap<DeviceContext, DeviceDescriptor>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored descriptors
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

impl DeviceStore for InMemoryDeviceStore {
    fn get(&self, device: &DeviceContext) -> HubResult<Option<DeviceDescriptor>> {
        Ok(self.devices.lock().get(device).cloned())
    }

    fn put(&self, descriptor: &DeviceDescriptor) -> HubResult<()> {
        self.devices
            .lock()
            .insert(descriptor.context.clone(), descriptor.clone());
        Ok(())
    }

    fn delete(&self, device: &DeviceContext) -> HubResult<()> {
        self.devices.lock().remove(device);
        Ok(())
    }

    fn keys(&self) -> HubResult<Vec<DeviceContext>> {
        Ok(self.devices.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryDeviceStore::new();
        let lamp = DeviceDescriptor::new(DeviceContext::new("hue", "lamp-1"), "Lamp", "light");

        store.put(&lamp).unwrap();
        assert_eq!(store.get(&lamp.context).unwrap(), Some(lamp.clone()));
        assert_eq!(store.keys().unwrap(), vec![lamp.context.clone()]);

        store.delete(&lamp.context).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get(&lamp.context).unwrap(), None);
    }
}
