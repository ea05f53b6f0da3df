// Device Store - redb-backed persistence for device descriptors
//
// Keys are `plugin:device` strings, values are JSON-encoded descriptors.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use hearth_runtime::{DeviceContext, DeviceDescriptor, DeviceStore, HubError, HubResult};

const DEVICES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

fn store_err(e: impl std::fmt::Display) -> HubError {
    HubError::Store(e.to_string())
}

/// Embedded device store
pub struct RedbDeviceStore {
    db: Database,
}

impl RedbDeviceStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }

        let db = Database::create(path)
            .map_err(|e| HubError::Store(format!("Failed to open database: {}", e)))?;

        // Ensure table exists
        let write_txn = db.begin_write().map_err(store_err)?;
        write_txn.open_table(DEVICES_TABLE).map_err(store_err)?;
        write_txn.commit().map_err(store_err)?;

        tracing::info!(path = %path.display(), "Device store opened");
        Ok(Self { db })
    }
}

impl DeviceStore for RedbDeviceStore {
    fn get(&self, device: &DeviceContext) -> HubResult<Option<DeviceDescriptor>> {
        let read_txn = self.db.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(DEVICES_TABLE).map_err(store_err)?;

        let key = device.key();
        match table.get(key.as_str()).map_err(store_err)? {
            Some(value) => {
                let descriptor = serde_json::from_slice(value.value()).map_err(store_err)?;
                Ok(Some(descriptor))
            }
            None => Ok(None),
        }
    }

    fn put(&self, descriptor: &DeviceDescriptor) -> HubResult<()> {
        let key = descriptor.context.key();
        let bytes = serde_json::to_vec(descriptor).map_err(store_err)?;

        let write_txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = write_txn.open_table(DEVICES_TABLE).map_err(store_err)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)
    }

    fn delete(&self, device: &DeviceContext) -> HubResult<()> {
        let key = device.key();
        let write_txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = write_txn.open_table(DEVICES_TABLE).map_err(store_err)?;
            table.remove(key.as_str()).map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)
    }

    fn keys(&self) -> HubResult<Vec<DeviceContext>> {
        let read_txn = self.db.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(DEVICES_TABLE).map_err(store_err)?;

        let mut keys = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (key, _) = entry.map_err(store_err)?;
            match key.value().parse::<DeviceContext>() {
                Ok(device) => keys.push(device),
                Err(e) => tracing::warn!(key = key.value(), error = %e, "Skipping malformed device key"),
            }
        }
        Ok(keys)
    }
}
