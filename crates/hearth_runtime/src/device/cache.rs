//! Device Cache
//!
//! Read-through / write-behind cache in front of a [`DeviceStore`].
//!
//! Every known device has a slot in the index. A slot's descriptor may be
//! evicted once the index holds more than `max_resident` descriptors and is
//! reloaded from the store on the next read. Slots with writes still queued
//! are never evicted, so a read always observes the latest write.
//!
//! Writes update the index synchronously and are queued to one worker thread
//! which applies them to the store strictly in submission order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use super::DeviceStore;
use crate::error::{HubError, HubResult};
use crate::types::{DeviceContext, DeviceDescriptor};

// ─────────────────────────────────────────────────────────────────────────────
// Index
// ─────────────────────────────────────────────────────────────────────────────

struct Slot {
    /// Identifies this incarnation of the slot across delete/re-create
    generation: u64,
    /// Bumped whenever a descriptor is installed
    version: u64,
    descriptor: Option<Arc<DeviceDescriptor>>,
    /// Writes queued but not yet applied to the store
    pending: usize,
    last_access: AtomicU64,
}

impl Slot {
    fn new(generation: u64, descriptor: Option<Arc<DeviceDescriptor>>) -> Self {
        Self {
            generation,
            version: 0,
            descriptor,
            pending: 0,
            last_access: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct Index {
    slots: HashMap<DeviceContext, Slot>,
    resident: usize,
    next_generation: u64,
    clock: AtomicU64,
}

impl Index {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn touch(&self, slot: &Slot) {
        slot.last_access.store(self.tick(), Ordering::Relaxed);
    }

    /// Make `descriptor` resident in the slot for its device, creating the slot
    /// if needed. Returns the slot generation.
    fn install(&mut self, descriptor: Arc<DeviceDescriptor>) -> u64 {
        let tick = self.tick();
        let next_generation = self.next_generation;
        let slot = self
            .slots
            .entry(descriptor.context.clone())
            .or_insert_with(|| Slot::new(next_generation, None));
        if slot.generation == next_generation {
            self.next_generation += 1;
        }
        if slot.descriptor.is_none() {
            self.resident += 1;
        }
        slot.descriptor = Some(descriptor);
        slot.version += 1;
        slot.last_access.store(tick, Ordering::Relaxed);
        slot.generation
    }

    /// Evict least recently used descriptors with no pending writes until the
    /// resident count fits. `keep` is never evicted.
    fn evict(&mut self, max_resident: usize, keep: &DeviceContext) {
        while self.resident > max_resident {
            let victim = self
                .slots
                .iter()
                .filter(|(ctx, slot)| slot.descriptor.is_some() && slot.pending == 0 && *ctx != keep)
                .min_by_key(|(_, slot)| slot.last_access.load(Ordering::Relaxed))
                .map(|(ctx, _)| ctx.clone());

            let Some(victim) = victim else { break };
            if let Some(slot) = self.slots.get_mut(&victim) {
                slot.descriptor = None;
                self.resident -= 1;
                tracing::trace!(device = %victim, "Evicted device descriptor");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write-behind worker
// ─────────────────────────────────────────────────────────────────────────────

enum WriteOp {
    Put {
        descriptor: Arc<DeviceDescriptor>,
        generation: u64,
    },
    Delete(DeviceContext),
    /// Acknowledge once every earlier op was applied
    Flush(Sender<()>),
}

struct WriteWorker {
    store: Arc<dyn DeviceStore>,
    index: Arc<RwLock<Index>>,
    rx: Receiver<WriteOp>,
}

impl WriteWorker {
    fn run(self) {
        tracing::debug!("Device write worker started");

        while let Ok(op) = self.rx.recv() {
            match op {
                WriteOp::Put {
                    descriptor,
                    generation,
                } => match self.store.put(&descriptor) {
                    Ok(()) => {
                        let mut index = self.index.write();
                        if let Some(slot) = index.slots.get_mut(&descriptor.context) {
                            if slot.generation == generation {
                                slot.pending = slot.pending.saturating_sub(1);
                            }
                        }
                    }
                    Err(e) => {
                        // The slot stays pinned, so reads keep seeing the write
                        tracing::error!(device = %descriptor.context, error = %e, "Device write failed");
                    }
                },
                WriteOp::Delete(device) => {
                    if let Err(e) = self.store.delete(&device) {
                        tracing::error!(device = %device, error = %e, "Device delete failed");
                    }
                }
                WriteOp::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        tracing::debug!("Device write worker stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Read-through / write-behind device descriptor cache
pub struct DeviceCache {
    store: Arc<dyn DeviceStore>,
    index: Arc<RwLock<Index>>,
    max_resident: usize,
    tx: Mutex<Option<Sender<WriteOp>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeviceCache {
    /// Open a cache over `store`, loading every stored device identity into the
    /// index and starting the write worker.
    pub fn open(store: Arc<dyn DeviceStore>, max_resident: usize) -> HubResult<Self> {
        let mut index = Index::default();
        for device in store.keys()? {
            let generation = index.next_generation;
            index.next_generation += 1;
            index.slots.insert(device, Slot::new(generation, None));
        }
        let known = index.slots.len();
        let index = Arc::new(RwLock::new(index));

        let (tx, rx) = mpsc::channel();
        let worker = WriteWorker {
            store: Arc::clone(&store),
            index: Arc::clone(&index),
            rx,
        };
        let handle = thread::Builder::new()
            .name("device-writer".into())
            .spawn(move || worker.run())
            .map_err(|e| HubError::Store(format!("Failed to spawn device writer: {}", e)))?;

        tracing::info!(devices = known, max_resident, "Device cache opened");

        Ok(Self {
            store,
            index,
            max_resident: max_resident.max(1),
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Get a device descriptor, reloading it from the store if it was evicted
    pub fn get(&self, device: &DeviceContext) -> HubResult<Option<DeviceDescriptor>> {
        loop {
            let seen = {
                let index = self.index.read();
                let Some(slot) = index.slots.get(device) else {
                    return Ok(None);
                };
                if let Some(descriptor) = &slot.descriptor {
                    index.touch(slot);
                    return Ok(Some(descriptor.as_ref().clone()));
                }
                (slot.generation, slot.version)
            };

            // Evicted slots have no pending writes, so the store is current
            let loaded = self.store.get(device)?;

            let mut index = self.index.write();
            let Some(slot) = index.slots.get(device) else {
                // Deleted while we were loading
                return Ok(None);
            };
            if let Some(descriptor) = &slot.descriptor {
                // A write landed while we were loading; it wins
                return Ok(Some(descriptor.as_ref().clone()));
            }
            if (slot.generation, slot.version) != seen {
                // Written and evicted again while we were loading
                tracing::trace!(device = %device, "Reloading device after concurrent write");
                continue;
            }
            let Some(loaded) = loaded else {
                tracing::warn!(device = %device, "Indexed device missing from store");
                return Ok(None);
            };
            index.install(Arc::new(loaded.clone()));
            index.evict(self.max_resident, device);
            return Ok(Some(loaded));
        }
    }

    /// Check if a device is known, without touching the store
    pub fn exists(&self, device: &DeviceContext) -> bool {
        self.index.read().slots.contains_key(device)
    }

    /// Identities of every device owned by a plugin, sorted
    pub fn devices_for_plugin(&self, plugin_id: &str) -> Vec<DeviceContext> {
        let mut devices: Vec<_> = self
            .index
            .read()
            .slots
            .keys()
            .filter(|ctx| ctx.plugin_id == plugin_id)
            .cloned()
            .collect();
        devices.sort();
        devices
    }

    /// Identities of every known device, sorted
    pub fn all_devices(&self) -> Vec<DeviceContext> {
        let mut devices: Vec<_> = self.index.read().slots.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn len(&self) -> usize {
        self.index.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptors currently held in memory
    pub fn resident(&self) -> usize {
        self.index.read().resident
    }

    /// Writes queued but not yet applied
    pub fn pending_writes(&self) -> usize {
        self.index.read().slots.values().map(|s| s.pending).sum()
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Save a descriptor. Visible to reads immediately; persisted later.
    pub fn save(&self, descriptor: DeviceDescriptor) -> HubResult<()> {
        let device = descriptor.context.clone();
        let descriptor = Arc::new(descriptor);
        if self.tx.lock().is_none() {
            return Err(HubError::ChannelClosed);
        }

        let mut index = self.index.write();
        let generation = index.install(Arc::clone(&descriptor));
        if let Some(slot) = index.slots.get_mut(&device) {
            slot.pending += 1;
        }
        // Enqueue under the index lock so store order matches index order
        if let Err(e) = self.enqueue(WriteOp::Put {
            descriptor,
            generation,
        }) {
            if let Some(slot) = index.slots.get_mut(&device) {
                slot.pending -= 1;
            }
            return Err(e);
        }
        index.evict(self.max_resident, &device);
        Ok(())
    }

    /// Change a device's display name
    pub fn rename(&self, device: &DeviceContext, name: impl Into<String>) -> HubResult<()> {
        let mut descriptor = self.require(device)?;
        descriptor.name = name.into();
        descriptor.updated_at = Utc::now();
        self.save(descriptor)
    }

    /// Replace a device's tags
    pub fn set_tags(&self, device: &DeviceContext, tags: BTreeSet<String>) -> HubResult<()> {
        let mut descriptor = self.require(device)?;
        descriptor.tags = tags;
        descriptor.updated_at = Utc::now();
        self.save(descriptor)
    }

    /// Forget a device. Returns false if it was not known.
    pub fn delete(&self, device: &DeviceContext) -> HubResult<bool> {
        let mut index = self.index.write();
        if !index.slots.contains_key(device) {
            return Ok(false);
        }
        // The slot is kept if the delete cannot be queued
        self.enqueue(WriteOp::Delete(device.clone()))?;
        if let Some(slot) = index.slots.remove(device) {
            if slot.descriptor.is_some() {
                index.resident -= 1;
            }
        }
        Ok(true)
    }

    /// Block until every write enqueued before this call reached the store
    pub fn flush(&self) -> HubResult<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.enqueue(WriteOp::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| HubError::ChannelClosed)
    }

    /// Drain the queue and stop the worker. Later writes fail with
    /// [`HubError::ChannelClosed`].
    pub fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Device write worker panicked");
            }
            tracing::info!("Device cache shut down");
        }
    }

    fn require(&self, device: &DeviceContext) -> HubResult<DeviceDescriptor> {
        self.get(device)?
            .ok_or_else(|| HubError::NotFound(format!("device {}", device)))
    }

    fn enqueue(&self, op: WriteOp) -> HubResult<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(op).map_err(|_| HubError::ChannelClosed),
            None => Err(HubError::ChannelClosed),
        }
    }
}

impl Drop for DeviceCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeviceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        f.debug_struct("DeviceCache")
            .field("devices", &index.slots.len())
            .field("resident", &index.resident)
            .field("max_resident", &self.max_resident)
            .finish()
    }
}
