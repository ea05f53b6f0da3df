//! Device Availability Monitor
//!
//! Tracks device check-ins and emits exactly one `deviceUnavailable` event per
//! silence period. A later check-in re-arms the device and emits
//! `deviceAvailable`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::event::{Event, EventBus};
use crate::types::DeviceContext;

/// Upper bound on the sweep interval
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness state of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAvailabilityRecord {
    pub device: DeviceContext,
    pub last_check_in: DateTime<Utc>,
    pub last_notification: Option<DateTime<Utc>>,
    pub available: bool,
}

/// Periodic liveness tracker for every device that ever checked in
pub struct DeviceAvailabilityMonitor {
    bus: Arc<EventBus>,
    timeout: Duration,
    records: DashMap<DeviceContext, DeviceAvailabilityRecord>,
}

impl DeviceAvailabilityMonitor {
    /// Create a monitor that marks devices unavailable after `timeout` of silence
    pub fn new(bus: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            bus,
            timeout,
            records: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How often [`sweep`](Self::sweep) should run
    pub fn sweep_interval(&self) -> Duration {
        self.timeout.min(MAX_SWEEP_INTERVAL)
    }

    /// Record that a device was heard from at `at`
    pub fn check_in(&self, device: &DeviceContext, at: DateTime<Utc>) {
        let recovered = {
            let mut record = self
                .records
                .entry(device.clone())
                .or_insert_with(|| DeviceAvailabilityRecord {
                    device: device.clone(),
                    last_check_in: at,
                    last_notification: None,
                    available: true,
                });
            if at > record.last_check_in {
                record.last_check_in = at;
            }
            let recovered = !record.available;
            record.available = true;
            recovered
        };

        if recovered {
            tracing::info!(device = %device, "Device available again");
            self.bus.publish(Event::device_available(device, at));
        }
    }

    /// Emit `deviceUnavailable` for every device silent for at least the
    /// timeout that has not been reported since its last check-in.
    ///
    /// Returns the devices reported by this sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<DeviceContext> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let mut reported = Vec::new();

        for mut record in self.records.iter_mut() {
            let silent = now.signed_duration_since(record.last_check_in) >= timeout;
            let unreported = record
                .last_notification
                .is_none_or(|sent| sent < record.last_check_in);
            if silent && unreported {
                record.last_notification = Some(now);
                record.available = false;
                reported.push(record.device.clone());
            }
        }

        // Publish outside the map so listeners may check in
        for device in &reported {
            tracing::warn!(device = %device, timeout = ?self.timeout, "Device unavailable");
            self.bus.publish(Event::device_unavailable(device, now));
        }
        reported
    }

    /// Check if a device checked in recently enough. Unknown devices are not
    /// available.
    pub fn is_available(&self, device: &DeviceContext) -> bool {
        self.records.get(device).is_some_and(|r| r.available)
    }

    pub fn record(&self, device: &DeviceContext) -> Option<DeviceAvailabilityRecord> {
        self.records.get(device).map(|r| r.clone())
    }

    /// Drop a device's record, e.g. when the device is deleted
    pub fn forget(&self, device: &DeviceContext) -> bool {
        self.records.remove(device).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every [`sweep_interval`](Self::sweep_interval)
    /// until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(monitor.sweep_interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = timer.tick() => {
                        monitor.sweep(Utc::now());
                    }
                }
            }
            tracing::debug!("Availability sweeper stopped");
        })
    }
}
