//! Plugin Handle
//!
//! [`PluginRuntime`] is the cloneable handle to one plugin's mailbox.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{HubServices, PluginCall, WorkItem};
use crate::error::{HubError, HubResult};
use crate::event::SubscriptionId;
use crate::types::DeviceContext;

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Status
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PluginStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    /// `on_startup` failed; the plugin may be started again
    Failed = 4,
}

impl PluginStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Failed,
        }
    }

    /// Check if the plugin can be started again
    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginStatus::Stopped | PluginStatus::Failed)
    }

    /// Check if events are still delivered
    pub fn accepts_events(&self) -> bool {
        matches!(self, PluginStatus::Starting | PluginStatus::Running)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginStatus::Stopped => write!(f, "stopped"),
            PluginStatus::Starting => write!(f, "starting"),
            PluginStatus::Running => write!(f, "running"),
            PluginStatus::Stopping => write!(f, "stopping"),
            PluginStatus::Failed => write!(f, "failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Runtime handle
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct PluginShared {
    pub id: String,
    pub instance: u64,
    pub name: String,
    pub status: AtomicU8,
    pub mailbox: mpsc::UnboundedSender<WorkItem>,
    pub subscription: Mutex<Option<SubscriptionId>>,
    pub refresh: Mutex<Option<JoinHandle<()>>>,
    pub published: Arc<Mutex<BTreeSet<DeviceContext>>>,
    pub shutdown_timeout: Duration,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Distinguishes successive runs of a plugin with the same id
pub(crate) fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

impl PluginShared {
    pub fn status(&self) -> PluginStatus {
        PluginStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: PluginStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`; false if the status was something else
    pub fn transition(&self, from: PluginStatus, to: PluginStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Handle to a plugin's single-task execution context
///
/// Cheap to clone. Work submitted through any clone runs in submission order.
#[derive(Clone)]
pub struct PluginRuntime {
    pub(crate) shared: Arc<PluginShared>,
    pub(crate) services: HubServices,
}

impl PluginRuntime {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Unique per started runtime; a restarted plugin gets a new value
    pub fn instance(&self) -> u64 {
        self.shared.instance
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> PluginStatus {
        self.shared.status()
    }

    pub fn is_running(&self) -> bool {
        self.status() == PluginStatus::Running
    }

    /// Devices the plugin published and has not stopped
    pub fn published_devices(&self) -> Vec<DeviceContext> {
        self.shared.published.lock().iter().cloned().collect()
    }

    /// Queue a call without waiting for it to run
    pub fn submit(&self, call: PluginCall) -> HubResult<()> {
        self.shared
            .mailbox
            .send(WorkItem { call, reply: None })
            .map_err(|_| HubError::NotRunning(self.shared.id.clone()))
    }

    /// Queue a call and wait until it ran, at most `timeout`.
    ///
    /// A callback error or panic surfaces as [`HubError::Callback`]. On timeout
    /// the call stays queued and still runs.
    pub async fn request(&self, call: PluginCall, timeout: Duration) -> HubResult<()> {
        let name = call.name();
        let reply = self.enqueue(call)?;
        self.await_reply(name, reply, timeout).await
    }

    /// Queue a call whose outcome is awaited later with [`Self::await_reply`]
    pub(crate) fn enqueue(&self, call: PluginCall) -> HubResult<oneshot::Receiver<anyhow::Result<()>>> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .mailbox
            .send(WorkItem {
                call,
                reply: Some(tx),
            })
            .map_err(|_| HubError::NotRunning(self.shared.id.clone()))?;
        Ok(rx)
    }

    pub(crate) async fn await_reply(
        &self,
        name: &'static str,
        reply: oneshot::Receiver<anyhow::Result<()>>,
        timeout: Duration,
    ) -> HubResult<()> {
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(HubError::callback(&self.shared.id, e)),
            Ok(Err(_)) => Err(HubError::ChannelClosed),
            Err(_) => {
                tracing::warn!(plugin_id = %self.shared.id, call = name, ?timeout, "Plugin call timed out");
                Err(HubError::Timeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}
