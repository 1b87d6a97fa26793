//! Device sessions
//!
//! A session bundles the node handle the CANopen stack built from a device's
//! object dictionary with the heartbeat listener started for it. Sessions
//! are created lazily by the [`SessionRegistry`] and live until process exit.

mod registry;

pub use registry::SessionRegistry;

use std::sync::Arc;
use std::time::Duration;

use cangw_core::{DeviceId, NmtState};
use tokio::sync::watch;

use crate::protocol::NodeHandle;

/// Cached connection state for one device
pub struct Session {
    device_id: DeviceId,
    node: Arc<dyn NodeHandle>,
    heartbeat: watch::Receiver<NmtState>,
}

impl Session {
    /// Wrap a freshly created node and start listening for its heartbeat
    pub fn new(node: Arc<dyn NodeHandle>) -> Self {
        let heartbeat = node.listen_for_heartbeat();
        Self {
            device_id: node.device_id(),
            node,
            heartbeat,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn node(&self) -> &dyn NodeHandle {
        self.node.as_ref()
    }

    /// Wait until at least one heartbeat arrives after this call, or until
    /// `timeout` elapses. Returns whether a heartbeat was seen.
    pub async fn wait_for_heartbeat(&self, timeout: Duration) -> bool {
        let mut heartbeat = self.heartbeat.clone();
        heartbeat.borrow_and_update();
        matches!(
            tokio::time::timeout(timeout, heartbeat.changed()).await,
            Ok(Ok(()))
        )
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("state", &self.node.nmt_state())
            .finish()
    }
}
