//! Serialized bus access
//!
//! The CANopen request/response channel carries one transaction at a time.
//! Every command issued by the gateway, from any session or from the flash
//! worker, is funnelled through a single [`BusGate`].

use std::time::Duration;

use cangw_core::{NmtCommand, NmtState, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::ProtocolError;
use crate::session::Session;

/// Global single-flight lock in front of the node handles
#[derive(Debug)]
pub struct BusGate {
    lock: Mutex<()>,
    heartbeat_timeout: Duration,
}

impl BusGate {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            heartbeat_timeout,
        }
    }

    /// Current NMT state of the device.
    ///
    /// Waits for one fresh heartbeat first (bounded by the heartbeat
    /// timeout, outside the gate). A missing heartbeat is not an error; the
    /// last known state is returned.
    pub async fn read_state(&self, session: &Session) -> Result<NmtState> {
        if !session.wait_for_heartbeat(self.heartbeat_timeout).await {
            debug!(
                device_id = %session.device_id(),
                timeout_ms = self.heartbeat_timeout.as_millis() as u64,
                "No heartbeat before timeout, using cached state"
            );
        }

        let _guard = self.lock.lock().await;
        let state = session.node().nmt_state();
        debug!(device_id = %session.device_id(), %state, "NMT state read");
        Ok(state)
    }

    pub async fn write_state(&self, session: &Session, command: NmtCommand) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!(device_id = %session.device_id(), %command, "NMT command");
        session
            .node()
            .set_nmt_state(command)
            .await
            .map_err(|e| surface(session, "NMT command", e))
    }

    pub async fn read_entry(&self, session: &Session, index: u16, subindex: u8) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        debug!(
            device_id = %session.device_id(),
            index = format_args!("0x{:04X}", index),
            subindex,
            "SDO upload"
        );
        session
            .node()
            .sdo_read(index, subindex)
            .await
            .map_err(|e| surface(session, "SDO upload", e))
    }

    pub async fn write_entry(
        &self,
        session: &Session,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!(
            device_id = %session.device_id(),
            index = format_args!("0x{:04X}", index),
            subindex,
            len = data.len(),
            "SDO download"
        );
        session
            .node()
            .sdo_write(index, subindex, data)
            .await
            .map_err(|e| surface(session, "SDO download", e))
    }
}

fn surface(session: &Session, command: &str, err: ProtocolError) -> cangw_core::Error {
    warn!(device_id = %session.device_id(), error = %err, "{} failed", command);
    err.into()
}
