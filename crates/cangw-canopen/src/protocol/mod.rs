//! Protocol library seam
//!
//! The gateway does not speak CAN frames itself. Everything below the
//! [`Network`] / [`NodeHandle`] traits (EDS parsing, SDO segmentation, NMT
//! encoding, heartbeat consumption) belongs to the CANopen stack plugged in
//! here. A simulated stack is provided in [`sim`] for tests and demos.

mod abort;
pub mod sim;

pub use abort::SdoAbortCode;

use std::sync::Arc;

use async_trait::async_trait;
use cangw_core::{DeviceId, Error, NmtCommand, NmtState};
use thiserror::Error;
use tokio::sync::watch;

/// Errors reported by the CANopen stack
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("SDO abort: {} (0x{code:08X})", describe_abort(.code))]
    Abort { code: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid object dictionary: {0}")]
    Dictionary(String),
}

fn describe_abort(code: &u32) -> SdoAbortCode {
    SdoAbortCode::from(*code)
}

impl ProtocolError {
    pub fn abort(code: SdoAbortCode) -> Self {
        ProtocolError::Abort { code: code.into() }
    }
}

/// Device errors are surfaced verbatim: no retry, no reinterpretation
impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout(_) | ProtocolError::Transport(_) => {
                Error::DeviceUnreachable(err.to_string())
            }
            ProtocolError::Abort { code } => Error::DeviceRejected {
                code,
                message: SdoAbortCode::from(code).to_string(),
            },
            ProtocolError::Dictionary(msg) => Error::InvalidRequest(msg),
        }
    }
}

/// A CANopen network the gateway is attached to
#[async_trait]
pub trait Network: Send + Sync {
    /// Parse `dictionary` (EDS text) and initialise a node handle for `device`
    async fn create_node(
        &self,
        device: DeviceId,
        dictionary: &[u8],
    ) -> Result<Arc<dyn NodeHandle>, ProtocolError>;
}

/// Live handles for one remote node
///
/// Implementations do not serialize access themselves; callers go through
/// the bus gate.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    fn device_id(&self) -> DeviceId;

    /// Start consuming heartbeats of this node.
    ///
    /// The receiver is notified on every heartbeat, including repeats of the
    /// same state.
    fn listen_for_heartbeat(&self) -> watch::Receiver<NmtState>;

    /// Last state reported by heartbeat
    fn nmt_state(&self) -> NmtState;

    /// Send an NMT command to the node
    async fn set_nmt_state(&self, command: NmtCommand) -> Result<(), ProtocolError>;

    /// SDO upload
    async fn sdo_read(&self, index: u16, subindex: u8) -> Result<Vec<u8>, ProtocolError>;

    /// SDO download
    async fn sdo_write(&self, index: u16, subindex: u8, data: &[u8])
        -> Result<(), ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_maps_to_device_rejected() {
        let err: Error = ProtocolError::abort(SdoAbortCode::ObjectDoesNotExist).into();
        match err {
            Error::DeviceRejected { code, message } => {
                assert_eq!(code, 0x0602_0000);
                assert!(message.contains("does not exist"));
            }
            other => panic!("Expected DeviceRejected, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_maps_to_unreachable() {
        let err: Error = ProtocolError::Timeout("SDO response".to_string()).into();
        assert!(matches!(err, Error::DeviceUnreachable(msg) if msg.contains("SDO response")));
    }
}
