//! Error taxonomy of the gateway core

use thiserror::Error;

use crate::models::{DeviceId, FlashPhase, OrderId};
use crate::store::StoreError;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the gateway operations
#[derive(Debug, Error)]
pub enum Error {
    /// No usable object dictionary stored for the device (absent or malformed)
    #[error("Object dictionary for device {device} not found: {reason}")]
    DictionaryNotFound { device: DeviceId, reason: String },

    /// Device did not answer (timeout, bus or transport failure)
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    /// Device answered with a refusal (e.g. SDO abort code)
    #[error("Device rejected request: {message} (code 0x{code:08X})")]
    DeviceRejected { code: u32, message: String },

    /// Flash queue is at capacity
    #[error("Flash queue is full")]
    QueueFull,

    /// No flash state recorded for this order
    #[error("Flash order not found: {0}")]
    OrderNotFound(OrderId),

    /// Durable store I/O problem
    #[error("Store failure: {0}")]
    StoreFailure(String),

    /// A flash phase could not be completed
    #[error("Flash phase {phase} failed: {cause}")]
    PhaseFailure {
        phase: FlashPhase,
        #[source]
        cause: Box<Error>,
    },

    /// Unknown target NMT state
    #[error("Invalid NMT state: '{0}'")]
    InvalidState(String),

    /// Malformed request argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Flash admission has been closed
    #[error("Flash queue is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn phase_failure(phase: FlashPhase, cause: Error) -> Self {
        Error::PhaseFailure {
            phase,
            cause: Box::new(cause),
        }
    }

    /// Returns the HTTP status code a transport layer should map this error to
    pub fn status_code(&self) -> u16 {
        match self {
            Error::DictionaryNotFound { .. } => 404,
            Error::DeviceUnreachable(_) => 504,
            Error::DeviceRejected { .. } => 502,
            Error::QueueFull => 429,
            Error::OrderNotFound(_) => 404,
            Error::StoreFailure(_) => 500,
            Error::PhaseFailure { .. } => 502,
            Error::InvalidState(_) => 400,
            Error::InvalidRequest(_) => 400,
            Error::ShuttingDown => 503,
        }
    }
}

/// Store errors without a call-site specific meaning. `NotFound` is mapped
/// by the caller, which knows whether a dictionary or an order was missing.
impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::StoreFailure(err.to_string())
    }
}
