//! Durable store contracts
//!
//! The storage medium is not part of the core. Implementations live in
//! `cangw-store` (files on disk, in-memory) and must uphold the rules below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{DeviceId, FlashPhase, FlashState, OrderId};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid flash state transition: {from} -> {to}")]
    InvalidTransition { from: FlashPhase, to: FlashPhase },
}

/// Per-device object dictionary (EDS) blobs
#[async_trait]
pub trait DictionaryStore: Send + Sync {
    /// Store (or replace) the dictionary of a device
    async fn save_dictionary(&self, device: DeviceId, dictionary: &[u8]) -> StoreResult<()>;

    /// Load a device dictionary, `NotFound` if none was stored
    async fn load_dictionary(&self, device: DeviceId) -> StoreResult<Vec<u8>>;

    /// All devices with a stored dictionary
    async fn list_device_ids(&self) -> StoreResult<Vec<DeviceId>>;
}

/// Per-order flash progress records
#[async_trait]
pub trait FlashStateStore: Send + Sync {
    /// Record a phase for an order and return the updated record.
    ///
    /// `Requested` creates the record; every other phase is applied through
    /// [`FlashState::advance`] so timestamps and ordering are enforced the same
    /// way by every implementation. Must be atomic per order.
    async fn save_flash_state(
        &self,
        order: OrderId,
        phase: FlashPhase,
        error: Option<&str>,
    ) -> StoreResult<FlashState>;

    /// Load the record of an order, `NotFound` if absent
    async fn load_flash_state(&self, order: OrderId) -> StoreResult<FlashState>;
}

/// Compute the record that results from persisting `phase` on top of the
/// currently stored one. Shared by every [`FlashStateStore`] implementation.
pub fn next_flash_state(
    existing: Option<FlashState>,
    order: OrderId,
    phase: FlashPhase,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<FlashState> {
    match (existing, phase) {
        (None, FlashPhase::Requested) => Ok(FlashState::requested(now)),
        (None, _) => Err(StoreError::NotFound(format!("flash order {}", order))),
        (Some(mut state), phase) => {
            state.advance(phase, error, now)?;
            Ok(state)
        }
    }
}
