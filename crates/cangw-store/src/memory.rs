//! In-memory storage

use std::collections::HashMap;

use async_trait::async_trait;
use cangw_core::{
    next_flash_state, DeviceId, DictionaryStore, FlashPhase, FlashState, FlashStateStore,
    OrderId, StoreError, StoreResult,
};
use chrono::Utc;
use parking_lot::RwLock;

/// Process-local store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    dictionaries: RwLock<HashMap<DeviceId, Vec<u8>>>,
    flash_states: RwLock<HashMap<OrderId, FlashState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flash records held
    pub fn flash_state_count(&self) -> usize {
        self.flash_states.read().len()
    }
}

#[async_trait]
impl DictionaryStore for MemoryStore {
    async fn save_dictionary(&self, device: DeviceId, dictionary: &[u8]) -> StoreResult<()> {
        self.dictionaries.write().insert(device, dictionary.to_vec());
        Ok(())
    }

    async fn load_dictionary(&self, device: DeviceId) -> StoreResult<Vec<u8>> {
        self.dictionaries
            .read()
            .get(&device)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("dictionary for device {}", device)))
    }

    async fn list_device_ids(&self) -> StoreResult<Vec<DeviceId>> {
        let mut ids: Vec<DeviceId> = self.dictionaries.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl FlashStateStore for MemoryStore {
    async fn save_flash_state(
        &self,
        order: OrderId,
        phase: FlashPhase,
        error: Option<&str>,
    ) -> StoreResult<FlashState> {
        let mut states = self.flash_states.write();
        let state = next_flash_state(states.get(&order).cloned(), order, phase, error, Utc::now())?;
        states.insert(order, state.clone());
        Ok(state)
    }

    async fn load_flash_state(&self, order: OrderId) -> StoreResult<FlashState> {
        self.flash_states
            .read()
            .get(&order)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("flash order {}", order)))
    }
}
