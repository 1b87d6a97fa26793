//! Lazily populated session cache

use std::collections::HashMap;
use std::sync::Arc;

use cangw_core::{DeviceId, DictionaryStore, Error, Result, StoreError};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::Session;
use crate::protocol::{Network, ProtocolError};

/// Creates and caches one [`Session`] per device id.
///
/// Each id owns its own `OnceCell`: concurrent first accesses to the same id
/// share a single construction, while different ids are opened
/// independently. A failed construction leaves the cell empty and is retried
/// by the next caller.
pub struct SessionRegistry {
    network: Arc<dyn Network>,
    dictionaries: Arc<dyn DictionaryStore>,
    sessions: Mutex<HashMap<DeviceId, Arc<OnceCell<Arc<Session>>>>>,
}

impl SessionRegistry {
    pub fn new(network: Arc<dyn Network>, dictionaries: Arc<dyn DictionaryStore>) -> Self {
        Self {
            network,
            dictionaries,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `device`, opening it on first use
    pub async fn get_or_create(&self, device: DeviceId) -> Result<Arc<Session>> {
        let cell = self.sessions.lock().entry(device).or_default().clone();
        let session = cell.get_or_try_init(|| self.open(device)).await?;
        Ok(session.clone())
    }

    /// Persist a device dictionary, then open (and cache) its session.
    ///
    /// An already cached session keeps running on the dictionary it was
    /// opened with; the new one takes effect on the next process start.
    pub async fn create_device(&self, device: DeviceId, dictionary: &[u8]) -> Result<()> {
        self.dictionaries
            .save_dictionary(device, dictionary)
            .await?;
        info!(device_id = %device, size = dictionary.len(), "Device dictionary registered");
        self.get_or_create(device).await?;
        Ok(())
    }

    /// Open sessions for every device with a stored dictionary.
    ///
    /// Failures are logged per device and do not stop the others. Returns the
    /// number of sessions available afterwards.
    pub async fn warm_up(&self) -> Result<usize> {
        let ids = self.dictionaries.list_device_ids().await?;
        let mut opened = 0;
        for id in ids {
            match self.get_or_create(id).await {
                Ok(_) => opened += 1,
                Err(e) => warn!(device_id = %id, error = %e, "Could not open session"),
            }
        }
        Ok(opened)
    }

    /// Ids with an initialised session
    pub fn cached_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    async fn open(&self, device: DeviceId) -> Result<Arc<Session>> {
        debug!(device_id = %device, "Opening session");

        let dictionary = self
            .dictionaries
            .load_dictionary(device)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(reason) => Error::DictionaryNotFound { device, reason },
                other => other.into(),
            })?;

        let node = self
            .network
            .create_node(device, &dictionary)
            .await
            .map_err(|e| match e {
                ProtocolError::Dictionary(reason) => Error::DictionaryNotFound { device, reason },
                other => other.into(),
            })?;

        let session = Arc::new(Session::new(node));
        info!(device_id = %device, "Session opened, listening for heartbeat");
        Ok(session)
    }
}
