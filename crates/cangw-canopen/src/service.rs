//! Gateway operations
//!
//! [`CanOpenService`] is what a transport layer (REST handlers, CLI, tests)
//! talks to. It owns the session registry, the bus gate and the flash queue
//! and routes each operation through them.

use std::sync::Arc;

use bytes::Bytes;
use cangw_core::{
    DeviceId, DictionaryStore, Error, FlashOrder, FlashState, FlashStateStore, NmtCommand,
    OrderId, Result, StoreError,
};
use cangw_store::FileStorage;
use tracing::info;

use crate::config::CanGwConfig;
use crate::flash::{FlashMachine, FlashQueue};
use crate::gate::BusGate;
use crate::protocol::Network;
use crate::session::SessionRegistry;

pub struct CanOpenService {
    registry: Arc<SessionRegistry>,
    gate: Arc<BusGate>,
    queue: FlashQueue,
    dictionaries: Arc<dyn DictionaryStore>,
    states: Arc<dyn FlashStateStore>,
}

impl CanOpenService {
    /// Open the on-disk storage named by `config` and start the flash worker
    pub async fn open(config: &CanGwConfig, network: Arc<dyn Network>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let storage = Arc::new(FileStorage::open(&config.storage.path).await?);
        info!(path = %config.storage.path.display(), "Storage opened");
        Ok(Self::with_stores(config, network, storage.clone(), storage))
    }

    /// Build the service on caller-provided stores. Must be called inside a
    /// tokio runtime.
    pub fn with_stores(
        config: &CanGwConfig,
        network: Arc<dyn Network>,
        dictionaries: Arc<dyn DictionaryStore>,
        states: Arc<dyn FlashStateStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(network, dictionaries.clone()));
        let gate = Arc::new(BusGate::new(config.bus.heartbeat_timeout()));
        let machine = Arc::new(FlashMachine::new(
            registry.clone(),
            gate.clone(),
            states.clone(),
            config.flash.clone(),
        ));
        let queue = FlashQueue::start(config.flash.queue_capacity, states.clone(), machine);

        Self {
            registry,
            gate,
            queue,
            dictionaries,
            states,
        }
    }

    /// NMT state as reported by the device's heartbeat, e.g. `"OPERATIONAL"`
    pub async fn read_device_state(&self, device: DeviceId) -> Result<String> {
        let session = self.registry.get_or_create(device).await?;
        let state = self.gate.read_state(&session).await?;
        Ok(state.as_str().to_string())
    }

    /// Command a device into `target` (`"OPERATIONAL"`, `"RESET"`, ...)
    pub async fn write_device_state(&self, device: DeviceId, target: &str) -> Result<()> {
        let command: NmtCommand = target.parse()?;
        let session = self.registry.get_or_create(device).await?;
        self.gate.write_state(&session, command).await
    }

    pub async fn read_dictionary_entry(
        &self,
        device: DeviceId,
        index: u16,
        subindex: u8,
    ) -> Result<Vec<u8>> {
        let session = self.registry.get_or_create(device).await?;
        self.gate.read_entry(&session, index, subindex).await
    }

    pub async fn write_dictionary_entry(
        &self,
        device: DeviceId,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<()> {
        let session = self.registry.get_or_create(device).await?;
        self.gate.write_entry(&session, index, subindex, data).await
    }

    /// Store a device's object dictionary and open its session
    pub async fn register_device(&self, device: DeviceId, dictionary: &[u8]) -> Result<()> {
        self.registry.create_device(device, dictionary).await
    }

    /// Queue a firmware image for `device`. Progress is available through
    /// [`query_flash_state`](Self::query_flash_state) under the returned id.
    pub async fn submit_flash(
        &self,
        device: DeviceId,
        payload: impl Into<Bytes>,
        expected_version: Option<String>,
    ) -> Result<OrderId> {
        let order = FlashOrder::new(device, payload, expected_version);
        self.queue.submit(order).await
    }

    pub async fn query_flash_state(&self, order: OrderId) -> Result<FlashState> {
        self.states
            .load_flash_state(order)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => Error::OrderNotFound(order),
                other => other.into(),
            })
    }

    /// Devices with a stored object dictionary
    pub async fn list_devices(&self) -> Result<Vec<DeviceId>> {
        Ok(self.dictionaries.list_device_ids().await?)
    }

    /// Open sessions for every known device ahead of the first request
    pub async fn warm_up(&self) -> Result<usize> {
        self.registry.warm_up().await
    }

    /// Reject new flash orders and wait for the queued ones to finish
    pub async fn shutdown(&self) {
        info!("Shutting down, draining flash queue");
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sim::SimNetwork;
    use cangw_core::NmtState;
    use cangw_store::MemoryStore;
    use std::time::Duration;

    const EDS: &[u8] = b"[FileInfo]\nFileName=svc.eds\n";

    fn service(network: Arc<SimNetwork>) -> CanOpenService {
        let mut config = CanGwConfig::default();
        config.bus.heartbeat_timeout_ms = 0;
        let store = Arc::new(MemoryStore::new());
        CanOpenService::with_stores(&config, network, store.clone(), store)
    }

    #[tokio::test]
    async fn test_write_then_read_state() {
        let network = Arc::new(SimNetwork::new());
        let svc = service(network.clone());
        svc.register_device(DeviceId(4), EDS).await.unwrap();

        svc.write_device_state(DeviceId(4), "operational")
            .await
            .unwrap();
        assert_eq!(svc.read_device_state(DeviceId(4)).await.unwrap(), "OPERATIONAL");

        let err = svc
            .write_device_state(DeviceId(4), "hibernate")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_dictionary_entry_round_trip_through_gate() {
        let network = Arc::new(SimNetwork::new());
        let svc = service(network.clone());
        svc.register_device(DeviceId(6), EDS).await.unwrap();

        svc.write_dictionary_entry(DeviceId(6), 0x2000, 1, &[0x12, 0x34])
            .await
            .unwrap();
        assert_eq!(
            svc.read_dictionary_entry(DeviceId(6), 0x2000, 1).await.unwrap(),
            vec![0x12, 0x34]
        );
        assert_eq!(svc.list_devices().await.unwrap(), vec![DeviceId(6)]);
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let svc = service(Arc::new(SimNetwork::new()));
        let order = OrderId::new();
        let err = svc.query_flash_state(order).await.unwrap_err();
        assert!(matches!(err, Error::OrderNotFound(id) if id == order));
    }

    #[tokio::test]
    async fn test_read_state_without_heartbeat_reports_unknown() {
        let network = Arc::new(SimNetwork::new());
        let mut config = CanGwConfig::default();
        config.bus.heartbeat_timeout_ms = 5;
        let store = Arc::new(MemoryStore::new());
        let svc = CanOpenService::with_stores(&config, network, store.clone(), store);
        svc.register_device(DeviceId(8), EDS).await.unwrap();

        let started = tokio::time::Instant::now();
        let state = svc.read_device_state(DeviceId(8)).await.unwrap();
        assert_eq!(state, NmtState::Unknown.as_str());
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
