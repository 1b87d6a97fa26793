//! Simulated CANopen network
//!
//! Nodes answer SDO reads from a value table, remember every write, follow
//! NMT commands and emit heartbeats on demand. Failures can be scripted per
//! object or for NMT. All nodes of one [`SimNetwork`] share a [`BusMonitor`]
//! that records how many transactions overlapped on the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cangw_core::{DeviceId, NmtCommand, NmtState};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use super::{Network, NodeHandle, ProtocolError, SdoAbortCode};

/// Tracks concurrent transactions across all simulated nodes
#[derive(Debug, Default)]
pub struct BusMonitor {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl BusMonitor {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous transactions observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of transactions issued so far
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// A command received by a simulated node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    Nmt(NmtCommand),
    Read { index: u16, subindex: u8 },
    Write { index: u16, subindex: u8, data: Vec<u8> },
}

/// Simulated remote node
pub struct SimNode {
    device_id: DeviceId,
    monitor: Arc<BusMonitor>,
    latency: RwLock<Duration>,
    heartbeat_tx: watch::Sender<NmtState>,
    values: RwLock<HashMap<(u16, u8), Vec<u8>>>,
    read_failures: RwLock<HashMap<(u16, u8), ProtocolError>>,
    write_failures: RwLock<HashMap<(u16, u8), ProtocolError>>,
    nmt_failure: RwLock<Option<ProtocolError>>,
    log: RwLock<Vec<SimCommand>>,
}

impl SimNode {
    fn new(device_id: DeviceId, monitor: Arc<BusMonitor>) -> Self {
        let (heartbeat_tx, _) = watch::channel(NmtState::Unknown);
        Self {
            device_id,
            monitor,
            latency: RwLock::new(Duration::ZERO),
            heartbeat_tx,
            values: RwLock::new(HashMap::new()),
            read_failures: RwLock::new(HashMap::new()),
            write_failures: RwLock::new(HashMap::new()),
            nmt_failure: RwLock::new(None),
            log: RwLock::new(Vec::new()),
        }
    }

    /// Simulated round-trip time of each transaction
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Value returned by SDO reads of an object
    pub fn set_value(&self, index: u16, subindex: u8, value: impl Into<Vec<u8>>) {
        self.values.write().insert((index, subindex), value.into());
    }

    pub fn fail_read(&self, index: u16, subindex: u8, error: ProtocolError) {
        self.read_failures.write().insert((index, subindex), error);
    }

    pub fn fail_write(&self, index: u16, subindex: u8, error: ProtocolError) {
        self.write_failures.write().insert((index, subindex), error);
    }

    pub fn fail_nmt(&self, error: Option<ProtocolError>) {
        *self.nmt_failure.write() = error;
    }

    /// Broadcast a heartbeat carrying the current state
    pub fn emit_heartbeat(&self) {
        let state = *self.heartbeat_tx.borrow();
        self.heartbeat_tx.send_replace(state);
    }

    /// Broadcast a heartbeat reporting `state`
    pub fn report_state(&self, state: NmtState) {
        self.heartbeat_tx.send_replace(state);
    }

    /// Every command received so far, oldest first
    pub fn commands(&self) -> Vec<SimCommand> {
        self.log.read().clone()
    }

    /// Values written to one object, oldest first
    pub fn writes_to(&self, index: u16, subindex: u8) -> Vec<Vec<u8>> {
        self.log
            .read()
            .iter()
            .filter_map(|cmd| match cmd {
                SimCommand::Write {
                    index: i,
                    subindex: s,
                    data,
                } if *i == index && *s == subindex => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn nmt_commands(&self) -> Vec<NmtCommand> {
        self.log
            .read()
            .iter()
            .filter_map(|cmd| match cmd {
                SimCommand::Nmt(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    async fn transaction(&self, command: SimCommand) {
        self.monitor.enter();
        let latency = *self.latency.read();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
        debug!(device_id = %self.device_id, ?command, "Simulated node: command received");
        self.log.write().push(command);
        self.monitor.exit();
    }
}

#[async_trait]
impl NodeHandle for SimNode {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn listen_for_heartbeat(&self) -> watch::Receiver<NmtState> {
        self.heartbeat_tx.subscribe()
    }

    fn nmt_state(&self) -> NmtState {
        *self.heartbeat_tx.borrow()
    }

    async fn set_nmt_state(&self, command: NmtCommand) -> Result<(), ProtocolError> {
        self.transaction(SimCommand::Nmt(command)).await;
        if let Some(err) = self.nmt_failure.read().clone() {
            return Err(err);
        }

        // The node reports its new state with the next heartbeat; resets come
        // back through boot-up into pre-operational.
        let state = match command {
            NmtCommand::Operational => NmtState::Operational,
            NmtCommand::Stopped => NmtState::Stopped,
            NmtCommand::PreOperational
            | NmtCommand::ResetNode
            | NmtCommand::ResetCommunication => NmtState::PreOperational,
        };
        self.heartbeat_tx.send_replace(state);
        Ok(())
    }

    async fn sdo_read(&self, index: u16, subindex: u8) -> Result<Vec<u8>, ProtocolError> {
        self.transaction(SimCommand::Read { index, subindex }).await;
        if let Some(err) = self.read_failures.read().get(&(index, subindex)).cloned() {
            return Err(err);
        }
        self.values
            .read()
            .get(&(index, subindex))
            .cloned()
            .ok_or_else(|| ProtocolError::abort(SdoAbortCode::ObjectDoesNotExist))
    }

    async fn sdo_write(
        &self,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        self.transaction(SimCommand::Write {
            index,
            subindex,
            data: data.to_vec(),
        })
        .await;
        if let Some(err) = self.write_failures.read().get(&(index, subindex)).cloned() {
            return Err(err);
        }
        self.values.write().insert((index, subindex), data.to_vec());
        Ok(())
    }
}

/// Simulated bus holding any number of [`SimNode`]s
#[derive(Default)]
pub struct SimNetwork {
    nodes: RwLock<HashMap<DeviceId, Arc<SimNode>>>,
    monitor: Arc<BusMonitor>,
    created: AtomicUsize,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `device`, created on first access so tests can script it
    /// before the gateway opens a session
    pub fn node(&self, device: DeviceId) -> Arc<SimNode> {
        self.nodes
            .write()
            .entry(device)
            .or_insert_with(|| Arc::new(SimNode::new(device, self.monitor.clone())))
            .clone()
    }

    pub fn monitor(&self) -> &BusMonitor {
        &self.monitor
    }

    /// Number of successful `create_node` calls
    pub fn nodes_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// Minimal EDS sanity check: UTF-8 text with at least one `[section]`
fn check_dictionary(dictionary: &[u8]) -> Result<(), ProtocolError> {
    let text = std::str::from_utf8(dictionary)
        .map_err(|e| ProtocolError::Dictionary(format!("not UTF-8 text: {}", e)))?;
    let has_section = text.lines().any(|line| {
        let line = line.trim();
        line.starts_with('[') && line.ends_with(']')
    });
    if !has_section {
        return Err(ProtocolError::Dictionary(
            "no [section] header found".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl Network for SimNetwork {
    async fn create_node(
        &self,
        device: DeviceId,
        dictionary: &[u8],
    ) -> Result<Arc<dyn NodeHandle>, ProtocolError> {
        check_dictionary(dictionary)?;
        // Give concurrent callers a chance to interleave with node creation
        tokio::task::yield_now().await;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.node(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_malformed_dictionary() {
        let network = SimNetwork::new();
        let result = network.create_node(DeviceId(1), &[0xFF, 0xFE]).await;
        assert!(matches!(result, Err(ProtocolError::Dictionary(_))));
        let result = network.create_node(DeviceId(1), b"no sections here").await;
        assert!(matches!(result, Err(ProtocolError::Dictionary(_))));
        assert_eq!(network.nodes_created(), 0);
    }

    #[tokio::test]
    async fn test_reads_return_scripted_values() {
        let network = SimNetwork::new();
        let node = network.node(DeviceId(3));
        node.set_value(0x1001, 0, vec![0x00]);

        assert_eq!(node.sdo_read(0x1001, 0).await.unwrap(), vec![0x00]);
        assert!(matches!(
            node.sdo_read(0x2000, 1).await,
            Err(ProtocolError::Abort { code: 0x0602_0000 })
        ));
        assert_eq!(network.monitor().total(), 2);
    }

    #[tokio::test]
    async fn test_nmt_command_is_reported_by_heartbeat() {
        let network = SimNetwork::new();
        let node = network.node(DeviceId(3));
        let mut heartbeat = node.listen_for_heartbeat();

        node.set_nmt_state(NmtCommand::Operational).await.unwrap();

        heartbeat.changed().await.unwrap();
        assert_eq!(*heartbeat.borrow(), NmtState::Operational);
        assert_eq!(node.nmt_commands(), vec![NmtCommand::Operational]);
    }
}
