//! Flash phase machine
//!
//! Drives one [`FlashOrder`] through the program download sequence. The
//! phase is persisted before its action runs, so the stored record always
//! names the step the device is in (or the one that failed).

use std::future::Future;
use std::sync::Arc;

use cangw_core::{Error, FlashOrder, FlashPhase, FlashStateStore, NmtCommand, Result};
use tracing::{debug, error, info, warn};

use crate::config::{EntryAddress, FlashConfig};
use crate::gate::BusGate;
use crate::session::{Session, SessionRegistry};

/// Commands written to the program control object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgramControl {
    Stop = 0,
    Start = 1,
    Reset = 2,
    Clear = 3,
    Ack = 0x80,
}

impl ProgramControl {
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub struct FlashMachine {
    registry: Arc<SessionRegistry>,
    gate: Arc<BusGate>,
    states: Arc<dyn FlashStateStore>,
    config: FlashConfig,
}

impl FlashMachine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gate: Arc<BusGate>,
        states: Arc<dyn FlashStateStore>,
        config: FlashConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            states,
            config,
        }
    }

    /// Run an order to completion and return the terminal phase reached.
    ///
    /// Failures never escape: they end up in the order's record as
    /// [`FlashPhase::Error`].
    pub async fn run(&self, order: &FlashOrder) -> FlashPhase {
        info!(
            order_id = %order.order_id,
            device_id = %order.device_id,
            size = order.payload.len(),
            expected_version = ?order.expected_version,
            "Flash started"
        );

        let session = match self.registry.get_or_create(order.device_id).await {
            Ok(session) => session,
            Err(e) => {
                self.abort(order, None, &e).await;
                return FlashPhase::Error;
            }
        };

        match self.execute(order, &session).await {
            Ok(()) => {
                info!(order_id = %order.order_id, device_id = %order.device_id, "Flash finished");
                FlashPhase::Finish
            }
            Err(e) => {
                // the image is already acknowledged when only the final record fails
                let acknowledged = matches!(
                    e,
                    Error::PhaseFailure {
                        phase: FlashPhase::Finish,
                        ..
                    }
                );
                let reset = if acknowledged { None } else { Some(&*session) };
                self.abort(order, reset, &e).await;
                FlashPhase::Error
            }
        }
    }

    async fn execute(&self, order: &FlashOrder, session: &Session) -> Result<()> {
        let objects = &self.config.objects;

        self.step(
            order,
            FlashPhase::PreOperational,
            self.gate.write_state(session, NmtCommand::PreOperational),
        )
        .await?;

        self.step(
            order,
            FlashPhase::ProgramStopBefore,
            self.control(session, ProgramControl::Stop),
        )
        .await?;

        self.step(
            order,
            FlashPhase::ProgramClear,
            self.control(session, ProgramControl::Clear),
        )
        .await?;

        self.step(
            order,
            FlashPhase::ProgramWriteData,
            self.write(session, objects.program_data, &order.payload),
        )
        .await?;

        self.step(order, FlashPhase::ProgramWriteFinish, async {
            let status = self.read(session, objects.flash_status).await?;
            expect_zero("flash status", &status)
        })
        .await?;

        self.step(
            order,
            FlashPhase::ProgramStopAfter,
            self.control(session, ProgramControl::Stop),
        )
        .await?;

        tokio::time::sleep(self.config.settle_before_start()).await;
        self.step(
            order,
            FlashPhase::ProgramStart,
            self.control(session, ProgramControl::Start),
        )
        .await?;

        tokio::time::sleep(self.config.boot_delay()).await;
        self.step(order, FlashPhase::ProgramCheckError, async {
            let register = self.read(session, objects.error_register).await?;
            expect_zero("error register", &register)
        })
        .await?;

        let version = self
            .step(order, FlashPhase::ProgramCheckVersion, async {
                let raw = self.read(session, objects.software_version).await?;
                Ok::<_, Error>(decode_version(&raw))
            })
            .await?;

        match order.expected_version.as_deref() {
            Some(expected) if expected == version => {
                self.step(
                    order,
                    FlashPhase::ProgramAck,
                    self.control(session, ProgramControl::Ack),
                )
                .await?;
            }
            expected => {
                self.persist(order, FlashPhase::ProgramAck).await?;
                info!(
                    order_id = %order.order_id,
                    reported = %version,
                    expected = ?expected,
                    "Version not confirmed, application left unacknowledged"
                );
            }
        }

        self.persist(order, FlashPhase::Finish).await?;
        Ok(())
    }

    /// Persist `phase`, then run its action. Failures of either are reported
    /// against `phase`.
    async fn step<T, F>(&self, order: &FlashOrder, phase: FlashPhase, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.persist(order, phase).await?;
        action
            .await
            .map_err(|cause| Error::phase_failure(phase, cause))
    }

    async fn persist(&self, order: &FlashOrder, phase: FlashPhase) -> Result<()> {
        self.states
            .save_flash_state(order.order_id, phase, None)
            .await
            .map_err(|e| Error::phase_failure(phase, e.into()))?;
        info!(
            order_id = %order.order_id,
            device_id = %order.device_id,
            %phase,
            "{}",
            phase.description()
        );
        Ok(())
    }

    /// Record the failure, then reset the device through `reset` if given
    async fn abort(&self, order: &FlashOrder, reset: Option<&Session>, err: &Error) {
        error!(order_id = %order.order_id, device_id = %order.device_id, error = %err, "Flash failed");

        let message = err.to_string();
        if let Err(e) = self
            .states
            .save_flash_state(order.order_id, FlashPhase::Error, Some(&message))
            .await
        {
            error!(order_id = %order.order_id, error = %e, "Could not record flash failure");
        }

        let Some(session) = reset else {
            debug!(order_id = %order.order_id, "Reset skipped");
            return;
        };
        if let Err(e) = self.gate.write_state(session, NmtCommand::ResetNode).await {
            warn!(device_id = %order.device_id, error = %e, "Reset after failed flash did not go through");
        }
    }

    async fn control(&self, session: &Session, command: ProgramControl) -> Result<()> {
        self.write(session, self.config.objects.program_control, &[command.code()])
            .await
    }

    async fn write(&self, session: &Session, at: EntryAddress, data: &[u8]) -> Result<()> {
        self.gate
            .write_entry(session, at.index, at.subindex, data)
            .await
    }

    async fn read(&self, session: &Session, at: EntryAddress) -> Result<Vec<u8>> {
        self.gate.read_entry(session, at.index, at.subindex).await
    }
}

/// First byte of a status object must be zero
fn expect_zero(what: &str, value: &[u8]) -> Result<()> {
    match value.first() {
        Some(0) => Ok(()),
        Some(&status) => Err(Error::DeviceRejected {
            code: status as u32,
            message: format!("{} {}", what, status),
        }),
        None => Err(Error::DeviceRejected {
            code: 0,
            message: format!("empty {}", what),
        }),
    }
}

/// Version string without its NUL padding
fn decode_version(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sim::{SimNetwork, SimNode};
    use crate::protocol::{ProtocolError, SdoAbortCode};
    use async_trait::async_trait;
    use cangw_core::{DeviceId, DictionaryStore, FlashState, OrderId, StoreError, StoreResult};
    use cangw_store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const EDS: &[u8] = b"[FileInfo]\nFileName=flashable.eds\n";
    const DEVICE: DeviceId = DeviceId(9);

    fn fast_config() -> FlashConfig {
        FlashConfig {
            settle_before_start_ms: 0,
            boot_delay_ms: 0,
            ..FlashConfig::default()
        }
    }

    struct Fixture {
        machine: FlashMachine,
        network: Arc<SimNetwork>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            Self::with_states(store.clone(), store).await
        }

        async fn with_states(store: Arc<MemoryStore>, states: Arc<dyn FlashStateStore>) -> Self {
            store.save_dictionary(DEVICE, EDS).await.unwrap();
            let network = Arc::new(SimNetwork::new());
            let node = network.node(DEVICE);
            node.set_value(0x1F57, 1, vec![0x00]);
            node.set_value(0x1001, 0, vec![0x00]);
            node.set_value(0x100A, 0, b"1.2.0\0\0".to_vec());

            let registry = Arc::new(SessionRegistry::new(network.clone(), store.clone()));
            let gate = Arc::new(BusGate::new(Duration::ZERO));
            let machine = FlashMachine::new(registry, gate, states, fast_config());
            Self {
                machine,
                network,
                store,
            }
        }

        fn node(&self) -> Arc<SimNode> {
            self.network.node(DEVICE)
        }

        async fn submit(&self, states: &dyn FlashStateStore, version: Option<&str>) -> FlashOrder {
            let order = FlashOrder::new(DEVICE, vec![0xAA; 64], version.map(str::to_string));
            states
                .save_flash_state(order.order_id, FlashPhase::Requested, None)
                .await
                .unwrap();
            order
        }

        async fn state(&self, order: &FlashOrder) -> FlashState {
            self.store.load_flash_state(order.order_id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_full_sequence_writes_expected_commands() {
        let fx = Fixture::new().await;
        let order = fx.submit(fx.store.as_ref(), Some("1.2.0")).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Finish);

        let node = fx.node();
        assert_eq!(node.nmt_commands(), vec![NmtCommand::PreOperational]);
        assert_eq!(
            node.writes_to(0x1F51, 1),
            vec![vec![0x00], vec![0x03], vec![0x00], vec![0x01], vec![0x80]]
        );
        assert_eq!(node.writes_to(0x1F50, 1), vec![vec![0xAA; 64]]);

        let state = fx.state(&order).await;
        assert_eq!(state.phase, FlashPhase::Finish);
        assert!(state.started_at.is_some());
        assert!(state.finished_at.is_some());
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn test_no_expected_version_skips_ack() {
        let fx = Fixture::new().await;
        let order = fx.submit(fx.store.as_ref(), None).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Finish);
        assert!(!fx.node().writes_to(0x1F51, 1).contains(&vec![0x80]));
    }

    #[tokio::test]
    async fn test_empty_version_finishes_without_ack() {
        let fx = Fixture::new().await;
        fx.node().set_value(0x100A, 0, Vec::<u8>::new());
        let unversioned = fx.submit(fx.store.as_ref(), None).await;

        assert_eq!(fx.machine.run(&unversioned).await, FlashPhase::Finish);

        let state = fx.state(&unversioned).await;
        assert_eq!(state.error, None);
        assert_eq!(fx.node().nmt_commands(), vec![NmtCommand::PreOperational]);

        let versioned = fx.submit(fx.store.as_ref(), Some("1.2.0")).await;
        assert_eq!(fx.machine.run(&versioned).await, FlashPhase::Finish);
        assert!(!fx.node().writes_to(0x1F51, 1).contains(&vec![0x80]));
    }

    #[tokio::test]
    async fn test_version_must_match_exactly() {
        let fx = Fixture::new().await;
        fx.node().set_value(0x100A, 0, b"1.2.0 \0".to_vec());
        let order = fx.submit(fx.store.as_ref(), Some("1.2.0")).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Finish);
        assert!(!fx.node().writes_to(0x1F51, 1).contains(&vec![0x80]));
    }

    #[tokio::test]
    async fn test_error_register_set_after_boot() {
        let fx = Fixture::new().await;
        fx.node().set_value(0x1001, 0, vec![0x11]);
        let order = fx.submit(fx.store.as_ref(), Some("1.2.0")).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Error);

        let state = fx.state(&order).await;
        let message = state.error.unwrap();
        assert!(message.contains("program_check_error"), "{}", message);
        assert!(message.contains("17"), "{}", message);
        assert_eq!(
            fx.node().nmt_commands(),
            vec![NmtCommand::PreOperational, NmtCommand::ResetNode]
        );
    }

    #[tokio::test]
    async fn test_sdo_abort_stops_sequence() {
        let fx = Fixture::new().await;
        fx.node().fail_write(
            0x1F50,
            1,
            ProtocolError::abort(SdoAbortCode::CannotStoreDeviceState),
        );
        let order = fx.submit(fx.store.as_ref(), Some("1.2.0")).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Error);

        let state = fx.state(&order).await;
        assert!(state.error.unwrap().contains("program_write_data"));
        // CLEAR was the last control write, nothing after the failed download
        assert_eq!(fx.node().writes_to(0x1F51, 1), vec![vec![0x00], vec![0x03]]);
    }

    #[tokio::test]
    async fn test_failed_reset_is_not_propagated() {
        let fx = Fixture::new().await;
        let node = fx.node();
        node.fail_nmt(Some(ProtocolError::Transport("bus off".to_string())));
        let order = fx.submit(fx.store.as_ref(), None).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Error);

        let state = fx.state(&order).await;
        assert!(state.error.unwrap().contains("pre_operational"));
        assert!(state.finished_at.is_some());
        // the reset was attempted and failed the same way
        assert_eq!(
            node.nmt_commands(),
            vec![NmtCommand::PreOperational, NmtCommand::ResetNode]
        );
        assert!(node.writes_to(0x1F51, 1).is_empty());
    }

    #[tokio::test]
    async fn test_missing_dictionary_records_error_without_reset() {
        let fx = Fixture::new().await;
        let order = FlashOrder::new(DeviceId(77), vec![1, 2, 3], None);
        fx.store
            .save_flash_state(order.order_id, FlashPhase::Requested, None)
            .await
            .unwrap();

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Error);

        let state = fx.state(&order).await;
        assert_eq!(state.started_at, None);
        assert!(state.error.unwrap().contains("77"));
        assert!(fx.network.node(DeviceId(77)).commands().is_empty());
    }

    /// Fails every write of one phase
    struct FailingStates {
        inner: Arc<MemoryStore>,
        fail_at: FlashPhase,
    }

    #[async_trait]
    impl FlashStateStore for FailingStates {
        async fn save_flash_state(
            &self,
            order: OrderId,
            phase: FlashPhase,
            error: Option<&str>,
        ) -> StoreResult<FlashState> {
            if phase == self.fail_at {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.save_flash_state(order, phase, error).await
        }

        async fn load_flash_state(&self, order: OrderId) -> StoreResult<FlashState> {
            self.inner.load_flash_state(order).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_skips_action_and_resets() {
        let store = Arc::new(MemoryStore::new());
        let states = Arc::new(FailingStates {
            inner: store.clone(),
            fail_at: FlashPhase::ProgramClear,
        });
        let fx = Fixture::with_states(store, states.clone()).await;
        let order = fx.submit(states.as_ref(), None).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Error);

        let state = fx.state(&order).await;
        assert_eq!(state.phase, FlashPhase::Error);
        let message = state.error.unwrap();
        assert!(message.contains("disk full"), "{}", message);
        assert!(message.contains("program_clear"), "{}", message);
        // STOP went out, CLEAR did not
        assert_eq!(fx.node().writes_to(0x1F51, 1), vec![vec![0x00]]);
        assert_eq!(
            fx.node().nmt_commands(),
            vec![NmtCommand::PreOperational, NmtCommand::ResetNode]
        );
    }

    #[tokio::test]
    async fn test_unrecorded_finish_does_not_reset_device() {
        let store = Arc::new(MemoryStore::new());
        let states = Arc::new(FailingStates {
            inner: store.clone(),
            fail_at: FlashPhase::Finish,
        });
        let fx = Fixture::with_states(store, states.clone()).await;
        let order = fx.submit(states.as_ref(), Some("1.2.0")).await;

        assert_eq!(fx.machine.run(&order).await, FlashPhase::Error);

        let state = fx.state(&order).await;
        assert_eq!(state.phase, FlashPhase::Error);
        assert!(state.error.unwrap().contains("finish"));
        assert_eq!(fx.node().writes_to(0x1F51, 1).last(), Some(&vec![0x80]));
        assert_eq!(fx.node().nmt_commands(), vec![NmtCommand::PreOperational]);
    }

    #[test]
    fn test_decode_version_trims_padding() {
        assert_eq!(decode_version(b"1.2.0\0\0"), "1.2.0");
        assert_eq!(decode_version(b"2.0 \r\n"), "2.0 \r\n");
        assert_eq!(decode_version(b"\0\0"), "");
        assert_eq!(decode_version(b""), "");
    }

    #[test]
    fn test_expect_zero() {
        assert!(expect_zero("flash status", &[0x00, 0xFF]).is_ok());
        let err = expect_zero("flash status", &[0x03]).unwrap_err();
        assert!(err.to_string().contains("flash status 3"));
        assert!(expect_zero("flash status", &[]).is_err());
    }
}
