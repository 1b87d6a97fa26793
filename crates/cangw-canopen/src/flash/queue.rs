//! Bounded flash order queue with a single worker

use std::sync::Arc;

use cangw_core::{Error, FlashOrder, FlashPhase, FlashStateStore, OrderId, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::FlashMachine;

/// FIFO admission of flash orders.
///
/// `capacity` orders may wait behind the one being executed. The record of
/// an order is created only once it is certain to be queued, so a rejected
/// submit leaves nothing behind.
pub struct FlashQueue {
    sender: Mutex<Option<mpsc::Sender<FlashOrder>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    states: Arc<dyn FlashStateStore>,
}

impl FlashQueue {
    /// Create the queue and spawn its worker on the current runtime
    pub fn start(
        capacity: usize,
        states: Arc<dyn FlashStateStore>,
        machine: Arc<FlashMachine>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(rx, machine));
        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            states,
        }
    }

    /// Admit an order without waiting for a free slot
    pub async fn submit(&self, order: FlashOrder) -> Result<OrderId> {
        let sender = self.sender.lock().clone().ok_or(Error::ShuttingDown)?;
        let permit = sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => Error::QueueFull,
            TrySendError::Closed(()) => Error::ShuttingDown,
        })?;

        let order_id = order.order_id;
        self.states
            .save_flash_state(order_id, FlashPhase::Requested, None)
            .await?;
        info!(
            order_id = %order_id,
            device_id = %order.device_id,
            size = order.payload.len(),
            "Flash order queued"
        );
        permit.send(order);
        Ok(order_id)
    }

    /// Stop admitting orders and wait for the worker to drain the queue
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Flash worker ended abnormally");
            }
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<FlashOrder>, machine: Arc<FlashMachine>) {
    debug!("Flash worker started");
    while let Some(order) = rx.recv().await {
        let phase = machine.run(&order).await;
        debug!(order_id = %order.order_id, %phase, "Flash order done");
    }
    debug!("Flash worker stopped");
}
