//! cangw-canopen - CANopen device access and firmware flashing
//!
//! This crate sits between a transport layer and a CANopen stack. It caches
//! one session per device, serializes every bus transaction and runs
//! firmware flash orders from a durable queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CanOpenService                         │
//! │                                                             │
//! │  ┌─────────────────┐          ┌──────────────────────────┐  │
//! │  │ SessionRegistry │          │ FlashQueue (1 worker)    │  │
//! │  │ (per-id cache)  │◄─────────┤   └─► FlashMachine       │  │
//! │  └────────┬────────┘          └────────────┬─────────────┘  │
//! │           │                                │                │
//! │           │        ┌──────────────┐        │                │
//! │           └───────►│   BusGate    │◄───────┘                │
//! │                    │ (one in      │                         │
//! │                    │  flight)     │                         │
//! │                    └──────┬───────┘                         │
//! │                           │                                 │
//! │                 ┌─────────┴─────────┐                       │
//! │                 │ Network/NodeHandle│                       │
//! │                 │ (CANopen stack)   │                       │
//! │                 └───────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//!        DictionaryStore / FlashStateStore (cangw-store)
//! ```

pub mod config;
pub mod flash;
pub mod gate;
pub mod protocol;
pub mod service;
pub mod session;

pub use config::{CanGwConfig, ConfigError, EntryAddress, ProgramObjects};
pub use flash::{FlashMachine, FlashQueue, ProgramControl};
pub use gate::BusGate;
pub use protocol::{Network, NodeHandle, ProtocolError, SdoAbortCode};
pub use service::CanOpenService;
pub use session::{Session, SessionRegistry};

// Re-export for convenience
pub use cangw_core::{
    DeviceId, Error, FlashOrder, FlashPhase, FlashState, NmtCommand, NmtState, OrderId, Result,
};
