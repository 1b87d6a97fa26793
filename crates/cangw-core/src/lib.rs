//! cangw-core - Core types and traits for the CANopen gateway
//!
//! This crate holds everything the gateway layers agree on: device and order
//! identifiers, the flash phase enumeration with its persistence rules, NMT
//! state types, the error taxonomy and the durable store contracts.

pub mod error;
pub mod models;
pub mod store;

pub use error::{Error, Result};
pub use models::*;
pub use store::{next_flash_state, DictionaryStore, FlashStateStore, StoreError, StoreResult};
