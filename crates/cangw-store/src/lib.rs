//! cangw-store - Durable storage backends for the CANopen gateway
//!
//! Both stores implement [`DictionaryStore`] and [`FlashStateStore`] from
//! `cangw-core`:
//!
//! - [`FileStorage`] keeps one directory per device with its `objdict.eds`
//!   and one YAML document per flash order under `flash/`.
//! - [`MemoryStore`] keeps everything in process memory.

mod file;
mod memory;

pub use cangw_core::{DictionaryStore, FlashStateStore, StoreError, StoreResult};
pub use file::FileStorage;
pub use memory::MemoryStore;
