//! Shared data models for the gateway

mod device;
mod flash;

pub use device::*;
pub use flash::*;
