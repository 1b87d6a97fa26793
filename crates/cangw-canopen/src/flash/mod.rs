//! Firmware flash orchestration
//!
//! Orders are admitted by the [`FlashQueue`] and executed one at a time by
//! its worker, which hands each order to the [`FlashMachine`].

mod machine;
mod queue;

pub use machine::{FlashMachine, ProgramControl};
pub use queue::FlashQueue;
