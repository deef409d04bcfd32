//! open-g13-core: report decoding, bindings, macro playback and device output
//! for the Logitech G13 gameboard.
//!
//! This crate holds the device I/O and macro-execution engine. The binary
//! crate adds configuration files, the uinput keyboard and the command line.

pub mod bus;
pub mod buttons;
pub mod comm;
pub mod config;
pub mod control;
pub mod decoder;
pub mod device;
pub mod engine;
pub mod error;
#[cfg(test)]
mod integration_tests;
pub mod keys;
pub mod lcd;
pub mod macros;
pub mod output;
pub mod profile;
pub mod report;
pub mod resolver;
pub mod safety;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod transport;

pub use bus::{BusEvent, EventBus, Subscription};
pub use buttons::{ButtonId, Mode};
pub use config::EngineConfig;
pub use control::Controller;
pub use engine::Engine;
pub use error::{Error, Result};

/// Logitech USB Vendor ID.
pub const LOGITECH_VID: u16 = 0x046D;

/// Known Logitech G13 product IDs.
pub mod pids {
    /// G13 Advanced Gameboard.
    pub const G13: u16 = 0xC21C;
}
