//! Scan run control for a pixel readout chip: run numbering, a background
//! scan worker with cooperative stop, and the mask-stepping command loop.

mod cancel;
mod command;
mod config;
mod controller;
mod error;
mod hw;
mod ledger;
mod mask;
mod restore;
mod scans;
mod sequencer;
pub mod sim;

pub use cancel::*;
pub use command::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use hw::*;
pub use ledger::*;
pub use mask::*;
pub use restore::*;
pub use scans::*;
pub use sequencer::*;
