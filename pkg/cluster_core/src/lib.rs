#[macro_use]
extern crate common;

pub mod conn;
pub mod core;
pub mod dump;
pub mod election;
pub mod fence;
pub mod heartbeat;
pub mod membership;
pub mod peer_probe;
pub mod registry;
pub mod replicate;

pub use crate::core::{Core, CoreState};
