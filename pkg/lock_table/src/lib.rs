#[macro_use]
extern crate common;

pub mod partition;
pub mod server;

pub use crate::server::LtServer;
