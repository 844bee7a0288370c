#[macro_use]
extern crate common;

pub mod route;
pub mod server;

pub use crate::server::LtpxServer;
