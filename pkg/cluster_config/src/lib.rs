#[macro_use]
extern crate common;
#[macro_use]
extern crate macros;

pub mod args;
pub mod ccs;
pub mod config;
pub mod exitcode;
pub mod hash;
pub mod pidfile;

pub use ccs::{CcsSource, NoneCcs, StaticCcs};
pub use config::{Config, ConfigBuilder, ServerEntry};
pub use exitcode::ExitCode;
pub use pidfile::{PidFile, PidFileError};
