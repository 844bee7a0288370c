#[macro_use]
extern crate common;

pub mod codec;
pub mod conn;
pub mod opcode;
pub mod partitioning;
pub mod record;

pub use codec::{Decoder, DecodeError, Encoder};
pub use conn::{read_frame, write_frame};
pub use opcode::Opcode;
pub use partitioning::partition_of;
pub use record::*;
