//! SCPI message encoding, reply decoding and definite-length block framing.

pub mod block;
pub mod codec;
pub mod command;

pub use block::{BlockTarget, BlockTransferDescriptor, Direction, Endian};
pub use codec::ScpiCodec;
pub use command::{Arg, Command, CommandBuilder, CommandKind};
