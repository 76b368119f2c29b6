// Frame codec and one-off protocol message constructors.

pub mod codec;
pub mod constants;
pub mod server;

pub use codec::{
    FrameReader, Incoming, MessageBuffer, MessageWriter, ProtocolVersion, DUMP_VER_MIN,
    MAX_MESSAGE_SIZE, PROTO_VER_CURRENT, PROTO_VER_MIN,
};
pub use constants::*;
