//! PixelPusher device blocks, commands, and pixel datagrams.
//!
//! PixelPusher beacons extend the generic device header with a
//! software-revision-gated block (see [`Device`]). Data traffic is a stream
//! of UDP datagrams, each beginning with a big-endian packet index and
//! carrying either a command (prefixed with [`COMMAND_MAGIC`]) or a run of
//! per-strip pixel states.

mod command;
mod discovery;
mod packet;
mod strip;

pub use command::{
    ColourOrder, Command, CommandId, LedConfigure, Security, COMMAND_MAGIC,
};
pub use discovery::{
    Device, PusherFlags, DEFAULT_PORT, LATEST_SOFTWARE_REVISION, LISTEN_PORT,
    MIN_ACCEPTABLE_SOFTWARE_REVISION,
};
pub use packet::{Packet, PacketBody, PacketReader, PacketStream};
pub use strip::{StripFlags, StripState};
