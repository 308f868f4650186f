//! Recording and replay of device traffic.
//!
//! The [`Recorder`] observes packets routed through a
//! [`Router`](crate::device::Router) and writes them to a
//! [`streamfile`] directory. The [`Player`] reads a stream file back and
//! re-injects its packets with the recorded timing.

pub mod streamfile;

mod player;
mod recorder;

pub use player::{NoRouteEntry, PacketSink, PlaybackLeaser, Player, PlayerStatus};
pub use recorder::{Recorder, RecorderStatus};
