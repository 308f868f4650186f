//! Device impersonation (man-in-the-middle proxying).
//!
//! The proxy [`Manager`] creates a [`Local`](crate::device::Local) stand-in
//! for each observed remote device. Traffic sent to a stand-in is parsed,
//! fanned out to proxy listeners (where it can be recorded or inspected),
//! and forwarded to the real device — unless a lease is held, in which
//! case forwarding pauses so another subsystem (such as the replay player)
//! can drive the devices instead.

mod autoresume;
mod manager;

pub use autoresume::AutoResumeListener;
pub use manager::{Manager, ProxyLease, ProxyListener};
