//! Device discovery.
//!
//! PixelPusher devices announce themselves with periodic multicast beacons.
//! The [`Listener`] receives and parses them; the [`Registry`] turns
//! observations into [`Remote`] devices, refreshing an expiration deadline
//! on every beacon and marking a device done when its deadline lapses. The
//! [`Transmitter`] broadcasts beacons for locally hosted (e.g. proxy)
//! devices.
//!
//! [`Remote`]: crate::device::Remote

mod listener;
mod registry;
mod transmitter;

pub use listener::Listener;
pub use registry::{Registry, RegistryOptions};
pub use transmitter::Transmitter;

use crate::device::Remote;

/// Listens for discovery beacons on `listener` and registers every
/// observation with `registry`.
///
/// Runs until the listener fails. `on_new` is called for each device the
/// first time it is observed; returning `false` stops the loop.
pub async fn listen_and_register(
    listener: &mut Listener,
    registry: &Registry,
    mut on_new: impl FnMut(&Remote) -> bool,
) -> std::io::Result<()> {
    loop {
        let dh = listener.accept().await?;
        let (device, is_new) = registry.observe(dh);
        if is_new && !on_new(&device) {
            return Ok(());
        }
    }
}
