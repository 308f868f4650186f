//! The discovery beacon transmitter.

use log::debug;

use pixelbridge_core::error::SendError;
use pixelbridge_core::io::DatagramSender;
use pixelbridge_core::protocol::DiscoveryHeaders;

/// Broadcasts discovery beacons for a set of devices.
///
/// Run periodically to announce locally hosted devices (such as proxy
/// devices) the way real hardware would.
#[derive(Default)]
pub struct Transmitter {
    buf: Vec<u8>,
}

impl Transmitter {
    pub fn new() -> Self {
        Transmitter::default()
    }

    /// Serializes and broadcasts one device's discovery headers.
    pub fn broadcast(
        &mut self,
        ds: &mut dyn DatagramSender,
        dh: &DiscoveryHeaders,
    ) -> Result<(), SendError> {
        self.buf.clear();
        dh.write_packet(&mut self.buf);

        debug!(
            "broadcasting device {} ({} byte(s))",
            dh.hardware_addr_string(),
            self.buf.len()
        );
        ds.send_datagram(&self.buf)?;
        Ok(())
    }
}
