//! The discovery beacon listener.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use log::{debug, warn};
use tokio::net::UdpSocket;

use pixelbridge_core::protocol::{self, DiscoveryHeaders};

use crate::network::MAX_UDP_SIZE;

/// An optional filter applied to prospective discovery headers. Returning
/// false ignores the device.
pub type DiscoveryFilter = dyn Fn(&DiscoveryHeaders) -> bool + Send + Sync;

/// Listens for PixelPusher discovery beacons.
///
/// Beacons that fail to parse, come from unsupported device types, or are
/// rejected by the filter are logged and skipped; [`Listener::accept`]
/// resolves only for valid PixelPusher beacons.
pub struct Listener {
    socket: UdpSocket,
    filter: Option<Box<DiscoveryFilter>>,
    buf: Vec<u8>,
}

impl Listener {
    /// Binds the default discovery port on all interfaces.
    pub async fn bind() -> io::Result<Listener> {
        Listener::bind_addr((Ipv4Addr::UNSPECIFIED, protocol::DISCOVERY_PORT).into()).await
    }

    /// Binds a specific address.
    pub async fn bind_addr(addr: SocketAddr) -> io::Result<Listener> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(
            "listening for discovery packets on {}",
            socket.local_addr()?
        );
        Ok(Listener::from_socket(socket))
    }

    /// Wraps an already-bound socket.
    pub fn from_socket(socket: UdpSocket) -> Listener {
        Listener {
            socket,
            filter: None,
            buf: vec![0u8; MAX_UDP_SIZE],
        }
    }

    /// Joins an IPv4 multicast group on the listening socket.
    pub fn join_multicast(&self, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.socket.join_multicast_v4(group, interface)
    }

    /// Installs a discovery filter.
    pub fn set_filter(&mut self, filter: Box<DiscoveryFilter>) {
        self.filter = Some(filter);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next valid device beacon.
    ///
    /// Cancel-safe: dropping the future between datagrams loses nothing.
    pub async fn accept(&mut self) -> io::Result<DiscoveryHeaders> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.buf).await?;
            debug!("discovery packet received from {} ({} byte(s))", from, len);

            let dh = match protocol::parse_discovery(&self.buf[..len]) {
                Ok(dh) => dh,
                Err(e) => {
                    warn!("failed to parse discovery packet from {}: {}", from, e);
                    continue;
                }
            };

            if let Some(filter) = &self.filter {
                if !filter(&dh) {
                    debug!(
                        "device {} is explicitly filtered; ignoring",
                        dh.hardware_addr_string()
                    );
                    continue;
                }
            }

            debug!("received discovery for device {}", dh.hardware_addr_string());
            return Ok(dh);
        }
    }
}
