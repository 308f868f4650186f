//! Local virtual devices.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use log::{debug, warn};
use tokio::net::UdpSocket;

use pixelbridge_core::protocol::DiscoveryHeaders;

use crate::network::MAX_UDP_SIZE;

use super::{Device, DeviceError, DeviceInfo, DoneSignal, Ordinal, Sender, TrafficCounters};

/// The callback invoked for every datagram a [`Local`] device receives.
///
/// The data is only valid for the duration of the call.
pub type PacketDataHandler = dyn Fn(&[u8]) + Send + Sync;

/// A local "virtual" device.
///
/// A `Local` lets the local system instantiate its own devices: it binds a
/// UDP socket, receives pixel/command datagrams on it, and hands each one
/// to a callback. The proxy tier uses it to impersonate remote devices;
/// it is also useful for testing and simulation.
///
/// `Local` is a cheap-clone handle; clones observe the same device.
#[derive(Clone)]
pub struct Local {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    id: String,
    addr: SocketAddr,
    done: DoneSignal,
    created: SystemTime,
    counters: TrafficCounters,

    // The retained headers, rewritten to advertise this device's own
    // address.
    headers: RwLock<Option<Arc<DiscoveryHeaders>>>,
}

impl Local {
    /// Starts a local device on the given socket and begins listening for
    /// packets. Received datagrams are passed to `on_packet_data`.
    ///
    /// The device owns the socket; closing the device stops the listener.
    pub fn start(
        id: impl Into<String>,
        socket: UdpSocket,
        on_packet_data: Box<PacketDataHandler>,
    ) -> std::io::Result<Local> {
        let addr = socket.local_addr()?;
        let inner = Arc::new(LocalInner {
            id: id.into(),
            addr,
            done: DoneSignal::new(),
            created: SystemTime::now(),
            counters: TrafficCounters::default(),
            headers: RwLock::new(None),
        });

        let listener = inner.clone();
        tokio::spawn(async move {
            listener.listen_for_packets(socket, on_packet_data).await;
        });

        Ok(Local { inner })
    }

    /// Sets the base discovery headers for this device. The headers are
    /// rewritten to carry this device's own address and port.
    ///
    /// Call at least once before the device's headers are consumed.
    pub fn update_headers(&self, dh: &DiscoveryHeaders) {
        let mut dh = dh.clone();
        if let SocketAddr::V4(v4) = self.inner.addr {
            dh.header.set_ip4_address(*v4.ip());
        }
        if let Some(pp) = dh.pixel_pusher_mut() {
            pp.my_port = self.inner.addr.port();
        }
        *self.inner.headers.write().unwrap() = Some(Arc::new(dh));
    }

    /// Closes the device, stopping its listener and marking it done.
    pub fn close(&self) {
        self.inner.done.mark_done();
    }
}

impl LocalInner {
    async fn listen_for_packets(&self, socket: UdpSocket, on_packet_data: Box<PacketDataHandler>) {
        let mut buf = vec![0u8; MAX_UDP_SIZE];
        loop {
            tokio::select! {
                _ = self.done.wait() => return,
                recv = socket.recv_from(&mut buf) => {
                    let (size, from) = match recv {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("local device {}: receive failed: {}", self.id, e);
                            continue;
                        }
                    };

                    debug!(
                        "local device {} received {} byte(s) from {}",
                        self.id, size, from
                    );
                    self.counters.record_received(size);
                    on_packet_data(&buf[..size]);
                }
            }
        }
    }
}

impl Device for Local {
    fn id(&self) -> &str {
        &self.inner.id
    }

    /// A local device is not part of any ordinal group.
    fn ordinal(&self) -> Ordinal {
        Ordinal::INVALID
    }

    fn sender(&self) -> Result<Box<dyn Sender>, DeviceError> {
        Err(DeviceError::SenderUnsupported)
    }

    fn discovery_headers(&self) -> Option<Arc<DiscoveryHeaders>> {
        self.inner.headers.read().unwrap().clone()
    }

    fn done(&self) -> DoneSignal {
        self.inner.done.clone()
    }

    fn addr(&self) -> Option<SocketAddr> {
        Some(self.inner.addr)
    }

    fn info(&self) -> DeviceInfo {
        self.inner
            .counters
            .snapshot(self.inner.created, self.inner.created)
    }
}

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Local{{{}}}", self.inner.addr)
    }
}
