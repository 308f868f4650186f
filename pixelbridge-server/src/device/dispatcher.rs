//! The per-device packet dispatcher.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use pixelbridge_core::io::DatagramSender;
use pixelbridge_core::protocol::{DiscoveryHeaders, Packet, PacketStream};

use crate::network::{UdpDatagramSender, MAX_UDP_SIZE};

use super::remote::RemoteInner;
use super::{DeviceError, DoneSignal, Sender};

/// A higher-level construct that sends packets to one remote device.
///
/// The dispatcher is a reference-counted singleton attached to a device. It
/// owns (a) a datagram sender that transparently re-dials when the device
/// announces a new address, and (b) a packet stream configured from the
/// device's headers. Every sender handed out by the device shares this
/// singleton; when the last sender closes, or the device becomes done, the
/// dispatcher flushes, closes the socket, and detaches from the device.
pub(super) struct PacketDispatcher {
    owner: Weak<RemoteInner>,

    // Signals that this dispatcher has been shut down.
    shutdown: DoneSignal,

    // The datagram sender. Guarded separately from the stream state so
    // max_datagram_size can be answered without serializing against packet
    // sends.
    sender: Mutex<DynamicDatagramSender>,

    state: Mutex<DispatchState>,
}

struct DispatchState {
    stream: PacketStream,
    refs: i64,
    is_shutdown: bool,
}

impl PacketDispatcher {
    /// Creates the dispatcher with one reference held, connects its sender,
    /// and starts the watchdog that tears it down when the device is done.
    pub(super) fn start(
        owner: Weak<RemoteInner>,
        device_done: DoneSignal,
        headers: &DiscoveryHeaders,
    ) -> Result<Arc<Self>, DeviceError> {
        let mut sender = DynamicDatagramSender::new(owner.clone());
        sender.ensure_connected()?;

        let disp = Arc::new(PacketDispatcher {
            owner,
            shutdown: DoneSignal::new(),
            sender: Mutex::new(sender),
            state: Mutex::new(DispatchState {
                stream: headers.packet_stream(),
                refs: 1,
                is_shutdown: false,
            }),
        });

        // Tear down automatically when the device is done. Without a
        // runtime the teardown still happens through the last release.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let watchdog = disp.clone();
            handle.spawn(async move {
                tokio::select! {
                    _ = device_done.wait() => watchdog.shutdown_now(),
                    _ = watchdog.shutdown.wait() => {}
                }
            });
        }

        Ok(disp)
    }

    /// Takes another reference. Returns false if the dispatcher has already
    /// shut down, in which case the caller must create a fresh one.
    pub(super) fn retain(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.is_shutdown {
            return false;
        }
        st.refs += 1;
        true
    }

    /// Releases one reference, shutting down when the count reaches zero.
    pub(super) fn release(&self) {
        let shutdown = {
            let mut st = self.state.lock().unwrap();
            st.refs -= 1;
            st.refs <= 0 && !st.is_shutdown
        };
        if shutdown {
            self.shutdown_now();
        }
    }

    /// Flushes pending data, closes the socket, and detaches from the
    /// device. Idempotent.
    fn shutdown_now(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.is_shutdown {
                return;
            }
            st.is_shutdown = true;

            let mut sender = self.sender.lock().unwrap();
            if let Err(e) = st.stream.flush(&mut *sender) {
                warn!("failed to send a final flush: {}", e);
            }
            let _ = sender.close();
        }

        // Detach outside our own locks; the owner takes its dispatcher
        // lock to clear the reference.
        if let Some(owner) = self.owner.upgrade() {
            owner.clear_dispatcher(self);
        }
        self.shutdown.mark_done();
    }

    /// Sends a packet through the shared stream, blocking until it has
    /// been handed to the socket. Serialized across senders.
    pub(super) fn send_packet(&self, packet: &Packet<'_>) -> Result<(), DeviceError> {
        let mut st = self.state.lock().unwrap();
        if st.is_shutdown {
            return Err(DeviceError::DeviceDone);
        }

        // Send immediately: dispatch the packet and flush anything the
        // stream buffered, in one critical section so per-device ordering
        // holds.
        let mut sender = self.sender.lock().unwrap();
        st.stream.send(&mut *sender, packet)?;
        st.stream.flush(&mut *sender)?;
        Ok(())
    }

    pub(super) fn send_datagram(&self, data: &[u8]) -> Result<(), DeviceError> {
        if self.shutdown.is_done() {
            return Err(DeviceError::DeviceDone);
        }
        let mut sender = self.sender.lock().unwrap();
        Ok(sender.send_datagram(data)?)
    }

    /// Advisory; answered without taking the stream lock, so it does not
    /// contend with in-flight sends.
    pub(super) fn max_datagram_size(&self) -> usize {
        self.sender.lock().unwrap().max_datagram_size()
    }
}

/// A datagram sender that tracks its device's announced address.
///
/// A remote device can receive header updates at any time, changing its
/// address or port. Each send compares the device's current address against
/// the connected one and transparently re-dials on mismatch, reusing the
/// bound socket in the common case where nothing changed.
struct DynamicDatagramSender {
    device: Weak<RemoteInner>,

    base: Option<UdpDatagramSender>,
    base_addr: Option<SocketAddr>,

    // Recorded when a connection is established, so max_datagram_size
    // does not need to dial.
    last_datagram_size: usize,
}

impl DynamicDatagramSender {
    fn new(device: Weak<RemoteInner>) -> Self {
        DynamicDatagramSender {
            device,
            base: None,
            base_addr: None,
            last_datagram_size: MAX_UDP_SIZE,
        }
    }

    fn ensure_connected(&mut self) -> io::Result<()> {
        let device = self.device.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "device is gone")
        })?;
        let addr = device.addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "device has no address")
        })?;

        // Common case: connected and the address still matches.
        if self.base.is_some() && self.base_addr == Some(addr) {
            return Ok(());
        }

        if let Some(mut base) = self.base.take() {
            base.close()?;
        }

        let base = UdpDatagramSender::connect(addr)?;
        self.last_datagram_size = base.max_datagram_size();
        self.base = Some(base);
        self.base_addr = Some(addr);
        Ok(())
    }
}

impl DatagramSender for DynamicDatagramSender {
    fn send_datagram(&mut self, data: &[u8]) -> io::Result<()> {
        self.ensure_connected()?;
        self.base.as_mut().unwrap().send_datagram(data)?;

        if let Some(device) = self.device.upgrade() {
            device.counters.record_sent(data.len());
        }
        Ok(())
    }

    fn max_datagram_size(&self) -> usize {
        self.last_datagram_size
    }

    fn close(&mut self) -> io::Result<()> {
        self.base_addr = None;
        match self.base.take() {
            Some(mut base) => base.close(),
            None => Ok(()),
        }
    }
}

/// A user-facing sender backed by the shared dispatcher singleton.
pub(super) struct RemoteSender {
    dispatcher: Arc<PacketDispatcher>,
    closed: bool,
}

impl RemoteSender {
    pub(super) fn new(dispatcher: Arc<PacketDispatcher>) -> Self {
        RemoteSender {
            dispatcher,
            closed: false,
        }
    }
}

impl Sender for RemoteSender {
    fn send_packet(&mut self, packet: &Packet<'_>) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::DeviceDone);
        }
        self.dispatcher.send_packet(packet)
    }

    fn send_datagram(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::DeviceDone);
        }
        self.dispatcher.send_datagram(data)
    }

    fn max_datagram_size(&self) -> usize {
        self.dispatcher.max_datagram_size()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            self.dispatcher.release();
        }
        Ok(())
    }
}

impl Drop for RemoteSender {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.dispatcher.release();
        }
    }
}
