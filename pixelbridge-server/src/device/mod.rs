//! Device definition and management.
//!
//! A [`Device`] is the library's view of a single PixelPusher: something
//! with a stable ID, an optional ordinal, a lifecycle that ends exactly
//! once, and the ability to hand out [`Sender`]s. [`Remote`] represents a
//! discovered device on the network; [`Local`] is a virtual device backed
//! by a locally bound socket, used by the proxy tier and in tests.
//!
//! [`Mutable`] tracks the pixel state of a device and generates sync
//! packets for the strips that changed.

mod dispatcher;
mod local;
mod mutable;
mod ordinal;
mod registry;
pub(crate) mod remote;
mod router;
mod snapshot;

pub use local::Local;
pub use mutable::Mutable;
pub use ordinal::Ordinal;
pub use registry::DeviceRegistry;
pub use remote::Remote;
pub use router::{Router, RouterListener};
pub use snapshot::{Snapshot, SnapshotManager};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::watch;

use pixelbridge_core::error::{ProtocolError, SendError};
use pixelbridge_core::protocol::{DiscoveryHeaders, Packet};

/// Errors produced by device senders and the router.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device has no discovery headers bound, so a device-specific
    /// reader or stream cannot be configured for it.
    #[error("device has no discovery headers bound")]
    NotConfigured,

    /// The device is done; no further senders succeed and outstanding
    /// senders fail.
    #[error("device is done")]
    DeviceDone,

    /// No registered device matches the requested ordinal or ID.
    #[error("no route for device")]
    NoRoute,

    /// The device type does not support senders.
    #[error("sender is not supported for this device")]
    SenderUnsupported,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<SendError> for DeviceError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Protocol(p) => DeviceError::Protocol(p),
            SendError::Io(e) => DeviceError::Io(e),
        }
    }
}

impl DeviceError {
    /// True for [`DeviceError::NoRoute`], which callers commonly tolerate.
    pub fn is_no_route(&self) -> bool {
        matches!(self, DeviceError::NoRoute)
    }
}

/// A one-shot, monotonic "done" signal.
///
/// Marking done is terminal: it cannot be undone, and marking more than
/// once has no further effect. Handles are cheap to clone and any handle
/// can both mark and observe.
#[derive(Clone, Debug)]
pub struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl DoneSignal {
    pub fn new() -> Self {
        DoneSignal {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    /// Marks the signal done. Safe to call any number of times.
    pub fn mark_done(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves when the signal is marked done. Resolves immediately if it
    /// already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        DoneSignal::new()
    }
}

/// Stats collected for a device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,

    pub created: SystemTime,
    pub observed: SystemTime,
}

/// Shared, atomically updated traffic counters backing [`DeviceInfo`].
#[derive(Debug, Default)]
pub(crate) struct TrafficCounters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TrafficCounters {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, created: SystemTime, observed: SystemTime) -> DeviceInfo {
        DeviceInfo {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            created,
            observed,
        }
    }
}

/// Dispatches data and packets to a single device.
///
/// Senders obtained from the same device share one underlying connection;
/// each sender must be closed when its user is finished with it. Dropping a
/// sender without closing releases it as well.
pub trait Sender: Send {
    /// Sends a packet to the target device, choosing how to batch or
    /// format it based on its content.
    fn send_packet(&mut self, packet: &Packet<'_>) -> Result<(), DeviceError>;

    /// Sends a raw datagram to the device. Most users should prefer
    /// [`Sender::send_packet`].
    fn send_datagram(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// The maximum allowed datagram size. Advisory.
    fn max_datagram_size(&self) -> usize;

    /// Releases this sender's reference to the underlying connection.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// A single device.
pub trait Device: Send + Sync {
    /// This device's ID: unique within the system and stable between
    /// executions, regardless of simple reconfigurations on the device's
    /// part. A hardware address is suitable.
    fn id(&self) -> &str;

    /// The device's ordinal, or [`Ordinal::INVALID`] when it has none.
    fn ordinal(&self) -> Ordinal;

    /// Creates a device sender. Multiple senders may exist at once; each
    /// is individually closed.
    ///
    /// Fails once the device is done.
    fn sender(&self) -> Result<Box<dyn Sender>, DeviceError>;

    /// The device's most recent discovery headers, if any are bound.
    fn discovery_headers(&self) -> Option<Arc<DiscoveryHeaders>>;

    /// The device's lifecycle signal. Done is terminal.
    fn done(&self) -> DoneSignal;

    /// The device's data address, if known.
    fn addr(&self) -> Option<SocketAddr>;

    /// Current stats for this device.
    fn info(&self) -> DeviceInfo;

    fn is_done(&self) -> bool {
        self.done().is_done()
    }
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("ordinal", &self.ordinal())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn done_signal_is_monotonic_and_idempotent() {
        let done = DoneSignal::new();
        assert!(!done.is_done());

        done.mark_done();
        done.mark_done();
        assert!(done.is_done());

        // Waiting on an already-done signal resolves immediately.
        done.wait().await;
    }

    #[tokio::test]
    async fn done_signal_wakes_waiters() {
        let done = DoneSignal::new();
        let waiter = done.clone();

        let handle = tokio::spawn(async move { waiter.wait().await });
        done.mark_done();
        handle.await.unwrap();
    }
}
