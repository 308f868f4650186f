//! Remote devices discovered on the network.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use pixelbridge_core::protocol::DiscoveryHeaders;

use super::dispatcher::{PacketDispatcher, RemoteSender};
use super::{Device, DeviceError, DeviceInfo, DoneSignal, Ordinal, Sender, TrafficCounters};

/// The state published by a header observation. Replaced wholesale so
/// readers always see a consistent snapshot.
pub(super) struct RemoteState {
    pub(super) headers: Option<Arc<DiscoveryHeaders>>,
    pub(super) addr: Option<SocketAddr>,
    pub(super) observed: SystemTime,
}

/// A remote PixelPusher device.
///
/// A `Remote` is typically backed by a discovered device's beacon headers,
/// which may be live-updated as new beacons arrive. It can also be
/// constructed as a headerless stub for talking to a device at a known
/// address.
///
/// `Remote` is a cheap-clone handle; clones observe the same device.
#[derive(Clone)]
pub struct Remote {
    pub(super) inner: Arc<RemoteInner>,
}

pub(super) struct RemoteInner {
    id: String,
    state: RwLock<Arc<RemoteState>>,
    done: DoneSignal,
    created: SystemTime,
    pub(super) counters: TrafficCounters,

    // The dispatcher singleton shared by every sender for this device.
    // Created with the first sender, torn down on last release or when the
    // device is done.
    dispatcher: Mutex<Option<Arc<PacketDispatcher>>>,
}

impl Remote {
    /// Creates a remote device from a discovered beacon.
    pub fn new(id: impl Into<String>, dh: DiscoveryHeaders) -> Self {
        let d = Remote::make(id.into());
        d.update_headers(SystemTime::now(), dh);
        d
    }

    /// Creates a headerless stub for a device at a known address.
    pub fn stub(id: impl Into<String>, addr: SocketAddr) -> Self {
        let d = Remote::make(id.into());
        d.inner.set_state(RemoteState {
            headers: None,
            addr: Some(addr),
            observed: SystemTime::now(),
        });
        d
    }

    fn make(id: String) -> Self {
        Remote {
            inner: Arc::new(RemoteInner {
                id,
                state: RwLock::new(Arc::new(RemoteState {
                    headers: None,
                    addr: None,
                    observed: SystemTime::UNIX_EPOCH,
                })),
                done: DoneSignal::new(),
                created: SystemTime::now(),
                counters: TrafficCounters::default(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Live-updates this device's headers from a new beacon observation.
    pub fn update_headers(&self, now: SystemTime, dh: DiscoveryHeaders) {
        let addr = dh.addr();
        self.inner.set_state(RemoteState {
            headers: Some(Arc::new(dh)),
            addr: Some(addr),
            observed: now,
        });
    }

    /// Marks this device done. Terminal; calls past the first do nothing.
    pub fn mark_done(&self) {
        self.inner.done.mark_done();
    }

    /// True when `other` is a handle to this same device instance.
    pub fn same_instance(&self, other: &Remote) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Device for Remote {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn ordinal(&self) -> Ordinal {
        match self.inner.get_state().headers.as_deref() {
            Some(dh) => match dh.pixel_pusher() {
                Some(pp) => Ordinal::new(pp.group_ordinal, pp.controller_ordinal),
                None => Ordinal::INVALID,
            },
            None => Ordinal::INVALID,
        }
    }

    fn sender(&self) -> Result<Box<dyn Sender>, DeviceError> {
        if self.inner.done.is_done() {
            return Err(DeviceError::DeviceDone);
        }

        let mut guard = self.inner.dispatcher.lock().unwrap();

        // Share the existing singleton when it is still alive.
        if let Some(disp) = guard.as_ref() {
            if disp.retain() {
                return Ok(Box::new(RemoteSender::new(disp.clone())));
            }
        }

        let headers = self
            .inner
            .get_state()
            .headers
            .clone()
            .ok_or(DeviceError::NotConfigured)?;

        let disp = PacketDispatcher::start(
            Arc::downgrade(&self.inner),
            self.inner.done.clone(),
            &headers,
        )?;
        *guard = Some(disp.clone());
        Ok(Box::new(RemoteSender::new(disp)))
    }

    fn discovery_headers(&self) -> Option<Arc<DiscoveryHeaders>> {
        self.inner.get_state().headers.clone()
    }

    fn done(&self) -> DoneSignal {
        self.inner.done.clone()
    }

    fn addr(&self) -> Option<SocketAddr> {
        self.inner.get_state().addr
    }

    fn info(&self) -> DeviceInfo {
        let state = self.inner.get_state();
        self.inner
            .counters
            .snapshot(self.inner.created, state.observed)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.get_state().addr {
            Some(addr) => write!(f, "{:?} @{}", self.inner.id, addr),
            None => write!(f, "{:?}", self.inner.id),
        }
    }
}

impl RemoteInner {
    pub(super) fn get_state(&self) -> Arc<RemoteState> {
        self.state.read().unwrap().clone()
    }

    fn set_state(&self, state: RemoteState) {
        *self.state.write().unwrap() = Arc::new(state);
    }

    pub(super) fn addr(&self) -> Option<SocketAddr> {
        self.get_state().addr
    }

    /// Clears the dispatcher singleton, but only if it is still the one
    /// being torn down. Called from the dispatcher's shutdown path; a new
    /// dispatcher is created when the next sender is requested.
    pub(super) fn clear_dispatcher(&self, disp: &PacketDispatcher) {
        let mut guard = self.dispatcher.lock().unwrap();
        if let Some(cur) = guard.as_ref() {
            if std::ptr::eq(Arc::as_ptr(cur), disp) {
                *guard = None;
            }
        }
    }
}
