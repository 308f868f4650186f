//! Packet routing to registered devices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use pixelbridge_core::protocol::Packet;

use super::{Device, DeviceError, DeviceRegistry, Ordinal, Sender};

/// Receives a callback for every packet routed through a [`Router`].
pub trait RouterListener: Send + Sync {
    /// Called for each packet sent through the router, before the send to
    /// the device is attempted.
    ///
    /// The packet is shared and read-only; listeners must not rely on
    /// exclusive access to its pixel data.
    fn handle_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>);
}

impl<F> RouterListener for F
where
    F: Fn(&Arc<dyn Device>, &Packet<'_>) + Send + Sync,
{
    fn handle_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>) {
        self(device, packet)
    }
}

/// Routes packets to devices in a [`DeviceRegistry`] by ordinal or ID.
///
/// The router maintains one sender connection per target device, created
/// lazily and closed when the device becomes done. Every routed packet is
/// fanned out to the registered listeners, whether or not the send to the
/// device succeeds.
///
/// `Router` is a cheap-clone handle and safe for concurrent use.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: DeviceRegistry,
    listeners: RwLock<Vec<Arc<dyn RouterListener>>>,
    connections: RwLock<HashMap<String, Arc<RouterConnection>>>,
}

struct RouterConnection {
    device: Arc<dyn Device>,
    sender: Mutex<Option<Box<dyn Sender>>>,
}

impl Router {
    pub fn new(registry: DeviceRegistry) -> Self {
        Router {
            inner: Arc::new(RouterInner {
                registry,
                listeners: RwLock::new(Vec::new()),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Sends `packet` to the device identified by `ordinal` or `id`.
    ///
    /// A valid ordinal with exactly one registered claimant wins; otherwise
    /// the ID is tried. With no match, [`DeviceError::NoRoute`] is
    /// returned.
    pub fn route(&self, ordinal: Ordinal, id: &str, packet: &Packet<'_>) -> Result<(), DeviceError> {
        let mut device = None;
        if ordinal.is_valid() {
            device = self.inner.registry.get_unique_ordinal(ordinal);
        }
        if device.is_none() {
            device = self.inner.registry.get(id);
        }
        let Some(device) = device else {
            return Err(DeviceError::NoRoute);
        };

        let conn = self.get_or_create_connection(&device)?;

        // Listeners observe the packet before the send attempt returns,
        // and regardless of its outcome.
        self.dispatch_to_listeners(&device, packet);

        conn.send_packet(packet)
    }

    pub fn add_listener(&self, l: Arc<dyn RouterListener>) {
        self.inner.listeners.write().unwrap().push(l);
    }

    /// Removes a listener previously added with the same `Arc`.
    pub fn remove_listener(&self, l: &Arc<dyn RouterListener>) {
        self.inner
            .listeners
            .write()
            .unwrap()
            .retain(|cur| !Arc::ptr_eq(cur, l));
    }

    fn dispatch_to_listeners(&self, device: &Arc<dyn Device>, packet: &Packet<'_>) {
        // Snapshot the list so listeners can unregister themselves even as
        // packets are being delivered.
        let listeners = self.inner.listeners.read().unwrap().clone();
        for l in listeners {
            l.handle_packet(device, packet);
        }
    }

    fn get_or_create_connection(
        &self,
        device: &Arc<dyn Device>,
    ) -> Result<Arc<RouterConnection>, DeviceError> {
        let id = device.id();

        // Fast path: a live connection to this device instance exists.
        {
            let conns = self.inner.connections.read().unwrap();
            if let Some(conn) = conns.get(id) {
                if Arc::ptr_eq(&conn.device, device) && !conn.device.is_done() {
                    return Ok(conn.clone());
                }
            }
        }

        let mut conns = self.inner.connections.write().unwrap();

        // Clear done registrations first, so a device that flickered off
        // and on is not mistaken for its stale connection.
        conns.retain(|_, conn| {
            if conn.device.is_done() {
                conn.shutdown();
                false
            } else {
                true
            }
        });

        // A connection may have appeared while we upgraded the lock.
        if let Some(conn) = conns.get(id) {
            if Arc::ptr_eq(&conn.device, device) {
                return Ok(conn.clone());
            }
            conn.shutdown();
        }

        let sender = device.sender()?;
        let conn = Arc::new(RouterConnection {
            device: device.clone(),
            sender: Mutex::new(Some(sender)),
        });
        conns.insert(id.to_string(), conn.clone());

        // Close the connection when its device finishes.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let router = self.clone();
            let lifecycle = conn.clone();
            handle.spawn(async move {
                lifecycle.device.done().wait().await;
                router.remove_connection(&lifecycle);
            });
        }

        Ok(conn)
    }

    fn remove_connection(&self, conn: &Arc<RouterConnection>) {
        let mut conns = self.inner.connections.write().unwrap();
        if let Some(cur) = conns.get(conn.device.id()) {
            if Arc::ptr_eq(cur, conn) {
                conns.remove(conn.device.id());
            }
        }
        conn.shutdown();
    }

    /// Shuts down all connections held by the router.
    pub fn shutdown(&self) {
        let mut conns = self.inner.connections.write().unwrap();
        for (_, conn) in conns.drain() {
            conn.shutdown();
        }
    }
}

impl RouterConnection {
    fn send_packet(&self, packet: &Packet<'_>) -> Result<(), DeviceError> {
        let mut sender = self.sender.lock().unwrap();
        match sender.as_mut() {
            Some(s) => s.send_packet(packet),
            None => Err(DeviceError::DeviceDone),
        }
    }

    fn shutdown(&self) {
        if let Some(mut s) = self.sender.lock().unwrap().take() {
            if let Err(e) = s.close() {
                debug!("router connection close failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::remote::tests::test_headers;
    use super::super::Remote;
    use super::*;
    use pixelbridge_core::pixel::{BufferLayout, Pixel, PixelBuffer};
    use pixelbridge_core::protocol::pixelpusher;
    use std::net::UdpSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pixel_packet() -> Packet<'static> {
        let mut pixels = PixelBuffer::with_len(BufferLayout::Rgb, 4);
        pixels.set_pixel(0, Pixel::rgb(1, 2, 3));
        Packet::PixelPusher(pixelpusher::Packet::strip_states(
            0,
            vec![pixelpusher::StripState {
                strip_number: 0,
                pixels,
            }],
        ))
    }

    #[tokio::test]
    async fn routes_by_ordinal_then_id() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let registry = DeviceRegistry::new();
        let router = Router::new(registry.clone());

        let d = Remote::new("aa:00", test_headers(port, 4, 2));
        registry.add(Arc::new(d));

        // Route by unique ordinal.
        router
            .route(Ordinal::new(4, 2), "nonsense", &pixel_packet())
            .unwrap();

        // Route by ID with an invalid ordinal.
        router
            .route(Ordinal::INVALID, "aa:00", &pixel_packet())
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 4 + 1 + 12);
        receiver.recv_from(&mut buf).unwrap();
    }

    #[tokio::test]
    async fn unroutable_packet_is_an_error() {
        let router = Router::new(DeviceRegistry::new());
        let err = router
            .route(Ordinal::INVALID, "who", &pixel_packet())
            .unwrap_err();
        assert!(err.is_no_route());
    }

    #[tokio::test]
    async fn listeners_observe_routed_packets() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();

        let registry = DeviceRegistry::new();
        let router = Router::new(registry.clone());
        registry.add(Arc::new(Remote::new("aa:00", test_headers(port, -1, -1))));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_listener = seen.clone();
        let listener: Arc<dyn RouterListener> =
            Arc::new(move |device: &Arc<dyn Device>, _packet: &Packet<'_>| {
                assert_eq!(device.id(), "aa:00");
                seen_by_listener.fetch_add(1, Ordering::SeqCst);
            });
        router.add_listener(listener.clone());

        router
            .route(Ordinal::INVALID, "aa:00", &pixel_packet())
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        router.remove_listener(&listener);
        router
            .route(Ordinal::INVALID, "aa:00", &pixel_packet())
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        router.shutdown();
    }

    #[tokio::test]
    async fn duplicate_ordinal_falls_back_to_id() {
        let recv_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let recv_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv_b
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();

        let registry = DeviceRegistry::new();
        let router = Router::new(registry.clone());
        registry.add(Arc::new(Remote::new(
            "aa:00",
            test_headers(recv_a.local_addr().unwrap().port(), 1, 1),
        )));
        registry.add(Arc::new(Remote::new(
            "bb:00",
            test_headers(recv_b.local_addr().unwrap().port(), 1, 1),
        )));

        // The ordinal is ambiguous, so the ID picks the device.
        router
            .route(Ordinal::new(1, 1), "bb:00", &pixel_packet())
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = recv_b.recv_from(&mut buf).unwrap();
        assert!(n > 0);

        router.shutdown();
    }
}
