//! The proxy manager.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use pixelbridge_core::protocol::{Packet, PacketReader};

use crate::device::{Device, DeviceError, Local, Sender};
use crate::discovery::Transmitter;
use crate::replay::PlaybackLeaser;

use pixelbridge_core::error::SendError;
use pixelbridge_core::io::DatagramSender;

/// Receives proxy-targeted packets as they arrive.
pub trait ProxyListener: Send + Sync {
    /// Called for each packet received by a proxy device. `forwarded`
    /// reports whether the packet was passed on to the real device.
    fn receive_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>, forwarded: bool);
}

impl<F> ProxyListener for F
where
    F: Fn(&Arc<dyn Device>, &Packet<'_>, bool) + Send + Sync,
{
    fn receive_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>, forwarded: bool) {
        self(device, packet, forwarded)
    }
}

/// Manages the proxy state: one local stand-in device per proxied base
/// device.
///
/// While any lease is outstanding, received packets are still parsed and
/// delivered to listeners, but are not forwarded to the base devices.
///
/// `Manager` is a cheap-clone handle and safe for concurrent use.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    // The local address proxy devices listen and identify on. The default
    // address is usually not what you want, since proxies advertise this
    // address in their discovery beacons.
    proxy_ip: Ipv4Addr,

    // Added to the group ordinal of proxied devices, so proxies can be
    // addressed separately from their base devices.
    group_offset: i32,

    state: RwLock<ManagerState>,
    listeners: RwLock<Vec<Arc<dyn ProxyListener>>>,

    lease_counter: AtomicU64,
    playback_lease: Mutex<Option<ProxyLease>>,
}

#[derive(Default)]
struct ManagerState {
    devices: HashMap<String, ProxyEntry>,
    leases: HashSet<u64>,
}

struct ProxyEntry {
    proxy: Local,
    base: Arc<dyn Device>,
    base_sender: Arc<Mutex<Box<dyn Sender>>>,
}

impl Manager {
    pub fn new(proxy_ip: Ipv4Addr, group_offset: i32) -> Self {
        Manager {
            inner: Arc::new(ManagerInner {
                proxy_ip,
                group_offset,
                state: RwLock::new(ManagerState::default()),
                listeners: RwLock::new(Vec::new()),
                lease_counter: AtomicU64::new(0),
                playback_lease: Mutex::new(None),
            }),
        }
    }

    /// Creates and registers a proxy device for `base`.
    ///
    /// The proxy remains active until the base device becomes done, at
    /// which point it is removed automatically. Adding a device that is
    /// already proxied does nothing.
    pub async fn add_device(&self, base: Arc<dyn Device>) -> Result<(), DeviceError> {
        let base_id = base.id().to_string();
        if self.inner.state.read().unwrap().devices.contains_key(&base_id) {
            debug!("device {:?} is already proxied; ignoring", base_id);
            return Ok(());
        }

        let headers = base.discovery_headers().ok_or(DeviceError::NotConfigured)?;
        let reader = headers.packet_reader();
        let base_sender = Arc::new(Mutex::new(base.sender()?));

        // A deterministic hardware address derived from the base ID, so a
        // proxy keeps its identity across runs.
        let mac = derive_proxy_mac(&base_id);
        let proxy_id = format_mac(mac);

        let socket = UdpSocket::bind((self.inner.proxy_ip, 0)).await?;

        let manager = Arc::downgrade(&self.inner);
        let callback_id = base_id.clone();
        let callback_reader = reader;
        let proxy = Local::start(
            proxy_id.clone(),
            socket,
            Box::new(move |data| {
                if let Some(inner) = manager.upgrade() {
                    inner.handle_proxied_data(&callback_id, &callback_reader, data);
                }
            }),
        )?;

        // Advertise the base device's headers under the proxy's identity.
        let mut dh = (*headers).clone();
        dh.header.mac_address = mac;
        if let Some(pp) = dh.pixel_pusher_mut() {
            pp.group_ordinal += self.inner.group_offset;
        }
        proxy.update_headers(&dh);

        {
            let mut state = self.inner.state.write().unwrap();
            state.devices.insert(
                base_id.clone(),
                ProxyEntry {
                    proxy: proxy.clone(),
                    base: base.clone(),
                    base_sender,
                },
            );
        }

        // Remove the proxy when its base device finishes.
        let manager = self.clone();
        let done = base.done();
        let lifecycle_id = base_id.clone();
        tokio::spawn(async move {
            done.wait().await;
            manager.remove_device(&lifecycle_id);
        });

        info!(
            "created proxy device {:?} on {:?} for device {:?}",
            proxy_id,
            proxy.addr(),
            base_id
        );
        Ok(())
    }

    /// The registered proxy devices, sorted by ID.
    pub fn proxy_devices(&self) -> Vec<Local> {
        let state = self.inner.state.read().unwrap();
        let mut devices: Vec<Local> = state.devices.values().map(|e| e.proxy.clone()).collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn add_listener(&self, l: Arc<dyn ProxyListener>) {
        self.inner.listeners.write().unwrap().push(l);
    }

    pub fn remove_listener(&self, l: &Arc<dyn ProxyListener>) {
        self.inner
            .listeners
            .write()
            .unwrap()
            .retain(|cur| !Arc::ptr_eq(cur, l));
    }

    /// Takes out a lease, pausing packet forwarding until every lease is
    /// dropped.
    pub fn add_lease(&self) -> ProxyLease {
        let id = self.inner.lease_counter.fetch_add(1, Ordering::Relaxed);
        self.inner.state.write().unwrap().leases.insert(id);
        ProxyLease {
            manager: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Whether received packets are currently forwarded to base devices.
    pub fn forwarding(&self) -> bool {
        self.inner.state.read().unwrap().leases.is_empty()
    }

    /// Broadcasts discovery beacons for every proxy device.
    pub fn broadcast_headers(
        &self,
        transmitter: &mut Transmitter,
        ds: &mut dyn DatagramSender,
    ) -> Result<(), SendError> {
        for proxy in self.proxy_devices() {
            if let Some(dh) = proxy.discovery_headers() {
                transmitter.broadcast(ds, &dh)?;
            }
        }
        Ok(())
    }

    /// Shuts down every proxy and stops forwarding permanently.
    pub fn close(&self) {
        // Take out a lease that is never released, so forwarding stays
        // off for good.
        std::mem::forget(self.add_lease());

        let entries: Vec<ProxyEntry> = {
            let mut state = self.inner.state.write().unwrap();
            state.devices.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.shutdown();
        }
    }

    fn remove_device(&self, base_id: &str) {
        let entry = self.inner.state.write().unwrap().devices.remove(base_id);
        if let Some(entry) = entry {
            info!("removing proxy for device {:?}", base_id);
            entry.shutdown();
        }
    }
}

impl ManagerInner {
    /// Handles one datagram received by a proxy device: parse, notify
    /// listeners, and forward when no lease is held.
    fn handle_proxied_data(&self, base_id: &str, reader: &PacketReader, data: &[u8]) {
        let packet = match reader.read_packet(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("proxy for {:?} could not parse packet: {}", base_id, e);
                return;
            }
        };

        // Snapshot what we need and drop the lock before calling out.
        let (proxy, base_sender, forwarded) = {
            let state = self.state.read().unwrap();
            let Some(entry) = state.devices.get(base_id) else {
                return;
            };
            (
                entry.proxy.clone(),
                entry.base_sender.clone(),
                state.leases.is_empty(),
            )
        };

        let proxy_device: Arc<dyn Device> = Arc::new(proxy);
        let listeners = self.listeners.read().unwrap().clone();
        for l in listeners {
            l.receive_packet(&proxy_device, &packet, forwarded);
        }

        if forwarded {
            if let Err(e) = base_sender.lock().unwrap().send_packet(&packet) {
                warn!("proxy failed to forward packet to {:?}: {}", base_id, e);
            }
        }
    }
}

impl PlaybackLeaser for Manager {
    /// Pauses proxy forwarding while the playback lease is held.
    fn acquire_playback_lease(&self) {
        let mut lease = self.inner.playback_lease.lock().unwrap();
        if lease.is_none() {
            *lease = Some(self.add_lease());
        }
    }

    fn release_playback_lease(&self) {
        self.inner.playback_lease.lock().unwrap().take();
    }
}

impl ProxyEntry {
    fn shutdown(self) {
        self.proxy.close();
        if let Err(e) = self.base_sender.lock().unwrap().close() {
            debug!(
                "failed to close base sender for {:?}: {}",
                self.base.id(),
                e
            );
        }
    }
}

/// A held proxy-forwarding lease. Dropping it releases the lease.
pub struct ProxyLease {
    manager: Weak<ManagerInner>,
    id: u64,
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.state.write().unwrap().leases.remove(&self.id);
        }
    }
}

/// Derives a stable, locally-administered MAC address from a base device
/// ID.
fn derive_proxy_mac(base_id: &str) -> [u8; 6] {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    base_id.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();

    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[..6]);
    // Locally administered, unicast.
    mac[0] = (mac[0] | 0x02) & !0x01;
    mac
}

fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::remote::tests::test_headers;
    use crate::device::Remote;
    use std::sync::atomic::AtomicUsize;

    fn proxied_remote() -> (Arc<dyn Device>, std::net::UdpSocket) {
        let base_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = base_socket.local_addr().unwrap().port();
        let base: Arc<dyn Device> = Arc::new(Remote::new("aa:00", test_headers(port, 1, 1)));
        (base, base_socket)
    }

    #[tokio::test]
    async fn proxy_identity_is_stable_and_offset() {
        let manager = Manager::new(Ipv4Addr::LOCALHOST, 16);
        let (base, _base_socket) = proxied_remote();
        manager.add_device(base.clone()).await.unwrap();

        let proxies = manager.proxy_devices();
        assert_eq!(proxies.len(), 1);
        let proxy = &proxies[0];

        // Identity is derived deterministically from the base ID.
        assert_eq!(proxy.id(), format_mac(derive_proxy_mac("aa:00")));

        // The advertised headers carry the offset group and the proxy's
        // own port.
        let dh = proxy.discovery_headers().unwrap();
        let pp = dh.pixel_pusher().unwrap();
        assert_eq!(pp.group_ordinal, 1 + 16);
        assert_eq!(pp.my_port, proxy.addr().unwrap().port());

        // Re-adding is a no-op.
        manager.add_device(base).await.unwrap();
        assert_eq!(manager.proxy_devices().len(), 1);
    }

    #[tokio::test]
    async fn forwards_packets_and_honors_leases() {
        let manager = Manager::new(Ipv4Addr::LOCALHOST, 0);
        let (base, base_socket) = proxied_remote();
        base_socket
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        manager.add_device(base).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_listener = seen.clone();
        manager.add_listener(Arc::new(
            move |_d: &Arc<dyn Device>, _p: &Packet<'_>, _forwarded: bool| {
                seen_by_listener.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let proxy_addr = manager.proxy_devices()[0].addr().unwrap();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        // A pixel datagram: id + strip 0 + 4 RGB pixels.
        let mut datagram = vec![0, 0, 0, 1, 0];
        datagram.extend_from_slice(&[7u8; 12]);

        client.send_to(&datagram, proxy_addr).unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = base_socket.recv_from(&mut buf).unwrap();
        assert_eq!(n, datagram.len());

        // With a lease held, listeners still fire but nothing is
        // forwarded.
        let lease = manager.add_lease();
        assert!(!manager.forwarding());
        client.send_to(&datagram, proxy_addr).unwrap();

        while seen.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        base_socket
            .set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        assert!(base_socket.recv_from(&mut buf).is_err());

        drop(lease);
        assert!(manager.forwarding());
        manager.close();
        assert!(!manager.forwarding());
    }
}
