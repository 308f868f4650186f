//! The expiring discovery registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::debug;
use tokio::sync::mpsc;
use tokio::time::Instant;

use pixelbridge_core::protocol::DiscoveryHeaders;

use crate::device::{Device, DeviceRegistry, Remote};

/// Construction options for a [`Registry`].
#[derive(Default)]
pub struct RegistryOptions {
    /// The amount of time after which an unobserved device is considered
    /// to no longer exist. Zero means devices never expire once observed.
    pub expiration: Duration,

    /// A device registry to keep updated as devices are observed.
    pub device_registry: Option<DeviceRegistry>,
}

/// Tracks discovered devices, instantiating a [`Remote`] for each unique
/// device ID.
///
/// Successive observations of the same device refresh its headers and its
/// expiration deadline. A device that goes unobserved past the expiration
/// window is marked done and unregistered; each registered device runs one
/// lifecycle task that waits on its done signal, its deadline timer, and
/// new deadlines.
///
/// `Registry` is a cheap-clone handle and safe for concurrent use.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    expiration: Duration,
    device_registry: Option<DeviceRegistry>,
    devices: Mutex<HashMap<String, RegistryEntry>>,
}

struct RegistryEntry {
    device: Remote,

    // New expiration deadlines for the entry's lifecycle task. Dropping
    // the sender (by unregistering the entry) terminates the task.
    deadline_tx: mpsc::UnboundedSender<Instant>,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Self {
        Registry {
            inner: Arc::new(RegistryInner {
                expiration: options.expiration,
                device_registry: options.device_registry,
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Observes a discovery beacon, adding the device if it has not been
    /// seen before or refreshing its headers and deadline if it has.
    ///
    /// Returns the device and whether this observation created it.
    pub fn observe(&self, dh: DiscoveryHeaders) -> (Remote, bool) {
        let id = dh.hardware_addr_string();
        let now = SystemTime::now();

        let (device, is_new) = {
            let mut devices = self.inner.devices.lock().unwrap();

            // Unregister entries that are already done, under lock. This
            // prevents a race where a done device is rediscovered before
            // its lifecycle task has removed it, which would make the
            // rediscovery invisible.
            devices.retain(|_, e| !e.device.is_done());

            let is_new = if let Some(entry) = devices.get(&id) {
                entry.device.update_headers(now, dh);
                false
            } else {
                debug!("discovered device {}", id);
                let device = Remote::new(id.clone(), dh);
                let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();

                tokio::spawn(manage_entry_lifecycle(
                    self.clone(),
                    id.clone(),
                    device.clone(),
                    deadline_rx,
                ));

                devices.insert(
                    id.clone(),
                    RegistryEntry {
                        device,
                        deadline_tx,
                    },
                );
                true
            };
            let entry = devices.get(&id).unwrap();

            if self.inner.expiration > Duration::ZERO {
                let _ = entry
                    .deadline_tx
                    .send(Instant::now() + self.inner.expiration);
            }
            (entry.device.clone(), is_new)
        };

        if let Some(dr) = &self.inner.device_registry {
            dr.add(Arc::new(device.clone()));
        }

        (device, is_new)
    }

    /// The current devices, in no particular order.
    pub fn devices(&self) -> Vec<Remote> {
        let devices = self.inner.devices.lock().unwrap();
        devices
            .values()
            .filter(|e| !e.device.is_done())
            .map(|e| e.device.clone())
            .collect()
    }

    /// Unregisters and shuts down the specified device. Does nothing when
    /// the device is not currently registered.
    pub fn unregister(&self, device: &Remote) {
        device.mark_done();
        self.remove_entry(device.id(), device);
    }

    /// Shuts down the registry and all managed devices.
    pub fn shutdown(&self) {
        let mut devices = self.inner.devices.lock().unwrap();
        for (_, e) in devices.drain() {
            e.device.mark_done();
        }
    }

    /// Removes the entry for `id`, but only if it still refers to
    /// `device`. An entry can already have been replaced when a device
    /// expires concurrently with its rediscovery.
    fn remove_entry(&self, id: &str, device: &Remote) {
        let mut devices = self.inner.devices.lock().unwrap();
        if let Some(e) = devices.get(id) {
            if e.device.same_instance(device) {
                devices.remove(id);
            }
        }
    }
}

/// The per-entry lifecycle task: waits on the device's done signal, the
/// expiration timer, and new deadlines. A new deadline resets the timer;
/// expiry or done marks the device done and unregisters it.
async fn manage_entry_lifecycle(
    registry: Registry,
    id: String,
    device: Remote,
    mut deadline_rx: mpsc::UnboundedReceiver<Instant>,
) {
    let done = device.done();
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = async {
            match deadline {
                Some(t) => tokio::time::sleep_until(t).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = done.wait() => break,
            _ = sleep => {
                debug!("device {} expired", id);
                break;
            }
            msg = deadline_rx.recv() => match msg {
                Some(t) if t <= Instant::now() => break, // already expired
                Some(t) => deadline = Some(t),
                None => break, // entry was unregistered
            }
        }
    }

    device.mark_done();
    registry.remove_entry(&id, &device);
}
