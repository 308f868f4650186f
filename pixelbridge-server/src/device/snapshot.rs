//! Sampled snapshots of device pixel state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use pixelbridge_core::pixel::PixelBuffer;
use pixelbridge_core::protocol::{pixelpusher, Packet};

use super::{Device, Mutable, RouterListener};

/// A snapshot of one device's pixel state. An independent data clone.
pub struct Snapshot {
    /// The snapshot device ID.
    pub id: String,

    /// The pixel state of each strip on the device.
    pub strips: Vec<pixelpusher::StripState<'static>>,
}

/// Maintains pixel-state snapshots for observed devices.
///
/// Registered as a router listener, the manager folds every routed pixel
/// packet into a per-device model. With a sample rate configured, updates
/// are subsampled: strips refresh at most once per sample window, with the
/// windows aligned on a common edge across devices so snapshots compose
/// into consistent frames.
///
/// `SnapshotManager` is a cheap-clone handle and safe for concurrent use.
#[derive(Clone)]
pub struct SnapshotManager {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    // After a sample is taken, further samples are ignored until this
    // much time has passed. Zero samples everything.
    sample_rate: Duration,

    states: RwLock<HashMap<String, Arc<SnapshotDeviceState>>>,

    // The current common sample edge.
    last_snapshot_time: RwLock<Option<Instant>>,
}

struct SnapshotDeviceState {
    id: String,
    state: Mutex<DeviceSample>,
}

struct DeviceSample {
    model: Mutable,
    last_sample_time: HashMap<u8, Instant>,
}

impl SnapshotManager {
    /// Creates a manager sampling at most once per `sample_rate` per
    /// strip. A zero rate takes every sample.
    pub fn new(sample_rate: Duration) -> Self {
        SnapshotManager {
            inner: Arc::new(SnapshotInner {
                sample_rate,
                states: RwLock::new(HashMap::new()),
                last_snapshot_time: RwLock::new(None),
            }),
        }
    }

    /// Folds a packet into the snapshot state for `device`. Non-pixel
    /// packets are ignored.
    pub fn observe_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>) {
        let Packet::PixelPusher(pp) = packet;
        let pixelpusher::PacketBody::StripStates(states) = &pp.body else {
            return;
        };
        if states.is_empty() {
            return;
        }

        let ds = self.device_state_or_create(device);
        let now = Instant::now();
        let mut sample = ds.state.lock().unwrap();
        for ss in states {
            self.update_strip(&mut sample, now, ss.strip_number, &ss.pixels);
        }
    }

    /// The current snapshot for `device`, or `None` when nothing has been
    /// observed for it.
    pub fn snapshot_for_device(&self, device: &Arc<dyn Device>) -> Option<Snapshot> {
        let ds = self.device_state(device.id())?;
        let sample = ds.state.lock().unwrap();

        let num_strips = sample.model.num_strips();
        if num_strips == 0 {
            return None;
        }

        let mut strips = Vec::with_capacity(num_strips);
        for i in 0..num_strips {
            let mut pixels = PixelBuffer::new(Default::default());
            sample.model.clone_pixels_to(i, &mut pixels);
            strips.push(pixelpusher::StripState {
                strip_number: i as u8,
                pixels,
            });
        }
        Some(Snapshot {
            id: ds.id.clone(),
            strips,
        })
    }

    pub fn has_snapshot_for_device(&self, device: &Arc<dyn Device>) -> bool {
        match self.device_state(device.id()) {
            Some(ds) => ds.state.lock().unwrap().model.num_strips() > 0,
            None => false,
        }
    }

    /// Removes any stored state for `device`.
    pub fn delete(&self, device_id: &str) {
        self.inner.states.write().unwrap().remove(device_id);
    }

    fn device_state(&self, id: &str) -> Option<Arc<SnapshotDeviceState>> {
        self.inner.states.read().unwrap().get(id).cloned()
    }

    fn device_state_or_create(&self, device: &Arc<dyn Device>) -> Arc<SnapshotDeviceState> {
        // The device likely exists already; check under read lock first.
        if let Some(ds) = self.device_state(device.id()) {
            return ds;
        }

        let mut states = self.inner.states.write().unwrap();
        if let Some(ds) = states.get(device.id()) {
            return ds.clone();
        }

        let mut model = Mutable::default();
        if let Some(dh) = device.discovery_headers() {
            model.initialize(&dh);
        }
        let ds = Arc::new(SnapshotDeviceState {
            id: device.id().to_string(),
            state: Mutex::new(DeviceSample {
                model,
                last_sample_time: HashMap::new(),
            }),
        });
        states.insert(device.id().to_string(), ds.clone());

        // Drop the state when the device closes, so snapshots do not
        // accumulate as devices come and go.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.clone();
            let done = device.done();
            let id = device.id().to_string();
            handle.spawn(async move {
                done.wait().await;
                manager.delete(&id);
            });
        }

        ds
    }

    fn update_strip(
        &self,
        sample: &mut DeviceSample,
        now: Instant,
        strip_number: u8,
        pixels: &PixelBuffer<'_>,
    ) {
        let sampling = !self.inner.sample_rate.is_zero();
        if sampling {
            let last = sample.last_sample_time.get(&strip_number).copied();
            if !self.should_snapshot(now, last) {
                return;
            }
        }

        sample.model.set_pixels(strip_number as usize, pixels);

        if sampling {
            sample.last_sample_time.insert(strip_number, now);
        }
    }

    /// Decides whether a strip last sampled at `last` should sample again
    /// at `now`, advancing the common sample edge as time passes. Aligning
    /// every strip on the shared edge keeps snapshots consistent across
    /// devices.
    fn should_snapshot(&self, now: Instant, last: Option<Instant>) -> bool {
        let sample_rate = self.inner.sample_rate;

        let last_edge = *self.inner.last_snapshot_time.read().unwrap();
        let Some(last_edge) = last_edge else {
            // First sample anywhere: establish the edge.
            *self.inner.last_snapshot_time.write().unwrap() = Some(now);
            return true;
        };

        if last_edge + sample_rate >= now {
            // The next edge is still in the future; sample only strips
            // that have not sampled since the current edge.
            return match last {
                Some(last) => last < last_edge,
                None => true,
            };
        }

        // The edge is stale. Advance it one window when we are within the
        // next window, otherwise re-anchor at the current time. Another
        // caller may have advanced it already, so re-check under the
        // write lock.
        let mut guard = self.inner.last_snapshot_time.write().unwrap();
        if let Some(edge) = *guard {
            let next_edge = edge + sample_rate;
            if now > next_edge {
                *guard = Some(if now < next_edge + sample_rate {
                    next_edge
                } else {
                    now
                });
            }
        }
        true
    }
}

impl RouterListener for SnapshotManager {
    fn handle_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>) {
        self.observe_packet(device, packet);
    }
}

#[cfg(test)]
mod tests {
    use super::super::remote::tests::test_headers;
    use super::super::Remote;
    use super::*;
    use pixelbridge_core::pixel::{BufferLayout, Pixel};

    fn pixel_packet(strip_number: u8, seed: u8) -> Packet<'static> {
        let mut pixels = PixelBuffer::with_len(BufferLayout::Rgb, 4);
        pixels.set_pixel(0, Pixel::rgb(seed, seed, seed));
        Packet::PixelPusher(pixelpusher::Packet::strip_states(
            0,
            vec![pixelpusher::StripState {
                strip_number,
                pixels,
            }],
        ))
    }

    #[tokio::test]
    async fn snapshots_reflect_observed_packets() {
        let manager = SnapshotManager::new(Duration::ZERO);
        let device: Arc<dyn Device> = Arc::new(Remote::new("aa:00", test_headers(9897, 1, 1)));

        assert!(!manager.has_snapshot_for_device(&device));
        assert!(manager.snapshot_for_device(&device).is_none());

        manager.observe_packet(&device, &pixel_packet(1, 42));

        let snapshot = manager.snapshot_for_device(&device).unwrap();
        assert_eq!(snapshot.id, "aa:00");
        assert_eq!(snapshot.strips.len(), 2);
        assert_eq!(snapshot.strips[1].pixels.pixel(0), Pixel::rgb(42, 42, 42));

        // The snapshot is an independent clone; later packets do not
        // affect it.
        manager.observe_packet(&device, &pixel_packet(1, 99));
        assert_eq!(snapshot.strips[1].pixels.pixel(0), Pixel::rgb(42, 42, 42));

        manager.delete(device.id());
        assert!(!manager.has_snapshot_for_device(&device));
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_subsamples_within_a_window() {
        let manager = SnapshotManager::new(Duration::from_secs(1));
        let device: Arc<dyn Device> = Arc::new(Remote::new("aa:00", test_headers(9897, 1, 1)));

        // The first packet in a window is sampled; the second is not.
        manager.observe_packet(&device, &pixel_packet(0, 1));
        manager.observe_packet(&device, &pixel_packet(0, 2));
        let snapshot = manager.snapshot_for_device(&device).unwrap();
        assert_eq!(snapshot.strips[0].pixels.pixel(0), Pixel::rgb(1, 1, 1));

        // After the window passes, sampling resumes.
        tokio::time::sleep(Duration::from_secs(2)).await;
        manager.observe_packet(&device, &pixel_packet(0, 3));
        let snapshot = manager.snapshot_for_device(&device).unwrap();
        assert_eq!(snapshot.strips[0].pixels.pixel(0), Pixel::rgb(3, 3, 3));
    }
}
