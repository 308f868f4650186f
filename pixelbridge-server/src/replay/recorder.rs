//! The packet recorder.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};

use pixelbridge_core::protocol::Packet;

use crate::device::{Device, RouterListener};

use super::streamfile::{EventStreamWriter, StreamError};

/// A snapshot of the current recorder status.
#[derive(Debug, Clone)]
pub struct RecorderStatus {
    /// The destination path of the stream being recorded.
    pub name: PathBuf,

    /// The latched receive error, if one has occurred.
    pub error: Option<String>,

    pub events: i64,
    pub bytes: i64,
    pub duration: Duration,
}

/// Records routed packets to an event stream.
///
/// A recorder is registered as a router listener; every packet routed to a
/// device lands in the stream, stamped with its arrival time. Packets the
/// stream format cannot encode (commands) are skipped. The first fatal
/// write error is latched: subsequent packets are ignored, and the error
/// surfaces when the recorder is stopped.
///
/// `Recorder` is a cheap-clone handle and safe for concurrent use.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

#[derive(Default)]
struct RecorderState {
    writer: Option<EventStreamWriter>,
    recv_err: Option<StreamError>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }

    /// Starts recording into `writer`. The recorder owns the writer and
    /// closes it on [`Recorder::stop`].
    ///
    /// # Panics
    ///
    /// Panics if the recorder is already recording.
    pub fn start(&self, writer: EventStreamWriter) {
        let mut state = self.state.lock().unwrap();
        assert!(state.writer.is_none(), "recorder already started");
        state.writer = Some(writer);
        state.recv_err = None;
    }

    /// Stops recording, finalizing the output stream.
    ///
    /// Returns the finalization error, or the latched receive error when
    /// finalization succeeds.
    pub fn stop(&self) -> Result<(), StreamError> {
        let (writer, recv_err) = {
            let mut state = self.state.lock().unwrap();
            (state.writer.take(), state.recv_err.take())
        };

        let Some(writer) = writer else {
            return Ok(());
        };

        writer.close()?;
        match recv_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A snapshot of the current status, or `None` when not recording.
    pub fn status(&self) -> Option<RecorderStatus> {
        let state = self.state.lock().unwrap();
        let writer = state.writer.as_ref()?;
        Some(RecorderStatus {
            name: writer.path().to_path_buf(),
            error: state.recv_err.as_ref().map(|e| e.to_string()),
            events: writer.num_events(),
            bytes: writer.num_bytes(),
            duration: writer.duration(),
        })
    }

    /// Adds one packet from `device` to the recording.
    ///
    /// Unencodable packets return [`StreamError::EncodingNotSupported`]
    /// without affecting the session. Any other write error is latched:
    /// it is reported once here, later packets are ignored, and
    /// [`Recorder::stop`] returns it.
    pub fn record_packet(
        &self,
        device: &dyn Device,
        packet: &Packet<'_>,
    ) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();

        // Not recording, or already latched an error: do nothing.
        if state.recv_err.is_some() {
            return Ok(());
        }
        let Some(writer) = state.writer.as_mut() else {
            return Ok(());
        };

        match writer.write_packet(device, packet) {
            Ok(()) => Ok(()),
            Err(StreamError::EncodingNotSupported) => Err(StreamError::EncodingNotSupported),
            Err(e) => {
                error!("recording failed; ignoring further packets: {}", e);
                state.recv_err = Some(e);
                Ok(())
            }
        }
    }
}

impl RouterListener for Recorder {
    fn handle_packet(&self, device: &Arc<dyn Device>, packet: &Packet<'_>) {
        match self.record_packet(device.as_ref(), packet) {
            Ok(()) => {}
            Err(StreamError::EncodingNotSupported) => {
                debug!("skipping unencodable packet from {}", device.id());
            }
            Err(e) => {
                error!("failed to record packet from {}: {}", device.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::remote::tests::test_headers;
    use crate::device::{DeviceRegistry, Ordinal, Remote, Router};
    use crate::replay::streamfile::{
        Compression, EventStreamConfig, EventStreamReader,
    };
    use pixelbridge_core::pixel::{BufferLayout, Pixel, PixelBuffer};
    use pixelbridge_core::protocol::{pixelpusher, Packet};
    use std::net::UdpSocket;

    fn pixel_packet(seed: u8) -> Packet<'static> {
        let mut pixels = PixelBuffer::with_len(BufferLayout::Rgb, 4);
        pixels.set_pixel(0, Pixel::rgb(seed, seed, seed));
        Packet::PixelPusher(pixelpusher::Packet::strip_states(
            0,
            vec![pixelpusher::StripState {
                strip_number: 0,
                pixels,
            }],
        ))
    }

    #[tokio::test]
    async fn records_routed_packets() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();

        let registry = DeviceRegistry::new();
        let router = Router::new(registry.clone());
        registry.add(Arc::new(Remote::new("aa:00", test_headers(port, 3, 4))));

        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("capture");
        let cfg = EventStreamConfig {
            compression: Compression::Snappy,
            compression_level: None,
            temp_dir: root.path().to_path_buf(),
        };

        let recorder = Recorder::new();
        recorder.start(cfg.make_writer(&dest, "capture").unwrap());
        router.add_listener(Arc::new(recorder.clone()));

        for seed in 1..=3u8 {
            router
                .route(Ordinal::INVALID, "aa:00", &pixel_packet(seed))
                .unwrap();
        }

        // Commands pass through the router but are skipped by the
        // recorder.
        let cmd = Packet::PixelPusher(pixelpusher::Packet::command(
            0,
            pixelpusher::Command::Reset,
        ));
        router.route(Ordinal::INVALID, "aa:00", &cmd).unwrap();

        let status = recorder.status().unwrap();
        assert_eq!(status.events, 3);
        assert!(status.error.is_none());

        recorder.stop().unwrap();
        router.shutdown();

        let mut reader = EventStreamReader::open(&dest).unwrap();
        for seed in 1..=3u8 {
            let event = reader.read_event().unwrap().unwrap();
            assert_eq!(event.pixel_data[0], seed);

            let device = reader.resolve_device_for_index(event.device).unwrap();
            assert_eq!(device.id, "aa:00");
            assert_eq!(device.device_ordinal(), Ordinal::new(3, 4));
        }
        assert!(reader.read_event().unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let recorder = Recorder::new();
        assert!(recorder.stop().is_ok());
        assert!(recorder.status().is_none());
    }
}
