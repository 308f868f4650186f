//! The event stream writer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use pixelbridge_core::protocol::Packet;

use crate::device::Device;

use super::event::encode_packet;
use super::staging::StagingDir;
use super::stream::RawStreamWriter;
use super::{
    Compression, MetadataBuilder, PixelType, StreamDevice, StreamError, StreamOrdinal,
    StreamStrip, EVENT_FILE_NAME, METADATA_FILE_NAME,
};

/// Configuration for generating event streams.
#[derive(Clone, Debug)]
pub struct EventStreamConfig {
    /// The compression to apply when writing event files.
    pub compression: Compression,

    /// The compression level, where the codec has one.
    pub compression_level: Option<u32>,

    /// The directory used for staging in-progress streams. Committing is
    /// an atomic rename, so this should live on the same filesystem as the
    /// destination.
    pub temp_dir: PathBuf,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        EventStreamConfig {
            compression: Compression::None,
            compression_level: None,
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl EventStreamConfig {
    /// Creates a writer that will construct a stream file at `path`.
    ///
    /// The stream is built in a staging directory and atomically moved to
    /// `path` on close.
    pub fn make_writer(
        &self,
        path: &Path,
        display_name: &str,
    ) -> Result<EventStreamWriter, StreamError> {
        let mut mb = MetadataBuilder::new(display_name);

        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());
        let staging = StagingDir::new(&self.temp_dir, &prefix)?;

        let event_path = staging.path(EVENT_FILE_NAME);
        let fd = std::fs::File::create(&event_path)
            .map_err(StreamError::io("create event file", &event_path))?;
        let writer = RawStreamWriter::new(fd, self.compression, self.compression_level);

        mb.add_event_file(EVENT_FILE_NAME, self.compression);

        Ok(EventStreamWriter {
            staging,
            dest: path.to_path_buf(),
            writer: Some(writer),
            mb,
            start: None,
        })
    }
}

/// Writes packets to a stream file under construction.
pub struct EventStreamWriter {
    staging: StagingDir,
    dest: PathBuf,
    writer: Option<RawStreamWriter>,
    mb: MetadataBuilder,

    // Set on the first event; offsets are measured from it.
    start: Option<Instant>,
}

impl EventStreamWriter {
    /// The destination path of the stream being written (not the staging
    /// directory used to construct it).
    pub fn path(&self) -> &Path {
        &self.dest
    }

    /// The number of events recorded so far.
    pub fn num_events(&self) -> i64 {
        self.mb.num_events()
    }

    /// The number of bytes recorded so far.
    pub fn num_bytes(&self) -> i64 {
        self.mb.num_bytes()
    }

    /// The duration of the recording so far.
    pub fn duration(&self) -> Duration {
        self.mb.offset()
    }

    /// Writes one packet as one event per strip state.
    ///
    /// The first event is recorded at offset zero; later events carry
    /// their duration from that first write.
    pub fn write_packet(
        &mut self,
        device: &dyn Device,
        packet: &Packet<'_>,
    ) -> Result<(), StreamError> {
        let device_index = self
            .mb
            .device_internal_index(device.id(), || stream_device_record(device));

        let offset = match self.start {
            Some(start) => start.elapsed(),
            None => {
                self.start = Some(Instant::now());
                Duration::ZERO
            }
        };

        let events = encode_packet(device_index, packet, offset)?;
        if events.is_empty() {
            return Ok(());
        }

        let writer = self.writer.as_mut().expect("writer already closed");
        let mut total = 0i64;
        for event in &events {
            let n = event
                .write_framed(writer)
                .map_err(StreamError::io("write event", &self.dest))?;
            total += n as i64;
        }

        self.mb.record_event(total, offset);
        Ok(())
    }

    /// Finalizes the stream, writing its metadata and atomically moving it
    /// into place.
    ///
    /// A stream with no recorded events is discarded rather than
    /// committed.
    pub fn close(mut self) -> Result<(), StreamError> {
        if let Some(writer) = self.writer.take() {
            writer
                .finish()
                .map_err(StreamError::io("finish event file", &self.dest))?;
        }

        // Nothing recorded: let the staging directory be discarded on
        // drop instead of wasting space on an empty stream.
        if self.mb.num_events() == 0 {
            return Ok(());
        }

        self.mb.write(&self.staging.path(METADATA_FILE_NAME))?;
        self.staging.commit(&self.dest)
    }
}

/// Builds the metadata record for a device from its live state.
fn stream_device_record(device: &dyn Device) -> StreamDevice {
    let ordinal = device.ordinal();

    let mut record = StreamDevice {
        id: device.id().to_string(),
        ordinal: ordinal.is_valid().then(|| StreamOrdinal {
            group: ordinal.group,
            controller: ordinal.controller,
        }),
        pixels_per_strip: 0,
        strips: Vec::new(),
    };

    if let Some(dh) = device.discovery_headers() {
        if let Some(pp) = dh.pixel_pusher() {
            record.pixels_per_strip = u32::from(pp.pixels_per_strip);
            record.strips = pp
                .strip_flags
                .iter()
                .map(|sf| StreamStrip {
                    pixel_type: PixelType::from_layout(sf.layout()),
                })
                .collect();
        }
    }
    record
}
