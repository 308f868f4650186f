//! The on-disk stream file format.
//!
//! A stream file is a directory holding a metadata document and one or
//! more event files. Each event file is a sequence of varint-length-
//! prefixed binary event records, optionally compressed. The metadata
//! carries a global device list; each event file maps its file-local
//! device indices into that list, which lets stream files be merged
//! without rewriting event payloads.

mod event;
mod merge;
mod metadata;
mod reader;
mod staging;
mod stream;
mod writer;

pub use event::Event;
pub use merge::merge;
pub use metadata::{load_metadata_and_size, MetadataBuilder};
pub use reader::EventStreamReader;
pub use writer::{EventStreamConfig, EventStreamWriter};

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pixelbridge_core::pixel::BufferLayout;

use crate::device::Ordinal;

/// The compatibility version of the metadata document.
pub const METADATA_VERSION: u32 = 1;

/// The current metadata minor (migration) version.
pub const METADATA_MINOR_VERSION: u32 = 1;

/// The name of the metadata file within a stream directory.
pub const METADATA_FILE_NAME: &str = "metadata.v1.proto.text";

/// The extension used for event stream binary files.
pub const EVENT_FILE_EXT: &str = ".protostream";

/// The event file name used for newly recorded streams. A single stream
/// writer produces exactly one event file.
pub const EVENT_FILE_NAME: &str = "events.protostream";

/// Errors produced by stream file reading, writing and merging.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The recorder was asked to serialize a packet kind it does not
    /// support. Not fatal to a recording session.
    #[error("packet encoding not supported")]
    EncodingNotSupported,

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// A migration step failed to advance the metadata minor version.
    #[error("metadata migration did not advance version (minor {0})")]
    Migration(u32),

    /// Two stream files disagree about a device with the same ID.
    #[error("device {id:?} is not compatible: {reason}")]
    IncompatibleDevice { id: String, reason: &'static str },

    /// An event referenced a device index with no metadata entry.
    #[error("event references unknown device index {0}")]
    UnknownDevice(i64),

    #[error("corrupt event record: {0}")]
    CorruptEvent(&'static str),
}

impl StreamError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| StreamError::Io { op, path, source }
    }
}

/// The compression applied to an event file.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Gzip,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "NONE"),
            Compression::Snappy => write!(f, "SNAPPY"),
            Compression::Gzip => write!(f, "GZIP"),
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Compression::None),
            "SNAPPY" => Ok(Compression::Snappy),
            "GZIP" => Ok(Compression::Gzip),
            other => Err(format!("unknown compression type: {:?}", other)),
        }
    }
}

/// A strip's pixel encoding, recorded per device strip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PixelType {
    #[default]
    Rgb,
    Rgbow,
}

impl PixelType {
    pub fn layout(self) -> BufferLayout {
        match self {
            PixelType::Rgb => BufferLayout::Rgb,
            PixelType::Rgbow => BufferLayout::Rgbow,
        }
    }

    pub fn from_layout(layout: BufferLayout) -> Self {
        match layout {
            BufferLayout::Rgb => PixelType::Rgb,
            BufferLayout::Rgbow => PixelType::Rgbow,
        }
    }
}

/// A device ordinal as recorded in stream metadata. Only valid ordinals
/// are recorded; devices without one omit the field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOrdinal {
    pub group: i32,
    pub controller: i32,
}

/// A single strip of a recorded device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStrip {
    pub pixel_type: PixelType,
}

/// A device in the stream's global device list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDevice {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<StreamOrdinal>,

    #[serde(default)]
    pub pixels_per_strip: u32,

    #[serde(default)]
    pub strips: Vec<StreamStrip>,
}

impl StreamDevice {
    /// The device's ordinal, or the invalid ordinal when none was
    /// recorded.
    pub fn device_ordinal(&self) -> Ordinal {
        match self.ordinal {
            Some(o) => Ordinal::new(o.group, o.controller),
            None => Ordinal::INVALID,
        }
    }

    /// The pixel layout of strip `i`, if the strip exists.
    pub fn strip_layout(&self, i: usize) -> Option<BufferLayout> {
        self.strips.get(i).map(|s| s.pixel_type.layout())
    }
}

/// The per-event-file record within the metadata document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFileInfo {
    pub name: String,

    #[serde(default)]
    pub compression: Compression,

    /// The span covered by this file's events, in microseconds.
    #[serde(default)]
    pub duration_micros: u64,

    #[serde(default)]
    pub num_events: i64,

    #[serde(default)]
    pub num_bytes: i64,

    /// Maps this file's local device indices to indices into the global
    /// device list.
    #[serde(default)]
    pub device_mapping: Vec<i64>,
}

impl EventFileInfo {
    /// Resolves a file-local device index against the global device list.
    pub fn device_for_internal_index<'a>(
        &self,
        index: i64,
        devices: &'a [StreamDevice],
    ) -> Option<&'a StreamDevice> {
        if index < 0 {
            return None;
        }
        let global = *self.device_mapping.get(index as usize)?;
        if global < 0 {
            return None;
        }
        devices.get(global as usize)
    }
}

/// The stream's metadata document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,

    /// The migration counter. Loading migrates older documents forward
    /// one minor version at a time.
    pub minor: u32,

    pub name: String,
    pub created: chrono::DateTime<chrono::Utc>,

    /// Total stream duration across all event files, in microseconds.
    #[serde(default)]
    pub duration_micros: u64,

    #[serde(default)]
    pub num_events: i64,

    #[serde(default)]
    pub num_bytes: i64,

    #[serde(default)]
    pub devices: Vec<StreamDevice>,

    #[serde(default)]
    pub event_files: Vec<EventFileInfo>,

    // Legacy minor-version-0 fields, folded into `event_files` by
    // migration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_file: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            version: METADATA_VERSION,
            minor: METADATA_MINOR_VERSION,
            name: String::new(),
            created: chrono::Utc::now(),
            duration_micros: 0,
            num_events: 0,
            num_bytes: 0,
            devices: Vec::new(),
            event_files: Vec::new(),
            event_file: Vec::new(),
            compression: None,
        }
    }
}

/// Validates that `path` is a stream file directory with loadable
/// metadata.
pub fn validate(path: &Path) -> Result<(), StreamError> {
    let st = std::fs::metadata(path).map_err(StreamError::io("stat", path))?;
    if !st.is_dir() {
        return Err(StreamError::Io {
            op: "stat",
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "is not a directory"),
        });
    }
    metadata::load_metadata(path)?;
    Ok(())
}

/// Deletes the stream file at `path`.
pub fn delete(path: &Path) -> Result<(), StreamError> {
    std::fs::remove_dir_all(path).map_err(StreamError::io("remove", path))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::remote::tests::test_headers;
    use crate::device::Remote;
    use pixelbridge_core::pixel::{BufferLayout, Pixel, PixelBuffer};
    use pixelbridge_core::protocol::{pixelpusher, Packet};

    fn config(temp: &Path, compression: Compression) -> EventStreamConfig {
        EventStreamConfig {
            compression,
            compression_level: None,
            temp_dir: temp.to_path_buf(),
        }
    }

    fn device(id: &str, controller: i32) -> Remote {
        Remote::new(id, test_headers(9897, 1, controller))
    }

    fn strip_packet(strip_number: u8, seed: u8) -> Packet<'static> {
        let mut pixels = PixelBuffer::new(BufferLayout::Rgb);
        pixels.set_pixels(&[
            Pixel::rgb(seed, seed, seed),
            Pixel::rgb(seed + 1, seed + 1, seed + 1),
            Pixel::rgb(seed + 2, seed + 2, seed + 2),
            Pixel::rgb(seed + 3, seed + 3, seed + 3),
        ]);
        Packet::PixelPusher(pixelpusher::Packet::strip_states(
            0,
            vec![pixelpusher::StripState {
                strip_number,
                pixels,
            }],
        ))
    }

    #[tokio::test]
    async fn stream_round_trip_for_each_compression() {
        for compression in [Compression::None, Compression::Snappy, Compression::Gzip] {
            let root = tempfile::tempdir().unwrap();
            let dest = root.path().join("stream");
            let cfg = config(root.path(), compression);

            let d = device("aa:00", 1);
            let mut writer = cfg.make_writer(&dest, "round trip").unwrap();
            for i in 0..5u8 {
                writer.write_packet(&d, &strip_packet(i % 2, i * 10)).unwrap();
            }
            assert_eq!(writer.num_events(), 5);
            writer.close().unwrap();

            let mut reader = EventStreamReader::open(&dest).unwrap();
            assert_eq!(reader.metadata().event_files[0].compression, compression);

            for i in 0..5u8 {
                let event = reader.read_event().unwrap().unwrap();
                assert_eq!(event.strip_number, i % 2);
                assert_eq!(event.pixel_data[0], i * 10);

                let sd = reader.resolve_device_for_index(event.device).unwrap();
                assert_eq!(sd.id, "aa:00");
            }
            // Past the last event the reader reports a clean end, and
            // reset rewinds to the first event.
            assert!(reader.read_event().unwrap().is_none());
            reader.reset();
            let first = reader.read_event().unwrap().unwrap();
            assert_eq!(first.pixel_data[0], 0);
        }
    }

    #[tokio::test]
    async fn empty_streams_are_discarded() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("stream");

        let writer = config(root.path(), Compression::None)
            .make_writer(&dest, "empty")
            .unwrap();
        writer.close().unwrap();

        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn commands_are_reported_but_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("stream");
        let cfg = config(root.path(), Compression::None);

        let d = device("aa:00", 1);
        let mut writer = cfg.make_writer(&dest, "with command").unwrap();

        let cmd = Packet::PixelPusher(pixelpusher::Packet::command(
            0,
            pixelpusher::Command::Reset,
        ));
        assert!(matches!(
            writer.write_packet(&d, &cmd),
            Err(StreamError::EncodingNotSupported)
        ));

        // The stream still works afterwards.
        writer.write_packet(&d, &strip_packet(0, 1)).unwrap();
        writer.close().unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn closing_over_an_existing_stream_replaces_it() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("stream");
        let cfg = config(root.path(), Compression::None);

        for seed in [10u8, 20] {
            let d = device("aa:00", 1);
            let mut writer = cfg.make_writer(&dest, "take").unwrap();
            writer.write_packet(&d, &strip_packet(0, seed)).unwrap();
            writer.close().unwrap();
        }

        let mut reader = EventStreamReader::open(&dest).unwrap();
        let event = reader.read_event().unwrap().unwrap();
        assert_eq!(event.pixel_data[0], 20);
    }

    #[tokio::test]
    async fn merge_unions_devices_and_remaps_files() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(root.path(), Compression::None);

        // Stream one: devices aa and bb. Stream two: bb and cc.
        let stream_a = root.path().join("a");
        let mut writer = cfg.make_writer(&stream_a, "a").unwrap();
        writer
            .write_packet(&device("aa:00", 1), &strip_packet(0, 1))
            .unwrap();
        writer
            .write_packet(&device("bb:00", 2), &strip_packet(0, 2))
            .unwrap();
        writer.close().unwrap();

        let stream_b = root.path().join("b");
        let mut writer = cfg.make_writer(&stream_b, "b").unwrap();
        writer
            .write_packet(&device("bb:00", 2), &strip_packet(0, 3))
            .unwrap();
        writer
            .write_packet(&device("cc:00", 3), &strip_packet(0, 4))
            .unwrap();
        writer.close().unwrap();

        let merged = root.path().join("merged");
        merge(&cfg, &merged, "merged", &[&stream_a, &stream_b]).unwrap();

        let md = metadata::load_metadata(&merged).unwrap();

        // Union of devices, ordered by (group, controller, id).
        let ids: Vec<&str> = md.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["aa:00", "bb:00", "cc:00"]);
        assert_eq!(md.event_files.len(), 2);
        assert_eq!(md.num_events, 4);

        // The merged event files are the source payloads, byte for byte.
        let original = std::fs::read(stream_a.join(EVENT_FILE_NAME)).unwrap();
        let linked = std::fs::read(merged.join(&md.event_files[0].name)).unwrap();
        assert_eq!(original, linked);

        // Reading the merged stream resolves every event to its device.
        let mut reader = EventStreamReader::open(&merged).unwrap();
        let mut seen = Vec::new();
        while let Some(event) = reader.read_event().unwrap() {
            let sd = reader.resolve_device_for_index(event.device).unwrap();
            seen.push((sd.id.clone(), event.pixel_data[0]));
        }
        assert_eq!(
            seen,
            vec![
                ("aa:00".to_string(), 1),
                ("bb:00".to_string(), 2),
                ("bb:00".to_string(), 3),
                ("cc:00".to_string(), 4),
            ]
        );
    }
}
