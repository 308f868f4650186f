//! The event stream reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::event::Event;
use super::metadata::load_metadata;
use super::stream::RawStreamReader;
use super::{Metadata, StreamDevice, StreamError};

/// Reads events back from a stream file directory.
///
/// Event files are read sequentially in metadata order; each file's
/// device mapping is resolved against the global device list as the file
/// is opened.
pub struct EventStreamReader {
    path: PathBuf,
    md: Metadata,

    next_index: usize,
    current: Option<CurrentFile>,

    // The offset of the latest event in the current file, and the total
    // span of the files already finished.
    last_event_offset: Duration,
    cumulative_offset: Duration,
}

struct CurrentFile {
    reader: RawStreamReader,
    file_index: usize,

    // file-local device index -> global device list index.
    device_map: HashMap<i64, usize>,
}

impl EventStreamReader {
    /// Opens the stream file at `path`.
    pub fn open(path: &Path) -> Result<EventStreamReader, StreamError> {
        let md = load_metadata(path)?;
        Ok(EventStreamReader {
            path: path.to_path_buf(),
            md,
            next_index: 0,
            current: None,
            last_event_offset: Duration::ZERO,
            cumulative_offset: Duration::ZERO,
        })
    }

    /// The stream file's base directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.md
    }

    /// The offset of the latest event read, across all files.
    pub fn position(&self) -> Duration {
        self.cumulative_offset + self.last_event_offset
    }

    /// The total stream duration from the metadata.
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.md.duration_micros)
    }

    /// Rewinds the reader to the first event of the first file.
    pub fn reset(&mut self) {
        self.current = None;
        self.next_index = 0;
        self.last_event_offset = Duration::ZERO;
        self.cumulative_offset = Duration::ZERO;
    }

    /// Reads the next event, crossing into the next event file as needed.
    ///
    /// Returns `Ok(None)` at the end of the last file.
    pub fn read_event(&mut self) -> Result<Option<Event>, StreamError> {
        loop {
            if self.current.is_none() && !self.begin_next_file()? {
                return Ok(None);
            }
            let current = self.current.as_mut().unwrap();

            match Event::read_framed(&mut current.reader)? {
                Some(event) => {
                    if event.offset > self.last_event_offset {
                        self.last_event_offset = event.offset;
                    }
                    return Ok(Some(event));
                }
                None => {
                    // End of this file: roll its span into the cumulative
                    // offset and move on.
                    let efi = &self.md.event_files[current.file_index];
                    self.cumulative_offset += Duration::from_micros(efi.duration_micros);
                    self.last_event_offset = Duration::ZERO;
                    self.current = None;
                }
            }
        }
    }

    /// Resolves a file-local device index from the most recent
    /// [`EventStreamReader::read_event`] against the stream's device list.
    pub fn resolve_device_for_index(&self, index: i64) -> Option<&StreamDevice> {
        let current = self.current.as_ref()?;
        let global = *current.device_map.get(&index)?;
        self.md.devices.get(global)
    }

    /// Opens the next event file. Returns false when no files remain.
    fn begin_next_file(&mut self) -> Result<bool, StreamError> {
        if self.next_index >= self.md.event_files.len() {
            return Ok(false);
        }

        let file_index = self.next_index;
        self.next_index += 1;
        self.last_event_offset = Duration::ZERO;

        let efi = &self.md.event_files[file_index];
        let path = self.path.join(&efi.name);
        let fd =
            std::fs::File::open(&path).map_err(StreamError::io("open event file", &path))?;

        let mut device_map = HashMap::with_capacity(efi.device_mapping.len());
        for (local, global) in efi.device_mapping.iter().enumerate() {
            if *global >= 0 && (*global as usize) < self.md.devices.len() {
                device_map.insert(local as i64, *global as usize);
            }
        }

        self.current = Some(CurrentFile {
            reader: RawStreamReader::new(fd, efi.compression),
            file_index,
            device_map,
        });
        Ok(true)
    }
}
