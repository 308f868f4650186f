//! Metadata loading, construction, migration and merging.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::{
    Compression, EventFileInfo, Metadata, StreamDevice, StreamError, METADATA_FILE_NAME,
    METADATA_MINOR_VERSION,
};

/// Loads and migrates the metadata document from a stream directory.
pub(super) fn load_metadata(dir: &Path) -> Result<Metadata, StreamError> {
    let path = dir.join(METADATA_FILE_NAME);
    let data = std::fs::read(&path).map_err(StreamError::io("read metadata", &path))?;

    let mut md: Metadata = serde_json::from_slice(&data)?;
    migrate_metadata(&mut md)?;
    Ok(md)
}

/// Loads the metadata and the total event file size for a stream
/// directory.
pub fn load_metadata_and_size(dir: &Path) -> Result<(Metadata, u64), StreamError> {
    let md = load_metadata(dir)?;

    let mut size = 0;
    for efi in &md.event_files {
        let path = dir.join(&efi.name);
        let st = std::fs::metadata(&path).map_err(StreamError::io("stat event file", &path))?;
        size += st.len();
    }
    Ok((md, size))
}

/// Migrates `md` forwards one minor version at a time until it reaches the
/// current version. A step that fails to advance the version is an error.
pub(super) fn migrate_metadata(md: &mut Metadata) -> Result<(), StreamError> {
    while md.minor != METADATA_MINOR_VERSION {
        let cur = md.minor;

        if cur == 0 {
            migrate_metadata_0_to_1(md);
        }

        if md.minor <= cur {
            return Err(StreamError::Migration(cur));
        }
    }
    Ok(())
}

/// v0 -> v1: fold the file-level `event_file` list and compression into
/// per-file records, and give mapping-less event files an identity device
/// mapping.
fn migrate_metadata_0_to_1(md: &mut Metadata) {
    for name in std::mem::take(&mut md.event_file) {
        md.event_files.push(EventFileInfo {
            name,
            compression: md.compression.unwrap_or_default(),
            duration_micros: md.duration_micros,
            num_events: md.num_events,
            num_bytes: md.num_bytes,
            device_mapping: Vec::new(),
        });
    }
    md.compression = None;

    let identity: Vec<i64> = (0..md.devices.len() as i64).collect();
    for efi in &mut md.event_files {
        if efi.device_mapping.is_empty() {
            efi.device_mapping = identity.clone();
        }
    }

    md.minor = 1;
}

/// Constructs a metadata document incrementally as events are recorded or
/// merged.
pub struct MetadataBuilder {
    meta: Metadata,
    device_index_map: HashMap<String, i64>,
    cumulative_duration: Duration,

    // State for the event file currently being built.
    current_file: Option<EventFileInfo>,
    current_file_offset: Duration,
    current_device_index_map: HashMap<String, i64>,
}

impl MetadataBuilder {
    pub fn new(name: &str) -> Self {
        MetadataBuilder {
            meta: Metadata {
                name: name.to_string(),
                ..Metadata::default()
            },
            device_index_map: HashMap::new(),
            cumulative_duration: Duration::ZERO,
            current_file: None,
            current_file_offset: Duration::ZERO,
            current_device_index_map: HashMap::new(),
        }
    }

    /// Begins a new event file record, finishing any current one.
    pub fn add_event_file(&mut self, name: &str, compression: Compression) {
        self.finish_file_info();
        self.current_file = Some(EventFileInfo {
            name: name.to_string(),
            compression,
            ..EventFileInfo::default()
        });
    }

    /// Returns the current event file's local index for the device with
    /// the given ID, registering the device (generated by `gen`) in the
    /// global list and the file's mapping on first sight.
    pub fn device_internal_index(
        &mut self,
        id: &str,
        gen: impl FnOnce() -> StreamDevice,
    ) -> i64 {
        if let Some(file_index) = self.current_device_index_map.get(id) {
            return *file_index;
        }

        let device_index = self.register_device(id, gen);

        let efi = self
            .current_file
            .as_mut()
            .expect("no current event file");
        let file_index = efi.device_mapping.len() as i64;
        efi.device_mapping.push(device_index);

        self.current_device_index_map
            .insert(id.to_string(), file_index);
        file_index
    }

    /// Returns the global device list index for `id`, registering the
    /// device on first sight.
    fn register_device(&mut self, id: &str, gen: impl FnOnce() -> StreamDevice) -> i64 {
        if let Some(device_index) = self.device_index_map.get(id) {
            return *device_index;
        }

        let device_index = self.meta.devices.len() as i64;
        self.meta.devices.push(gen());
        self.device_index_map.insert(id.to_string(), device_index);
        device_index
    }

    /// Updates event stats for one recorded event.
    pub fn record_event(&mut self, bytes: i64, offset: Duration) {
        if self.current_file_offset < offset {
            self.current_file_offset = offset;
        }

        let efi = self
            .current_file
            .as_mut()
            .expect("no current event file");
        efi.num_events += 1;
        efi.num_bytes += bytes;

        self.meta.num_events += 1;
        self.meta.num_bytes += bytes;
    }

    pub fn num_events(&self) -> i64 {
        self.meta.num_events
    }

    pub fn num_bytes(&self) -> i64 {
        self.meta.num_bytes
    }

    /// The stream offset recorded so far: finished files plus the current
    /// file's span.
    pub fn offset(&self) -> Duration {
        self.cumulative_duration + self.current_file_offset
    }

    /// Folds another stream's metadata into this builder: its event files
    /// are appended with their device mappings rewritten against this
    /// builder's device list.
    ///
    /// On error the builder is left in an indeterminate state.
    pub fn merge(&mut self, md: Metadata) -> Result<(), StreamError> {
        self.finish_file_info();

        let devices = md.devices;
        for mut efi in md.event_files {
            self.cumulative_duration += Duration::from_micros(efi.duration_micros);
            self.meta.num_events += efi.num_events;
            self.meta.num_bytes += efi.num_bytes;

            // Rewrite the file's device map: resolve each local index in
            // its source metadata, then register that device here.
            for i in 0..efi.device_mapping.len() {
                let d = efi
                    .device_for_internal_index(i as i64, &devices)
                    .ok_or(StreamError::UnknownDevice(i as i64))?
                    .clone();

                let device_index = self.register_device(&d.id, || d.clone());
                assert_devices_compat(&d, &self.meta.devices[device_index as usize])?;

                efi.device_mapping[i] = device_index;
            }

            self.meta.event_files.push(efi);
        }
        Ok(())
    }

    /// Finalizes and writes the metadata document to `path`.
    pub fn write(&mut self, path: &Path) -> Result<(), StreamError> {
        self.finish_file_info();
        self.meta.duration_micros = self.cumulative_duration.as_micros() as u64;
        self.sort_device_list();

        let data = serde_json::to_vec_pretty(&self.meta)?;
        std::fs::write(path, data).map_err(StreamError::io("write metadata", path))
    }

    fn finish_file_info(&mut self) {
        let Some(mut efi) = self.current_file.take() else {
            return;
        };

        efi.duration_micros = self.current_file_offset.as_micros() as u64;
        self.meta.event_files.push(efi);

        self.cumulative_duration += self.current_file_offset;
        self.current_file_offset = Duration::ZERO;
        self.current_device_index_map.clear();
    }

    /// Sorts the device list for human accessibility: devices without
    /// ordinals first (by ID), then by group, controller, and ID. Event
    /// file mappings are rewritten to track the shuffle.
    fn sort_device_list(&mut self) {
        let mut order: Vec<usize> = (0..self.meta.devices.len()).collect();
        order.sort_by(|a, b| {
            let (da, db) = (&self.meta.devices[*a], &self.meta.devices[*b]);
            match (&da.ordinal, &db.ordinal) {
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, None) => da.id.cmp(&db.id),
                (Some(oa), Some(ob)) => oa
                    .group
                    .cmp(&ob.group)
                    .then(oa.controller.cmp(&ob.controller))
                    .then(da.id.cmp(&db.id)),
            }
        });

        if order.iter().enumerate().all(|(new, old)| new == *old) {
            return;
        }

        // order[new] = old; invert to map old indices to new ones.
        let mut new_index = vec![0i64; order.len()];
        for (new, old) in order.iter().enumerate() {
            new_index[*old] = new as i64;
        }

        let mut sorted = Vec::with_capacity(self.meta.devices.len());
        for old in &order {
            sorted.push(self.meta.devices[*old].clone());
        }
        self.meta.devices = sorted;

        for efi in &mut self.meta.event_files {
            for index in &mut efi.device_mapping {
                *index = new_index[*index as usize];
            }
        }

        for index in self.device_index_map.values_mut() {
            *index = new_index[*index as usize];
        }
    }
}

fn assert_devices_compat(a: &StreamDevice, b: &StreamDevice) -> Result<(), StreamError> {
    if a.id != b.id {
        return Err(StreamError::IncompatibleDevice {
            id: a.id.clone(),
            reason: "unequal IDs",
        });
    }
    if a.pixels_per_strip != b.pixels_per_strip {
        return Err(StreamError::IncompatibleDevice {
            id: a.id.clone(),
            reason: "pixels per strip do not match",
        });
    }
    if a.strips.len() != b.strips.len() {
        return Err(StreamError::IncompatibleDevice {
            id: a.id.clone(),
            reason: "strip counts do not match",
        });
    }
    Ok(())
}
