//! Merging stream files.

use std::fs;
use std::path::Path;

use log::debug;

use super::metadata::load_metadata;
use super::staging::StagingDir;
use super::writer::EventStreamConfig;
use super::{StreamError, EVENT_FILE_EXT, METADATA_FILE_NAME};

/// Merges the stream files at `paths` into a new stream file at `dest`.
///
/// Event files are hardlinked into the merged stream where the filesystem
/// allows it (falling back to a byte copy), so the merge is near-instant
/// and payloads are never rewritten. Each source's device mapping is
/// remapped onto the union device list.
pub fn merge(
    cfg: &EventStreamConfig,
    dest: &Path,
    display_name: &str,
    paths: &[&Path],
) -> Result<(), StreamError> {
    let mut mb = super::MetadataBuilder::new(display_name);

    let prefix = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merge".to_string());
    let staging = StagingDir::new(&cfg.temp_dir, &prefix)?;

    for (i, path) in paths.iter().enumerate() {
        let mut md = load_metadata(path)?;

        // Link or copy each event file into the staging directory under a
        // collision-free name, updating the metadata to match before it is
        // merged.
        for (j, efi) in md.event_files.iter_mut().enumerate() {
            let src = path.join(&efi.name);
            efi.name = format!("merged.{}.{}{}", i, j, EVENT_FILE_EXT);
            let dst = staging.path(&efi.name);
            hard_link_or_copy(&src, &dst)?;
        }

        mb.merge(md)?;
    }

    mb.write(&staging.path(METADATA_FILE_NAME))?;
    staging.commit(dest)
}

/// Makes `dst` the same file as `src`, ideally by hardlink.
fn hard_link_or_copy(src: &Path, dst: &Path) -> Result<(), StreamError> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }

    debug!(
        "hardlink {} => {} failed; copying",
        src.display(),
        dst.display()
    );
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(StreamError::io("copy event file", src))
}
