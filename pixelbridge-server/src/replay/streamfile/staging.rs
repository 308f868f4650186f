//! Atomic stream construction via a staging directory.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::TempDir;

use super::StreamError;

/// A staging directory for stream construction.
///
/// While active, the directory lives in a temporary location. On commit it
/// is atomically renamed into its destination; if it is dropped
/// uncommitted, it is deleted along with its contents.
pub(super) struct StagingDir {
    temp_root: PathBuf,
    dir: Option<TempDir>,
}

impl StagingDir {
    /// Creates a staging directory under `temp_root` with the given name
    /// prefix.
    pub(super) fn new(temp_root: &Path, prefix: &str) -> Result<StagingDir, StreamError> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(temp_root)
            .map_err(StreamError::io("create staging directory", temp_root))?;

        Ok(StagingDir {
            temp_root: temp_root.to_path_buf(),
            dir: Some(dir),
        })
    }

    /// Builds a path to `name` inside the staging directory.
    pub(super) fn path(&self, name: &str) -> PathBuf {
        self.dir
            .as_ref()
            .expect("staging directory already committed")
            .path()
            .join(name)
    }

    /// Finalizes the staging directory, atomically renaming it to `dest`.
    ///
    /// Anything already at `dest` is first moved aside into the temporary
    /// root and deleted in the background.
    pub(super) fn commit(mut self, dest: &Path) -> Result<(), StreamError> {
        if dest.exists() {
            let kill_dir = tempfile::Builder::new()
                .prefix("overwrite")
                .tempdir_in(&self.temp_root)
                .map_err(StreamError::io("create overwrite directory", &self.temp_root))?
                .keep();

            let displaced =
                kill_dir.join(dest.file_name().unwrap_or(std::ffi::OsStr::new("displaced")));
            // Best effort: if the move fails, the rename below still gets
            // its chance.
            if let Err(e) = fs::rename(dest, &displaced) {
                debug!("failed to displace {}: {}", dest.display(), e);
            }

            std::thread::spawn(move || {
                let _ = fs::remove_dir_all(kill_dir);
            });
        }

        let staged = self
            .dir
            .take()
            .expect("staging directory already committed")
            .keep();
        fs::rename(&staged, dest).map_err(StreamError::io("commit staging directory", dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_moves_content_into_place() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("stream");

        let staging = StagingDir::new(root.path(), "stream").unwrap();
        fs::write(staging.path("file.txt"), b"content").unwrap();
        staging.commit(&dest).unwrap();

        assert_eq!(fs::read(dest.join("file.txt")).unwrap(), b"content");
    }

    #[test]
    fn drop_without_commit_discards() {
        let root = tempfile::tempdir().unwrap();

        let staged_path;
        {
            let staging = StagingDir::new(root.path(), "stream").unwrap();
            staged_path = staging.path("file.txt");
            fs::write(&staged_path, b"content").unwrap();
        }
        assert!(!staged_path.exists());
    }

    #[test]
    fn commit_displaces_an_existing_destination() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("stream");

        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("old.txt"), b"old").unwrap();

        let staging = StagingDir::new(root.path(), "stream").unwrap();
        fs::write(staging.path("new.txt"), b"new").unwrap();
        staging.commit(&dest).unwrap();

        assert!(dest.join("new.txt").exists());
        assert!(!dest.join("old.txt").exists());
    }
}
