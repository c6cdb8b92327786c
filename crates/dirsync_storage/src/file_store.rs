//! Segment store on the local file system.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├─ LOCK                                  # exclusive advisory lock
//! └─ streams/
//!    └─ <hex(stream name)>/
//!       ├─ 00000000000000000000.log
//!       └─ 00000000000000000001.log
//! ```
//!
//! Stream names carry DNs (`,`, `=`, spaces), so each one is hex-encoded into
//! a single directory name.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::store::{validate_stream, SegmentStore};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const STREAMS_DIR: &str = "streams";
const SEGMENT_SUFFIX: &str = ".log";

/// A [`SegmentStore`] rooted at a directory.
///
/// Holds an exclusive lock on `<root>/LOCK` for its lifetime, so two
/// processes never append to the same replica logs.
#[derive(Debug)]
pub struct FileSegmentStore {
    root: PathBuf,
    _lock_file: File,
}

impl FileSegmentStore {
    /// Opens or creates a store at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the store,
    /// or an I/O error.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root.join(STREAMS_DIR))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.display().to_string()));
        }

        debug!(root = %root.display(), "opened segment store");
        Ok(Self {
            root: root.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_dir(&self, stream: &str) -> PathBuf {
        self.root.join(STREAMS_DIR).join(encode_name(stream))
    }

    fn segment_path(&self, stream: &str, segment: u64) -> PathBuf {
        self.stream_dir(stream)
            .join(format!("{segment:020}{SEGMENT_SUFFIX}"))
    }
}

impl SegmentStore for FileSegmentStore {
    fn list_streams(&self) -> StorageResult<Vec<String>> {
        let mut streams = Vec::new();
        for entry in fs::read_dir(self.root.join(STREAMS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().and_then(decode_name) else {
                continue;
            };
            if !self.list_segments(&name)?.is_empty() {
                streams.push(name);
            }
        }
        streams.sort();
        Ok(streams)
    }

    fn list_segments(&self, stream: &str) -> StorageResult<Vec<u64>> {
        let dir = self.stream_dir(stream);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(SEGMENT_SUFFIX))
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            segments.push(id);
        }
        segments.sort_unstable();
        Ok(segments)
    }

    fn open_segment(&self, stream: &str, segment: u64) -> StorageResult<Box<dyn StorageBackend>> {
        validate_stream(stream)?;
        let backend = FileBackend::open_with_create_dirs(&self.segment_path(stream, segment))?;
        Ok(Box::new(backend))
    }

    fn remove_segment(&self, stream: &str, segment: u64) -> StorageResult<()> {
        let path = self.segment_path(stream, segment);
        if !path.exists() {
            return Err(StorageError::segment_not_found(stream, segment));
        }
        fs::remove_file(&path)?;

        let dir = self.stream_dir(stream);
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
        }
        Ok(())
    }
}

fn encode_name(name: &str) -> String {
    name.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_name(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn name_encoding_round_trips_dns() {
        let name = "changelog/dc=example, dc=com/42";
        assert_eq!(decode_name(&encode_name(name)).as_deref(), Some(name));
        assert_eq!(decode_name("abc"), None);
        assert_eq!(decode_name("zz"), None);
    }

    #[test]
    fn segments_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileSegmentStore::open(dir.path()).unwrap();
            let mut segment = store.open_segment("changelog/dc=a/1", 0).unwrap();
            segment.append(b"record").unwrap();
            segment.sync().unwrap();
            store.open_segment("changelog/dc=a/1", 1).unwrap();
        }

        let store = FileSegmentStore::open(dir.path()).unwrap();
        assert_eq!(store.list_streams().unwrap(), vec!["changelog/dc=a/1"]);
        assert_eq!(store.list_segments("changelog/dc=a/1").unwrap(), vec![0, 1]);
        let segment = store.open_segment("changelog/dc=a/1", 0).unwrap();
        assert_eq!(segment.read_at(0, 6).unwrap(), b"record");
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _store = FileSegmentStore::open(dir.path()).unwrap();
        assert!(matches!(
            FileSegmentStore::open(dir.path()),
            Err(StorageError::Locked(_))
        ));
    }

    #[test]
    fn removing_last_segment_drops_stream() {
        let dir = tempdir().unwrap();
        let store = FileSegmentStore::open(dir.path()).unwrap();
        store.open_segment("state/dc=a", 0).unwrap();
        store.open_segment("state/dc=a", 1).unwrap();

        store.remove_segment("state/dc=a", 0).unwrap();
        assert_eq!(store.list_segments("state/dc=a").unwrap(), vec![1]);
        store.remove_stream("state/dc=a").unwrap();
        assert!(store.list_streams().unwrap().is_empty());
        assert!(matches!(
            store.remove_segment("state/dc=a", 1),
            Err(StorageError::SegmentNotFound { .. })
        ));
    }
}
