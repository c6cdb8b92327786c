//! One segment of a log: a byte store plus its in-memory key index.

use crate::error::{CoreError, CoreResult};
use crate::log::frame::{decode_frame, frame_len, FrameReader};
use crate::log::{LogKey, PositionStrategy};
use dirsync_storage::StorageBackend;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct IndexEntry<K> {
    key: K,
    offset: u64,
    len: u32,
}

/// A segment file and the key, offset and length of every frame in it.
///
/// The index is rebuilt by scanning the frames on open. A torn trailing frame
/// is cut off so the next append starts on a frame boundary.
pub(crate) struct Segment<K> {
    id: u64,
    backend: Box<dyn StorageBackend>,
    index: Vec<IndexEntry<K>>,
    size: u64,
}

impl<K: LogKey> Segment<K> {
    pub(crate) fn open(stream: &str, id: u64, mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let mut index: Vec<IndexEntry<K>> = Vec::new();
        let torn_at = {
            let mut reader = FrameReader::new(backend.as_ref(), 0)?;
            for frame in reader.by_ref() {
                let (offset, payload) = frame?;
                let (key, _) = K::decode_key(&payload)?;
                if let Some(last) = index.last() {
                    if key <= last.key {
                        return Err(CoreError::log_corruption(format!(
                            "{stream} segment {id}: key {key} follows {}",
                            last.key
                        )));
                    }
                }
                let len = u32::try_from(frame_len(payload.len()))
                    .map_err(|_| CoreError::log_corruption("frame length overflow"))?;
                index.push(IndexEntry { key, offset, len });
            }
            reader.clean_end()
        };

        if let Some(offset) = torn_at {
            warn!(stream, segment = id, offset, "dropping torn frame at segment tail");
            backend.truncate(offset)?;
        }
        let size = backend.size()?;

        Ok(Self {
            id,
            backend,
            index,
            size,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn first_key(&self) -> Option<K> {
        self.index.first().map(|e| e.key)
    }

    pub(crate) fn last_key(&self) -> Option<K> {
        self.index.last().map(|e| e.key)
    }

    /// Index of the first entry satisfying `strategy` relative to `key`.
    pub(crate) fn lower_bound(&self, key: K, strategy: PositionStrategy) -> usize {
        match strategy {
            PositionStrategy::AtOrAfter => self.index.partition_point(|e| e.key < key),
            PositionStrategy::StrictlyAfter => self.index.partition_point(|e| e.key <= key),
        }
    }

    pub(crate) fn append(&mut self, key: K, frame: &[u8]) -> CoreResult<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| CoreError::invalid_operation("frame larger than 4 GiB"))?;
        match self.backend.append(frame) {
            Ok(offset) => {
                self.index.push(IndexEntry { key, offset, len });
                self.size = offset + u64::from(len);
                Ok(())
            }
            Err(e) => {
                // Drop whatever part of the frame reached the segment.
                if let Err(undo) = self.backend.truncate(self.size) {
                    warn!(segment = self.id, error = %undo, "could not roll back failed append");
                }
                Err(e.into())
            }
        }
    }

    /// Reads the payload (key and value bytes) of entry `idx`.
    pub(crate) fn read_payload(&self, idx: usize) -> CoreResult<Vec<u8>> {
        let entry = self.index.get(idx).ok_or_else(|| {
            CoreError::invalid_operation(format!("segment {} has no entry {idx}", self.id))
        })?;
        let frame = self.backend.read_at(entry.offset, entry.len as usize)?;
        Ok(decode_frame(&frame)?.to_vec())
    }

    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }
}
