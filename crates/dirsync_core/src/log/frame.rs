//! Checksummed frames inside a log segment.
//!
//! ```text
//! magic "DSLG" (4) | version u16 LE (2) | length u32 LE (4) | payload | crc32 LE (4)
//! ```
//!
//! The CRC covers header and payload. A frame cut short by a crash marks the
//! end of the segment; a frame whose CRC does not match is corruption.

use crate::error::{CoreError, CoreResult};
use dirsync_storage::StorageBackend;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DSLG";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + length (4).
pub const HEADER_SIZE: usize = 10;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Wraps `payload` into a frame.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_frame(payload: &[u8]) -> CoreResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CoreError::invalid_operation(format!(
            "frame payload of {} bytes exceeds {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Total length of a frame carrying `payload_len` bytes.
#[must_use]
pub const fn frame_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len + CRC_SIZE
}

/// Extracts the payload of a single complete frame.
///
/// # Errors
///
/// Returns a corruption or checksum error if the bytes are not one valid
/// frame.
pub fn decode_frame(frame: &[u8]) -> CoreResult<&[u8]> {
    if frame.len() < HEADER_SIZE + CRC_SIZE {
        return Err(CoreError::log_corruption("frame shorter than its header"));
    }
    let payload_len = check_header(&frame[..HEADER_SIZE], 0)?;
    if frame.len() != frame_len(payload_len) {
        return Err(CoreError::log_corruption(format!(
            "frame of {} bytes declares a {payload_len} byte payload",
            frame.len()
        )));
    }
    let body_end = HEADER_SIZE + payload_len;
    verify_crc(&frame[..body_end], &frame[body_end..])?;
    Ok(&frame[HEADER_SIZE..body_end])
}

fn check_header(header: &[u8], offset: u64) -> CoreResult<usize> {
    if header[0..4] != FRAME_MAGIC {
        return Err(CoreError::log_corruption(format!(
            "invalid magic at offset {offset}"
        )));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > FRAME_VERSION {
        return Err(CoreError::log_corruption(format!(
            "unsupported frame version {version} at offset {offset}"
        )));
    }
    Ok(u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize)
}

fn verify_crc(body: &[u8], crc: &[u8]) -> CoreResult<()> {
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Streams the frames of one segment with a bounded read buffer.
///
/// Yields `(offset, payload)` pairs. A truncated trailing frame ends the
/// iteration cleanly and is reported by [`FrameReader::clean_end`]; bad magic
/// or a CRC mismatch yields an error and stops.
pub struct FrameReader<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_len: usize,
    finished: bool,
    truncated_at: Option<u64>,
}

impl<'a> FrameReader<'a> {
    /// Starts reading `backend` from `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend, offset: u64) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            buffer_pos: 0,
            buffer_len: 0,
            finished: false,
            truncated_at: None,
        })
    }

    /// Offset just past the last complete frame read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Returns the offset of a trailing partial frame, if one was found.
    #[must_use]
    pub fn clean_end(&self) -> Option<u64> {
        self.truncated_at
    }

    fn ensure_buffered(&mut self, min_bytes: usize) -> CoreResult<bool> {
        let available = self.buffer_len - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }

        let unread_in_segment = (self.total_size - self.offset) as usize;
        if unread_in_segment < min_bytes {
            return Ok(false);
        }

        if self.buffer_pos > 0 && available > 0 {
            self.buffer.copy_within(self.buffer_pos..self.buffer_len, 0);
        }
        self.buffer_len = available;
        self.buffer_pos = 0;

        if min_bytes > self.buffer.len() {
            self.buffer.resize(min_bytes.next_power_of_two(), 0);
        }

        let read_from = self.offset + available as u64;
        let to_read = (self.buffer.len() - self.buffer_len).min(unread_in_segment - available);
        if to_read > 0 {
            let data = self.backend.read_at(read_from, to_read)?;
            self.buffer[self.buffer_len..self.buffer_len + data.len()].copy_from_slice(&data);
            self.buffer_len += data.len();
        }
        Ok(self.buffer_len - self.buffer_pos >= min_bytes)
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, Vec<u8>)>> {
        let start = self.offset;
        if !self.ensure_buffered(HEADER_SIZE)? {
            if start < self.total_size {
                self.truncated_at = Some(start);
            }
            return Ok(None);
        }

        let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
        let payload_len = check_header(header, start)?;
        let total = frame_len(payload_len);
        if !self.ensure_buffered(total)? {
            self.truncated_at = Some(start);
            return Ok(None);
        }

        let body_end = self.buffer_pos + HEADER_SIZE + payload_len;
        verify_crc(
            &self.buffer[self.buffer_pos..body_end],
            &self.buffer[body_end..body_end + CRC_SIZE],
        )?;
        let payload = self.buffer[self.buffer_pos + HEADER_SIZE..body_end].to_vec();

        self.buffer_pos += total;
        self.offset += total as u64;
        Ok(Some((start, payload)))
    }
}

impl Iterator for FrameReader<'_> {
    type Item = CoreResult<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
