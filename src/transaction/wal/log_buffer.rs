use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::Lsn;

/// Bytes in front of every record body: `len u32 | crc32 u32`
pub const FRAME_HEADER_SIZE: usize = 8;

/// Configuration for log buffer behavior
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Size of the buffer in bytes
    pub buffer_size: usize,

    /// Flush threshold as a percentage of buffer capacity
    pub flush_threshold: f32,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024, // 1 MB default
            flush_threshold: 0.75,    // 75% default
        }
    }
}

/// Encode one record frame
pub fn encode_frame(body: &[u8], out: &mut Vec<u8>) {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], body.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(body));
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
}

/// Result of decoding the frame at the start of a byte slice
#[derive(Debug, PartialEq, Eq)]
pub enum FrameDecode<'a> {
    /// A complete, checksummed body
    Complete(&'a [u8]),
    /// Not enough bytes for the header or the announced body
    Incomplete,
    /// Checksum mismatch
    Corrupt,
}

pub fn decode_frame(bytes: &[u8]) -> FrameDecode<'_> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return FrameDecode::Incomplete;
    }
    let len = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let crc = LittleEndian::read_u32(&bytes[4..8]);
    let Some(body) = bytes.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len) else {
        return FrameDecode::Incomplete;
    };
    if crc32fast::hash(body) != crc {
        return FrameDecode::Corrupt;
    }
    FrameDecode::Complete(body)
}

/// In-memory tail of the log: framed records that are appended but not yet
/// written to a segment file. Byte `i` of the buffer sits at LSN `start_lsn + i`.
#[derive(Debug)]
pub struct LogBuffer {
    data: Vec<u8>,
    start_lsn: Lsn,
    config: LogBufferConfig,
}

impl LogBuffer {
    /// Create an empty buffer whose first record will get `start_lsn`
    pub fn new(config: LogBufferConfig, start_lsn: Lsn) -> Self {
        Self {
            data: Vec::with_capacity(config.buffer_size),
            start_lsn,
            config,
        }
    }

    /// Append a record body and return its LSN
    pub fn append(&mut self, body: &[u8]) -> Lsn {
        let lsn = self.end_lsn();
        encode_frame(body, &mut self.data);
        lsn
    }

    /// LSN of the first buffered byte; everything below is on disk
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// LSN the next appended record will receive
    pub fn end_lsn(&self) -> Lsn {
        self.start_lsn + self.data.len() as Lsn
    }

    /// Bytes of the buffered frame starting at `lsn`, if it is buffered
    pub fn frame_at(&self, lsn: Lsn) -> Option<&[u8]> {
        if lsn < self.start_lsn || lsn >= self.end_lsn() {
            return None;
        }
        Some(&self.data[(lsn - self.start_lsn) as usize..])
    }

    /// Buffered bytes waiting to be written
    pub fn content(&self) -> &[u8] {
        &self.data
    }

    /// Forget the buffered bytes once they are written
    pub fn reset(&mut self) {
        self.start_lsn = self.end_lsn();
        self.data.clear();
    }

    pub fn should_flush(&self) -> bool {
        let flush_size = (self.config.buffer_size as f32 * self.config.flush_threshold) as usize;
        self.data.len() >= flush_size
    }

    /// Check if the buffer is currently empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get current buffer utilization as a percentage
    pub fn utilization(&self) -> f32 {
        self.data.len() as f32 / self.config.buffer_size as f32
    }
}
