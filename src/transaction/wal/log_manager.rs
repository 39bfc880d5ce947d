use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, FIRST_LSN, INVALID_LSN};
use crate::transaction::wal::log_buffer::{decode_frame, FrameDecode, LogBuffer, LogBufferConfig, FRAME_HEADER_SIZE};
use crate::transaction::wal::log_file::{find_log_files, segment_path, LogFileHeader, LogSegment};
use crate::transaction::wal::log_record::{LogRecord, LogRecordError};

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Corrupt log record at LSN {0}")]
    CorruptRecord(Lsn),

    #[error("No log record at LSN {0}")]
    LsnNotFound(Lsn),

    #[error("LSN {0} lies before the first retained log record")]
    LsnTruncated(Lsn),

    #[error("Invalid log file format: {0}")]
    InvalidFormat(String),
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Path to the log directory
    pub log_dir: PathBuf,

    /// Base name for log files
    pub log_file_base_name: String,

    /// Size after which the current segment is closed and a new one started
    pub max_log_file_size: u64,

    /// Log buffer configuration
    pub buffer_config: LogBufferConfig,

    /// Whether every log write is followed by an fsync
    pub force_sync: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file_base_name: "pagevault_log".to_string(),
            max_log_file_size: 16 * 1024 * 1024, // 16 MB
            buffer_config: LogBufferConfig::default(),
            force_sync: true,
        }
    }
}

struct LogState {
    buffer: LogBuffer,
    /// Retained segments in LSN order; the last one receives new records
    segments: Vec<LogSegment>,
    current: File,
    current_size: u64,
    reader: Option<(u32, File)>,
}

/// Manager for write-ahead logging operations
///
/// LSNs are byte positions in the logical log stream, so the record following
/// the one at `lsn` starts at `lsn + frame length`. Records are buffered in
/// memory until `flush` writes them to the current segment file.
pub struct LogManager {
    config: LogManagerConfig,
    state: Mutex<LogState>,
    /// Every record with an LSN below this value is on disk
    durable_lsn: AtomicU64,
}

impl LogManager {
    /// Open the log in `config.log_dir`, cutting off a torn tail left by a crash
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;

        let mut segments = Vec::new();
        for (sequence, path) in find_log_files(&config.log_dir, &config.log_file_base_name)? {
            let mut file = File::open(&path)?;
            match LogFileHeader::read_from(&mut file) {
                Ok(header) if header.validate() => segments.push(LogSegment {
                    sequence,
                    path,
                    first_lsn: header.first_lsn,
                }),
                Ok(_) => {
                    return Err(LogManagerError::InvalidFormat(format!(
                        "bad segment header in {:?}",
                        path
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // A segment whose header never reached the disk holds no records
                    warn!("Removing log segment {:?} with a torn header", path);
                    drop(file);
                    std::fs::remove_file(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let (current, current_size, end_lsn) = match segments.last() {
            Some(last) => Self::open_tail_segment(last)?,
            None => {
                let segment = LogSegment {
                    sequence: 1,
                    path: segment_path(&config.log_dir, &config.log_file_base_name, 1),
                    first_lsn: FIRST_LSN,
                };
                let file = Self::create_segment_file(&segment)?;
                segments.push(segment);
                (file, LogFileHeader::HEADER_SIZE as u64, FIRST_LSN)
            }
        };

        info!(
            "Opened log at {:?}: {} segment(s), LSNs [{}, {})",
            config.log_dir,
            segments.len(),
            segments[0].first_lsn,
            end_lsn
        );

        let buffer = LogBuffer::new(config.buffer_config.clone(), end_lsn);
        Ok(Self {
            config,
            state: Mutex::new(LogState {
                buffer,
                segments,
                current,
                current_size,
                reader: None,
            }),
            durable_lsn: AtomicU64::new(end_lsn),
        })
    }

    fn create_segment_file(segment: &LogSegment) -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&segment.path)?;
        LogFileHeader::new(segment.first_lsn).write_to(&mut file)?;
        file.sync_all()?;
        Ok(file)
    }

    /// Validate the records of the last segment and truncate after the last good one
    fn open_tail_segment(segment: &LogSegment) -> Result<(File, u64, Lsn)> {
        let mut file = OpenOptions::new().read(true).write(true).open(&segment.path)?;
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let header_size = LogFileHeader::HEADER_SIZE as usize;
        let mut pos = header_size;
        loop {
            match decode_frame(&bytes[pos..]) {
                FrameDecode::Complete(body) => pos += FRAME_HEADER_SIZE + body.len(),
                FrameDecode::Incomplete => break,
                FrameDecode::Corrupt => {
                    warn!(
                        "Checksum mismatch at LSN {}, discarding the log tail",
                        segment.first_lsn + (pos - header_size) as Lsn
                    );
                    break;
                }
            }
        }

        if pos < bytes.len() {
            debug!("Cutting {} torn byte(s) from {:?}", bytes.len() - pos, segment.path);
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(pos as u64))?;
        let end_lsn = segment.first_lsn + (pos - header_size) as Lsn;
        Ok((file, pos as u64, end_lsn))
    }

    /// Append a record to the log buffer and return its LSN
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        let body = record.serialize()?;
        let mut state = self.state.lock();
        let lsn = state.buffer.append(&body);
        if state.buffer.should_flush() {
            self.write_buffer(&mut state)?;
        }
        Ok(lsn)
    }

    /// Make every record up to and including `lsn` durable
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        if self.is_durable(lsn) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if lsn >= state.buffer.start_lsn() {
            self.write_buffer(&mut state)?;
        }
        Ok(())
    }

    /// Make every appended record durable
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.write_buffer(&mut state)
    }

    fn write_buffer(&self, state: &mut LogState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        // A full segment is closed before the next write; if that fails the records stay buffered
        let header_size = LogFileHeader::HEADER_SIZE as u64;
        if state.current_size > header_size && state.current_size >= self.config.max_log_file_size {
            self.rotate(state)?;
        }
        let content_len = state.buffer.content().len() as u64;
        let LogState { buffer, current, .. } = state;
        current.write_all(buffer.content())?;
        if self.config.force_sync {
            current.sync_data()?;
        }
        state.current_size += content_len;
        state.buffer.reset();
        self.durable_lsn.store(state.buffer.start_lsn(), Ordering::SeqCst);
        Ok(())
    }

    /// Start a new segment at the current end of the log
    fn rotate(&self, state: &mut LogState) -> Result<()> {
        let sequence = state.segments.last().map_or(1, |s| s.sequence + 1);
        let segment = LogSegment {
            sequence,
            path: segment_path(&self.config.log_dir, &self.config.log_file_base_name, sequence),
            first_lsn: state.buffer.start_lsn(),
        };
        state.current = Self::create_segment_file(&segment)?;
        state.current_size = LogFileHeader::HEADER_SIZE as u64;
        debug!("Rotated log to segment {} at LSN {}", sequence, segment.first_lsn);
        state.segments.push(segment);
        Ok(())
    }

    /// Read the record stored at `lsn`
    pub fn get(&self, lsn: Lsn) -> Result<LogRecord> {
        let mut state = self.state.lock();
        let body = Self::read_body(&mut state, lsn)?;
        Ok(LogRecord::deserialize(lsn, &body)?)
    }

    fn read_body(state: &mut LogState, lsn: Lsn) -> Result<Vec<u8>> {
        if lsn == INVALID_LSN || lsn >= state.buffer.end_lsn() {
            return Err(LogManagerError::LsnNotFound(lsn));
        }
        if lsn < state.segments[0].first_lsn {
            return Err(LogManagerError::LsnTruncated(lsn));
        }

        if let Some(frame) = state.buffer.frame_at(lsn) {
            return match decode_frame(frame) {
                FrameDecode::Complete(body) => Ok(body.to_vec()),
                _ => Err(LogManagerError::CorruptRecord(lsn)),
            };
        }

        let index = state.segments.partition_point(|s| s.first_lsn <= lsn) - 1;
        let segment = state.segments[index].clone();
        let cached = matches!(&state.reader, Some((sequence, _)) if *sequence == segment.sequence);
        if !cached {
            state.reader = Some((segment.sequence, File::open(&segment.path)?));
        }
        let Some((_, file)) = state.reader.as_mut() else {
            return Err(LogManagerError::LsnNotFound(lsn));
        };

        let offset = segment.file_offset(lsn);
        let file_len = file.metadata()?.len();
        let mut header = [0u8; FRAME_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header).map_err(|_| LogManagerError::LsnNotFound(lsn))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        // A length running past the segment end means `lsn` is not a record boundary
        if offset + FRAME_HEADER_SIZE as u64 + len > file_len {
            return Err(LogManagerError::CorruptRecord(lsn));
        }
        let len = len as usize;
        let mut frame = header.to_vec();
        frame.resize(FRAME_HEADER_SIZE + len, 0);
        file.read_exact(&mut frame[FRAME_HEADER_SIZE..])
            .map_err(|_| LogManagerError::CorruptRecord(lsn))?;

        match decode_frame(&frame) {
            FrameDecode::Complete(body) => Ok(body.to_vec()),
            _ => Err(LogManagerError::CorruptRecord(lsn)),
        }
    }

    /// LSN the next appended record will receive
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().buffer.end_lsn()
    }

    /// Every record with an LSN below this value is durable
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::SeqCst)
    }

    /// Whether the record at `lsn` has reached the disk
    pub fn is_durable(&self, lsn: Lsn) -> bool {
        lsn == INVALID_LSN || lsn < self.durable_lsn()
    }

    /// LSN of the oldest retained record position
    pub fn first_lsn(&self) -> Lsn {
        self.state.lock().segments[0].first_lsn
    }

    /// First retained record, if the log holds any
    pub fn first(&self) -> Result<Option<LogRecord>> {
        let first = self.first_lsn();
        if first >= self.next_lsn() {
            return Ok(None);
        }
        self.get(first).map(Some)
    }

    /// Record following `record` in the log stream
    pub fn next(&self, record: &LogRecord) -> Result<Option<LogRecord>> {
        let lsn = record.lsn + FRAME_HEADER_SIZE as Lsn + record.body_len()?;
        if lsn >= self.next_lsn() {
            return Ok(None);
        }
        self.get(lsn).map(Some)
    }

    /// Iterate over all records starting at `lsn`
    pub fn iter_from(&self, lsn: Lsn) -> LogIterator<'_> {
        LogIterator {
            log: self,
            next: lsn,
            done: false,
        }
    }

    /// Drop whole segments that only hold records below `lsn`.
    ///
    /// Returns the first retained LSN, which may be lower than `lsn` since the
    /// log is cut at segment boundaries.
    pub fn truncate_to(&self, lsn: Lsn) -> Result<Lsn> {
        let mut state = self.state.lock();
        let removable = state
            .segments
            .windows(2)
            .take_while(|pair| pair[1].first_lsn <= lsn)
            .count();

        for segment in state.segments.drain(..removable).collect::<Vec<_>>() {
            if matches!(&state.reader, Some((sequence, _)) if *sequence == segment.sequence) {
                state.reader = None;
            }
            std::fs::remove_file(&segment.path)?;
            debug!("Removed log segment {:?}", segment.path);
        }

        let first = state.segments[0].first_lsn;
        if removable > 0 {
            info!("Truncated log to LSN {} (requested {})", first, lsn);
        }
        Ok(first)
    }

    /// Number of segment files currently retained
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }
}

/// Forward scan over the log, yielding records in LSN order
pub struct LogIterator<'a> {
    log: &'a LogManager,
    next: Lsn,
    done: bool,
}

impl Iterator for LogIterator<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= self.log.next_lsn() {
            return None;
        }
        let record = self.log.get(self.next).and_then(|record| {
            self.next = record.lsn + FRAME_HEADER_SIZE as Lsn + record.body_len()?;
            Ok(record)
        });
        if record.is_err() {
            self.done = true;
        }
        Some(record)
    }
}
