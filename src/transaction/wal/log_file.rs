use std::fs::File;
use std::io::{self, Read, Write, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::common::types::Lsn;

/// Header at the start of every log segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileHeader {
    pub magic: u32,
    pub version: u16,
    pub header_size: u16,
    /// LSN of the first record stored in this segment
    pub first_lsn: Lsn,
}

impl LogFileHeader {
    pub const MAGIC: u32 = 0x57414C44;
    pub const VERSION: u16 = 1;
    pub const HEADER_SIZE: u16 = 16;

    pub fn new(first_lsn: Lsn) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            header_size: Self::HEADER_SIZE,
            first_lsn,
        }
    }

    pub fn write_to(&self, file: &mut File) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.magic.to_le_bytes())?;
        file.write_all(&self.version.to_le_bytes())?;
        file.write_all(&self.header_size.to_le_bytes())?;
        file.write_all(&self.first_lsn.to_le_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn read_from(file: &mut File) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = [0u8; Self::HEADER_SIZE as usize];
        file.read_exact(&mut bytes)?;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut version = [0u8; 2];
        version.copy_from_slice(&bytes[4..6]);
        let mut header_size = [0u8; 2];
        header_size.copy_from_slice(&bytes[6..8]);
        let mut first_lsn = [0u8; 8];
        first_lsn.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            magic: u32::from_le_bytes(magic),
            version: u16::from_le_bytes(version),
            header_size: u16::from_le_bytes(header_size),
            first_lsn: u64::from_le_bytes(first_lsn),
        })
    }

    pub fn validate(&self) -> bool {
        self.magic == Self::MAGIC
            && self.version == Self::VERSION
            && self.header_size == Self::HEADER_SIZE
    }
}

/// One segment file of the log
#[derive(Debug, Clone)]
pub struct LogSegment {
    pub sequence: u32,
    pub path: PathBuf,
    pub first_lsn: Lsn,
}

impl LogSegment {
    /// Byte position inside the segment file of the record at `lsn`
    pub fn file_offset(&self, lsn: Lsn) -> u64 {
        LogFileHeader::HEADER_SIZE as u64 + (lsn - self.first_lsn)
    }
}

pub fn segment_path(log_dir: &Path, base_name: &str, sequence: u32) -> PathBuf {
    log_dir.join(format!("{}_{:06}.log", base_name, sequence))
}

/// All segment files of `base_name` in `log_dir`, ordered by sequence number
pub fn find_log_files(log_dir: &Path, base_name: &str) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut log_files = Vec::new();
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
        return Ok(log_files);
    }
    for entry in std::fs::read_dir(log_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(sequence) = extract_sequence_from_path(base_name, &path) {
            log_files.push((sequence, path));
        }
    }
    log_files.sort_by_key(|(sequence, _)| *sequence);
    Ok(log_files)
}

pub fn extract_sequence_from_path(base_name: &str, path: &Path) -> Option<u32> {
    let file_name = path.file_name()?.to_str()?;
    let prefix = format!("{}_", base_name);
    let sequence_str = file_name.strip_prefix(&prefix)?.strip_suffix(".log")?;
    sequence_str.parse::<u32>().ok()
}
