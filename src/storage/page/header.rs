use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{BlockNo, Lsn, UnitId, INVALID_LSN};
use crate::storage::page::layout::{BLOCK_OFFSET, HEADER_SIZE, LSN_OFFSET, UNIT_OFFSET};

/// Header persisted in front of every page's payload.
///
/// The LSN lives on the page itself so that restart redo can compare a log
/// record against what actually reached the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub unit: UnitId,
    pub block: BlockNo,
}

impl Default for PageHeader {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl PageHeader {
    pub fn new(unit: UnitId, block: BlockNo) -> Self {
        Self {
            lsn: INVALID_LSN,
            unit,
            block,
        }
    }

    // Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        self.write_to(&mut bytes);
        bytes
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(&mut bytes[LSN_OFFSET..LSN_OFFSET + 8], self.lsn);
        LittleEndian::write_u32(&mut bytes[UNIT_OFFSET..UNIT_OFFSET + 4], self.unit);
        LittleEndian::write_u32(&mut bytes[BLOCK_OFFSET..BLOCK_OFFSET + 4], self.block);
    }

    // Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            lsn: LittleEndian::read_u64(&bytes[LSN_OFFSET..LSN_OFFSET + 8]),
            unit: LittleEndian::read_u32(&bytes[UNIT_OFFSET..UNIT_OFFSET + 4]),
            block: LittleEndian::read_u32(&bytes[BLOCK_OFFSET..BLOCK_OFFSET + 4]),
        }
    }
}
