pub mod header;
pub mod layout;

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, PageId, UnitId};
pub use header::PageHeader;
pub use layout::HEADER_SIZE;

/// One block's worth of bytes as cached in a buffer frame.
///
/// The first `HEADER_SIZE` bytes hold the [`PageHeader`]; the rest is the
/// payload handed to higher layers.
#[derive(Debug, Clone)]
pub struct Page {
    page_id: PageId,
    data: Box<[u8]>,
}

impl Page {
    pub fn new(page_id: PageId, block_size: usize) -> Self {
        Self {
            page_id,
            data: vec![0; block_size].into_boxed_slice(),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub(crate) fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
    }

    pub fn header(&self) -> PageHeader {
        PageHeader::from_bytes(&self.data)
    }

    /// LSN of the last logged change applied to this page
    pub fn lsn(&self) -> Lsn {
        LittleEndian::read_u64(&self.data[layout::LSN_OFFSET..layout::LSN_OFFSET + 8])
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        LittleEndian::write_u64(&mut self.data[layout::LSN_OFFSET..layout::LSN_OFFSET + 8], lsn);
    }

    pub fn unit(&self) -> UnitId {
        self.header().unit
    }

    /// Reset the page to an empty payload owned by `unit`
    pub fn format(&mut self, unit: UnitId, lsn: Lsn) {
        self.data.fill(0);
        let mut header = PageHeader::new(unit, self.page_id.block);
        header.lsn = lsn;
        header.write_to(&mut self.data);
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[HEADER_SIZE..]
    }

    /// Raw block bytes including the header, as written to storage
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
