/// Bytes reserved at the start of every block for the page header
pub const HEADER_SIZE: usize = 16;

pub const LSN_OFFSET: usize = 0;
pub const UNIT_OFFSET: usize = 8;
pub const BLOCK_OFFSET: usize = 12;

/// Smallest block size that still leaves room for a payload
pub const MIN_BLOCK_SIZE: usize = 512;
