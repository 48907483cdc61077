/// Longest accepted room name, contact field or email.
pub const MAX_NAME_LEN: usize = 256;

/// Rows per table before inserts are refused.
pub const MAX_RECORDS_PER_TABLE: usize = 1_000_000;

/// Largest WAL record payload. A longer length prefix on disk marks corruption.
pub const MAX_WAL_FRAME_LEN: usize = 1 << 20;
