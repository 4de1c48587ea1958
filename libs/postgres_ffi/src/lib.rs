//! The handful of PostgreSQL WAL layout constants and helpers the proposer
//! needs to reason about page headers and wall-clock timestamps. Named and
//! sized the way the corresponding PostgreSQL C definitions are, since the
//! wire format and on-disk layout are PostgreSQL's, not ours.

use std::time::SystemTime;

pub const XLOG_BLCKSZ: usize = 8192;
pub const MAX_SEND_SIZE: usize = XLOG_BLCKSZ * 16;

/// `SizeOfXLogShortPHD`: short page header, used on every page but the first
/// of a segment.
pub const SIZE_OF_XLOG_SHORT_PHD: usize = 8 + 8 + 4 + 4;
/// `SizeOfXLogLongPHD`: long page header, used on the first page of a segment.
pub const SIZE_OF_XLOG_LONG_PHD: usize = SIZE_OF_XLOG_SHORT_PHD + 8 + 4 + 4;

pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogSegNo = u64;
pub type XLogRecPtr = u64;

/// Offset of `lsn` within its WAL segment.
pub fn xlog_segment_offset(lsn: u64, wal_segsz_bytes: usize) -> u64 {
    lsn % wal_segsz_bytes as u64
}

/// `SkipXLogPageHeader`: advance an LSN landing exactly on a page boundary
/// past that page's header, so it points at the first byte of real WAL data.
pub fn skip_xlog_page_header(lsn: u64, wal_segsz_bytes: usize) -> u64 {
    if xlog_segment_offset(lsn, wal_segsz_bytes) == 0 {
        lsn + SIZE_OF_XLOG_LONG_PHD as u64
    } else if lsn % XLOG_BLCKSZ as u64 == 0 {
        lsn + SIZE_OF_XLOG_SHORT_PHD as u64
    } else {
        lsn
    }
}

/// PostgreSQL's epoch (2000-01-01) is offset from the Unix epoch by this many
/// days; `get_current_timestamp` mirrors `GetCurrentTimestamp()`.
pub fn get_current_timestamp() -> TimestampTz {
    const UNIX_EPOCH_JDATE: u64 = 2440588;
    const POSTGRES_EPOCH_JDATE: u64 = 2451545;
    const SECS_PER_DAY: u64 = 86400;
    const USECS_PER_SEC: u64 = 1_000_000;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => {
            ((n.as_secs() - ((POSTGRES_EPOCH_JDATE - UNIX_EPOCH_JDATE) * SECS_PER_DAY))
                * USECS_PER_SEC
                + n.subsec_micros() as u64) as i64
        }
        Err(_) => panic!("SystemTime before UNIX EPOCH!"),
    }
}
