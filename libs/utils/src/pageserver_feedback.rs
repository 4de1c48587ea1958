//! Feedback a pageserver relays back through a safekeeper, piggy-backed on
//! `AppendResponse` as an extensible key/value tail so that new keys can be
//! added without breaking older proposers or safekeepers.

use bytes::{Buf, BufMut, BytesMut};

use crate::lsn::Lsn;

pub type TimestampTz = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageserverFeedback {
    pub current_timeline_size: u64,
    pub last_received_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    pub remote_consistent_lsn: Lsn,
    pub replytime: TimestampTz,
}

impl PageserverFeedback {
    pub fn empty() -> PageserverFeedback {
        PageserverFeedback {
            current_timeline_size: 0,
            last_received_lsn: Lsn::INVALID,
            disk_consistent_lsn: Lsn::INVALID,
            remote_consistent_lsn: Lsn::INVALID,
            replytime: 0,
        }
    }

    /// Serialize as `nkeys u8` followed by `(cstring key, u32 len, bytes)` entries.
    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut nkeys = 0u8;
        if self.current_timeline_size != 0 {
            nkeys += 1;
        }
        if self.last_received_lsn.is_valid() {
            nkeys += 1;
        }
        if self.disk_consistent_lsn.is_valid() {
            nkeys += 1;
        }
        if self.remote_consistent_lsn.is_valid() {
            nkeys += 1;
        }
        if self.replytime != 0 {
            nkeys += 1;
        }

        buf.put_u8(nkeys);

        if self.current_timeline_size != 0 {
            put_cstr(buf, "current_timeline_size");
            buf.put_u32_le(8);
            buf.put_u64_le(self.current_timeline_size);
        }
        if self.last_received_lsn.is_valid() {
            put_cstr(buf, "ps_writelsn");
            buf.put_u32_le(8);
            buf.put_u64_le(self.last_received_lsn.into());
        }
        if self.disk_consistent_lsn.is_valid() {
            put_cstr(buf, "ps_flushlsn");
            buf.put_u32_le(8);
            buf.put_u64_le(self.disk_consistent_lsn.into());
        }
        if self.remote_consistent_lsn.is_valid() {
            put_cstr(buf, "ps_applylsn");
            buf.put_u32_le(8);
            buf.put_u64_le(self.remote_consistent_lsn.into());
        }
        if self.replytime != 0 {
            put_cstr(buf, "ps_replytime");
            buf.put_u32_le(8);
            buf.put_i64_le(self.replytime);
        }
    }

    /// Parse the extensible tail. Unknown keys are skipped (forward-compat).
    pub fn parse(buf: &mut impl Buf) -> anyhow::Result<PageserverFeedback> {
        let mut rf = PageserverFeedback::empty();
        anyhow::ensure!(buf.remaining() >= 1, "PageserverFeedback missing nkeys");
        let nkeys = buf.get_u8();

        for _ in 0..nkeys {
            let key = get_cstr(buf)?;
            anyhow::ensure!(buf.remaining() >= 4, "PageserverFeedback missing value len");
            let len = buf.get_u32_le() as usize;
            anyhow::ensure!(
                buf.remaining() >= len,
                "PageserverFeedback value shorter than declared length"
            );
            match key.as_str() {
                "current_timeline_size" => rf.current_timeline_size = buf.get_u64_le(),
                "ps_writelsn" | "last_received_lsn" => {
                    rf.last_received_lsn = Lsn(buf.get_u64_le())
                }
                "ps_flushlsn" | "disk_consistent_lsn" => {
                    rf.disk_consistent_lsn = Lsn(buf.get_u64_le())
                }
                "ps_applylsn" | "remote_consistent_lsn" => {
                    rf.remote_consistent_lsn = Lsn(buf.get_u64_le())
                }
                "ps_replytime" | "replytime" => rf.replytime = buf.get_i64_le(),
                _ => {
                    // Unknown key: skip its value bytes to support
                    // backward-compatible protocol additions.
                    buf.advance(len);
                }
            }
        }
        Ok(rf)
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstr(buf: &mut impl Buf) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    loop {
        anyhow::ensure!(buf.remaining() >= 1, "unterminated cstring in feedback block");
        let b = buf.get_u8();
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let rf = PageserverFeedback {
            current_timeline_size: 1234,
            last_received_lsn: Lsn(100),
            disk_consistent_lsn: Lsn(90),
            remote_consistent_lsn: Lsn(80),
            replytime: 42,
        };
        let mut buf = BytesMut::new();
        rf.serialize(&mut buf);
        let mut bytes = buf.freeze();
        let parsed = PageserverFeedback::parse(&mut bytes).unwrap();
        assert_eq!(rf, parsed);
    }

    #[test]
    fn empty_roundtrips() {
        let rf = PageserverFeedback::empty();
        let mut buf = BytesMut::new();
        rf.serialize(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(PageserverFeedback::parse(&mut bytes).unwrap(), rf);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        put_cstr(&mut buf, "some_future_key");
        buf.put_u32_le(4);
        buf.put_u32_le(0xdead_beef);
        put_cstr(&mut buf, "current_timeline_size");
        buf.put_u32_le(8);
        buf.put_u64_le(99);

        let mut bytes = buf.freeze();
        let rf = PageserverFeedback::parse(&mut bytes).unwrap();
        assert_eq!(rf.current_timeline_size, 99);
    }
}
