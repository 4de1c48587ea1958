//! Wire codec for the proposer side of the proposer-acceptor protocol (C1).
//!
//! This is the mirror image of `safekeeper::safekeeper`'s codec: there, the
//! acceptor parses `ProposerAcceptorMessage` and serializes
//! `AcceptorProposerMessage`; here the proposer serializes
//! `ProposerAcceptorMessage` and parses `AcceptorProposerMessage`. Wire
//! layout, tag bytes and field order are identical on both sides.

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::min;
use std::fmt;

use postgres_ffi::{TimeLineID, MAX_SEND_SIZE};
use utils::id::{NodeId, TenantId, TimelineId};
use utils::lsn::Lsn;
use utils::pageserver_feedback::{PageserverFeedback, TimestampTz};

pub const SK_PROTOCOL_VERSION: u32 = 2;

/// Consensus logical timestamp.
pub type Term = u64;
pub const INVALID_TERM: Term = 0;

/// Unique id of this proposer instance; carried in messages for logging and
/// monitoring only, not used in any correctness decision.
pub type ProposerUuid = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TermLsn {
    pub term: Term,
    pub lsn: Lsn,
}

impl From<(Term, Lsn)> for TermLsn {
    fn from(pair: (Term, Lsn)) -> TermLsn {
        TermLsn {
            term: pair.0,
            lsn: pair.1,
        }
    }
}

#[derive(Clone, PartialEq, Default)]
pub struct TermHistory(pub Vec<TermLsn>);

impl TermHistory {
    pub fn empty() -> TermHistory {
        TermHistory(Vec::new())
    }

    /// The term of the last entry, or [`INVALID_TERM`] if empty.
    pub fn highest_term(&self) -> Term {
        self.0.last().map(|e| e.term).unwrap_or(INVALID_TERM)
    }

    /// `n_entries: u32` followed by that many `(term: u64, lsn: u64)` pairs.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0.len() as u32);
        for e in &self.0 {
            buf.put_u64_le(e.term);
            buf.put_u64_le(e.lsn.into());
        }
    }

    pub fn decode(bytes: &mut Bytes) -> Result<TermHistory> {
        if bytes.remaining() < 4 {
            bail!("TermHistory misses len");
        }
        let n_entries = bytes.get_u32_le();
        let mut res = Vec::with_capacity(n_entries as usize);
        for _ in 0..n_entries {
            if bytes.remaining() < 16 {
                bail!("TermHistory is incomplete");
            }
            res.push(TermLsn {
                term: bytes.get_u64_le(),
                lsn: bytes.get_u64_le().into(),
            });
        }
        Ok(TermHistory(res))
    }
}

impl fmt::Debug for TermHistory {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let n_printed = 20;
        write!(
            fmt,
            "{}{:?}",
            if self.0.len() > n_printed { "... " } else { "" },
            self.0
                .iter()
                .rev()
                .take(n_printed)
                .map(|&e| (e.term, e.lsn))
                .collect::<Vec<_>>()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotStandbyFeedback {
    pub ts: TimestampTz,
    pub xmin: u64,
    pub catalog_xmin: u64,
}

impl HotStandbyFeedback {
    pub fn empty() -> HotStandbyFeedback {
        HotStandbyFeedback {
            ts: 0,
            xmin: 0,
            catalog_xmin: 0,
        }
    }
}

/// Proposer -> Acceptor greeting.
#[derive(Debug, Clone)]
pub struct ProposerGreeting {
    pub protocol_version: u32,
    pub pg_version: u32,
    pub proposer_id: ProposerUuid,
    pub system_id: u64,
    pub timeline_id: TimelineId,
    pub tenant_id: TenantId,
    pub tli: TimeLineID,
    pub wal_seg_size: u32,
}

impl ProposerGreeting {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le('g' as u64);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.pg_version);
        buf.put_slice(&self.proposer_id);
        buf.put_u64_le(self.system_id);
        buf.put_slice(&self.timeline_id.as_arr());
        buf.put_slice(&self.tenant_id.as_arr());
        buf.put_u32_le(self.tli);
        buf.put_u32_le(self.wal_seg_size);
    }
}

/// Acceptor -> Proposer: the highest term the acceptor has voted for.
#[derive(Debug, Clone)]
pub struct AcceptorGreeting {
    pub term: Term,
    pub node_id: NodeId,
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: Term,
    pub proposer_id: ProposerUuid,
}

impl VoteRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le('v' as u64);
        buf.put_u64_le(self.term);
        buf.put_slice(&self.proposer_id);
    }
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_given: u64,
    pub flush_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

#[derive(Debug, Clone)]
pub struct ProposerElected {
    pub term: Term,
    pub start_streaming_at: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,
}

impl ProposerElected {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le('e' as u64);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.start_streaming_at.into());
        self.term_history.encode(buf);
        buf.put_u64_le(self.timeline_start_lsn.into());
    }
}

#[derive(Debug, Clone)]
pub struct AppendRequestHeader {
    pub term: Term,
    pub epoch_start_lsn: Lsn,
    pub begin_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub proposer_uuid: ProposerUuid,
}

impl AppendRequestHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le('a' as u64);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.epoch_start_lsn.into());
        buf.put_u64_le(self.begin_lsn.into());
        buf.put_u64_le(self.end_lsn.into());
        buf.put_u64_le(self.commit_lsn.into());
        buf.put_u64_le(self.truncate_lsn.into());
        buf.put_slice(&self.proposer_uuid);
    }
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub h: AppendRequestHeader,
    pub wal_data: Bytes,
}

impl AppendRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.h.encode(buf);
        buf.put_slice(&self.wal_data);
    }
}

#[derive(Debug, Clone)]
pub struct AppendResponse {
    pub term: Term,
    pub flush_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub hs_feedback: HotStandbyFeedback,
    pub pageserver_feedback: PageserverFeedback,
}

impl AppendResponse {
    pub fn term_only(term: Term) -> AppendResponse {
        AppendResponse {
            term,
            flush_lsn: Lsn::INVALID,
            commit_lsn: Lsn::INVALID,
            hs_feedback: HotStandbyFeedback::empty(),
            pageserver_feedback: PageserverFeedback::empty(),
        }
    }
}

/// Messages the proposer sends to an acceptor.
#[derive(Debug, Clone)]
pub enum ProposerAcceptorMessage {
    Greeting(ProposerGreeting),
    VoteRequest(VoteRequest),
    Elected(ProposerElected),
    AppendRequest(AppendRequest),
}

impl ProposerAcceptorMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ProposerAcceptorMessage::Greeting(msg) => msg.encode(buf),
            ProposerAcceptorMessage::VoteRequest(msg) => msg.encode(buf),
            ProposerAcceptorMessage::Elected(msg) => msg.encode(buf),
            ProposerAcceptorMessage::AppendRequest(msg) => msg.encode(buf),
        }
    }
}

/// Messages an acceptor sends back to the proposer.
#[derive(Debug, Clone)]
pub enum AcceptorProposerMessage {
    Greeting(AcceptorGreeting),
    VoteResponse(VoteResponse),
    AppendResponse(AppendResponse),
}

impl AcceptorProposerMessage {
    /// Parse an acceptor message. A tag byte is carried in the low byte of a
    /// u64 for historical reasons (matches the C struct layout on the wire).
    pub fn parse(msg_bytes: Bytes) -> Result<AcceptorProposerMessage> {
        let mut stream = msg_bytes.reader();
        let tag = stream.read_u64::<LittleEndian>()? as u8 as char;
        match tag {
            'g' => {
                let mut bytes = stream.into_inner();
                if bytes.remaining() < 16 {
                    bail!("AcceptorGreeting message is not complete");
                }
                let term = bytes.get_u64_le();
                let node_id = NodeId(bytes.get_u64_le());
                Ok(AcceptorProposerMessage::Greeting(AcceptorGreeting {
                    term,
                    node_id,
                }))
            }
            'v' => {
                let mut bytes = stream.into_inner();
                if bytes.remaining() < 32 {
                    bail!("VoteResponse message is not complete");
                }
                let term = bytes.get_u64_le();
                let vote_given = bytes.get_u64_le();
                let flush_lsn = bytes.get_u64_le().into();
                let truncate_lsn = bytes.get_u64_le().into();
                let term_history = TermHistory::decode(&mut bytes)?;
                if bytes.remaining() < 8 {
                    bail!("VoteResponse message is not complete");
                }
                let timeline_start_lsn = bytes.get_u64_le().into();
                Ok(AcceptorProposerMessage::VoteResponse(VoteResponse {
                    term,
                    vote_given,
                    flush_lsn,
                    truncate_lsn,
                    term_history,
                    timeline_start_lsn,
                }))
            }
            'a' => {
                let mut bytes = stream.into_inner();
                if bytes.remaining() < 24 {
                    bail!("AppendResponse message is not complete");
                }
                let term = bytes.get_u64_le();
                let flush_lsn = bytes.get_u64_le().into();
                let commit_lsn = bytes.get_u64_le().into();
                if bytes.remaining() < 24 {
                    bail!("AppendResponse hot standby feedback is not complete");
                }
                let hs_feedback = HotStandbyFeedback {
                    ts: bytes.get_i64_le(),
                    xmin: bytes.get_u64_le(),
                    catalog_xmin: bytes.get_u64_le(),
                };
                let pageserver_feedback = if bytes.has_remaining() {
                    PageserverFeedback::parse(&mut bytes)?
                } else {
                    PageserverFeedback::empty()
                };
                Ok(AcceptorProposerMessage::AppendResponse(AppendResponse {
                    term,
                    flush_lsn,
                    commit_lsn,
                    hs_feedback,
                    pageserver_feedback,
                }))
            }
            _ => bail!("unknown acceptor-proposer message tag: {}", tag),
        }
    }
}

/// Checks a decoded `AppendRequest`'s declared WAL length against
/// [`MAX_SEND_SIZE`]; shared by anything assembling one from raw bytes.
pub fn check_append_request_size(begin_lsn: Lsn, end_lsn: Lsn) -> Result<usize> {
    let rec_size = end_lsn
        .checked_sub(u64::from(begin_lsn))
        .context("begin_lsn > end_lsn in AppendRequest")?
        .0 as usize;
    if rec_size > MAX_SEND_SIZE {
        bail!("AppendRequest is longer than MAX_SEND_SIZE ({MAX_SEND_SIZE})");
    }
    Ok(rec_size)
}

/// Bound a single read so callers never allocate past `MAX_SEND_SIZE`.
pub fn bounded_send_size(n: usize) -> usize {
    min(n, MAX_SEND_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_term_history() -> TermHistory {
        TermHistory(vec![(1, Lsn(100)).into(), (5, Lsn(500)).into()])
    }

    #[test]
    fn term_history_roundtrip() {
        let th = sample_term_history();
        let mut buf = BytesMut::new();
        th.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = TermHistory::decode(&mut bytes).unwrap();
        assert!(decoded == th);
        assert_eq!(decoded.highest_term(), 5);
    }

    #[test]
    fn empty_term_history_highest_term_is_invalid() {
        assert_eq!(TermHistory::empty().highest_term(), INVALID_TERM);
    }

    #[test]
    fn vote_response_roundtrip_through_acceptor_message() {
        let mut buf = BytesMut::new();
        buf.put_u64_le('v' as u64);
        buf.put_u64_le(7);
        buf.put_u64_le(1);
        buf.put_u64_le(800);
        buf.put_u64_le(100);
        sample_term_history().encode(&mut buf);
        buf.put_u64_le(0x16000000);

        let parsed = AcceptorProposerMessage::parse(buf.freeze()).unwrap();
        match parsed {
            AcceptorProposerMessage::VoteResponse(vr) => {
                assert_eq!(vr.term, 7);
                assert_eq!(vr.vote_given, 1);
                assert_eq!(vr.flush_lsn, Lsn(800));
                assert_eq!(vr.truncate_lsn, Lsn(100));
                assert_eq!(vr.term_history, sample_term_history());
                assert_eq!(vr.timeline_start_lsn, Lsn(0x16000000));
            }
            other => panic!("expected VoteResponse, got {other:?}"),
        }
    }

    #[test]
    fn append_response_without_feedback_tail_parses() {
        let mut buf = BytesMut::new();
        buf.put_u64_le('a' as u64);
        buf.put_u64_le(3);
        buf.put_u64_le(900);
        buf.put_u64_le(850);
        buf.put_i64_le(0);
        buf.put_u64_le(0);
        buf.put_u64_le(0);

        let parsed = AcceptorProposerMessage::parse(buf.freeze()).unwrap();
        match parsed {
            AcceptorProposerMessage::AppendResponse(ar) => {
                assert_eq!(ar.term, 3);
                assert_eq!(ar.flush_lsn, Lsn(900));
                assert_eq!(ar.commit_lsn, Lsn(850));
                assert_eq!(ar.pageserver_feedback, PageserverFeedback::empty());
            }
            other => panic!("expected AppendResponse, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le('z' as u64);
        assert!(AcceptorProposerMessage::parse(buf.freeze()).is_err());
    }

    #[test]
    fn proposer_greeting_encodes_expected_tag() {
        let msg = ProposerGreeting {
            protocol_version: SK_PROTOCOL_VERSION,
            pg_version: 150000,
            proposer_id: [0u8; 16],
            system_id: 42,
            timeline_id: TimelineId::default(),
            tenant_id: TenantId::default(),
            tli: 1,
            wal_seg_size: 16 * 1024 * 1024,
        };
        let mut buf = BytesMut::new();
        ProposerAcceptorMessage::Greeting(msg).encode(&mut buf);
        assert_eq!(&buf[0..8], &('g' as u64).to_le_bytes());
    }
}
