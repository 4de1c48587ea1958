//! A [`WalproposerApi`] that keeps everything in memory: no sockets, no
//! real clock, a fixed "redo start LSN". Good enough to drive the election,
//! recovery and streaming algorithms end-to-end in tests; the socket-facing
//! methods record what was asked of them rather than doing real I/O, since
//! `peer_fsm`'s connection-lifecycle states aren't exercised through this
//! harness.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use utils::id::TenantTimelineId;
use utils::lsn::Lsn;

use crate::api::{
    AsyncReadResult, AsyncWriteResult, ConnectPollResult, EventMask, FlushResult, QueryResult,
    ShmemState, WaitResult, WalproposerApi,
};
use crate::protocol::Term;

#[derive(Debug, Default, Clone)]
pub struct RecordedCalls {
    pub process_safekeeper_feedback: Vec<Lsn>,
    pub confirm_wal_streamed: Vec<Lsn>,
    pub finish_sync_safekeepers: Vec<Lsn>,
    pub after_election_calls: usize,
}

/// In-memory stand-in for one safekeeper connection: a FIFO of whole
/// messages queued to be delivered on the next `async_read`, and a record
/// of everything the proposer wrote to it.
#[derive(Debug, Default)]
struct PeerChannel {
    inbound: VecDeque<Bytes>,
    sent: Vec<Bytes>,
}

pub struct SimulatedApi {
    pub now_ms: i64,
    pub redo_start_lsn: Lsn,
    pub flush_rec_ptr: Lsn,
    pub shmem: ShmemState,
    pub recovery_download_succeeds: bool,
    pub calls: RecordedCalls,
    channels: Vec<PeerChannel>,
}

impl SimulatedApi {
    pub fn new(redo_start_lsn: Lsn) -> SimulatedApi {
        SimulatedApi {
            now_ms: 0,
            redo_start_lsn,
            flush_rec_ptr: redo_start_lsn,
            shmem: ShmemState::default(),
            recovery_download_succeeds: true,
            calls: RecordedCalls::default(),
            channels: Vec::new(),
        }
    }

    pub fn with_mine_last_elected_term(mut self, term: Term) -> SimulatedApi {
        self.shmem.mine_last_elected_term = term;
        self
    }

    fn channel(&mut self, peer: usize) -> &mut PeerChannel {
        if self.channels.len() <= peer {
            self.channels.resize_with(peer + 1, PeerChannel::default);
        }
        &mut self.channels[peer]
    }

    /// Queue a whole wire message (tag + body) to be handed back on `peer`'s
    /// next `async_read`.
    pub fn queue_inbound(&mut self, peer: usize, msg: BytesMut) {
        self.channel(peer).inbound.push_back(msg.freeze());
    }

    /// Every message `peer` has written so far, in order, oldest first.
    pub fn sent_to(&mut self, peer: usize) -> &[Bytes] {
        &self.channel(peer).sent
    }
}

impl WalproposerApi for SimulatedApi {
    fn now(&self) -> i64 {
        self.now_ms
    }

    fn init_event_set(&mut self, _n_peers: usize) {}
    fn update_event_set(&mut self, _peer: usize, _mask: EventMask) {}
    fn add_peer_event(&mut self, _peer: usize, _mask: EventMask) {}
    fn rm_peer_event(&mut self, _peer: usize) {}
    fn wait_event_set(&mut self, _timeout_ms: i64) -> WaitResult {
        WaitResult::Timeout
    }

    fn connect_start(&mut self, _peer: usize) {}
    fn connect_poll(&mut self, _peer: usize) -> ConnectPollResult {
        ConnectPollResult::Ok
    }
    fn send_query(&mut self, _peer: usize, _query: &str) -> bool {
        true
    }
    fn get_query_result(&mut self, _peer: usize) -> QueryResult {
        QueryResult::CopyBothReady
    }
    fn async_read(&mut self, peer: usize) -> AsyncReadResult {
        match self.channel(peer).inbound.pop_front() {
            Some(msg) => AsyncReadResult::Ok(msg.to_vec()),
            None => AsyncReadResult::Again,
        }
    }
    fn async_write(&mut self, peer: usize, buf: &[u8]) -> AsyncWriteResult {
        self.channel(peer).sent.push(Bytes::copy_from_slice(buf));
        AsyncWriteResult::Ok
    }
    fn blocking_write(&mut self, peer: usize, buf: &[u8]) -> bool {
        self.channel(peer).sent.push(Bytes::copy_from_slice(buf));
        true
    }
    fn flush(&mut self, _peer: usize) -> FlushResult {
        FlushResult::Done
    }
    fn finish(&mut self, _peer: usize) {}
    fn error_message(&self, _peer: usize) -> String {
        String::new()
    }

    fn wal_read(&mut self, _start: Lsn, len: usize) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0u8; len])
    }
    fn recovery_download(&mut self, _donor: usize, _ttid: TenantTimelineId, _start: Lsn, _end: Lsn) -> bool {
        self.recovery_download_succeeds
    }
    fn get_redo_start_lsn(&self) -> Lsn {
        self.redo_start_lsn
    }
    fn get_flush_rec_ptr(&self) -> Lsn {
        self.flush_rec_ptr
    }

    fn get_shmem_state(&self) -> ShmemState {
        self.shmem
    }
    fn update_shmem_mine_last_elected_term(&mut self, term: Term) {
        self.shmem.mine_last_elected_term = term;
    }

    fn strong_random(&mut self, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = i as u8;
        }
    }

    fn start_streaming(&mut self, _start_lsn: Lsn) {}
    fn finish_sync_safekeepers(&mut self, lsn: Lsn) {
        self.calls.finish_sync_safekeepers.push(lsn);
    }
    fn process_safekeeper_feedback(&mut self, commit_lsn: Lsn) {
        self.calls.process_safekeeper_feedback.push(commit_lsn);
    }
    fn confirm_wal_streamed(&mut self, truncate_lsn: Lsn) {
        self.calls.confirm_wal_streamed.push(truncate_lsn);
    }
    fn after_election(&mut self) {
        self.calls.after_election_calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn async_read_drains_queued_messages_fifo() {
        let mut api = SimulatedApi::new(Lsn(0));
        let mut first = BytesMut::new();
        first.put_u8(1);
        let mut second = BytesMut::new();
        second.put_u8(2);
        api.queue_inbound(0, first);
        api.queue_inbound(0, second);

        match api.async_read(0) {
            AsyncReadResult::Ok(b) => assert_eq!(b, vec![1]),
            other => panic!("expected queued message, got {other:?}"),
        }
        match api.async_read(0) {
            AsyncReadResult::Ok(b) => assert_eq!(b, vec![2]),
            other => panic!("expected queued message, got {other:?}"),
        }
        assert!(matches!(api.async_read(0), AsyncReadResult::Again));
    }

    #[test]
    fn async_write_is_recorded_per_peer() {
        let mut api = SimulatedApi::new(Lsn(0));
        api.async_write(1, &[9, 9]);
        assert_eq!(api.sent_to(1).len(), 1);
        assert_eq!(api.sent_to(0).len(), 0);
    }
}
