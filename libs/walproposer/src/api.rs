//! The capability facade (C7): the only way the core touches the outside
//! world. A production implementation (sockets, a real clock, local WAL
//! storage) lives in the embedding binary, outside this crate; tests use
//! [`crate::simtest::SimulatedApi`].

use utils::id::TenantTimelineId;
use utils::lsn::Lsn;

use crate::protocol::Term;

pub type TimestampTz = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPollResult {
    Ok,
    NeedsRead,
    NeedsWrite,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    CopyBothReady,
    NeedsInput,
    Failed,
    UnexpectedSuccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncReadResult {
    Ok(Vec<u8>),
    Again,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncWriteResult {
    Ok,
    FlushNeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Done,
    Pending,
    Failed,
}

/// Readiness mask a peer's socket is registered for in the event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMask {
    Readable,
    Writable,
    ReadWritable,
}

/// What `wait_event_set` woke up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The producer published new WAL; the caller should re-enter via `Broadcast`.
    Latch,
    /// A registered peer socket became ready.
    Event { peer: usize, events: EventMask },
    /// No event arrived within the requested timeout.
    Timeout,
}

/// The cross-process shared-memory cell (§5, §6.2). `mine_last_elected_term`
/// is consulted during the basebackup cross-check (§4.3) and updated once a
/// new term is confirmed live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShmemState {
    pub mine_last_elected_term: Term,
}

/// All side effects the core state machine needs, routed through one trait
/// so the algorithms in `election`, `recovery`, `streaming`, `peer_fsm` and
/// `scheduler` are decoupled from any concrete transport, clock or storage.
pub trait WalproposerApi {
    fn now(&self) -> TimestampTz;

    fn init_event_set(&mut self, n_peers: usize);
    fn update_event_set(&mut self, peer: usize, mask: EventMask);
    fn add_peer_event(&mut self, peer: usize, mask: EventMask);
    fn rm_peer_event(&mut self, peer: usize);
    /// Block for at most `timeout_ms` (negative disables the timeout).
    fn wait_event_set(&mut self, timeout_ms: i64) -> WaitResult;

    fn connect_start(&mut self, peer: usize);
    fn connect_poll(&mut self, peer: usize) -> ConnectPollResult;
    fn send_query(&mut self, peer: usize, query: &str) -> bool;
    fn get_query_result(&mut self, peer: usize) -> QueryResult;
    fn async_read(&mut self, peer: usize) -> AsyncReadResult;
    fn async_write(&mut self, peer: usize, buf: &[u8]) -> AsyncWriteResult;
    /// A bounded blocking send, used only for the two handshake messages
    /// that the facade guarantees fit in a single packet (§9).
    fn blocking_write(&mut self, peer: usize, buf: &[u8]) -> bool;
    fn flush(&mut self, peer: usize) -> FlushResult;
    fn finish(&mut self, peer: usize);
    fn error_message(&self, peer: usize) -> String;

    /// Copy `len` bytes of local WAL starting at `start` into the outbound
    /// buffer. A failure here is process-fatal: the proposer cannot stream
    /// WAL it cannot read.
    fn wal_read(&mut self, start: Lsn, len: usize) -> anyhow::Result<Vec<u8>>;
    fn recovery_download(&mut self, donor: usize, ttid: TenantTimelineId, start: Lsn, end: Lsn) -> bool;
    fn get_redo_start_lsn(&self) -> Lsn;
    fn get_flush_rec_ptr(&self) -> Lsn;

    fn get_shmem_state(&self) -> ShmemState;
    fn update_shmem_mine_last_elected_term(&mut self, term: Term);

    fn strong_random(&mut self, dst: &mut [u8]);

    /// Notifies the embedder that streaming has begun at `start_lsn`. In the
    /// original C implementation this call transfers control permanently to
    /// the WAL-producing loop; here it is a one-shot hook so `Poll` can keep
    /// returning control to its caller.
    fn start_streaming(&mut self, start_lsn: Lsn);
    fn finish_sync_safekeepers(&mut self, lsn: Lsn);
    fn process_safekeeper_feedback(&mut self, commit_lsn: Lsn);
    fn confirm_wal_streamed(&mut self, truncate_lsn: Lsn);
    fn after_election(&mut self);
}
