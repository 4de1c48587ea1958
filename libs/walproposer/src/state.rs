//! Process-wide and per-peer state (§3). `ProposerState` is created once per
//! run; each `Peer` tracks one safekeeper connection through its 10-state
//! lifecycle (§4.2).

use bytes::BytesMut;

use utils::lsn::Lsn;

use crate::config::WalproposerConfig;
use crate::protocol::{AcceptorGreeting, AppendResponse, ProposerUuid, Term, TermHistory, VoteResponse, INVALID_TERM};

/// The ten states a peer connection moves through. Named after the readiness
/// event each one waits on (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Offline,
    ConnectingWrite,
    ConnectingRead,
    WaitExecResult,
    HandshakeRecv,
    Voting,
    WaitVerdict,
    SendElectedFlush,
    Idle,
    Active,
}

/// One safekeeper connection and everything learned from it so far.
pub struct Peer {
    pub host: String,
    pub port: u16,

    pub state: PeerState,
    pub outbuf: BytesMut,
    pub flush_write: bool,

    pub start_streaming_at: Lsn,
    pub streaming_at: Lsn,

    pub greet_response: Option<AcceptorGreeting>,
    pub vote_response: Option<VoteResponse>,
    pub append_response: Option<AppendResponse>,

    pub latest_msg_received_at: i64,
    pub event_slot: Option<usize>,

    /// Whether this peer's current connection has already contributed to
    /// `ProposerState::n_connected`. Cleared on every reset so a peer can
    /// only count once per connection, even though `n_connected` itself is
    /// never reset across the lifetime of the proposer (§9).
    pub greeting_counted: bool,

    /// Whether a `VoteRequest` has already been sent on this connection.
    /// A peer can be pushed straight from `VOTING` to `WAIT_VERDICT` by
    /// another peer's greeting completing the quorum, so sending the
    /// request can't be tied only to the event that moved this one peer.
    pub vote_requested: bool,
}

impl Peer {
    pub fn new(host: String, port: u16) -> Peer {
        Peer {
            host,
            port,
            state: PeerState::Offline,
            outbuf: BytesMut::new(),
            flush_write: false,
            start_streaming_at: Lsn::INVALID,
            streaming_at: Lsn::INVALID,
            greet_response: None,
            vote_response: None,
            append_response: None,
            latest_msg_received_at: 0,
            event_slot: None,
            greeting_counted: false,
            vote_requested: false,
        }
    }

    /// Reset everything that belongs to one connection attempt, as part of
    /// `ResetConnection`/`ShutdownConnection` (§4.2).
    pub fn reset_connection_state(&mut self) {
        self.state = PeerState::Offline;
        self.outbuf.clear();
        self.flush_write = false;
        self.greet_response = None;
        self.vote_response = None;
        self.event_slot = None;
        self.greeting_counted = false;
        self.vote_requested = false;
    }

    pub fn flush_lsn(&self) -> Lsn {
        self.append_response
            .as_ref()
            .map(|r| r.flush_lsn)
            .unwrap_or(Lsn::INVALID)
    }
}

/// The process-wide proposer singleton (§3).
pub struct ProposerState {
    pub config: WalproposerConfig,
    pub peers: Vec<Peer>,
    pub quorum: usize,

    pub available_lsn: Lsn,
    pub last_sent_commit_lsn: Lsn,
    pub truncate_lsn: Lsn,

    pub prop_term: Term,
    pub prop_term_history: TermHistory,
    pub prop_epoch_start_lsn: Lsn,

    pub donor: Option<usize>,
    pub donor_epoch: Term,
    pub timeline_start_lsn: Lsn,

    pub n_connected: usize,
    pub n_votes: usize,
    /// Set once `n_connected` first reaches `quorum` and the term has been
    /// bumped for voting. A greeting that arrives afterwards (quorum was
    /// already decided by others) still needs its peer pushed straight to
    /// `WAIT_VERDICT` instead of lingering in `VOTING`.
    pub quorum_reached: bool,

    pub last_reconnect_attempt: i64,

    pub proposer_id: ProposerUuid,

    pub elected: bool,
    pub sync_finished: bool,
}

impl ProposerState {
    pub fn new(config: WalproposerConfig, proposer_id: ProposerUuid) -> ProposerState {
        let quorum = config.quorum();
        let peers = config
            .safekeepers
            .iter()
            .map(|sk| Peer::new(sk.host.clone(), sk.port))
            .collect();
        ProposerState {
            config,
            peers,
            quorum,
            available_lsn: Lsn::INVALID,
            last_sent_commit_lsn: Lsn::INVALID,
            truncate_lsn: Lsn::INVALID,
            prop_term: INVALID_TERM,
            prop_term_history: TermHistory::empty(),
            prop_epoch_start_lsn: Lsn::INVALID,
            donor: None,
            donor_epoch: INVALID_TERM,
            timeline_start_lsn: Lsn::INVALID,
            n_connected: 0,
            n_votes: 0,
            quorum_reached: false,
            last_reconnect_attempt: 0,
            proposer_id,
            elected: false,
            sync_finished: false,
        }
    }

    pub fn n_safekeepers(&self) -> usize {
        self.peers.len()
    }

    /// `GetAcknowledgedByQuorumWALPosition` (C5): the `quorum`-th largest
    /// flush LSN reported from the current epoch, or `Lsn::INVALID` if no
    /// peer has acked anything from this epoch yet.
    pub fn quorum_commit_lsn(&self) -> Lsn {
        let mut flushed: Vec<Lsn> = self
            .peers
            .iter()
            .map(|p| {
                let lsn = p.flush_lsn();
                if lsn >= self.prop_epoch_start_lsn {
                    lsn
                } else {
                    Lsn::INVALID
                }
            })
            .collect();
        flushed.sort();
        let n = flushed.len();
        if self.quorum == 0 || self.quorum > n {
            return Lsn::INVALID;
        }
        flushed[n - self.quorum]
    }

    /// `CalculateMinFlushLsn` (C5): truncation may never advance past the
    /// slowest peer's flushed suffix.
    pub fn min_flush_lsn(&self) -> Lsn {
        self.peers
            .iter()
            .map(|p| p.flush_lsn())
            .min()
            .unwrap_or(Lsn::INVALID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TermLsn;

    fn state_with_flush_lsns(lsns: &[u64], epoch_start: u64) -> ProposerState {
        let mut st = ProposerState::new(WalproposerConfig::dummy(lsns.len()), [0u8; 16]);
        st.prop_epoch_start_lsn = Lsn(epoch_start);
        for (p, &lsn) in st.peers.iter_mut().zip(lsns) {
            p.append_response = Some(crate::protocol::AppendResponse {
                term: 1,
                flush_lsn: Lsn(lsn),
                commit_lsn: Lsn::INVALID,
                hs_feedback: crate::protocol::HotStandbyFeedback::empty(),
                pageserver_feedback: utils::pageserver_feedback::PageserverFeedback::empty(),
            });
        }
        st
    }

    #[test]
    fn quorum_commit_matches_spec_example() {
        // N=5, quorum=3, propEpochStartLsn=1000.
        let st = state_with_flush_lsns(&[900, 1200, 1500, 800, 1300], 1000);
        assert_eq!(st.quorum, 3);
        assert_eq!(st.quorum_commit_lsn(), Lsn(1200));
    }

    #[test]
    fn quorum_commit_invalid_when_below_quorum() {
        let st = state_with_flush_lsns(&[900, 800], 1000);
        assert_eq!(st.quorum_commit_lsn(), Lsn::INVALID);
    }

    #[test]
    fn min_flush_lsn_is_slowest_peer() {
        let st = state_with_flush_lsns(&[900, 1200, 1500], 0);
        assert_eq!(st.min_flush_lsn(), Lsn(900));
    }

    #[test]
    fn term_history_helper_available() {
        let th = TermHistory(vec![TermLsn::from((1, Lsn(1)))]);
        assert_eq!(th.highest_term(), 1);
    }
}
