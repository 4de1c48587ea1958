//! Election engine (C3): aggregate greetings, pick a term, collect votes,
//! choose a donor and build the proposer's term history.

use tracing::{info, warn};

use utils::lsn::Lsn;

use crate::api::WalproposerApi;
use crate::error::FatalError;
use crate::protocol::{AcceptorGreeting, ProposerElected, TermHistory, VoteResponse};
use crate::recovery::determine_start_streaming_at;
use crate::state::{PeerState, ProposerState};

/// `HANDSHAKE_RECV` decoded an `AcceptorGreeting` for `peer`. Bumps
/// `prop_term` and, once a quorum of greetings has arrived, fixes the term
/// and arms every still-`VOTING` peer to send a `VoteRequest`.
///
/// Returns `Err` if a greeting arrives after quorum with a term higher than
/// the one already chosen -- a concurrent proposer has taken over.
pub fn handle_greeting(
    st: &mut ProposerState,
    peer_idx: usize,
    greeting: AcceptorGreeting,
) -> Result<(), FatalError> {
    let peer = &mut st.peers[peer_idx];

    if st.n_votes > 0 || st.n_connected >= st.quorum {
        // Quorum already decided (or voting already under way): a later
        // greeting with a higher term means somebody else is proposing.
        if greeting.term > st.prop_term {
            return Err(FatalError::HigherTermObserved {
                observed: greeting.term,
                ours: st.prop_term,
            });
        }
    }

    if !peer.greeting_counted {
        st.n_connected += 1;
        peer.greeting_counted = true;
    }
    st.prop_term = st.prop_term.max(greeting.term);
    peer.greet_response = Some(greeting);

    if !st.quorum_reached && st.n_connected >= st.quorum {
        st.quorum_reached = true;
        st.prop_term += 1;
        info!(term = st.prop_term, "quorum of greetings reached, requesting votes");
    }
    if st.quorum_reached {
        for p in st.peers.iter_mut() {
            if p.state == PeerState::Voting {
                p.state = PeerState::WaitVerdict;
            }
        }
    }

    Ok(())
}

/// Outcome of processing one `VoteResponse`, telling the caller (C2) what to
/// do with this peer next, and whether the quorum-wide election steps
/// should now run.
pub enum VoteOutcome {
    /// Not enough votes yet; wait in `IDLE`.
    AwaitingQuorum,
    /// This was the vote that reached quorum; caller must run
    /// `determine_epoch_start_lsn` + `handle_elected_proposer`.
    QuorumReached,
    /// Quorum was already reached earlier; send `ProposerElected` to this
    /// peer directly.
    SendElectedNow,
}

pub fn handle_vote_response(
    st: &mut ProposerState,
    peer_idx: usize,
    vote: VoteResponse,
) -> Result<VoteOutcome, FatalError> {
    if vote.vote_given == 0 {
        if vote.term > st.prop_term || st.n_votes < st.quorum {
            return Err(FatalError::VoteRejected {
                observed: vote.term,
                ours: st.prop_term,
            });
        }
    }
    if vote.term != st.prop_term {
        return Err(FatalError::Bug(format!(
            "VoteResponse term {} does not match propTerm {}",
            vote.term, st.prop_term
        )));
    }

    st.peers[peer_idx].vote_response = Some(vote);
    st.n_votes += 1;
    st.peers[peer_idx].state = PeerState::Idle;

    match st.n_votes.cmp(&st.quorum) {
        std::cmp::Ordering::Less => Ok(VoteOutcome::AwaitingQuorum),
        std::cmp::Ordering::Equal => Ok(VoteOutcome::QuorumReached),
        std::cmp::Ordering::Greater => Ok(VoteOutcome::SendElectedNow),
    }
}

/// `DetermineEpochStartLsn`: scan all `IDLE` peers (those that voted yes and
/// are waiting) to pick the donor, `propEpochStartLsn` and `truncateLsn`.
pub fn determine_epoch_start_lsn(st: &mut ProposerState, api: &impl WalproposerApi) {
    st.prop_epoch_start_lsn = Lsn::INVALID;
    st.donor_epoch = 0;
    st.truncate_lsn = Lsn::INVALID;
    st.timeline_start_lsn = Lsn::INVALID;
    st.donor = None;

    for i in 0..st.peers.len() {
        if st.peers[i].state != PeerState::Idle {
            continue;
        }
        let vr = st.peers[i].vote_response.clone().expect("idle peer has a vote response");
        let epoch = vr.term_history.highest_term();

        if st.donor.is_none()
            || epoch > st.donor_epoch
            || (epoch == st.donor_epoch && vr.flush_lsn > st.prop_epoch_start_lsn)
        {
            st.donor_epoch = epoch;
            st.prop_epoch_start_lsn = vr.flush_lsn;
            st.donor = Some(i);
        }
        st.truncate_lsn = st.truncate_lsn.max(vr.truncate_lsn);

        if vr.timeline_start_lsn.is_valid() {
            if st.timeline_start_lsn.is_valid() && st.timeline_start_lsn != vr.timeline_start_lsn {
                warn!(
                    current = %st.timeline_start_lsn,
                    received = %vr.timeline_start_lsn,
                    "inconsistent timelineStartLsn"
                );
            }
            st.timeline_start_lsn = vr.timeline_start_lsn;
        }
    }

    if !st.prop_epoch_start_lsn.is_valid() && !st.config.sync_safekeepers {
        let redo = api.get_redo_start_lsn();
        st.prop_epoch_start_lsn = redo;
        st.truncate_lsn = redo;
        if !st.timeline_start_lsn.is_valid() {
            st.timeline_start_lsn = redo;
        }
        info!(epoch_start_lsn = %st.prop_epoch_start_lsn, "bumped epochStartLsn to the first record");
    }

    st.available_lsn = st.prop_epoch_start_lsn;

    let donor_idx = st.donor.expect("donor must be set after scanning idle peers");
    let donor_history = st.peers[donor_idx]
        .vote_response
        .as_ref()
        .expect("donor has a vote response")
        .term_history
        .clone();
    let mut entries = donor_history.0.clone();
    entries.push((st.prop_term, st.prop_epoch_start_lsn).into());
    st.prop_term_history = TermHistory(entries);

    info!(
        quorum = st.quorum,
        term = st.prop_term,
        epoch_start_lsn = %st.prop_epoch_start_lsn,
        truncate_lsn = %st.truncate_lsn,
        "got votes from majority of nodes"
    );
}

/// Basebackup cross-check + recovery download + `afterElection` hook +
/// `ProposerElected` broadcast (`HandleElectedProposer`, §4.3).
pub fn handle_elected_proposer(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
) -> Result<Vec<(usize, ProposerElected)>, FatalError> {
    if !st.config.sync_safekeepers {
        let shmem = api.get_shmem_state();
        let corrected = postgres_ffi::skip_xlog_page_header(
            u64::from(st.prop_epoch_start_lsn),
            st.config.wal_segment_size,
        );
        let basebackup_lsn = u64::from(api.get_redo_start_lsn());
        if corrected != basebackup_lsn {
            let donor_idx = st.donor.expect("donor set by determine_epoch_start_lsn");
            let donor_history_empty = st.peers[donor_idx]
                .vote_response
                .as_ref()
                .map(|vr| vr.term_history.0.is_empty())
                .unwrap_or(true);
            let donor_last_term = st.peers[donor_idx]
                .vote_response
                .as_ref()
                .map(|vr| vr.term_history.highest_term())
                .unwrap_or(0);
            // An empty donor history can never justify the mismatch: the
            // donor never wrote anything, so there's no term of its own to
            // match against ours. Only a non-empty history whose highest
            // term equals ours explains a basebackup taken under our term.
            if donor_history_empty || donor_last_term != shmem.mine_last_elected_term {
                return Err(FatalError::BasebackupLsnMismatch {
                    collected: st.prop_epoch_start_lsn,
                    basebackup: Lsn(basebackup_lsn),
                });
            }
        }
        api.update_shmem_mine_last_elected_term(st.prop_term);
    }

    if st.truncate_lsn < st.prop_epoch_start_lsn {
        let donor_idx = st.donor.expect("donor set by determine_epoch_start_lsn");
        let ok = api.recovery_download(donor_idx, st.config.ttid, st.truncate_lsn, st.prop_epoch_start_lsn);
        if !ok {
            return Err(FatalError::RecoveryDownloadFailed);
        }
    }

    if st.config.sync_safekeepers && st.truncate_lsn >= st.prop_epoch_start_lsn {
        api.finish_sync_safekeepers(st.prop_epoch_start_lsn);
        st.sync_finished = true;
        return Ok(Vec::new());
    }

    api.after_election();
    st.elected = true;

    let mut out = Vec::new();
    for i in 0..st.peers.len() {
        if st.peers[i].state != PeerState::Idle {
            continue;
        }
        let msg = build_proposer_elected(st, i);
        out.push((i, msg));
    }
    Ok(out)
}

/// Build the `ProposerElected` message for `peer_idx` and set its
/// `start_streaming_at` (C4 + the tail of `SendProposerElected`).
pub fn build_proposer_elected(st: &mut ProposerState, peer_idx: usize) -> ProposerElected {
    let peer_history = st.peers[peer_idx]
        .vote_response
        .as_ref()
        .map(|vr| vr.term_history.clone())
        .unwrap_or_else(TermHistory::empty);
    let peer_flush_lsn = st.peers[peer_idx].flush_lsn();

    let d = determine_start_streaming_at(
        &st.prop_term_history,
        st.prop_term,
        &peer_history,
        peer_flush_lsn,
        st.truncate_lsn,
    );
    debug_assert!(d.start_streaming_at >= st.truncate_lsn);
    debug_assert!(d.start_streaming_at <= st.available_lsn);

    st.peers[peer_idx].start_streaming_at = d.start_streaming_at;
    st.peers[peer_idx].streaming_at = d.start_streaming_at;

    ProposerElected {
        term: st.prop_term,
        start_streaming_at: d.start_streaming_at,
        term_history: st.prop_term_history.clone(),
        timeline_start_lsn: st.timeline_start_lsn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalproposerConfig;
    use crate::protocol::{Term, TermLsn};
    use crate::simtest::SimulatedApi;

    fn vote_yes(term: Term, flush_lsn: u64, truncate_lsn: u64) -> VoteResponse {
        VoteResponse {
            term,
            vote_given: 1,
            flush_lsn: Lsn(flush_lsn),
            truncate_lsn: Lsn(truncate_lsn),
            term_history: TermHistory(vec![TermLsn::from((1, Lsn(100)))]),
            timeline_start_lsn: Lsn(100),
        }
    }

    #[test]
    fn greeting_quorum_bumps_term_once_and_arms_peers() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(3), [0u8; 16]);
        st.peers[0].state = PeerState::Voting;
        st.peers[1].state = PeerState::Voting;
        let starting_term = st.prop_term;

        handle_greeting(&mut st, 0, AcceptorGreeting { term: 0, node_id: utils::id::NodeId(0) }).unwrap();
        assert!(!st.quorum_reached);
        assert_eq!(st.peers[0].state, PeerState::Voting);

        handle_greeting(&mut st, 1, AcceptorGreeting { term: 0, node_id: utils::id::NodeId(1) }).unwrap();
        assert!(st.quorum_reached);
        assert_eq!(st.prop_term, starting_term + 1);
        // Both already-Voting peers flip to WaitVerdict once quorum lands.
        assert_eq!(st.peers[0].state, PeerState::WaitVerdict);
        assert_eq!(st.peers[1].state, PeerState::WaitVerdict);
    }

    #[test]
    fn late_greeting_at_same_term_after_quorum_is_not_fatal() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(3), [0u8; 16]);
        st.quorum_reached = true;
        st.n_connected = st.quorum;
        st.prop_term = 5;
        let res = handle_greeting(&mut st, 2, AcceptorGreeting { term: 5, node_id: utils::id::NodeId(2) });
        assert!(res.is_ok());
    }

    #[test]
    fn late_greeting_with_higher_term_after_quorum_is_fatal() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(3), [0u8; 16]);
        st.quorum_reached = true;
        st.n_connected = st.quorum;
        st.prop_term = 5;
        let res = handle_greeting(&mut st, 2, AcceptorGreeting { term: 9, node_id: utils::id::NodeId(2) });
        assert!(matches!(res, Err(FatalError::HigherTermObserved { observed: 9, ours: 5 })));
    }

    #[test]
    fn vote_outcome_progresses_from_awaiting_to_send_elected_now() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(3), [0u8; 16]);
        st.prop_term = 1;
        for p in &mut st.peers {
            p.state = PeerState::WaitVerdict;
        }

        let o1 = handle_vote_response(&mut st, 0, vote_yes(1, 100, 0)).unwrap();
        assert!(matches!(o1, VoteOutcome::AwaitingQuorum));

        let o2 = handle_vote_response(&mut st, 1, vote_yes(1, 100, 0)).unwrap();
        assert!(matches!(o2, VoteOutcome::QuorumReached));

        let o3 = handle_vote_response(&mut st, 2, vote_yes(1, 100, 0)).unwrap();
        assert!(matches!(o3, VoteOutcome::SendElectedNow));
    }

    #[test]
    fn donor_selection_prefers_higher_epoch_then_higher_flush_lsn() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(3), [0u8; 16]);
        st.prop_term = 6;
        st.peers[0].vote_response = Some(vote_yes(1, 300, 50));
        st.peers[0].state = PeerState::Idle;
        st.peers[1].vote_response = Some(VoteResponse {
            term_history: TermHistory(vec![TermLsn::from((2, Lsn(100)))]),
            ..vote_yes(1, 500, 50)
        });
        st.peers[1].state = PeerState::Idle;
        st.peers[2].vote_response = Some(vote_yes(1, 900, 50));
        st.peers[2].state = PeerState::Idle;

        let api = SimulatedApi::new(Lsn(0));
        determine_epoch_start_lsn(&mut st, &api);

        // Peer 1 has the highest epoch (2), so it wins regardless of peer 2's
        // higher flush lsn at the lower epoch.
        assert_eq!(st.donor, Some(1));
        assert_eq!(st.prop_epoch_start_lsn, Lsn(500));
        assert_eq!(st.truncate_lsn, Lsn(50));
    }

    #[test]
    fn epoch_start_falls_back_to_redo_lsn_when_all_peers_are_fresh() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(2), [0u8; 16]);
        st.prop_term = 1;
        for p in &mut st.peers {
            p.vote_response = Some(VoteResponse {
                term: 1,
                vote_given: 1,
                flush_lsn: Lsn::INVALID,
                truncate_lsn: Lsn::INVALID,
                term_history: TermHistory::empty(),
                timeline_start_lsn: Lsn::INVALID,
            });
            p.state = PeerState::Idle;
        }
        let api = SimulatedApi::new(Lsn(4096));
        determine_epoch_start_lsn(&mut st, &api);
        assert_eq!(st.prop_epoch_start_lsn, Lsn(4096));
        assert_eq!(st.truncate_lsn, Lsn(4096));
    }

    #[test]
    fn basebackup_mismatch_with_empty_donor_history_is_unconditionally_fatal() {
        let mut st = ProposerState::new(WalproposerConfig::dummy(2), [0u8; 16]);
        st.prop_term = 1;
        st.donor = Some(0);
        st.truncate_lsn = Lsn(900);
        st.prop_epoch_start_lsn = Lsn(900);
        st.peers[0].vote_response = Some(VoteResponse {
            term: 1,
            vote_given: 1,
            flush_lsn: Lsn(900),
            truncate_lsn: Lsn(900),
            term_history: TermHistory::empty(),
            timeline_start_lsn: Lsn(900),
        });
        st.peers[0].state = PeerState::Idle;

        // redo_start_lsn disagrees with prop_epoch_start_lsn, and
        // mine_last_elected_term defaults to 0, which would equal an empty
        // history's highest_term() (also 0) if that were treated as a real
        // term match rather than as "no history at all".
        let mut api = SimulatedApi::new(Lsn(800));
        let res = handle_elected_proposer(&mut st, &mut api);
        assert!(matches!(res, Err(FatalError::BasebackupLsnMismatch { .. })));
    }
}
