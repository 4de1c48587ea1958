//! Proposer-side implementation of the safekeeper replication protocol: a
//! single-threaded, event-driven state machine that gets a quorum of
//! safekeepers to agree on a term, elects itself the writer for that term,
//! and streams WAL to them until superseded.
//!
//! The crate is organized around the seams a production embedder needs:
//! wire codec ([`protocol`]), per-peer connection FSM ([`peer_fsm`]),
//! election ([`election`]), recovery planning ([`recovery`]), streaming
//! ([`streaming`]), the scheduler loop ([`scheduler`]) and the capability
//! facade ([`api`]) that decouples all of the above from any concrete
//! transport, clock or WAL storage. [`simtest`] provides an in-memory
//! capability for tests.

pub mod api;
pub mod config;
pub mod election;
pub mod error;
pub mod metrics;
pub mod peer_fsm;
pub mod protocol;
pub mod recovery;
pub mod scheduler;
pub mod simtest;
pub mod state;
pub mod streaming;

use tracing::info;

use crate::api::{EventMask, WalproposerApi};
use crate::config::WalproposerConfig;
use crate::error::FatalError;
use crate::protocol::ProposerUuid;
use crate::scheduler::PollOutcome;
use crate::state::{PeerState, ProposerState};
use utils::lsn::Lsn;

/// `Create` (§6.4): build a fresh, not-yet-started proposer for `config`,
/// identified on the wire by `proposer_id`.
pub fn create(config: WalproposerConfig, proposer_id: ProposerUuid) -> ProposerState {
    ProposerState::new(config, proposer_id)
}

/// `Start` (§6.4): arm the event set and kick every peer off `OFFLINE` into
/// its connection sequence. The caller drives the run to completion by
/// calling [`poll`] (and, once elected, [`broadcast`]) in a loop.
pub fn start(st: &mut ProposerState, api: &mut impl WalproposerApi) {
    api.init_event_set(st.n_safekeepers());
    info!(n_safekeepers = st.n_safekeepers(), quorum = st.quorum, "starting walproposer");
    for i in 0..st.peers.len() {
        peer_fsm::reset_connection(st, api, i);
    }
}

/// `Broadcast` (§6.4): new WAL is available in `[start_pos, end_pos)`.
/// `start_pos` must equal the proposer's current `availableLsn`; `end_pos`
/// becomes the new one. Sends an `AppendRequest` batch to every `ACTIVE`
/// peer.
pub fn broadcast(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    start_pos: Lsn,
    end_pos: Lsn,
) -> Result<(), FatalError> {
    debug_assert_eq!(start_pos, st.available_lsn, "Broadcast must start where availableLsn left off");
    debug_assert!(end_pos >= start_pos, "Broadcast range must not go backwards");
    st.available_lsn = end_pos;
    streaming::broadcast_active_peers(st, api).map_err(|e| FatalError::Bug(e.to_string()))?;
    metrics::update_from_state(st);
    Ok(())
}

/// `Poll` (§6.4): run the scheduler for one wait/dispatch cycle. Returns
/// what happened so the caller knows whether to call [`broadcast`] next or
/// simply call `poll` again.
pub fn poll(st: &mut ProposerState, api: &mut impl WalproposerApi) -> Result<PollOutcome, FatalError> {
    let outcome = scheduler::poll_once(st, api)?;
    metrics::update_from_state(st);
    Ok(outcome)
}

/// `Free` (§6.4): tear down every live connection. The `ProposerState` is
/// dropped by the caller afterwards; this only releases capability-side
/// resources (sockets, event-set registrations).
pub fn free(st: &mut ProposerState, api: &mut impl WalproposerApi) {
    for i in 0..st.peers.len() {
        if st.peers[i].state != PeerState::Offline {
            peer_fsm::shutdown_connection(st, api, i);
        }
    }
}

/// True once a quorum has elected this proposer and `ProposerElected` has
/// gone out; `broadcast` only has peers to talk to once this holds.
pub fn is_elected(st: &ProposerState) -> bool {
    st.elected
}

/// Readiness mask this peer's socket should be registered for right now,
/// for embedders that manage their own event set outside of [`start`].
pub fn desired_events(st: &ProposerState, peer_idx: usize) -> Option<EventMask> {
    peer_fsm::desired_events(st.peers[peer_idx].state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simtest::SimulatedApi;

    #[test]
    fn create_starts_with_n_peers_offline() {
        let cfg = WalproposerConfig::dummy(3);
        let st = create(cfg, [1u8; 16]);
        assert_eq!(st.n_safekeepers(), 3);
        assert!(st.peers.iter().all(|p| p.state == PeerState::Offline));
    }

    #[test]
    fn start_moves_every_peer_off_offline() {
        let cfg = WalproposerConfig::dummy(3);
        let mut st = create(cfg, [1u8; 16]);
        let mut api = SimulatedApi::new(Lsn(0));
        start(&mut st, &mut api);
        assert!(st
            .peers
            .iter()
            .all(|p| p.state == PeerState::ConnectingWrite));
    }

    #[test]
    fn free_returns_live_peers_to_offline() {
        let cfg = WalproposerConfig::dummy(2);
        let mut st = create(cfg, [1u8; 16]);
        let mut api = SimulatedApi::new(Lsn(0));
        start(&mut st, &mut api);
        free(&mut st, &mut api);
        assert!(st.peers.iter().all(|p| p.state == PeerState::Offline));
    }

    #[test]
    fn not_elected_before_quorum() {
        let cfg = WalproposerConfig::dummy(3);
        let st = create(cfg, [1u8; 16]);
        assert!(!is_elected(&st));
    }
}
