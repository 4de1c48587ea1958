//! Streaming engine (C5): frame `AppendRequest`s, advance `streamingAt`,
//! process `AppendResponse`s, recompute the quorum commit LSN, advance the
//! truncation horizon and drive sync-mode exit.

use bytes::BytesMut;
use tracing::{info, warn};

use postgres_ffi::MAX_SEND_SIZE;
use utils::lsn::Lsn;

use crate::api::{AsyncWriteResult, FlushResult, WalproposerApi};
use crate::error::FatalError;
use crate::protocol::{AppendRequest, AppendRequestHeader, AppendResponse, ProposerAcceptorMessage};
use crate::state::{PeerState, ProposerState};

/// What the caller (C2/C6) should do with the peer after one call to
/// `send_append_requests`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Fully caught up to `availableLsn`.
    Done,
    /// Partial write; `flush_write` is now set, caller must wait for write
    /// readiness and call `flush` before sending anything else.
    FlushPending,
    Failed,
}

/// `SendAppendRequests` (§4.5). Builds and sends batches of up to
/// `MAX_SEND_SIZE` bytes until the peer has caught up to `availableLsn`, or
/// a write can't complete without blocking.
pub fn send_append_requests(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    peer_idx: usize,
) -> anyhow::Result<SendOutcome> {
    if st.peers[peer_idx].flush_write {
        match api.flush(peer_idx) {
            FlushResult::Done => st.peers[peer_idx].flush_write = false,
            FlushResult::Pending => return Ok(SendOutcome::FlushPending),
            FlushResult::Failed => return Ok(SendOutcome::Failed),
        }
    }

    loop {
        let streaming_at = st.peers[peer_idx].streaming_at;
        let end = Lsn(u64::from(streaming_at) + MAX_SEND_SIZE as u64).min(st.available_lsn);
        let len = (end - streaming_at) as usize;

        let wal_data = if len == 0 {
            Vec::new()
        } else {
            api.wal_read(streaming_at, len)?
        };

        let header = AppendRequestHeader {
            term: st.prop_term,
            epoch_start_lsn: st.prop_epoch_start_lsn,
            begin_lsn: streaming_at,
            end_lsn: end,
            commit_lsn: st.last_sent_commit_lsn,
            truncate_lsn: st.truncate_lsn,
            proposer_uuid: st.proposer_id,
        };
        let msg = AppendRequest {
            h: header,
            wal_data: wal_data.into(),
        };

        let mut buf = BytesMut::new();
        ProposerAcceptorMessage::AppendRequest(msg).encode(&mut buf);

        match api.async_write(peer_idx, &buf) {
            AsyncWriteResult::Ok => {
                st.peers[peer_idx].streaming_at = end;
                if end == st.available_lsn {
                    return Ok(SendOutcome::Done);
                }
            }
            AsyncWriteResult::FlushNeeded => {
                st.peers[peer_idx].streaming_at = end;
                st.peers[peer_idx].flush_write = true;
                return Ok(SendOutcome::FlushPending);
            }
            AsyncWriteResult::Failed => return Ok(SendOutcome::Failed),
        }
    }
}

/// Decode one `AppendResponse` already read off the wire and fold it into
/// peer/process state. Returns `Err` if the peer observed a higher term.
pub fn apply_append_response(
    st: &mut ProposerState,
    peer_idx: usize,
    response: AppendResponse,
) -> Result<(), FatalError> {
    if response.term > st.prop_term {
        return Err(FatalError::HigherTermObserved {
            observed: response.term,
            ours: st.prop_term,
        });
    }
    st.peers[peer_idx].append_response = Some(response);
    Ok(())
}

/// `HandleSafekeeperResponse` (§4.5): recompute commit/truncate LSNs, notify
/// the embedder, and decide whether a sync-mode run should exit.
pub fn handle_safekeeper_response(st: &mut ProposerState, api: &mut impl WalproposerApi) -> bool {
    let commit_lsn = st.quorum_commit_lsn();
    if commit_lsn.is_valid() {
        api.process_safekeeper_feedback(commit_lsn);
    }

    let min_flush = st.min_flush_lsn();
    if min_flush.is_valid() && min_flush > st.truncate_lsn {
        st.truncate_lsn = min_flush;
        api.confirm_wal_streamed(st.truncate_lsn);
    }

    if !st.config.sync_safekeepers || st.sync_finished {
        return false;
    }

    let mut synced = 0usize;
    let mut all_offline_are_excused = true;
    for p in &st.peers {
        if p.state == PeerState::Offline {
            continue;
        }
        match &p.append_response {
            Some(ar) if ar.commit_lsn >= st.prop_epoch_start_lsn => synced += 1,
            _ => all_offline_are_excused = false,
        }
    }

    if !all_offline_are_excused || synced < st.quorum {
        return false;
    }

    info!(synced, "quorum of safekeepers synced, finishing sync-safekeepers run");
    true
}

/// After a commit-LSN advance, rebroadcast a (possibly empty) `AppendRequest`
/// to every `ACTIVE` peer so the new commit/truncate LSNs propagate promptly
/// instead of waiting for the next heartbeat.
pub fn broadcast_active_peers(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
) -> anyhow::Result<()> {
    let active: Vec<usize> = st
        .peers
        .iter()
        .enumerate()
        .filter(|(_, p)| p.state == PeerState::Active)
        .map(|(i, _)| i)
        .collect();
    for i in active {
        match send_append_requests(st, api, i)? {
            SendOutcome::Failed => warn!(peer = i, "failed to rebroadcast append request"),
            _ => {}
        }
    }
    Ok(())
}
