//! Peer connection FSM (C2): drives one safekeeper connection through its
//! ten-state lifecycle in response to readiness events (§4.2).

use tracing::{trace, warn};

use crate::api::{ConnectPollResult, EventMask, QueryResult, WalproposerApi};
use crate::election;
use crate::error::FatalError;
use crate::protocol::{AcceptorProposerMessage, ProposerAcceptorMessage, ProposerElected, ProposerGreeting, VoteRequest};
use crate::state::{PeerState, ProposerState};
use crate::streaming;

/// Readiness bits a peer's socket may be woken for. Named after the
/// corresponding `WL_SOCKET_*` flags this mirrors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Events {
    pub readable: bool,
    pub writable: bool,
}

/// `SafekeeperStateDesiredEvents`: which readiness bits a peer in `state`
/// should be registered for.
pub fn desired_events(state: PeerState) -> Option<EventMask> {
    match state {
        PeerState::ConnectingRead => Some(EventMask::Readable),
        PeerState::ConnectingWrite => Some(EventMask::Writable),
        PeerState::WaitExecResult | PeerState::HandshakeRecv | PeerState::WaitVerdict => {
            Some(EventMask::Readable)
        }
        PeerState::Voting | PeerState::Idle => Some(EventMask::Readable),
        PeerState::SendElectedFlush | PeerState::Active => Some(EventMask::ReadWritable),
        PeerState::Offline => None,
    }
}

/// `FormatEvents`: a human-readable dump of which readiness bits fired.
/// Indices 4 and 5 both write into the same slot in the original C (the
/// exit-on-postmaster-death flag is clobbered by the socket-connected flag)
/// -- preserved here rather than fixed, since it's unclear which was meant
/// and nothing downstream parses this string.
pub fn format_events(ev: Events, connected: bool) -> String {
    let mut s = [b'_'; 6];
    s[0] = b'_'; // latch: not modeled at this granularity
    s[1] = if ev.readable { b'R' } else { b'_' };
    s[2] = if ev.writable { b'W' } else { b'_' };
    s[3] = b'_'; // timeout: reported by the caller, not part of Events
    s[4] = b'_'; // WL_POSTMASTER_DEATH: not applicable outside the C runtime
    s[4] = if connected { b'C' } else { b'_' };
    String::from_utf8_lossy(&s).into_owned()
}

/// Validate that the readiness bits actually delivered are a subset of what
/// this state declared it wants. A mismatch is an internal bug (§4.2).
pub fn validate_events(state: PeerState, ev: Events) -> Result<(), FatalError> {
    let (allow_read, allow_write) = match desired_events(state) {
        None => (false, false),
        Some(EventMask::Readable) => (true, false),
        Some(EventMask::Writable) => (false, true),
        Some(EventMask::ReadWritable) => (true, true),
    };
    let ok = (!ev.readable || allow_read) && (!ev.writable || allow_write);
    if !ok {
        return Err(FatalError::Bug(format!(
            "delivered events {ev:?} not a subset of desired events for state {state:?}"
        )));
    }
    Ok(())
}

/// `ResetConnection`: close the handle (if any), free owned buffers, return
/// to `OFFLINE` and immediately re-open.
pub fn reset_connection(st: &mut ProposerState, api: &mut impl WalproposerApi, peer_idx: usize) {
    shutdown_connection(st, api, peer_idx);
    st.peers[peer_idx].state = PeerState::ConnectingWrite;
    api.connect_start(peer_idx);
    api.update_event_set(peer_idx, EventMask::Writable);
}

/// `ShutdownConnection`: close the handle, free buffers, remove the event
/// slot, return to `OFFLINE`.
pub fn shutdown_connection(st: &mut ProposerState, api: &mut impl WalproposerApi, peer_idx: usize) {
    api.finish(peer_idx);
    api.rm_peer_event(peer_idx);
    st.peers[peer_idx].reset_connection_state();
}

/// Advance `peer_idx`'s FSM in response to `ev`. Returns `Err(FatalError)`
/// for process-fatal conditions (§7); any other failure is handled inline
/// by resetting or shutting down the one connection.
pub fn advance(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    peer_idx: usize,
    ev: Events,
) -> Result<(), FatalError> {
    let state = st.peers[peer_idx].state;
    validate_events(state, ev)?;
    trace!(peer = peer_idx, ?state, ?ev, "advancing peer fsm");

    match state {
        PeerState::Offline => {}

        PeerState::ConnectingWrite | PeerState::ConnectingRead => {
            match api.connect_poll(peer_idx) {
                ConnectPollResult::Ok => {
                    if !api.send_query(peer_idx, "START_WAL_PUSH") {
                        reset_connection(st, api, peer_idx);
                        return Ok(());
                    }
                    st.peers[peer_idx].state = PeerState::WaitExecResult;
                    api.update_event_set(peer_idx, EventMask::Readable);
                }
                ConnectPollResult::NeedsRead => {
                    st.peers[peer_idx].state = PeerState::ConnectingRead;
                    api.update_event_set(peer_idx, EventMask::Readable);
                }
                ConnectPollResult::NeedsWrite => {
                    st.peers[peer_idx].state = PeerState::ConnectingWrite;
                    api.update_event_set(peer_idx, EventMask::Writable);
                }
                ConnectPollResult::Failed => {
                    warn!(peer = peer_idx, err = %api.error_message(peer_idx), "connect failed");
                    shutdown_connection(st, api, peer_idx);
                }
            }
        }

        PeerState::WaitExecResult => match api.get_query_result(peer_idx) {
            QueryResult::CopyBothReady => {
                send_greeting(st, api, peer_idx);
            }
            QueryResult::NeedsInput => {}
            QueryResult::Failed | QueryResult::UnexpectedSuccess => {
                warn!(peer = peer_idx, "START_WAL_PUSH query failed");
                reset_connection(st, api, peer_idx);
            }
        },

        PeerState::HandshakeRecv => {
            if let Some(msg) = read_one(st, api, peer_idx)? {
                match msg {
                    AcceptorProposerMessage::Greeting(g) => {
                        st.peers[peer_idx].latest_msg_received_at = api.now();
                        election::handle_greeting(st, peer_idx, g)?;
                        st.peers[peer_idx].state = if st.quorum_reached {
                            PeerState::WaitVerdict
                        } else {
                            PeerState::Voting
                        };
                        send_vote_requests_to_armed_peers(st, api);
                    }
                    _ => {
                        warn!(peer = peer_idx, "unexpected message tag during handshake");
                        reset_connection(st, api, peer_idx);
                    }
                }
            }
        }

        PeerState::Voting => {
            // Idle: readable here means the peer closed the connection.
            if ev.readable {
                warn!(peer = peer_idx, "peer disconnected while voting");
                reset_connection(st, api, peer_idx);
            }
        }

        PeerState::WaitVerdict => {
            if let Some(msg) = read_one(st, api, peer_idx)? {
                match msg {
                    AcceptorProposerMessage::VoteResponse(vr) => {
                        st.peers[peer_idx].latest_msg_received_at = api.now();
                        handle_vote(st, api, peer_idx, vr)?;
                    }
                    _ => {
                        warn!(peer = peer_idx, "unexpected message tag waiting for vote");
                        reset_connection(st, api, peer_idx);
                    }
                }
            }
        }

        PeerState::SendElectedFlush => {
            use crate::api::FlushResult;
            match api.flush(peer_idx) {
                FlushResult::Done => {
                    st.peers[peer_idx].flush_write = false;
                    enter_active(st, api, peer_idx);
                }
                FlushResult::Pending => {}
                FlushResult::Failed => shutdown_connection(st, api, peer_idx),
            }
        }

        PeerState::Idle => {
            if ev.readable {
                warn!(peer = peer_idx, "peer disconnected while idle");
                reset_connection(st, api, peer_idx);
            }
        }

        PeerState::Active => {
            if ev.readable {
                drain_append_responses(st, api, peer_idx)?;
            }
            if ev.writable || st.peers[peer_idx].flush_write {
                match streaming::send_append_requests(st, api, peer_idx) {
                    Ok(streaming::SendOutcome::Failed) => shutdown_connection(st, api, peer_idx),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(peer = peer_idx, err = %e, "wal read failed");
                        return Err(FatalError::Bug(e.to_string()));
                    }
                }
            }
        }
    }

    Ok(())
}

fn send_greeting(st: &mut ProposerState, api: &mut impl WalproposerApi, peer_idx: usize) {
    let greeting = ProposerGreeting {
        protocol_version: crate::config::SK_PROTOCOL_VERSION,
        pg_version: st.config.pg_version,
        proposer_id: st.proposer_id,
        system_id: st.config.system_id,
        timeline_id: st.config.ttid.timeline_id,
        tenant_id: st.config.ttid.tenant_id,
        tli: st.config.pg_timeline,
        wal_seg_size: st.config.wal_segment_size as u32,
    };
    let mut buf = bytes::BytesMut::new();
    ProposerAcceptorMessage::Greeting(greeting).encode(&mut buf);
    if api.blocking_write(peer_idx, &buf) {
        st.peers[peer_idx].state = PeerState::HandshakeRecv;
        st.peers[peer_idx].latest_msg_received_at = api.now();
        api.update_event_set(peer_idx, EventMask::Readable);
    } else {
        reset_connection(st, api, peer_idx);
    }
}

/// Send a `VoteRequest` to every peer now sitting in `WAIT_VERDICT` that
/// hasn't been sent one yet on this connection. Quorum-of-greetings can
/// push several peers into `WAIT_VERDICT` in one call to
/// `election::handle_greeting`, only one of which is `peer_idx` itself.
fn send_vote_requests_to_armed_peers(st: &mut ProposerState, api: &mut impl WalproposerApi) {
    let armed: Vec<usize> = st
        .peers
        .iter()
        .enumerate()
        .filter(|(_, p)| p.state == PeerState::WaitVerdict && !p.vote_requested)
        .map(|(i, _)| i)
        .collect();

    let vr = VoteRequest {
        term: st.prop_term,
        proposer_id: st.proposer_id,
    };
    let mut buf = bytes::BytesMut::new();
    ProposerAcceptorMessage::VoteRequest(vr).encode(&mut buf);

    for i in armed {
        st.peers[i].vote_requested = true;
        if !api.blocking_write(i, &buf) {
            reset_connection(st, api, i);
        }
    }
}

fn handle_vote(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    peer_idx: usize,
    vr: crate::protocol::VoteResponse,
) -> Result<(), FatalError> {
    let outcome = election::handle_vote_response(st, peer_idx, vr)?;
    if st.sync_finished {
        // A sync-safekeepers run already finished on an earlier vote; a
        // straggler reaching quorum now has nothing left to do.
        return Ok(());
    }
    match outcome {
        election::VoteOutcome::AwaitingQuorum => {}
        election::VoteOutcome::QuorumReached => {
            election::determine_epoch_start_lsn(st, api);
            let elected = election::handle_elected_proposer(st, api)?;
            for (idx, msg) in elected {
                send_elected(st, api, idx, msg);
            }
        }
        election::VoteOutcome::SendElectedNow => {
            let msg = election::build_proposer_elected(st, peer_idx);
            send_elected(st, api, peer_idx, msg);
        }
    }
    Ok(())
}

fn send_elected(st: &mut ProposerState, api: &mut impl WalproposerApi, peer_idx: usize, msg: ProposerElected) {
    let mut buf = bytes::BytesMut::new();
    ProposerAcceptorMessage::Elected(msg).encode(&mut buf);
    match api.async_write(peer_idx, &buf) {
        crate::api::AsyncWriteResult::Ok => enter_active(st, api, peer_idx),
        crate::api::AsyncWriteResult::FlushNeeded => {
            st.peers[peer_idx].flush_write = true;
            st.peers[peer_idx].state = PeerState::SendElectedFlush;
            api.update_event_set(peer_idx, EventMask::ReadWritable);
        }
        crate::api::AsyncWriteResult::Failed => shutdown_connection(st, api, peer_idx),
    }
}

fn enter_active(st: &mut ProposerState, api: &mut impl WalproposerApi, peer_idx: usize) {
    st.peers[peer_idx].state = PeerState::Active;
    api.update_event_set(peer_idx, EventMask::ReadWritable);
}

fn drain_append_responses(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    peer_idx: usize,
) -> Result<(), FatalError> {
    let mut advanced = false;
    while let Some(msg) = read_one(st, api, peer_idx)? {
        match msg {
            AcceptorProposerMessage::AppendResponse(ar) => {
                st.peers[peer_idx].latest_msg_received_at = api.now();
                streaming::apply_append_response(st, peer_idx, ar)?;
                advanced = true;
            }
            _ => {
                warn!(peer = peer_idx, "unexpected message tag while active");
                reset_connection(st, api, peer_idx);
                return Ok(());
            }
        }
    }
    if advanced {
        let before = st.last_sent_commit_lsn;
        let should_exit = streaming::handle_safekeeper_response(st, api);
        let commit = st.quorum_commit_lsn();
        if commit.is_valid() && commit > before {
            st.last_sent_commit_lsn = commit;
            streaming::broadcast_active_peers(st, api).map_err(|e| FatalError::Bug(e.to_string()))?;
        }
        if should_exit {
            streaming::broadcast_active_peers(st, api).map_err(|e| FatalError::Bug(e.to_string()))?;
            api.finish_sync_safekeepers(st.prop_epoch_start_lsn);
            st.sync_finished = true;
        }
    }
    Ok(())
}

/// Read and parse one message if the capability has one buffered; returns
/// `Ok(None)` on "no complete message yet", resets the connection (and
/// returns `Ok(None)`) on a decode error, since that's a peer-local protocol
/// violation rather than a process-fatal one.
fn read_one(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    peer_idx: usize,
) -> Result<Option<AcceptorProposerMessage>, FatalError> {
    use crate::api::AsyncReadResult;
    match api.async_read(peer_idx) {
        AsyncReadResult::Ok(buf) => match AcceptorProposerMessage::parse(buf.into()) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!(peer = peer_idx, err = %e, "failed to decode message, resetting connection");
                reset_connection(st, api, peer_idx);
                Ok(None)
            }
        },
        AsyncReadResult::Again => Ok(None),
        AsyncReadResult::Failed => {
            shutdown_connection(st, api, peer_idx);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_events_offline_is_none() {
        assert_eq!(desired_events(PeerState::Offline), None);
    }

    #[test]
    fn desired_events_active_is_read_write() {
        assert_eq!(desired_events(PeerState::Active), Some(EventMask::ReadWritable));
    }

    #[test]
    fn format_events_collides_on_connected_flag() {
        // Documents the preserved E/C collision: the formatter only ever
        // reports the connected flag in that slot, never exit-on-pm-death.
        let s = format_events(Events { readable: true, writable: false }, true);
        assert_eq!(&s[4..5], "C");
    }

    #[test]
    fn validate_events_rejects_writable_when_not_desired() {
        let ev = Events { readable: false, writable: true };
        assert!(validate_events(PeerState::Offline, ev).is_err());
    }

    #[test]
    fn validate_events_accepts_subset() {
        let ev = Events { readable: true, writable: false };
        assert!(validate_events(PeerState::HandshakeRecv, ev).is_ok());
    }
}
