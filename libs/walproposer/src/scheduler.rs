//! Scheduler loop (C6): the one thread of control. Gathers readiness events
//! from the multiplexer, dispatches them to the matching peer FSM, and owns
//! the reconnect timer and per-peer inactivity timeout.

use tracing::warn;

use crate::api::{EventMask, WaitResult, WalproposerApi};
use crate::error::FatalError;
use crate::peer_fsm::{self, Events};
use crate::state::{PeerState, ProposerState};

/// `TimeToReconnect`: milliseconds until the next reconnect sweep is due, or
/// `None` if the timer is disabled (`reconnect_timeout_ms == 0`).
///
/// The timeout is configured in milliseconds but internally this computation
/// works in the same unit throughout -- unlike the original C, which
/// converts through microseconds and divides by 1000, a path that can
/// truncate or overflow for timeouts beyond roughly 35 minutes (§9). This
/// rendition keeps everything in milliseconds to sidestep that hazard,
/// rather than reproducing it.
pub fn time_until_next_reconnect(st: &ProposerState, now_ms: i64) -> Option<i64> {
    let timeout_ms = st.config.reconnect_timeout.as_millis() as i64;
    if timeout_ms == 0 {
        return None;
    }
    let elapsed = now_ms - st.last_reconnect_attempt;
    Some((timeout_ms - elapsed).max(0))
}

/// Reopen every `OFFLINE` peer and record the attempt time.
pub fn reconnect_offline_peers(st: &mut ProposerState, api: &mut impl WalproposerApi, now_ms: i64) {
    st.last_reconnect_attempt = now_ms;
    for i in 0..st.peers.len() {
        if st.peers[i].state == PeerState::Offline {
            peer_fsm::reset_connection(st, api, i);
        }
    }
}

/// Send a zero-payload `AppendRequest` to every `ACTIVE` peer, propagating
/// the latest commit/truncate LSNs and satisfying the
/// at-least-one-heartbeat-per-timeout invariant.
pub fn broadcast_heartbeat(st: &mut ProposerState, api: &mut impl WalproposerApi) {
    if !st.available_lsn.is_valid() {
        return;
    }
    if let Err(e) = crate::streaming::broadcast_active_peers(st, api) {
        warn!(err = %e, "heartbeat broadcast failed");
    }
}

/// Shut down any peer that hasn't produced a message within
/// `connection_timeout_ms`, including one stuck mid-handshake.
pub fn enforce_connection_timeouts(st: &mut ProposerState, api: &mut impl WalproposerApi, now_ms: i64) {
    let timeout_ms = st.config.connection_timeout.as_millis() as i64;
    let stale: Vec<usize> = st
        .peers
        .iter()
        .enumerate()
        .filter(|(_, p)| p.state != PeerState::Offline && now_ms - p.latest_msg_received_at > timeout_ms)
        .map(|(i, _)| i)
        .collect();
    for i in stale {
        warn!(peer = i, "connection timed out, shutting down");
        peer_fsm::shutdown_connection(st, api, i);
    }
}

/// One iteration of the scheduler loop body (§4.6), split out of `Start`'s
/// infinite loop so tests can single-step it. `event` is what the
/// multiplexer reported for `wait_event_set`.
pub fn handle_wait_result(
    st: &mut ProposerState,
    api: &mut impl WalproposerApi,
    result: WaitResult,
) -> Result<(), FatalError> {
    let now = api.now();

    match result {
        WaitResult::Latch => {
            // New WAL became available; the producer will call `Broadcast`.
            return Ok(());
        }
        WaitResult::Event { peer, events } => {
            let ev = Events {
                readable: matches!(events, EventMask::Readable | EventMask::ReadWritable),
                writable: matches!(events, EventMask::Writable | EventMask::ReadWritable),
            };
            peer_fsm::advance(st, api, peer, ev)?;
        }
        WaitResult::Timeout => {}
    }

    let due = time_until_next_reconnect(st, now).map(|ms| ms == 0).unwrap_or(false);
    if due {
        reconnect_offline_peers(st, api, now);
    }

    if matches!(result, WaitResult::Timeout) || due {
        broadcast_heartbeat(st, api);
        enforce_connection_timeouts(st, api, now);
    }

    Ok(())
}

/// `Poll`: run `handle_wait_result` in a loop until the multiplexer reports
/// new WAL (caller should then invoke `Broadcast`) or a sync-mode run
/// finishes.
pub fn poll_once(st: &mut ProposerState, api: &mut impl WalproposerApi) -> Result<PollOutcome, FatalError> {
    if st.sync_finished {
        return Ok(PollOutcome::SyncFinished);
    }
    let now = api.now();
    let timeout_ms = time_until_next_reconnect(st, now).unwrap_or(-1);
    let result = api.wait_event_set(timeout_ms);
    let is_latch = matches!(result, WaitResult::Latch);
    handle_wait_result(st, api, result)?;
    if st.sync_finished {
        return Ok(PollOutcome::SyncFinished);
    }
    if is_latch {
        return Ok(PollOutcome::NewWalAvailable);
    }
    Ok(PollOutcome::Continue)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    NewWalAvailable,
    SyncFinished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalproposerConfig;
    use crate::state::ProposerState;
    use std::time::Duration;

    fn dummy_state() -> ProposerState {
        let mut cfg = WalproposerConfig::dummy(3);
        cfg.reconnect_timeout = Duration::from_millis(1000);
        ProposerState::new(cfg, [0u8; 16])
    }

    #[test]
    fn reconnect_disabled_when_zero() {
        let mut st = dummy_state();
        st.config.reconnect_timeout = Duration::from_millis(0);
        assert_eq!(time_until_next_reconnect(&st, 5_000), None);
    }

    #[test]
    fn reconnect_due_time_never_negative() {
        let st = dummy_state();
        // last_reconnect_attempt starts at 0; "now" far in the future.
        assert_eq!(time_until_next_reconnect(&st, 10_000), Some(0));
    }

    #[test]
    fn reconnect_not_yet_due() {
        let mut st = dummy_state();
        st.last_reconnect_attempt = 900;
        assert_eq!(time_until_next_reconnect(&st, 1000), Some(900));
    }
}
