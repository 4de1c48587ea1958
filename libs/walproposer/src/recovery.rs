//! Per-peer recovery planner (C4): for a peer about to enter `ACTIVE`,
//! compute `startStreamingAt` by finding where the proposer's term history
//! and the peer's diverge. Mirrors the acceptor-side
//! `TermHistory::find_highest_common_point`, but the proposer's history
//! effectively extends to +infinity rather than ending at a flush LSN.

use utils::lsn::Lsn;

use crate::protocol::{Term, TermHistory};

/// Result of comparing `prop_history` against a peer's reported history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivergencePoint {
    /// Index of the last entry both histories agree on, or `None` if there
    /// is no common prefix at all.
    pub last_common_idx: Option<usize>,
    pub start_streaming_at: Lsn,
}

/// Determine `startStreamingAt` for a peer (§4.4). `peer_history` is the
/// safekeeper's reported term history, `peer_flush_lsn` its physical end of
/// WAL, `prop_term` the proposer's elected term, `truncate_lsn` the current
/// process-wide truncation horizon.
pub fn determine_start_streaming_at(
    prop_history: &TermHistory,
    prop_term: Term,
    peer_history: &TermHistory,
    peer_flush_lsn: Lsn,
    truncate_lsn: Lsn,
) -> DivergencePoint {
    assert!(!prop_history.0.is_empty(), "propTermHistory must have at least one entry");

    let mut last_common_idx: Option<i64> = None;
    let common_len = prop_history.0.len().min(peer_history.0.len());
    for i in 0..common_len {
        if prop_history.0[i].term != peer_history.0[i].term {
            break;
        }
        assert_eq!(
            prop_history.0[i].lsn, peer_history.0[i].lsn,
            "term {} begins at different LSNs in proposer and peer histories",
            prop_history.0[i].term
        );
        last_common_idx = Some(i as i64);
    }

    let i = match last_common_idx {
        None => {
            // No common point at all: peer is empty, or diverges from
            // entry 0. Start from the very beginning of proposer history,
            // unless that predates the truncation horizon -- a freshly
            // introduced, empty safekeeper is the common case here.
            let mut start = prop_history.0[0].lsn;
            if start < truncate_lsn {
                start = truncate_lsn;
            }
            return DivergencePoint {
                last_common_idx: None,
                start_streaming_at: start,
            };
        }
        Some(i) => i as usize,
    };

    let start_streaming_at = if prop_history.0[i].term == prop_term {
        // Peer is on our current term already; it knows better than us
        // where its own WAL ends.
        peer_flush_lsn
    } else {
        let prop_end = prop_history.0[i + 1].lsn;
        let peer_end = if i + 1 < peer_history.0.len() {
            peer_history.0[i + 1].lsn
        } else {
            peer_flush_lsn
        };
        prop_end.min(peer_end)
    };

    DivergencePoint {
        last_common_idx: Some(i),
        start_streaming_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TermLsn;

    fn history(pairs: &[(u64, u64)]) -> TermHistory {
        TermHistory(pairs.iter().map(|&(t, l)| TermLsn::from((t, Lsn(l)))).collect())
    }

    #[test]
    fn row1_same_history_uses_flush_lsn_on_current_term() {
        let prop = history(&[(1, 100), (5, 500)]);
        let peer = history(&[(1, 100), (5, 500)]);
        let d = determine_start_streaming_at(&prop, 5, &peer, Lsn(800), Lsn(100));
        assert_eq!(d.start_streaming_at, Lsn(800));
    }

    #[test]
    fn row2_diverges_at_second_entry_takes_min_of_term_ends() {
        let prop = history(&[(1, 100), (5, 500)]);
        let peer = history(&[(1, 100), (3, 400)]);
        let d = determine_start_streaming_at(&prop, 5, &peer, Lsn(450), Lsn(100));
        assert_eq!(d.start_streaming_at, Lsn(400));
    }

    #[test]
    fn row3_empty_peer_clamped_to_truncate_lsn() {
        let prop = history(&[(1, 100), (5, 500)]);
        let peer = TermHistory::empty();
        let d = determine_start_streaming_at(&prop, 5, &peer, Lsn::INVALID, Lsn(200));
        assert_eq!(d.last_common_idx, None);
        assert_eq!(d.start_streaming_at, Lsn(200));
    }

    #[test]
    fn row4_peer_ahead_on_same_single_term_uses_flush_lsn() {
        let prop = history(&[(1, 100)]);
        let peer = history(&[(1, 100), (2, 300)]);
        let d = determine_start_streaming_at(&prop, 1, &peer, Lsn(350), Lsn(100));
        assert_eq!(d.start_streaming_at, Lsn(100));
    }

    #[test]
    fn invariant_start_streaming_between_truncate_and_available() {
        let prop = history(&[(1, 100), (5, 500)]);
        let peer = history(&[(1, 100)]);
        let d = determine_start_streaming_at(&prop, 5, &peer, Lsn(550), Lsn(100));
        assert!(d.start_streaming_at >= Lsn(100));
    }
}
