//! Proposer-wide gauges, registered lazily the way `safekeeper::metrics`
//! registers its global counters.

use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, register_int_gauge_vec, IntGauge, IntGaugeVec};

pub static CURRENT_TERM: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "walproposer_current_term",
        "Term this proposer was elected with, 0 before election"
    )
    .expect("failed to register walproposer_current_term gauge")
});

pub static COMMIT_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "walproposer_commit_lsn",
        "Last commit LSN reported to the embedder"
    )
    .expect("failed to register walproposer_commit_lsn gauge")
});

pub static TRUNCATE_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "walproposer_truncate_lsn",
        "Truncation horizon below which WAL may be reclaimed"
    )
    .expect("failed to register walproposer_truncate_lsn gauge")
});

pub static PEER_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "walproposer_peer_connected",
        "1 if the peer's FSM is in ACTIVE, 0 otherwise",
        &["safekeeper"]
    )
    .expect("failed to register walproposer_peer_connected gauge vec")
});

/// Refresh the proposer-wide gauges from current state. Call after any
/// scheduler/election/streaming step that might have moved them.
pub fn update_from_state(st: &crate::state::ProposerState) {
    CURRENT_TERM.set(st.prop_term as i64);
    if st.last_sent_commit_lsn.is_valid() {
        COMMIT_LSN.set(u64::from(st.last_sent_commit_lsn) as i64);
    }
    if st.truncate_lsn.is_valid() {
        TRUNCATE_LSN.set(u64::from(st.truncate_lsn) as i64);
    }
    for p in &st.peers {
        let active = matches!(p.state, crate::state::PeerState::Active);
        PEER_CONNECTED
            .with_label_values(&[&format!("{}:{}", p.host, p.port)])
            .set(active as i64);
    }
}
