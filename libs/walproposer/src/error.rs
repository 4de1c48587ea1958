//! Errors that can cross the peer/connection boundary. Most failures are
//! per-peer and recoverable (plain [`anyhow::Error`], handled by resetting
//! or shutting down the one connection); a small set is process-fatal,
//! meaning a concurrent proposer with a higher term has been observed, or
//! an assumption the protocol depends on does not hold. Those are carried
//! as [`FatalError`] instead, so callers can tell the two apart with a
//! `match` rather than string-sniffing an `anyhow::Error`.

use thiserror::Error;

use utils::lsn::Lsn;

use crate::protocol::Term;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("safekeeper reported term {observed} higher than ours ({ours}); another proposer has taken over")]
    HigherTermObserved { observed: Term, ours: Term },

    #[error("vote rejected by safekeeper with term {observed} before quorum was reached (ours {ours})")]
    VoteRejected { observed: Term, ours: Term },

    #[error(
        "collected epoch start lsn {collected} does not match basebackup lsn {basebackup}"
    )]
    BasebackupLsnMismatch { collected: Lsn, basebackup: Lsn },

    #[error("failed to download missing WAL from donor safekeeper")]
    RecoveryDownloadFailed,

    #[error("internal invariant violated: {0}")]
    Bug(String),
}
