//! Run configuration for a single proposer instance: which timeline it
//! speaks for, which safekeepers to talk to, and the handful of timeouts
//! that drive the scheduler (§4.6).

use anyhow::{bail, Context};
use std::str::FromStr;
use std::time::Duration;

use utils::id::{TenantId, TenantTimelineId, TimelineId};

pub mod defaults {
    pub const DEFAULT_RECONNECT_TIMEOUT: &str = "1s";
    pub const DEFAULT_CONNECTION_TIMEOUT: &str = "10s";
}

pub const SK_PROTOCOL_VERSION: u32 = 2;
pub const MAX_SAFEKEEPERS: usize = 32;

/// One `host:port` entry from `safekeepers_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafekeeperHostPort {
    pub host: String,
    pub port: u16,
}

impl FromStr for SafekeeperHostPort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("safekeeper address {s:?} is missing a port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("safekeeper address {s:?} has an invalid port"))?;
        bail_if_empty(host, "host")?;
        Ok(SafekeeperHostPort {
            host: host.to_string(),
            port,
        })
    }
}

fn bail_if_empty(s: &str, what: &str) -> anyhow::Result<()> {
    if s.is_empty() {
        bail!("safekeeper address is missing a {what}");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WalproposerConfig {
    pub ttid: TenantTimelineId,
    pub safekeepers: Vec<SafekeeperHostPort>,
    pub reconnect_timeout: Duration,
    pub connection_timeout: Duration,
    pub wal_segment_size: usize,
    pub sync_safekeepers: bool,
    pub system_id: u64,
    pub pg_timeline: u32,
    pub pg_version: u32,
}

impl WalproposerConfig {
    /// Parse the hex tenant/timeline ids and the comma-separated
    /// `host:port` safekeeper list the way the embedding binary's CLI/config
    /// file would hand them to us. `bail!`s with context on any malformed
    /// field; more than [`MAX_SAFEKEEPERS`] or an empty list is also fatal.
    #[allow(clippy::too_many_arguments)]
    pub fn parse(
        tenant_hex: &str,
        timeline_hex: &str,
        safekeepers_list: &str,
        reconnect_timeout_ms: u64,
        connection_timeout_ms: u64,
        wal_segment_size: usize,
        sync_safekeepers: bool,
        system_id: u64,
        pg_timeline: u32,
        pg_version: u32,
    ) -> anyhow::Result<Self> {
        let tenant_id = TenantId::from_str(tenant_hex).context("invalid tenant id")?;
        let timeline_id = TimelineId::from_str(timeline_hex).context("invalid timeline id")?;

        if safekeepers_list.trim().is_empty() {
            bail!("safekeepers_list must not be empty");
        }
        let safekeepers = safekeepers_list
            .split(',')
            .map(SafekeeperHostPort::from_str)
            .collect::<anyhow::Result<Vec<_>>>()
            .context("invalid safekeepers_list")?;
        if safekeepers.is_empty() {
            bail!("safekeepers_list must contain at least one entry");
        }
        if safekeepers.len() > MAX_SAFEKEEPERS {
            bail!(
                "too many safekeepers: {} (max {MAX_SAFEKEEPERS})",
                safekeepers.len()
            );
        }

        if wal_segment_size == 0 || wal_segment_size % postgres_ffi::XLOG_BLCKSZ != 0 {
            bail!(
                "wal_segment_size must be a positive multiple of {}",
                postgres_ffi::XLOG_BLCKSZ
            );
        }

        Ok(WalproposerConfig {
            ttid: TenantTimelineId::new(tenant_id, timeline_id),
            safekeepers,
            reconnect_timeout: Duration::from_millis(reconnect_timeout_ms),
            connection_timeout: Duration::from_millis(connection_timeout_ms),
            wal_segment_size,
            sync_safekeepers,
            system_id,
            pg_timeline,
            pg_version,
        })
    }

    pub fn n_safekeepers(&self) -> usize {
        self.safekeepers.len()
    }

    pub fn quorum(&self) -> usize {
        self.n_safekeepers() / 2 + 1
    }

    /// A config with `n_safekeepers` made-up `skN:500N` addresses, for unit
    /// and integration tests that don't care about real connection details.
    pub fn dummy(n_safekeepers: usize) -> Self {
        let safekeepers = (0..n_safekeepers)
            .map(|i| SafekeeperHostPort {
                host: format!("sk{i}"),
                port: 5000 + i as u16,
            })
            .collect();
        WalproposerConfig {
            ttid: TenantTimelineId::new(TenantId::default(), TimelineId::default()),
            safekeepers,
            reconnect_timeout: Duration::from_millis(1000),
            connection_timeout: Duration::from_millis(10_000),
            wal_segment_size: 16 * 1024 * 1024,
            sync_safekeepers: false,
            system_id: 0,
            pg_timeline: 1,
            pg_version: 150000,
        }
    }
}

/// Not used at runtime, but documents the connection string shape the
/// embedding binary uses to open each safekeeper connection (§6.1).
pub fn connection_string(sk: &SafekeeperHostPort, ttid: &TenantTimelineId) -> String {
    format!(
        "host={} port={} dbname=replication options='-c timeline_id={} tenant_id={}'",
        sk.host, sk.port, ttid.timeline_id, ttid.tenant_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let hp = SafekeeperHostPort::from_str("sk1.example.com:5454").unwrap();
        assert_eq!(hp.host, "sk1.example.com");
        assert_eq!(hp.port, 5454);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(SafekeeperHostPort::from_str("sk1.example.com").is_err());
    }

    #[test]
    fn rejects_empty_list() {
        let tenant = "cf0480929707ee75372337efaa5ecf9";
        let timeline = "cf0480929707ee75372337efaa5ecf9";
        assert!(WalproposerConfig::parse(
            tenant, timeline, "", 1000, 10_000, 16 * 1024 * 1024, false, 1, 1, 150000
        )
        .is_err());
    }

    #[test]
    fn rejects_too_many_safekeepers() {
        let tenant = "cf0480929707ee75372337efaa5ecf9";
        let timeline = "cf0480929707ee75372337efaa5ecf9";
        let list = (0..MAX_SAFEKEEPERS + 1)
            .map(|i| format!("sk{i}:5000"))
            .collect::<Vec<_>>()
            .join(",");
        assert!(WalproposerConfig::parse(
            tenant,
            timeline,
            &list,
            1000,
            10_000,
            16 * 1024 * 1024,
            false,
            1,
            1,
            150000
        )
        .is_err());
    }

    #[test]
    fn rejects_bad_segment_size() {
        let tenant = "cf0480929707ee75372337efaa5ecf9";
        let timeline = "cf0480929707ee75372337efaa5ecf9";
        assert!(WalproposerConfig::parse(
            tenant, timeline, "sk1:5000", 1000, 10_000, 123, false, 1, 1, 150000
        )
        .is_err());
    }
}
