//! Identifiers used throughout the proposer/acceptor protocol: the 64-bit
//! [`NodeId`] a safekeeper reports in its greeting, and the 16-byte
//! [`TenantId`]/[`TimelineId`] pair that scopes a WAL stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hex_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 16]);

        impl $name {
            pub fn from_slice(src: &[u8]) -> anyhow::Result<Self> {
                anyhow::ensure!(
                    src.len() == 16,
                    "{} must be exactly 16 bytes, got {}",
                    stringify!($name),
                    src.len()
                );
                let mut arr = [0u8; 16];
                arr.copy_from_slice(src);
                Ok($name(arr))
            }

            pub fn as_arr(&self) -> [u8; 16] {
                self.0
            }
        }

        impl From<[u8; 16]> for $name {
            fn from(b: [u8; 16]) -> Self {
                $name(b)
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                anyhow::ensure!(
                    s.len() == 32,
                    "{} hex string must be 32 chars, got {}",
                    stringify!($name),
                    s.len()
                );
                let bytes = hex::decode(s)
                    .map_err(|e| anyhow::anyhow!("invalid {} hex: {e}", stringify!($name)))?;
                $name::from_slice(&bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name([0u8; 16])
            }
        }
    };
}

hex_id!(TenantId);
hex_id!(TimelineId);

/// Scopes a timeline's WAL stream to a tenant; used as the key under which
/// the embedding application tracks one proposer instance per timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantTimelineId {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
}

impl TenantTimelineId {
    pub fn new(tenant_id: TenantId, timeline_id: TimelineId) -> Self {
        Self {
            tenant_id,
            timeline_id,
        }
    }
}

impl fmt::Display for TenantTimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.timeline_id)
    }
}
