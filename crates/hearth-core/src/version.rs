//! Per-domain state version counters.
//!
//! Counters only move forward while a connection is alive. A regression, or a
//! jump larger than the configured tolerance, means deltas were missed and the
//! holder must fetch a fresh snapshot instead of applying the update.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Monotonic counters keyed by state domain.
///
/// Only the domains actually carried on the wire are present; a domain missing
/// from an update is left alone rather than read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(BTreeMap<String, u64>);

impl StateVersion {
    pub const PRESENCE: &'static str = "presence";
    pub const HEALTH: &'static str = "health";

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, domain: &str, value: u64) -> Self {
        self.set(domain, value);
        self
    }

    pub fn get(&self, domain: &str) -> Option<u64> {
        self.0.get(domain).copied()
    }

    pub fn set(&mut self, domain: &str, value: u64) {
        self.0.insert(domain.to_string(), value);
    }

    pub fn presence(&self) -> Option<u64> {
        self.get(Self::PRESENCE)
    }

    pub fn health(&self) -> Option<u64> {
        self.get(Self::HEALTH)
    }

    /// All `(domain, counter)` pairs present.
    pub fn domains(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Why an incoming version was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionAnomaly {
    #[error("{domain} version went backwards: held {held}, received {received}")]
    Regression {
        domain: String,
        held: u64,
        received: u64,
    },
    #[error("{domain} version jumped from {held} to {received}")]
    Gap {
        domain: String,
        held: u64,
        received: u64,
    },
}

impl VersionAnomaly {
    pub fn domain(&self) -> &str {
        match self {
            Self::Regression { domain, .. } | Self::Gap { domain, .. } => domain,
        }
    }
}

/// Holds the current [`StateVersion`] and enforces monotonicity.
#[derive(Debug, Clone)]
pub struct VersionTracker {
    current: StateVersion,
    gap_tolerance: u64,
}

impl VersionTracker {
    /// `gap_tolerance` is the largest forward step accepted per update.
    pub fn new(gap_tolerance: u64) -> Self {
        Self {
            current: StateVersion::default(),
            gap_tolerance: gap_tolerance.max(1),
        }
    }

    pub fn current(&self) -> &StateVersion {
        &self.current
    }

    /// Adopt a snapshot's versions unconditionally.
    pub fn reset(&mut self, version: StateVersion) {
        self.current = version;
    }

    /// Apply an update. Either every domain is committed or none is.
    ///
    /// Only domains present in `incoming` are checked and committed; domains
    /// not held yet are accepted as-is.
    pub fn apply(&mut self, incoming: &StateVersion) -> Result<(), VersionAnomaly> {
        for (domain, received) in incoming.domains() {
            let Some(held) = self.current.get(domain) else {
                continue;
            };
            if received < held {
                return Err(VersionAnomaly::Regression {
                    domain: domain.to_string(),
                    held,
                    received,
                });
            }
            if received - held > self.gap_tolerance {
                return Err(VersionAnomaly::Gap {
                    domain: domain.to_string(),
                    held,
                    received,
                });
            }
        }
        for (domain, received) in incoming.domains() {
            self.current.set(domain, received);
        }
        Ok(())
    }
}
