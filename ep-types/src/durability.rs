//! Durability requirements and replication topology.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EpError, EpResult};

/// Durability level requested for a SyncWrite. Ordinal values match the
/// wire encoding (`None=0` ... `PersistToMajority=3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DurabilityLevel {
    None = 0,
    Majority = 1,
    MajorityAndPersistOnMaster = 2,
    PersistToMajority = 3,
}

impl DurabilityLevel {
    pub fn requires_active_persistence(&self) -> bool {
        matches!(
            self,
            DurabilityLevel::MajorityAndPersistOnMaster | DurabilityLevel::PersistToMajority
        )
    }

    pub fn requires_replica_persistence(&self) -> bool {
        matches!(self, DurabilityLevel::PersistToMajority)
    }
}

/// 0 = server default, 65535 = infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurabilityTimeout(pub u16);

impl DurabilityTimeout {
    pub const SERVER_DEFAULT: DurabilityTimeout = DurabilityTimeout(0);
    pub const INFINITE: DurabilityTimeout = DurabilityTimeout(65535);

    /// Resolves to an actual wait duration, substituting `default` for the
    /// server-default sentinel and `None` for infinite (never times out).
    pub fn resolve(&self, default: Duration) -> Option<Duration> {
        match self.0 {
            0 => Some(default),
            65535 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }
}

/// Carried on a mutation request that wants durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurabilityRequirements {
    pub level: DurabilityLevel,
    pub timeout: DurabilityTimeout,
}

impl DurabilityRequirements {
    pub fn majority() -> Self {
        Self {
            level: DurabilityLevel::Majority,
            timeout: DurabilityTimeout::SERVER_DEFAULT,
        }
    }
}

/// A node name within a replication chain.
pub type NodeId = String;

/// `[active, replica1?, replica2?]`, the ordered replication chain for a
/// vBucket's durability. Chain length must be in `{1, 2, 3}`; longer chains
/// are rejected at construction with `DurabilityImpossible`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    chain: Vec<NodeId>,
}

impl Topology {
    pub fn new(chain: Vec<NodeId>) -> EpResult<Self> {
        if chain.is_empty() || chain.len() > 3 {
            return Err(EpError::DurabilityImpossible);
        }
        Ok(Self { chain })
    }

    /// A topology with only the active node, used during takeover before a
    /// real chain is configured.
    pub fn active_only(active: NodeId) -> Self {
        Self { chain: vec![active] }
    }

    pub fn active(&self) -> &NodeId {
        &self.chain[0]
    }

    pub fn replicas(&self) -> &[NodeId] {
        &self.chain[1..]
    }

    pub fn chain(&self) -> &[NodeId] {
        &self.chain
    }

    pub fn size(&self) -> usize {
        self.chain.len()
    }

    /// `m = floor(c/2) + 1`, the number of acknowledgements (including the
    /// Active itself) required to commit a Prepare.
    pub fn majority(&self) -> usize {
        self.size() / 2 + 1
    }

    pub fn contains(&self, node: &str) -> bool {
        self.chain.iter().any(|n| n == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_chains_longer_than_three() {
        let chain = vec!["a".into(), "b".into(), "c".into(), "d".into()];
        assert_eq!(Topology::new(chain), Err(EpError::DurabilityImpossible));
    }

    #[test]
    fn majority_thresholds() {
        assert_eq!(Topology::new(vec!["a".into()]).unwrap().majority(), 1);
        assert_eq!(
            Topology::new(vec!["a".into(), "b".into()]).unwrap().majority(),
            2
        );
        assert_eq!(
            Topology::new(vec!["a".into(), "b".into(), "c".into()])
                .unwrap()
                .majority(),
            2
        );
    }

    #[test]
    fn timeout_resolution() {
        let default = Duration::from_secs(30);
        assert_eq!(DurabilityTimeout::SERVER_DEFAULT.resolve(default), Some(default));
        assert_eq!(DurabilityTimeout::INFINITE.resolve(default), None);
        assert_eq!(
            DurabilityTimeout(500).resolve(default),
            Some(Duration::from_millis(500))
        );
    }
}
