use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Backend capability bit-set. Callers branch on advertised bits instead of
/// probing the backend at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    /// Ack removes the delivery record in one backend operation
    pub const ATOMIC_ACK: Capabilities = Capabilities(1 << 0);
    /// Multiple named consumers share delivery bookkeeping
    pub const CONSUMER_GROUPS: Capabilities = Capabilities(1 << 1);
    /// Historical entries can be re-read after delivery
    pub const REPLAY: Capabilities = Capabilities(1 << 2);
    /// Duplicate suppression on enqueue by caller-supplied key
    pub const IDEMPOTENT_ENQUEUE: Capabilities = Capabilities(1 << 3);
    /// Multi-key mutations execute atomically
    pub const TRANSACTIONS: Capabilities = Capabilities(1 << 4);
    /// Entries survive process restart
    pub const PERSISTENCE: Capabilities = Capabilities(1 << 5);
    /// Safe to run against a sharded deployment
    pub const CLUSTERING: Capabilities = Capabilities(1 << 6);
    /// Per-entry expiry
    pub const TTL: Capabilities = Capabilities(1 << 7);
    /// Priority classes dequeue ahead of lower ones
    pub const PRIORITIZATION: Capabilities = Capabilities(1 << 8);
    /// Batched enqueue/dequeue operations
    pub const BATCH: Capabilities = Capabilities(1 << 9);

    const ALL_NAMED: [(Capabilities, &'static str); 10] = [
        (Self::ATOMIC_ACK, "atomic_ack"),
        (Self::CONSUMER_GROUPS, "consumer_groups"),
        (Self::REPLAY, "replay"),
        (Self::IDEMPOTENT_ENQUEUE, "idempotent_enqueue"),
        (Self::TRANSACTIONS, "transactions"),
        (Self::PERSISTENCE, "persistence"),
        (Self::CLUSTERING, "clustering"),
        (Self::TTL, "ttl"),
        (Self::PRIORITIZATION, "prioritization"),
        (Self::BATCH, "batch"),
    ];

    /// Check whether every bit in `other` is advertised
    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Names of the advertised capabilities
    pub fn names(self) -> Vec<&'static str> {
        Self::ALL_NAMED
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Look up a capability bit by name
    pub fn by_name(name: &str) -> Option<Capabilities> {
        Self::ALL_NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(cap, _)| *cap)
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl BitAnd for Capabilities {
    type Output = Capabilities;

    fn bitand(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 & rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_all_bits() {
        let caps = Capabilities::ATOMIC_ACK | Capabilities::CONSUMER_GROUPS;
        assert!(caps.contains(Capabilities::ATOMIC_ACK));
        assert!(caps.contains(Capabilities::ATOMIC_ACK | Capabilities::CONSUMER_GROUPS));
        assert!(!caps.contains(Capabilities::REPLAY));
        assert!(!caps.contains(Capabilities::ATOMIC_ACK | Capabilities::REPLAY));
    }

    #[test]
    fn names_round_trip() {
        let caps = Capabilities::PERSISTENCE | Capabilities::TTL;
        let names = caps.names();
        assert_eq!(names, vec!["persistence", "ttl"]);
        for name in names {
            assert!(caps.contains(Capabilities::by_name(name).unwrap()));
        }
    }

    #[test]
    fn none_contains_nothing_but_none() {
        assert!(Capabilities::NONE.contains(Capabilities::NONE));
        assert!(!Capabilities::NONE.contains(Capabilities::BATCH));
    }
}
