use serde::{Deserialize, Serialize};

/// Job priority levels for queue ordering (higher values dequeue first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority jobs (processed last, sheddable under pressure)
    Low = 1,

    /// Normal priority jobs (default)
    Normal = 2,

    /// High priority jobs (processed first, never shed)
    High = 3,

    /// Critical priority jobs (processed immediately, never shed)
    Critical = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// All priority levels, highest first (dequeue scan order)
    pub fn descending() -> &'static [Priority] {
        &[Self::Critical, Self::High, Self::Normal, Self::Low]
    }

    /// All priority levels, lowest first
    pub fn ascending() -> &'static [Priority] {
        &[Self::Low, Self::Normal, Self::High, Self::Critical]
    }

    /// Get the numeric value for ordering
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create from numeric value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Whether jobs of this priority may be shed under red-zone pressure.
    /// High and critical are throttled instead, never rejected.
    pub fn sheddable(self) -> bool {
        matches!(self, Self::Low | Self::Normal)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_numeric() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn descending_scan_order() {
        assert_eq!(Priority::descending()[0], Priority::Critical);
        assert_eq!(Priority::descending()[3], Priority::Low);
    }

    #[test]
    fn high_priority_is_never_sheddable() {
        assert!(!Priority::Critical.sheddable());
        assert!(!Priority::High.sheddable());
        assert!(Priority::Normal.sheddable());
        assert!(Priority::Low.sheddable());
    }
}
