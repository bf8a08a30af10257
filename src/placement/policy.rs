//! Placement Policies
//!
//! Defines how candidate nodes for new replicas are ordered.

use serde::{Deserialize, Serialize};

// =============================================================================
// Placement Policy
// =============================================================================

/// Ordering applied to candidate nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementPolicy {
    /// Node name order
    Lexical,
    /// Round-robin across availability zones
    #[default]
    SpreadZones,
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementPolicy::Lexical => write!(f, "lexical"),
            PlacementPolicy::SpreadZones => write!(f, "spread-zones"),
        }
    }
}

impl std::str::FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lexical" => Ok(PlacementPolicy::Lexical),
            "spread-zones" | "spreadzones" | "zones" => Ok(PlacementPolicy::SpreadZones),
            other => Err(format!("unknown placement policy: {}", other)),
        }
    }
}
