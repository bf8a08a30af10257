//! Controller Configuration

use crate::crd::DRIVER_NAME;
use crate::placement::PlacementPolicy;
use std::time::Duration;

// =============================================================================
// Garbage Collection
// =============================================================================

/// Configuration for the delayed attachment cleanup
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Delay between a primary deletion and the cleanup of its volume's attachments
    pub grace_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_interval: Duration::from_secs(5 * 60),
        }
    }
}

// =============================================================================
// Replica Management
// =============================================================================

/// Configuration for replica maintenance
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Upper bound on replicas created by one pass
    pub max_replica_update_count: usize,
    /// How often a replacement task checks whether the old replica is gone
    pub deletion_poll_interval: Duration,
    /// Attempts a replacement task makes before giving up
    pub max_replica_retries: u32,
    /// First delay between replacement attempts
    pub retry_initial_interval: Duration,
    /// Largest delay between replacement attempts
    pub retry_max_interval: Duration,
    /// Ordering of candidate nodes
    pub placement_policy: PlacementPolicy,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_replica_update_count: 1,
            deletion_poll_interval: Duration::from_secs(10),
            max_replica_retries: 5,
            retry_initial_interval: Duration::from_secs(1),
            retry_max_interval: Duration::from_secs(30),
            placement_policy: PlacementPolicy::default(),
        }
    }
}

// =============================================================================
// Operator
// =============================================================================

/// Configuration for the whole operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace holding Volume and Attachment objects
    pub namespace: String,
    /// CSI driver whose persistent volumes are managed
    pub driver_name: String,
    /// Concurrent reconciles per kind
    pub concurrency: usize,
    /// Run the recovery pass before starting the controllers
    pub recover_on_start: bool,
    /// Garbage collection settings
    pub gc: GcConfig,
    /// Replica settings
    pub replica: ReplicaConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "storage-system".to_string(),
            driver_name: DRIVER_NAME.to_string(),
            concurrency: 10,
            recover_on_start: true,
            gc: GcConfig::default(),
            replica: ReplicaConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.gc.grace_interval, Duration::from_secs(300));
        assert_eq!(config.replica.max_replica_update_count, 1);
        assert_eq!(config.replica.deletion_poll_interval, Duration::from_secs(10));
        assert_eq!(config.replica.max_replica_retries, 5);
    }
}
