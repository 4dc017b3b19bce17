use std::time::Duration;

/// Every tunable constant of the DHT core, gathered in one struct so tests
/// can shrink timeouts/K without touching core logic. Loading this from a
/// TOML file on disk is the CLI harness's job, not the core's.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Replication parameter: bucket capacity and the lookup convergence size.
    pub k: usize,
    /// Lookup concurrency: RPCs issued in parallel per round.
    pub alpha: usize,
    /// Minimum in-flight-probe budget before a lookup round may advance.
    pub beta: usize,
    /// Width, in bytes, of node ids and storage keys.
    pub key_size_bytes: usize,
    pub refresh_interval: Duration,
    pub republish_interval: Duration,
    pub expire_interval: Duration,
    pub rpc_timeout: Duration,
    pub max_bootstrap_contacts: usize,
    pub min_store_success_ratio: f64,
    pub failed_rpc_tolerance: u32,
    pub rendezvous_ping_interval: Duration,
    pub rendezvous_death_threshold: u32,
    /// Number of bootstrap candidates contacted in parallel during Join.
    pub max_join_candidates: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let refresh_interval = Duration::from_secs(3600);
        let republish_interval = Duration::from_secs(43_200);
        NodeConfig {
            k: 20,
            alpha: 3,
            beta: 1,
            key_size_bytes: 64,
            expire_interval: republish_interval + refresh_interval + Duration::from_secs(300),
            refresh_interval,
            republish_interval,
            rpc_timeout: Duration::from_secs(10),
            max_bootstrap_contacts: 10_000,
            min_store_success_ratio: 0.75,
            failed_rpc_tolerance: 0,
            rendezvous_ping_interval: Duration::from_secs(8),
            rendezvous_death_threshold: 3,
            max_join_candidates: 3,
        }
    }
}

impl NodeConfig {
    /// Minimum number of successful `Store` RPCs required to call a
    /// `StoreValue` dissemination successful.
    pub fn min_store_successes(&self) -> usize {
        (self.k as f64 * self.min_store_success_ratio).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::NodeConfig;

    #[test]
    fn test_min_store_successes_rounds_up() {
        let config = NodeConfig::default();
        assert_eq!(config.min_store_successes(), 15);
    }
}
