//! Tunable constants for the transport core, broken out of algorithm code so
//! tests can shrink timeouts and table ceilings without touching the logic.

/// Maximum hop count a path/announce is still considered for (`PATHFINDER_M`).
pub const PATHFINDER_M: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    /// Maximum announce retransmit attempts (`PATHFINDER_R`).
    pub pathfinder_r: u8,
    /// Base grace delay between announce retries, seconds (`PATHFINDER_G`).
    pub pathfinder_g: f64,
    /// Random jitter window added to the first retransmit, seconds (`PATHFINDER_RW`).
    pub pathfinder_rw: f64,
    /// Max hops before a path/announce is ignored for table purposes (`PATHFINDER_M`).
    pub pathfinder_m: u8,
    /// Default path expiry for FULL/GATEWAY-mode interfaces, seconds (`PATHFINDER_E`).
    pub pathfinder_e: u64,
    /// Path expiry for ACCESS_POINT-mode interfaces, seconds.
    pub ap_path_time: u64,
    /// Path expiry for ROAMING-mode interfaces, seconds.
    pub roaming_path_time: u64,
    /// Peer rebroadcasts of the same announce before we drop our own pending retransmit.
    pub local_rebroadcasts_max: u8,
    /// Unanswered discovery path-request timeout, seconds.
    pub path_request_timeout: u64,
    /// Grace delay before answering a path request from the announce cache, seconds.
    pub path_request_grace: f64,
    /// Additional grace added on ROAMING-mode answering interfaces, seconds.
    pub path_request_rg: f64,
    /// Minimum interval between path-rediscovery attempts for the same destination, seconds.
    pub path_request_mi: u64,
    /// Reverse-table entry lifetime, seconds.
    pub reverse_timeout: u64,
    /// Absolute ceiling on any destination-related timeout, seconds.
    pub destination_timeout: u64,
    /// Maximum outstanding delivery receipts before forced eviction.
    pub max_receipts: usize,
    /// Sliding window length for per-destination announce rate tracking.
    pub max_rate_timestamps: usize,
    /// Maximum random blobs retained per path entry in memory.
    pub max_random_blobs: usize,
    /// Random blobs retained across a persistence round-trip.
    pub persist_random_blobs: usize,
    /// Packet hashlist ceiling; rotation happens at half this value.
    pub hashlist_maxsize: usize,
    /// Discovery path-request tag ring ceiling.
    pub max_pr_tags: usize,
    /// Maximum announces queued per interface awaiting their rate-cap window.
    pub max_queued_announces: usize,
    /// `jobs()` cadence, milliseconds.
    pub jobs_interval_ms: u64,
    /// Announce-table retry sweep cadence, seconds.
    pub announces_check_interval: f64,
    /// Table culling sweep cadence, seconds.
    pub tables_cull_interval: u64,
    /// Interface re-sort / held-announce flush cadence, seconds.
    pub interface_jobs_interval: u64,
    /// Announce packet cache GC cadence, seconds.
    pub cache_clean_interval: u64,
    /// Tunnel and tunnel-path expiry, seconds.
    pub tunnel_expiry: u64,
    /// Estimated per-hop link-request proof timeout contribution, seconds.
    pub est_timeout_per_hop: f64,
    /// `RNS.Link.STALE_TIME` equivalent: a validated link is culled once it
    /// has been idle longer than `link_stale_time * 1.25` (`LINK_TIMEOUT`,
    /// §4.8). The link state machine itself is out of scope (§1), so this is
    /// carried here as the transport's own view of link liveness.
    pub link_stale_time: f64,
    /// Fraction of an interface's bitrate budget reserved for announce
    /// traffic (§4.3 "Announce cap"); matches upstream RNS's `ANNOUNCE_CAP`.
    pub announce_cap: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pathfinder_r: 1,
            pathfinder_g: 5.0,
            pathfinder_rw: 0.5,
            pathfinder_m: PATHFINDER_M,
            pathfinder_e: 604_800,
            ap_path_time: 86_400,
            roaming_path_time: 21_600,
            local_rebroadcasts_max: 2,
            path_request_timeout: 15,
            path_request_grace: 0.4,
            path_request_rg: 1.5,
            path_request_mi: 20,
            reverse_timeout: 480,
            destination_timeout: 604_800,
            max_receipts: 1024,
            max_rate_timestamps: 16,
            max_random_blobs: 64,
            persist_random_blobs: 32,
            hashlist_maxsize: 1_000_000,
            max_pr_tags: 32_000,
            max_queued_announces: 64,
            jobs_interval_ms: 250,
            announces_check_interval: 1.0,
            tables_cull_interval: 5,
            interface_jobs_interval: 5,
            cache_clean_interval: 300,
            tunnel_expiry: 604_800,
            est_timeout_per_hop: 6.0,
            link_stale_time: 720.0,
            announce_cap: 0.02,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TransportConfig;

    #[test]
    fn default_matches_spec_constants() {
        let config = TransportConfig::default();
        assert_eq!(config.hashlist_maxsize, 1_000_000);
        assert_eq!(config.pathfinder_m, 128);
        assert_eq!(config.max_receipts, 1024);
    }
}
