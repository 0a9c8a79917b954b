//! The routing tables: path, reverse, link, announce, tunnels, held-announces,
//! path-states, announce-rate, discovery path-requests and the discovery tag
//! ring. All mutation goes through `&mut Tables`, which callers reach only
//! while holding the core's single jobs lock (`core_transport::Transport`).

use std::collections::{HashMap, VecDeque};

use crate::hash::AddressHash;
use crate::packet::Packet;
use crate::transport::config::TransportConfig;
use crate::transport::destination_ext::link::LinkId;
use crate::transport::iface::InterfaceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unknown,
    Responsive,
    Unresponsive,
}

#[derive(Debug, Clone)]
pub struct PathEntry {
    pub timestamp: f64,
    pub next_hop: AddressHash,
    pub hops: u8,
    pub expires: f64,
    pub random_blobs: VecDeque<[u8; 10]>,
    pub receiving_interface: InterfaceHandle,
    pub announce_packet_hash: Option<[u8; 32]>,
}

impl PathEntry {
    /// Monotone emission timebase across all stored random blobs, used by the
    /// announce admission algorithm (§4.5) as `T`.
    pub fn timebase(&self) -> u64 {
        self.random_blobs.iter().map(|blob| emission_timebase(blob)).max().unwrap_or(0)
    }

    pub fn remember_blob(&mut self, blob: [u8; 10], max_random_blobs: usize) -> bool {
        if self.random_blobs.contains(&blob) {
            return false;
        }
        self.random_blobs.push_back(blob);
        while self.random_blobs.len() > max_random_blobs {
            self.random_blobs.pop_front();
        }
        true
    }
}

/// Extracts the 40-bit emission timebase carried at offset `[5..10)` of an
/// announce random blob.
pub fn emission_timebase(blob: &[u8; 10]) -> u64 {
    let mut buf = [0u8; 8];
    buf[3..8].copy_from_slice(&blob[5..10]);
    u64::from_be_bytes(buf)
}

#[derive(Debug, Clone, Copy)]
pub struct ReverseEntry {
    pub received_if: InterfaceHandle,
    pub outbound_if: InterfaceHandle,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub timestamp: f64,
    pub next_hop_transport_id: Option<AddressHash>,
    pub next_hop_if: InterfaceHandle,
    pub remaining_hops: u8,
    pub received_if: InterfaceHandle,
    pub taken_hops: u8,
    pub destination_hash: AddressHash,
    pub validated: bool,
    pub proof_timeout: f64,
}

#[derive(Debug, Clone)]
pub struct AnnounceEntry {
    pub timestamp: f64,
    pub retransmit_at: f64,
    pub retries: u8,
    pub received_from: Option<InterfaceHandle>,
    pub hops: u8,
    pub packet: Packet,
    pub local_rebroadcasts: u8,
    pub block_rebroadcasts: bool,
    pub attached_interface: Option<InterfaceHandle>,
}

#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub interface: Option<InterfaceHandle>,
    pub paths: HashMap<AddressHash, PathEntry>,
    pub expires: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceRateEntry {
    pub last: f64,
    pub rate_violations: u32,
    pub blocked_until: f64,
    pub timestamps: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryPathRequest {
    pub requestor_transport_id: Option<AddressHash>,
    pub attached_interface: InterfaceHandle,
    pub timeout: f64,
}

#[derive(Default)]
pub struct Tables {
    pub path: HashMap<AddressHash, PathEntry>,
    pub reverse: HashMap<AddressHash, ReverseEntry>,
    pub link: HashMap<LinkId, LinkEntry>,
    pub announce_table: HashMap<AddressHash, AnnounceEntry>,
    pub held_announces: HashMap<AddressHash, AnnounceEntry>,
    pub tunnels: HashMap<AddressHash, TunnelEntry>,
    pub path_states: HashMap<AddressHash, PathState>,
    pub announce_rate: HashMap<AddressHash, AnnounceRateEntry>,
    pub discovery_path_requests: HashMap<AddressHash, DiscoveryPathRequest>,
    pub discovery_pr_tags: VecDeque<AddressHash>,
    pub local_path_requests: HashMap<AddressHash, (f64, InterfaceHandle)>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a path entry and installs `Unknown` path state if
    /// none is present yet (§3 invariant: every `path_states` key is in `path_table`).
    pub fn insert_path(&mut self, destination: AddressHash, entry: PathEntry) {
        self.path.insert(destination, entry);
        self.path_states.entry(destination).or_insert(PathState::Unknown);
    }

    pub fn remove_path(&mut self, destination: &AddressHash) {
        self.path.remove(destination);
        self.path_states.remove(destination);
    }

    /// Pushes a tag onto the discovery ring, trimming to `max_pr_tags` (§4.8).
    pub fn push_discovery_tag(&mut self, tag: AddressHash, max_pr_tags: usize) -> bool {
        if self.discovery_pr_tags.contains(&tag) {
            return false;
        }
        self.discovery_pr_tags.push_back(tag);
        while self.discovery_pr_tags.len() > max_pr_tags {
            self.discovery_pr_tags.pop_front();
        }
        true
    }

    /// Culls stale reverse entries (timeout or missing interface, §4.8).
    pub fn cull_reverse(&mut self, now: f64, config: &TransportConfig, live: impl Fn(&InterfaceHandle) -> bool) {
        self.reverse.retain(|_, entry| {
            now - entry.timestamp <= config.reverse_timeout as f64
                && live(&entry.received_if)
                && live(&entry.outbound_if)
        });
    }

    /// Culls stale link entries per §4.8's validated/unvalidated split.
    pub fn cull_links(&mut self, now: f64, stale_time: f64, live: impl Fn(&InterfaceHandle) -> bool) {
        self.link.retain(|_, entry| {
            if !live(&entry.received_if) || !live(&entry.next_hop_if) {
                return false;
            }
            if entry.validated {
                now - entry.timestamp <= stale_time * 1.25
            } else {
                now <= entry.proof_timeout
            }
        });
    }

    /// Culls expired paths and their orphaned path-states (§3 invariant).
    pub fn cull_paths(&mut self, now: f64) {
        self.path.retain(|_, entry| now < entry.expires);
        let live: std::collections::HashSet<_> = self.path.keys().copied().collect();
        self.path_states.retain(|dest, _| live.contains(dest));
    }

    pub fn cull_discovery_requests(&mut self, now: f64) {
        self.discovery_path_requests.retain(|_, req| now < req.timeout);
    }

    pub fn cull_local_path_requests(&mut self, live: impl Fn(&InterfaceHandle) -> bool) {
        self.local_path_requests.retain(|_, (_, iface)| live(iface));
    }

    pub fn cull_tunnels(&mut self, now: f64, tunnel_expiry: f64) {
        self.tunnels.retain(|_, tunnel| now < tunnel.expires || !tunnel.paths.is_empty());
        for tunnel in self.tunnels.values_mut() {
            tunnel.paths.retain(|_, entry| now < entry.expires);
            let _ = tunnel_expiry;
        }
    }

    /// Detaches a vanished interface from any tunnel bound to it without
    /// destroying its stored paths (§4.7).
    pub fn unbind_tunnel_interface(&mut self, iface: &InterfaceHandle) {
        for tunnel in self.tunnels.values_mut() {
            if tunnel.interface.as_ref() == Some(iface) {
                tunnel.interface = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand_core::OsRng;

    use super::{emission_timebase, PathEntry, Tables};
    use crate::hash::AddressHash;

    fn sample_path(expires: f64) -> PathEntry {
        PathEntry {
            timestamp: 0.0,
            next_hop: AddressHash::new_from_rand(OsRng),
            hops: 1,
            expires,
            random_blobs: VecDeque::new(),
            receiving_interface: AddressHash::new_from_rand(OsRng),
            announce_packet_hash: None,
        }
    }

    #[test]
    fn inserting_path_creates_unknown_state() {
        let mut tables = Tables::new();
        let dest = AddressHash::new_from_rand(OsRng);
        tables.insert_path(dest, sample_path(1000.0));
        assert!(tables.path_states.contains_key(&dest));
    }

    #[test]
    fn culling_paths_removes_orphaned_state() {
        let mut tables = Tables::new();
        let dest = AddressHash::new_from_rand(OsRng);
        tables.insert_path(dest, sample_path(10.0));
        tables.cull_paths(20.0);
        assert!(!tables.path.contains_key(&dest));
        assert!(!tables.path_states.contains_key(&dest));
    }

    #[test]
    fn emission_timebase_reads_offset_5_to_10() {
        let mut blob = [0u8; 10];
        blob[5..10].copy_from_slice(&[0, 0, 0, 0, 42]);
        assert_eq!(emission_timebase(&blob), 42);
    }

    #[test]
    fn discovery_tag_ring_trims_to_capacity() {
        let mut tables = Tables::new();
        for _ in 0..5 {
            tables.push_discovery_tag(AddressHash::new_from_rand(OsRng), 3);
        }
        assert_eq!(tables.discovery_pr_tags.len(), 3);
    }
}
