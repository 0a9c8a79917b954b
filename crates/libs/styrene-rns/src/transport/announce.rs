//! Announce admission, rate limiting, and retransmission scheduling (§4.5).

use std::collections::VecDeque;

use log::debug;

use crate::hash::AddressHash;
use crate::packet::Packet;
use crate::transport::config::TransportConfig;
use crate::transport::iface::InterfaceMode;
use crate::transport::tables::{
    emission_timebase, AnnounceEntry, AnnounceRateEntry, PathEntry, PathState, Tables,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceAdmission {
    Admitted,
    RateBlocked,
    Rejected,
}

/// Path expiry window selected by the receiving interface's mode (§3).
pub fn path_expiry(mode: InterfaceMode, config: &TransportConfig) -> f64 {
    (match mode {
        InterfaceMode::AccessPoint => config.ap_path_time,
        InterfaceMode::Roaming => config.roaming_path_time,
        _ => config.pathfinder_e,
    }) as f64
}

/// §4.5 step 1-2: decide whether a freshly received announce should replace
/// the existing path entry, given the new packet's hop count `new_hops` and
/// emission timebase `emission`.
pub fn admission_decision(
    existing: Option<&PathEntry>,
    existing_state: PathState,
    new_hops: u8,
    emission: u64,
    blob_is_new: bool,
    now: f64,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };

    let timebase = existing.timebase();
    let expired = now >= existing.expires;

    if new_hops < existing.hops {
        return blob_is_new && emission > timebase;
    }
    if new_hops == existing.hops {
        return blob_is_new && emission > timebase;
    }

    // new_hops > existing.hops
    (expired && blob_is_new)
        || (emission > timebase && blob_is_new)
        || (emission == timebase && existing_state == PathState::Unresponsive)
}

/// §4.5 step 3: per-destination announce rate limiting. Returns `true` if the
/// announce is currently rate-blocked (still admitted to the path table, but
/// not queued for rebroadcast).
pub fn apply_rate_limit(
    rate: &mut AnnounceRateEntry,
    now: f64,
    target: f64,
    grace: u32,
    penalty: f64,
    max_timestamps: usize,
) -> bool {
    if now <= rate.blocked_until {
        return true;
    }

    let current_rate = now - rate.last;
    if current_rate < target {
        rate.rate_violations = rate.rate_violations.saturating_add(1);
    } else {
        rate.rate_violations = rate.rate_violations.saturating_sub(1);
    }

    if rate.rate_violations > grace {
        rate.blocked_until = rate.last + target + penalty;
    }

    rate.last = now;
    rate.timestamps.push_back(now);
    while rate.timestamps.len() > max_timestamps {
        rate.timestamps.pop_front();
    }

    now <= rate.blocked_until
}

/// §4.5 step 5: schedules a retransmit for a freshly admitted announce.
pub fn schedule_retransmit(
    now: f64,
    jitter: f64,
    from_local_client: bool,
    config: &TransportConfig,
) -> (f64, u8) {
    if from_local_client {
        (now, config.pathfinder_r)
    } else {
        (now + jitter, 0)
    }
}

/// §4.5 step 7: maintenance sweep over the announce table. Returns the
/// destinations whose entries should be retransmitted this tick, each paired
/// with whether the rebroadcast should carry a PATH_RESPONSE context.
pub fn due_retransmits(
    table: &mut std::collections::HashMap<AddressHash, AnnounceEntry>,
    now: f64,
    config: &TransportConfig,
) -> Vec<(AddressHash, bool)> {
    let mut due = Vec::new();
    let mut expired = Vec::new();

    for (dest, entry) in table.iter_mut() {
        if entry.retries > config.pathfinder_r {
            expired.push(*dest);
            continue;
        }
        if now > entry.retransmit_at {
            due.push((*dest, entry.block_rebroadcasts));
            entry.retransmit_at += config.pathfinder_g + config.pathfinder_rw;
            entry.retries += 1;
        }
    }

    for dest in expired {
        table.remove(&dest);
        debug!("announce retry cap reached for {dest}, dropping pending retransmit");
    }

    due
}

/// §4.5 step 6: a rebroadcast from another node observed one hop further out
/// than our own counts against the local-rebroadcast ceiling.
pub fn observe_peer_rebroadcast(entry: &mut AnnounceEntry, packet_hops: u8, max: u8) -> bool {
    if packet_hops == entry.hops + 1 {
        entry.local_rebroadcasts += 1;
        return entry.local_rebroadcasts >= max;
    }
    false
}

/// Moves a live announce-table entry into `held_announces` for the duration
/// of a path-request response (§4.5 step 8, §8 invariant 1).
pub fn hold_for_path_response(tables: &mut Tables, destination: &AddressHash) {
    if let Some(entry) = tables.announce_table.remove(destination) {
        tables.held_announces.insert(*destination, entry);
    }
}

pub fn release_held(tables: &mut Tables, destination: &AddressHash) {
    if let Some(entry) = tables.held_announces.remove(destination) {
        tables.announce_table.insert(*destination, entry);
    }
}

pub fn retransmit_packet(packet: &Packet) -> Packet {
    let mut rebroadcast = *packet;
    rebroadcast.header.hops = packet.header.hops;
    rebroadcast
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_hop_admits_only_with_newer_emission() {
        let existing = sample_path_with_blob([0u8; 10]);
        assert!(!admission_decision(Some(&existing), PathState::Responsive, 0, 0, true, 0.0));
        assert!(admission_decision(Some(&existing), PathState::Responsive, 0, 100, true, 0.0));
    }

    #[test]
    fn higher_hop_admits_when_existing_expired() {
        let mut existing = sample_path_with_blob([0u8; 10]);
        existing.expires = 0.0;
        assert!(admission_decision(Some(&existing), PathState::Responsive, 5, 0, true, 1.0));
    }

    #[test]
    fn rate_limit_blocks_after_grace_exceeded() {
        let mut rate = AnnounceRateEntry::default();
        for t in 0..5 {
            apply_rate_limit(&mut rate, t as f64, 10.0, 2, 5.0, 16);
        }
        assert!(rate.blocked_until > 0.0);
    }

    fn sample_path_with_blob(blob: [u8; 10]) -> PathEntry {
        let mut blobs = VecDeque::new();
        blobs.push_back(blob);
        PathEntry {
            timestamp: 0.0,
            next_hop: AddressHash::new_empty(),
            hops: 2,
            expires: 1_000_000.0,
            random_blobs: blobs,
            receiving_interface: AddressHash::new_empty(),
            announce_packet_hash: None,
        }
    }
}
