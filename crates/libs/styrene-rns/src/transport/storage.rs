//! Host-triggered persistence (§4.9, §6 "Persistence paths"): msgpack
//! snapshots of the hashlist, path table and tunnels, plus the on-disk
//! announce packet cache referenced by hash from serialized path entries.
//!
//! Every write uses the atomic temp-path-then-rename idiom already
//! established by `ratchet_store.rs::persist_record`; no ad hoc binary
//! format is introduced (§4.9).

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::hash::{AddressHash, Hash};
use crate::packet::Packet;
use crate::transport::config::TransportConfig;
use crate::transport::tables::PathEntry;
use crate::transport::tables::TunnelEntry;
use crate::RnsError;

/// `[dst, ts, next_hop, hops, expires, random_blobs, iface_hash, announce_pkt_hash]`
/// (§6 "destination_table"), stored as an msgpack array rather than a map so
/// the field order in the spec is load-bearing on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedPath {
    dst: ByteBuf,
    timestamp: f64,
    next_hop: ByteBuf,
    hops: u8,
    expires: f64,
    random_blobs: Vec<ByteBuf>,
    iface_hash: ByteBuf,
    announce_packet_hash: Option<ByteBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTunnel {
    tunnel_id: ByteBuf,
    iface_hash: ByteBuf,
    paths: Vec<PersistedPath>,
    expires: f64,
}

fn io_err<E>(_: E) -> RnsError {
    RnsError::ConnectionError
}

fn encode_err<E>(_: E) -> RnsError {
    RnsError::PacketError
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RnsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(io_err)
}

fn to_persisted_path(dst: &AddressHash, entry: &PathEntry, config: &TransportConfig) -> PersistedPath {
    let blobs: Vec<ByteBuf> = entry
        .random_blobs
        .iter()
        .rev()
        .take(config.persist_random_blobs)
        .map(|blob| ByteBuf::from(blob.to_vec()))
        .collect();

    PersistedPath {
        dst: ByteBuf::from(dst.as_slice().to_vec()),
        timestamp: entry.timestamp,
        next_hop: ByteBuf::from(entry.next_hop.as_slice().to_vec()),
        hops: entry.hops,
        expires: entry.expires,
        random_blobs: blobs,
        iface_hash: ByteBuf::from(entry.receiving_interface.as_slice().to_vec()),
        announce_packet_hash: entry.announce_packet_hash.map(|h| ByteBuf::from(h.to_vec())),
    }
}

fn address_hash_from(buf: &ByteBuf) -> Option<AddressHash> {
    let slice = buf.as_ref();
    if slice.len() != 16 {
        return None;
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(slice);
    Some(AddressHash::new(raw))
}

fn blob_from(buf: &ByteBuf) -> Option<[u8; 10]> {
    let slice = buf.as_ref();
    if slice.len() != 10 {
        return None;
    }
    let mut raw = [0u8; 10];
    raw.copy_from_slice(slice);
    Some(raw)
}

/// Rebuilds a live [`PathEntry`] from its persisted form. Returns `None`
/// (and logs a warning) when the interface hash no longer resolves to a live
/// interface, per §4.9 "skipped with a warning".
fn from_persisted_path(
    persisted: &PersistedPath,
    live_interface: &impl Fn(&AddressHash) -> bool,
) -> Option<(AddressHash, PathEntry)> {
    let dst = address_hash_from(&persisted.dst)?;
    let next_hop = address_hash_from(&persisted.next_hop)?;
    let iface = address_hash_from(&persisted.iface_hash)?;

    if !live_interface(&iface) {
        warn!("skipping path entry for {dst}: interface {iface} is unknown");
        return None;
    }

    let random_blobs: VecDeque<[u8; 10]> = persisted.random_blobs.iter().filter_map(blob_from).collect();

    let announce_packet_hash = match &persisted.announce_packet_hash {
        Some(buf) if buf.as_ref().len() == 32 => {
            let mut raw = [0u8; 32];
            raw.copy_from_slice(buf.as_ref());
            Some(raw)
        }
        Some(_) => None,
        None => None,
    };

    Some((
        dst,
        PathEntry {
            timestamp: persisted.timestamp,
            next_hop,
            hops: persisted.hops,
            expires: persisted.expires,
            random_blobs,
            receiving_interface: iface,
            announce_packet_hash,
        },
    ))
}

/// Serializes the current-generation hashlist only (§4.9: "if transport
/// enabled"), matching `<storage>/packet_hashlist`.
pub fn save_hashlist(path: &Path, hashes: impl Iterator<Item = [u8; 32]>) -> Result<(), RnsError> {
    let entries: Vec<ByteBuf> = hashes.map(|h| ByteBuf::from(h.to_vec())).collect();
    let encoded = rmp_serde::to_vec(&entries).map_err(encode_err)?;
    write_atomic(path, &encoded)
}

pub fn load_hashlist(path: &Path) -> Result<Vec<[u8; 32]>, RnsError> {
    let data = fs::read(path).map_err(io_err)?;
    let entries: Vec<ByteBuf> = rmp_serde::from_slice(&data).map_err(encode_err)?;
    Ok(entries
        .into_iter()
        .filter_map(|buf| {
            let slice = buf.as_ref();
            if slice.len() != 32 {
                return None;
            }
            let mut raw = [0u8; 32];
            raw.copy_from_slice(slice);
            Some(raw)
        })
        .collect())
}

/// Serializes the path table, matching `<storage>/destination_table`.
pub fn save_path_table(
    path: &Path,
    paths: &HashMap<AddressHash, PathEntry>,
    config: &TransportConfig,
) -> Result<(), RnsError> {
    let entries: Vec<PersistedPath> =
        paths.iter().map(|(dst, entry)| to_persisted_path(dst, entry, config)).collect();
    let encoded = rmp_serde::to_vec(&entries).map_err(encode_err)?;
    write_atomic(path, &encoded)
}

/// Loads the path table, skipping (and logging) any entry whose interface is
/// unknown (§4.9).
pub fn load_path_table(
    path: &Path,
    live_interface: impl Fn(&AddressHash) -> bool,
) -> Result<HashMap<AddressHash, PathEntry>, RnsError> {
    let data = fs::read(path).map_err(io_err)?;
    let entries: Vec<PersistedPath> = rmp_serde::from_slice(&data).map_err(encode_err)?;
    Ok(entries.iter().filter_map(|p| from_persisted_path(p, &live_interface)).collect())
}

/// Serializes tunnels, matching `<storage>/tunnels`. A tunnel with no bound
/// interface persists the all-zero iface hash placeholder.
pub fn save_tunnels(
    path: &Path,
    tunnels: &HashMap<AddressHash, TunnelEntry>,
    config: &TransportConfig,
) -> Result<(), RnsError> {
    let entries: Vec<PersistedTunnel> = tunnels
        .iter()
        .map(|(id, tunnel)| PersistedTunnel {
            tunnel_id: ByteBuf::from(id.as_slice().to_vec()),
            iface_hash: ByteBuf::from(
                tunnel.interface.unwrap_or_else(AddressHash::new_empty).as_slice().to_vec(),
            ),
            paths: tunnel
                .paths
                .iter()
                .map(|(dst, entry)| to_persisted_path(dst, entry, config))
                .collect(),
            expires: tunnel.expires,
        })
        .collect();
    let encoded = rmp_serde::to_vec(&entries).map_err(encode_err)?;
    write_atomic(path, &encoded)
}

pub fn load_tunnels(
    path: &Path,
    live_interface: impl Fn(&AddressHash) -> bool,
) -> Result<HashMap<AddressHash, TunnelEntry>, RnsError> {
    let data = fs::read(path).map_err(io_err)?;
    let entries: Vec<PersistedTunnel> = rmp_serde::from_slice(&data).map_err(encode_err)?;

    let mut tunnels = HashMap::new();
    for persisted in entries {
        let Some(id) = address_hash_from(&persisted.tunnel_id) else { continue };
        let iface = address_hash_from(&persisted.iface_hash).filter(|h| live_interface(h));
        let paths = persisted
            .paths
            .iter()
            .filter_map(|p| from_persisted_path(p, &live_interface))
            .collect();
        tunnels.insert(id, TunnelEntry { interface: iface, paths, expires: persisted.expires });
    }
    Ok(tunnels)
}

/// `<cache>/announces/<hex>` — msgpack pair `[raw_packet_bytes, iface_str]`.
pub fn cache_announce_path(cache_dir: &Path, hash: &Hash) -> PathBuf {
    cache_dir.join("announces").join(format!("{hash}"))
}

pub fn store_cached_announce(cache_dir: &Path, packet: &Packet, iface_name: &str) -> Result<(), RnsError> {
    let hash = packet.hash();
    let path = cache_announce_path(cache_dir, &hash);
    let raw = packet.to_bytes()?;
    let pair: (Vec<u8>, String) = (raw, iface_name.to_string());
    let encoded = rmp_serde::to_vec(&pair).map_err(encode_err)?;
    write_atomic(&path, &encoded)
}

/// Loads a cached announce packet and bumps its stored hop count by one,
/// since re-reading a cached packet is semantically equivalent to receiving
/// it again (§4.9).
pub fn load_cached_announce(cache_dir: &Path, hash: &Hash) -> Result<Option<(Packet, String)>, RnsError> {
    let path = cache_announce_path(cache_dir, hash);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(_) => return Ok(None),
    };
    let (raw, iface): (Vec<u8>, String) = rmp_serde::from_slice(&data).map_err(encode_err)?;
    let mut packet = Packet::from_bytes(&raw)?;
    packet.header.hops = packet.header.hops.saturating_add(1);
    Ok(Some((packet, iface)))
}

/// Garbage-collects cached announce packets older than `max_age` seconds
/// (§4.8 "cache_clean_interval").
pub fn clean_announce_cache(cache_dir: &Path, max_age: f64, now_secs: u64) -> usize {
    let dir = cache_dir.join("announces");
    let Ok(entries) = fs::read_dir(&dir) else { return 0 };
    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let age = modified
            .elapsed()
            .map(|d| d.as_secs_f64())
            .unwrap_or_else(|_| now_secs as f64);
        if age > max_age && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::config::TransportConfig;
    use rand_core::OsRng;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    fn sample_entry(iface: AddressHash) -> PathEntry {
        let mut blobs = VecDeque::new();
        blobs.push_back([1u8; 10]);
        PathEntry {
            timestamp: 10.0,
            next_hop: AddressHash::new_from_rand(OsRng),
            hops: 2,
            expires: 1000.0,
            random_blobs: blobs,
            receiving_interface: iface,
            announce_packet_hash: Some([9u8; 32]),
        }
    }

    #[test]
    fn path_table_round_trips_through_disk() {
        let dir = TempDir::new().expect("tempdir");
        let config = TransportConfig::default();
        let iface = AddressHash::new_from_rand(OsRng);
        let dst = AddressHash::new_from_rand(OsRng);

        let mut paths = HashMap::new();
        paths.insert(dst, sample_entry(iface));

        let path = dir.path().join("destination_table");
        save_path_table(&path, &paths, &config).expect("save");

        let loaded = load_path_table(&path, |h| *h == iface).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&dst].hops, 2);
    }

    #[test]
    fn path_table_load_skips_unknown_interface() {
        let dir = TempDir::new().expect("tempdir");
        let config = TransportConfig::default();
        let iface = AddressHash::new_from_rand(OsRng);
        let dst = AddressHash::new_from_rand(OsRng);

        let mut paths = HashMap::new();
        paths.insert(dst, sample_entry(iface));

        let path = dir.path().join("destination_table");
        save_path_table(&path, &paths, &config).expect("save");

        let loaded = load_path_table(&path, |_| false).expect("load");
        assert!(loaded.is_empty());
    }

    #[test]
    fn announce_cache_round_trips_and_bumps_hops() {
        let dir = TempDir::new().expect("tempdir");
        let mut packet = Packet::default();
        packet.header.hops = 3;

        store_cached_announce(dir.path(), &packet, "iface0").expect("store");
        let (loaded, iface) =
            load_cached_announce(dir.path(), &packet.hash()).expect("load").expect("present");

        assert_eq!(iface, "iface0");
        assert_eq!(loaded.header.hops, 4);
    }
}
