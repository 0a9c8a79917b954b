//! The Transport engine: interface registry, IFAC framing, the packet
//! filter, inbound/outbound dispatch, announce admission wiring, path
//! requests, tunnel restoration and the maintenance loop (§4.2-§4.8).
//!
//! Everything here runs under one of two locks: `locked` (the "jobs lock",
//! §5 — path/reverse/link/announce/tunnel tables, the hashlist, the receipt
//! table, and per-interface announce-queue state) or `interfaces` (the
//! driver registry). Table-culling closures read `interfaces` while holding
//! `locked`, so the reverse order (taking `locked` while `interfaces` is
//! held) must never happen — `interfaces` is always the innermost lock.
//!
//! Destination registration, the link state machine, and the wire codec's
//! finer framing (e.g. the link-request MTU signalling suffix) are
//! out-of-scope external collaborators (§1); [`LocalEndpoints`] is the
//! narrow seam this module uses to reach an application's destination
//! registry without owning it — the same role the teacher's `path.rs` and
//! `link_table.rs` give to the `TransportHandler`'s `Link`/`Destination`
//! tables, which this crate doesn't have.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use rand_core::OsRng;

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};
use crate::identity::{Identity, PrivateIdentity};
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, Packet, PacketContext, PacketType,
    PropagationType,
};
use crate::transport::announce::{
    admission_decision, apply_rate_limit, due_retransmits, hold_for_path_response, path_expiry,
    release_held, schedule_retransmit,
};
use crate::transport::config::TransportConfig;
use crate::transport::destination_ext::link::LinkId;
use crate::transport::error::{DropReason, PacketOutcome};
use crate::transport::hashlist::Hashlist;
use crate::transport::ifac::{self, IfacConfig};
use crate::transport::iface::{Interface, InterfaceHandle, InterfaceMode};
use crate::transport::receipt::{receipt_eligible, Receipt, ReceiptTable};
use crate::transport::storage;
use crate::transport::tables::{
    emission_timebase, AnnounceEntry, DiscoveryPathRequest, LinkEntry, PathEntry, PathState,
    ReverseEntry, Tables, TunnelEntry,
};
use crate::transport::time::now_epoch_secs_f64;
use crate::transport::utils::{new_path_request_tag, new_random_blob, uniform_jitter};

/// Narrow seam into the application layer that owns destination registration
/// and the link state machine (§1 "out of scope: destination registration",
/// "link state machine internals beyond status and validation"). A host
/// implements this once and hands an `Arc<dyn LocalEndpoints>` to
/// [`Transport::new`].
pub trait LocalEndpoints: Send + Sync {
    fn is_local(&self, destination: &AddressHash) -> bool;

    fn destination_type(&self, destination: &AddressHash) -> Option<DestinationType>;

    /// Delivers a DATA packet to a local destination (§4.4 "Data to local
    /// destination").
    fn deliver_data(&self, packet: &Packet) -> DeliveryResult;

    /// Delivers a LINKREQUEST to a local destination's link factory.
    fn deliver_link_request(&self, packet: &Packet);

    /// Validates an announce's signature. Gates rate credit independent of
    /// table admission (§4.4 "Announce handling").
    fn verify_announce(&self, packet: &Packet) -> bool;

    /// Identity used to verify an LRPROOF's signature for a link destination.
    fn link_identity(&self, destination: &AddressHash) -> Option<Identity>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Delivered; no proof requested.
    NoProof,
    /// Delivered; the caller should emit a proof packet.
    Prove,
    /// Rejected by the application (e.g. PROVE_APP callback returned false).
    Drop,
}

/// A rebroadcast or fresh announce waiting for its interface's announce cap
/// to clear (§4.3 "Announce cap").
#[derive(Debug, Clone)]
struct QueuedAnnounce {
    destination: AddressHash,
    emitted: u64,
    packet: Packet,
}

/// Everything mutated under the single jobs lock (§5 "Global serialization").
struct Locked {
    tables: Tables,
    hashlist: Hashlist,
    receipts: ReceiptTable,
    announce_queues: HashMap<InterfaceHandle, VecDeque<QueuedAnnounce>>,
    announce_allowed_at: HashMap<InterfaceHandle, f64>,
}

/// A packet produced while the jobs lock was held, queued for delivery after
/// release (§5: "outgoing packets produced during maintenance are collected
/// into a queue and sent after the lock is released").
struct PendingSend {
    interface: InterfaceHandle,
    packet: Packet,
}

/// Decision reached by [`Transport::packet_filter`] (§4.2).
enum FilterVerdict {
    /// Admitted. `defer_hash` is true when the hash must not be inserted yet
    /// because forwarding still needs to confirm this hop should handle it
    /// (link transit, or an LRPROOF awaiting validation).
    Admit { defer_hash: bool },
    Drop(DropReason),
}

pub struct Transport {
    pub id: AddressHash,
    pub config: TransportConfig,
    transport_enabled: bool,
    locked: Mutex<Locked>,
    interfaces: Mutex<HashMap<InterfaceHandle, Arc<dyn Interface>>>,
    ifac: Mutex<HashMap<InterfaceHandle, (PrivateIdentity, Vec<u8>, usize)>>,
    endpoints: Option<Arc<dyn LocalEndpoints>>,
    /// `<cache>/announces/<hex>` root (§4.9). `None` disables the on-disk
    /// announce cache entirely — path responses then fall back to a
    /// synthetic re-announce and load skips the "missing announce packet"
    /// check, since there is nothing to check against.
    cache_dir: Option<std::path::PathBuf>,
    /// Whether this instance runs as a child of a local shared instance, so
    /// its directly-attached clients should appear one hop closer (§9
    /// "shared-instance hops spoofing").
    behind_shared_instance: bool,
}

impl Transport {
    pub fn new(id: AddressHash, config: TransportConfig, transport_enabled: bool) -> Self {
        let hashlist = Hashlist::new(config.hashlist_maxsize);
        Self {
            id,
            transport_enabled,
            locked: Mutex::new(Locked {
                tables: Tables::new(),
                hashlist,
                receipts: ReceiptTable::new(),
                announce_queues: HashMap::new(),
                announce_allowed_at: HashMap::new(),
            }),
            interfaces: Mutex::new(HashMap::new()),
            ifac: Mutex::new(HashMap::new()),
            endpoints: None,
            cache_dir: None,
            behind_shared_instance: false,
            config,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Arc<dyn LocalEndpoints>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Enables the on-disk announce-packet cache (§4.9) at `dir`.
    pub fn with_cache_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    /// Marks this instance as running behind a local shared instance (§9).
    pub fn with_shared_instance_parent(mut self, behind_shared_instance: bool) -> Self {
        self.behind_shared_instance = behind_shared_instance;
        self
    }

    pub fn transport_enabled(&self) -> bool {
        self.transport_enabled
    }

    // ---- interface registry -------------------------------------------------

    pub fn register_interface(&self, interface: Arc<dyn Interface>) {
        let handle = interface.get_hash();
        debug!("registering interface {handle} ({})", interface.name());
        self.interfaces.lock().expect("interfaces lock poisoned").insert(handle, interface);
    }

    pub fn deregister_interface(&self, handle: &InterfaceHandle) {
        if let Some(iface) = self.interfaces.lock().expect("interfaces lock poisoned").remove(handle) {
            iface.detach();
        }
        let mut locked = self.locked.lock().expect("jobs lock poisoned");
        locked.tables.unbind_tunnel_interface(handle);
        locked.announce_queues.remove(handle);
        locked.announce_allowed_at.remove(handle);
    }

    pub fn set_ifac(&self, handle: InterfaceHandle, identity: PrivateIdentity, key: Vec<u8>, size: usize) {
        self.ifac.lock().expect("ifac lock poisoned").insert(handle, (identity, key, size));
    }

    fn interface(&self, handle: &InterfaceHandle) -> Option<Arc<dyn Interface>> {
        self.interfaces.lock().expect("interfaces lock poisoned").get(handle).cloned()
    }

    fn live_interface(&self, handle: &InterfaceHandle) -> bool {
        self.interfaces.lock().expect("interfaces lock poisoned").contains_key(handle)
    }

    fn all_interfaces(&self) -> Vec<Arc<dyn Interface>> {
        self.interfaces.lock().expect("interfaces lock poisoned").values().cloned().collect()
    }

    fn out_interfaces(&self) -> Vec<Arc<dyn Interface>> {
        self.all_interfaces().into_iter().filter(|iface| iface.out() && !iface.detached()).collect()
    }

    // ---- IFAC framing (§4.1) ------------------------------------------------

    /// Serializes and, if the interface carries an IFAC configuration, masks
    /// `packet` before it is handed to the driver.
    pub fn frame_outgoing(&self, handle: &InterfaceHandle, packet: &Packet) -> Result<Vec<u8>, RnsError> {
        let raw = packet.to_bytes()?;
        let guard = self.ifac.lock().expect("ifac lock poisoned");
        match guard.get(handle) {
            Some((identity, key, size)) => {
                ifac::mask(&raw, &IfacConfig { identity, key, size: *size })
            }
            None => Ok(raw),
        }
    }

    /// Reverses [`Transport::frame_outgoing`]: unmasks (if the interface
    /// requires IFAC) and decodes into a [`Packet`]. Drops with
    /// [`RnsError::InvalidArgument`] on an IFAC-flag/config mismatch (§4.1).
    pub fn unframe_incoming(&self, handle: &InterfaceHandle, framed: &[u8]) -> Result<Packet, RnsError> {
        let ifac_flag_set = framed.first().map(|b| b & ifac::IFAC_FLAG_BIT != 0).unwrap_or(false);
        let guard = self.ifac.lock().expect("ifac lock poisoned");
        let config = guard.get(handle);

        let raw = match (ifac_flag_set, config) {
            (true, Some((identity, key, size))) => {
                ifac::unmask(framed, &IfacConfig { identity, key, size: *size })?
            }
            (true, None) => return Err(RnsError::InvalidArgument),
            (false, Some(_)) => return Err(RnsError::InvalidArgument),
            (false, None) => framed.to_vec(),
        };

        Packet::from_bytes(&raw)
    }

    fn extra_link_proof_timeout(iface: &Arc<dyn Interface>) -> f64 {
        if iface.bitrate() == 0 {
            0.0
        } else {
            (1.0 / iface.bitrate() as f64) * 8.0 * crate::packet::PACKET_MDU as f64
        }
    }

    // ---- packet filter and de-duplication (§4.2) ---------------------------

    fn packet_filter(&self, locked: &mut Locked, packet: &Packet) -> FilterVerdict {
        if let Some(transport_id) = packet.transport {
            if transport_id != self.id && packet.header.packet_type != PacketType::Announce {
                return FilterVerdict::Drop(DropReason::Invalid);
            }
        }

        if packet.context.is_link_protocol() {
            return FilterVerdict::Admit { defer_hash: false };
        }

        let plain_or_group =
            matches!(packet.header.destination_type, DestinationType::Plain | DestinationType::Group);

        if plain_or_group {
            if packet.header.packet_type == PacketType::Announce {
                return FilterVerdict::Drop(DropReason::Policy);
            }
            if packet.header.hops > 1 {
                return FilterVerdict::Drop(DropReason::Loop);
            }
        }

        if packet.header.packet_type == PacketType::Announce
            && packet.header.destination_type != DestinationType::Single
        {
            return FilterVerdict::Drop(DropReason::Policy);
        }

        let hash = packet.hash();
        if locked.hashlist.contains(&hash) {
            return FilterVerdict::Drop(DropReason::Duplicate);
        }

        let is_link_destination = packet.header.destination_type == DestinationType::Link;
        let is_lrproof = packet.header.packet_type == PacketType::Proof
            && packet.context == PacketContext::LinkRequestProof;
        let defer_hash = (is_link_destination && locked.tables.link.contains_key(&packet.destination))
            || is_lrproof;

        FilterVerdict::Admit { defer_hash }
    }

    // ---- inbound dispatch (§4.4) --------------------------------------------

    pub fn inbound(&self, packet: Packet, receiving_interface: InterfaceHandle) -> PacketOutcome {
        let Some(iface) = self.interface(&receiving_interface) else {
            warn!("inbound packet on unknown interface {receiving_interface}");
            return PacketOutcome::Dropped(DropReason::Invalid);
        };

        let mut locked = self.locked.lock().expect("jobs lock poisoned");

        let verdict = self.packet_filter(&mut locked, &packet);
        let defer_hash = match verdict {
            FilterVerdict::Drop(reason) => {
                trace!("packet_filter dropped {}: {reason}", packet.hash());
                return PacketOutcome::Dropped(reason);
            }
            FilterVerdict::Admit { defer_hash } => defer_hash,
        };

        let hash = packet.hash();
        if !defer_hash {
            locked.hashlist.insert(&hash);
        }

        let mut packet = packet;
        packet.header.hops = packet.header.hops.saturating_add(1);

        let (outcome, pending) = match packet.header.packet_type {
            PacketType::Announce => self.handle_announce_inbound(&mut locked, &iface, &packet),
            PacketType::LinkRequest => self.handle_link_request_inbound(&mut locked, &iface, &packet),
            PacketType::Proof => self.handle_proof_inbound(&mut locked, &iface, &packet, &hash),
            PacketType::Data => self.handle_data_inbound(&mut locked, &iface, &packet),
        };

        drop(locked);
        self.flush_pending(pending);
        outcome
    }

    fn flush_pending(&self, pending: Vec<PendingSend>) {
        for send in pending {
            let Some(iface) = self.interface(&send.interface) else { continue };
            match self.frame_outgoing(&send.interface, &send.packet) {
                Ok(bytes) => {
                    if let Err(err) = iface.process_outgoing(&bytes) {
                        warn!("process_outgoing failed on {}: {err}", send.interface);
                    }
                }
                Err(err) => warn!("failed to frame outgoing packet for {}: {err}", send.interface),
            }
        }
    }

    fn handle_data_inbound(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        if packet.header.destination_type == DestinationType::Plain {
            let mut pending = Vec::new();
            for other in self.all_interfaces() {
                if other.get_hash() == iface.get_hash() || !other.out() {
                    continue;
                }
                if iface.is_local_client() || other.is_local_client() {
                    pending.push(PendingSend { interface: other.get_hash(), packet: *packet });
                }
            }
            return (PacketOutcome::Forwarded, pending);
        }

        if packet.header.destination_type == DestinationType::Link {
            return self.handle_link_transit(locked, iface, packet);
        }

        if packet.transport == Some(self.id) && locked.tables.path.contains_key(&packet.destination) {
            return self.forward_transit_data(locked, iface, packet);
        }

        if let Some(endpoints) = &self.endpoints {
            if endpoints.is_local(&packet.destination) {
                return match endpoints.deliver_data(packet) {
                    DeliveryResult::NoProof => (PacketOutcome::DeliveredLocal, Vec::new()),
                    DeliveryResult::Prove => (PacketOutcome::DeliveredLocal, Vec::new()),
                    DeliveryResult::Drop => (PacketOutcome::Dropped(DropReason::Policy), Vec::new()),
                };
            }
        }

        (PacketOutcome::Dropped(DropReason::Invalid), Vec::new())
    }

    /// Transit data whose `transport_id` names this instance and whose
    /// destination is a known path (§4.4 "Transit data").
    fn forward_transit_data(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        let Some(entry) = locked.tables.path.get(&packet.destination).cloned() else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        let remaining_hops = entry.hops;
        let mut forwarded = *packet;

        if remaining_hops > 1 {
            forwarded.header.header_type = HeaderType::Type2;
            forwarded.header.propagation_type = PropagationType::Transport;
            forwarded.transport = Some(entry.next_hop);
        } else {
            forwarded.header.header_type = HeaderType::Type1;
            forwarded.header.propagation_type = PropagationType::Broadcast;
            forwarded.transport = None;
        }

        locked.tables.reverse.insert(
            packet.truncated_hash(),
            ReverseEntry { received_if: iface.get_hash(), outbound_if: entry.receiving_interface, timestamp: now_epoch_secs_f64() },
        );

        (
            PacketOutcome::Forwarded,
            vec![PendingSend { interface: entry.receiving_interface, packet: forwarded }],
        )
    }

    fn handle_link_request_inbound(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        if let Some(endpoints) = &self.endpoints {
            if endpoints.is_local(&packet.destination) {
                endpoints.deliver_link_request(packet);
                return (PacketOutcome::DeliveredLocal, Vec::new());
            }
        }

        let Some(entry) = locked.tables.path.get(&packet.destination).cloned() else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        let Some(outbound_iface) = self.interface(&entry.receiving_interface) else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        let remaining_hops = entry.hops;
        let now = now_epoch_secs_f64();
        let proof_timeout = now
            + self.config.est_timeout_per_hop * (remaining_hops.max(1) as f64)
            + Self::extra_link_proof_timeout(&outbound_iface);

        let link_id = LinkId::from(packet);
        locked.tables.link.insert(
            link_id,
            LinkEntry {
                timestamp: now,
                next_hop_transport_id: Some(entry.next_hop),
                next_hop_if: entry.receiving_interface,
                remaining_hops,
                received_if: iface.get_hash(),
                taken_hops: packet.header.hops,
                destination_hash: packet.destination,
                validated: false,
                proof_timeout,
            },
        );

        let hash = packet.hash();
        locked.hashlist.insert(&hash);

        let mut forwarded = *packet;
        if remaining_hops > 1 {
            forwarded.header.header_type = HeaderType::Type2;
            forwarded.header.propagation_type = PropagationType::Transport;
            forwarded.transport = Some(entry.next_hop);
        } else {
            forwarded.header.header_type = HeaderType::Type1;
            forwarded.header.propagation_type = PropagationType::Broadcast;
            forwarded.transport = None;
        }

        (
            PacketOutcome::Forwarded,
            vec![PendingSend { interface: entry.receiving_interface, packet: forwarded }],
        )
    }

    /// Non-announce, non-linkrequest, non-LRPROOF traffic addressed to a
    /// link ID (§4.4 "Transit link traffic").
    fn handle_link_transit(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        let link_id: LinkId = packet.destination;
        let Some(entry) = locked.tables.link.get(&link_id).cloned() else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        let received_on_next_hop = iface.get_hash() == entry.next_hop_if;
        let received_on_origin = iface.get_hash() == entry.received_if;
        let same_iface = entry.next_hop_if == entry.received_if;

        let hop_matches = if same_iface {
            packet.header.hops == entry.remaining_hops || packet.header.hops == entry.taken_hops
        } else if received_on_next_hop {
            packet.header.hops == entry.remaining_hops
        } else if received_on_origin {
            packet.header.hops == entry.taken_hops
        } else {
            false
        };

        if !hop_matches {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        }

        locked.hashlist.insert(&packet.hash());

        let outbound_if = if received_on_next_hop { entry.received_if } else { entry.next_hop_if };
        if let Some(link) = locked.tables.link.get_mut(&link_id) {
            link.timestamp = now_epoch_secs_f64();
        }

        (PacketOutcome::Forwarded, vec![PendingSend { interface: outbound_if, packet: *packet }])
    }

    fn handle_proof_inbound(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
        hash: &Hash,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        if packet.context == PacketContext::LinkRequestProof {
            return self.handle_link_request_proof(locked, iface, packet);
        }

        let mut pending = Vec::new();

        if let Some(reverse) = locked.tables.reverse.get(&packet.destination).copied() {
            if reverse.outbound_if == iface.get_hash() {
                locked.hashlist.insert(hash);
                locked.tables.reverse.remove(&packet.destination);
                pending.push(PendingSend { interface: reverse.received_if, packet: *packet });
            }
        }

        let receipt = if packet.data.len() >= 32 {
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&packet.data.as_slice()[..32]);
            locked.receipts.validate_explicit(&Hash::new(raw))
        } else {
            locked.receipts.validate_implicit(|receipt| receipt.destination_hash == packet.destination)
        };

        let outcome = if !pending.is_empty() {
            PacketOutcome::Forwarded
        } else if receipt.is_some() {
            PacketOutcome::DeliveredLocal
        } else {
            PacketOutcome::Dropped(DropReason::Invalid)
        };

        (outcome, pending)
    }

    fn handle_link_request_proof(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        let link_id: LinkId = packet.destination;
        let Some(mut entry) = locked.tables.link.get(&link_id).cloned() else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        if iface.get_hash() != entry.next_hop_if || packet.header.hops != entry.remaining_hops {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        }

        let Some(endpoints) = &self.endpoints else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };
        let Some(identity) = endpoints.link_identity(&entry.destination_hash) else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        let data = packet.data.as_slice();
        if data.len() < ed25519_dalek::SIGNATURE_LENGTH {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        }
        let split = data.len() - ed25519_dalek::SIGNATURE_LENGTH;
        let (signed, sig_bytes) = data.split_at(split);
        let Ok(signature) = ed25519_dalek::Signature::from_slice(sig_bytes) else {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        };

        if identity.verify(signed, &signature).is_err() {
            warn!("link-request proof signature mismatch for link {link_id}");
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        }

        entry.validated = true;
        locked.hashlist.insert(&packet.hash());
        let received_if = entry.received_if;
        locked.tables.link.insert(link_id, entry);

        (PacketOutcome::Forwarded, vec![PendingSend { interface: received_if, packet: *packet }])
    }

    fn handle_announce_inbound(
        &self,
        locked: &mut Locked,
        iface: &Arc<dyn Interface>,
        packet: &Packet,
    ) -> (PacketOutcome, Vec<PendingSend>) {
        if let Some(endpoints) = &self.endpoints {
            if !endpoints.verify_announce(packet) {
                return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
            }
        }

        let is_local = self.endpoints.as_ref().map(|e| e.is_local(&packet.destination)).unwrap_or(false);
        if is_local {
            return (PacketOutcome::Admitted, Vec::new());
        }

        if iface.should_ingress_limit()
            && !locked.tables.path.contains_key(&packet.destination)
        {
            iface.hold_announce(*packet);
            return (PacketOutcome::Dropped(DropReason::Deferred), Vec::new());
        }

        if packet.header.hops as u32 >= self.config.pathfinder_m as u32 + 1 {
            return (PacketOutcome::Admitted, Vec::new());
        }

        if packet.data.len() < 10 {
            return (PacketOutcome::Dropped(DropReason::Invalid), Vec::new());
        }
        let mut blob = [0u8; 10];
        blob.copy_from_slice(&packet.data.as_slice()[..10]);
        let emission = emission_timebase(&blob);

        let existing = locked.tables.path.get(&packet.destination).cloned();
        let existing_state =
            locked.tables.path_states.get(&packet.destination).copied().unwrap_or(PathState::Unknown);
        let blob_is_new = existing.as_ref().map(|e| !e.random_blobs.contains(&blob)).unwrap_or(true);

        let now = now_epoch_secs_f64();
        if !admission_decision(
            existing.as_ref(),
            existing_state,
            packet.header.hops,
            emission,
            blob_is_new,
            now,
        ) {
            return (PacketOutcome::Dropped(DropReason::Policy), Vec::new());
        }

        let rate_target = iface.announce_rate_target();
        let mut rate_blocked = false;
        if let Some(target) = rate_target {
            let rate = locked.tables.announce_rate.entry(packet.destination).or_default();
            rate_blocked = apply_rate_limit(
                rate,
                now,
                target,
                iface.announce_rate_grace().unwrap_or(0) as u32,
                iface.announce_rate_penalty().unwrap_or(0.0),
                self.config.max_rate_timestamps,
            );
        }

        let mut entry = existing.unwrap_or_else(|| PathEntry {
            timestamp: now,
            next_hop: packet.transport.unwrap_or(packet.destination),
            hops: packet.header.hops,
            expires: now + path_expiry(iface.mode(), &self.config),
            random_blobs: VecDeque::new(),
            receiving_interface: iface.get_hash(),
            announce_packet_hash: None,
        });
        entry.timestamp = now;
        entry.next_hop = packet.transport.unwrap_or(packet.destination);
        entry.hops = packet.header.hops;
        entry.expires = now + path_expiry(iface.mode(), &self.config);
        entry.receiving_interface = iface.get_hash();
        entry.announce_packet_hash = Some(packet.hash().to_bytes());
        entry.remember_blob(blob, self.config.max_random_blobs);

        if let Some(cache_dir) = &self.cache_dir {
            if let Err(err) = storage::store_cached_announce(cache_dir, packet, iface.name()) {
                warn!("failed to cache announce packet for {}: {err}", packet.destination);
            }
        }

        debug!("path entry for {} via {} at {} hops", packet.destination, iface.get_hash(), entry.hops);
        locked.tables.insert_path(packet.destination, entry.clone());

        if let Some(tunnel_id) = iface.tunnel_id() {
            if let Some(tunnel) = locked.tables.tunnels.get_mut(&tunnel_id) {
                tunnel.paths.insert(packet.destination, entry);
            }
        }

        let mut skip_retransmit = false;
        if let Some(existing_announce) = locked.tables.announce_table.get_mut(&packet.destination) {
            if crate::transport::announce::observe_peer_rebroadcast(
                existing_announce,
                packet.header.hops,
                self.config.local_rebroadcasts_max,
            ) {
                locked.tables.announce_table.remove(&packet.destination);
                skip_retransmit = true;
            }
        }

        let from_local_client = iface.is_local_client();
        if !skip_retransmit
            && (self.transport_enabled || from_local_client)
            && packet.context != PacketContext::PathResponse
            && !rate_blocked
        {
            let jitter = uniform_jitter(OsRng, self.config.pathfinder_rw);
            let (retransmit_at, retries) =
                schedule_retransmit(now, jitter, from_local_client, &self.config);
            locked.tables.announce_table.insert(
                packet.destination,
                AnnounceEntry {
                    timestamp: now,
                    retransmit_at,
                    retries,
                    received_from: Some(iface.get_hash()),
                    hops: packet.header.hops,
                    packet: *packet,
                    local_rebroadcasts: 0,
                    block_rebroadcasts: packet.context == PacketContext::PathResponse,
                    attached_interface: Some(iface.get_hash()),
                },
            );
        }

        if let Some(pending_discovery) = locked.tables.discovery_path_requests.remove(&packet.destination) {
            let mut response = *packet;
            response.context = PacketContext::PathResponse;
            return (
                PacketOutcome::Admitted,
                vec![PendingSend { interface: pending_discovery.attached_interface, packet: response }],
            );
        }

        (PacketOutcome::Admitted, Vec::new())
    }

    // ---- outbound dispatch (§4.3) -------------------------------------------

    /// Sends a locally originated packet. `pin` restricts broadcast fallback
    /// to a single interface (link-bound traffic, §4.3 "attached_interface").
    pub fn send_packet(
        &self,
        packet: Packet,
        create_receipt: bool,
        pin: Option<InterfaceHandle>,
    ) -> Result<PacketOutcome, RnsError> {
        let mut locked = self.locked.lock().expect("jobs lock poisoned");
        let now = now_epoch_secs_f64();

        let is_data = packet.header.packet_type == PacketType::Data;
        let destination_is_plain = packet.header.destination_type == DestinationType::Plain;
        if receipt_eligible(create_receipt, is_data, destination_is_plain, packet.context) {
            locked.receipts.insert(Receipt::new(packet.hash(), packet.destination, now, Some(self.config.destination_timeout as f64)));
            let evicted = locked.receipts.evict_over_capacity(self.config.max_receipts);
            if !evicted.is_empty() {
                warn!("evicted {} receipts over capacity", evicted.len());
            }
        }

        if packet.header.packet_type != PacketType::Announce
            && !matches!(packet.header.destination_type, DestinationType::Plain | DestinationType::Group)
        {
            if let Some(entry) = locked.tables.path.get_mut(&packet.destination) {
                let mut outgoing = packet;
                if entry.hops > 1 || (entry.hops == 1 && self.behind_shared_instance) {
                    outgoing.header.header_type = HeaderType::Type2;
                    outgoing.header.propagation_type = PropagationType::Transport;
                    outgoing.transport = Some(entry.next_hop);
                }
                let target = entry.receiving_interface;
                entry.timestamp = now;
                drop(locked);

                let Some(iface) = self.interface(&target) else {
                    return Ok(PacketOutcome::Dropped(DropReason::Invalid));
                };
                let bytes = self.frame_outgoing(&target, &outgoing)?;
                iface.process_outgoing(&bytes)?;
                return Ok(PacketOutcome::Forwarded);
            }
        }

        let targets: Vec<Arc<dyn Interface>> = match pin {
            Some(handle) => self.interface(&handle).into_iter().collect(),
            None => self.out_interfaces(),
        };
        drop(locked);

        for iface in &targets {
            let bytes = self.frame_outgoing(&iface.get_hash(), &packet)?;
            iface.process_outgoing(&bytes)?;
        }

        Ok(PacketOutcome::Forwarded)
    }

    /// Broadcasts a (re)transmission of an announce, applying the
    /// per-interface mode policy and announce cap (§4.3 item 3). Called from
    /// the maintenance loop's due-retransmit sweep.
    fn broadcast_announce(&self, locked: &mut Locked, packet: &Packet) -> Vec<PendingSend> {
        let now = now_epoch_secs_f64();
        let mut pending = Vec::new();

        for iface in self.out_interfaces() {
            let handle = iface.get_hash();
            match iface.mode() {
                InterfaceMode::AccessPoint => continue,
                InterfaceMode::Roaming | InterfaceMode::Boundary => {
                    let destination_local =
                        self.endpoints.as_ref().map(|e| e.is_local(&packet.destination)).unwrap_or(false);
                    if !destination_local {
                        continue;
                    }
                }
                _ => {}
            }

            if iface.bitrate() > 0 {
                let bytes_len = packet.to_bytes().map(|b| b.len()).unwrap_or(0) as f64;
                let tx_time = bytes_len * 8.0 / iface.bitrate() as f64;
                let wait_time = tx_time / self.config.announce_cap;
                let allowed_at = locked.announce_allowed_at.entry(handle).or_insert(now);

                if now < *allowed_at {
                    let queue = locked.announce_queues.entry(handle).or_default();
                    queue.retain(|queued| queued.destination != packet.destination);
                    queue.push_back(QueuedAnnounce {
                        destination: packet.destination,
                        emitted: emission_timebase(&blob_of(packet)),
                        packet: *packet,
                    });
                    while queue.len() > self.config.max_queued_announces {
                        queue.pop_front();
                    }
                    continue;
                }

                *allowed_at = now + wait_time;
            }

            pending.push(PendingSend { interface: handle, packet: *packet });
        }

        pending
    }

    /// Drains each interface's announce queue once its `announce_allowed_at`
    /// has passed (§4.8 "interface_jobs_interval", §9 "Resolved — announce
    /// queue drain timer": one delay-ordered structure under the maintenance
    /// loop rather than a timer task per interface).
    fn drain_announce_queues(&self, locked: &mut Locked) -> Vec<PendingSend> {
        let now = now_epoch_secs_f64();
        let mut pending = Vec::new();

        for (&handle, queue) in locked.announce_queues.iter_mut() {
            let allowed_at = locked.announce_allowed_at.get(&handle).copied().unwrap_or(now);
            if now >= allowed_at {
                if let Some(queued) = queue.pop_front() {
                    pending.push(PendingSend { interface: handle, packet: queued.packet });
                }
            }
        }

        pending
    }

    // ---- path requests (§4.6) ----------------------------------------------

    pub fn request_path(
        &self,
        destination: AddressHash,
        on_interface: Option<InterfaceHandle>,
        tag: Option<[u8; 16]>,
    ) -> Result<(), RnsError> {
        let tag = tag.unwrap_or_else(|| new_path_request_tag(OsRng));
        let mut data = Vec::with_capacity(16 + 16 + 16);
        data.extend_from_slice(destination.as_slice());
        if self.transport_enabled {
            data.extend_from_slice(self.id.as_slice());
        }
        data.extend_from_slice(&tag);

        let packet = Packet {
            header: Header {
                packet_type: PacketType::Data,
                destination_type: DestinationType::Plain,
                context_flag: ContextFlag::Set,
                ..Default::default()
            },
            destination,
            context: PacketContext::Request,
            data: crate::packet::PacketDataBuffer::new_from_slice(&data),
            ..Default::default()
        };

        {
            let mut locked = self.locked.lock().expect("jobs lock poisoned");
            locked.tables.local_path_requests.insert(
                destination,
                (now_epoch_secs_f64(), on_interface.unwrap_or(AddressHash::new_empty())),
            );
        }

        self.send_packet(packet, false, on_interface).map(|_| ())
    }

    pub fn path_request_handler(&self, data: &[u8], receiving_interface: InterfaceHandle) {
        if data.len() < 16 {
            return;
        }
        let dst = AddressHash::new(data[..16].try_into().unwrap());

        let (requestor_transport_id, tag_start) = if data.len() >= 32 {
            (Some(AddressHash::new(data[16..32].try_into().unwrap())), 32)
        } else {
            (None, 16)
        };

        if data.len() <= tag_start {
            return;
        }
        let tag_bytes = &data[tag_start..];
        let tag_len = tag_bytes.len().min(16);
        let mut tag = [0u8; 16];
        tag[..tag_len].copy_from_slice(&tag_bytes[..tag_len]);

        let mut unique_tag = Vec::with_capacity(32);
        unique_tag.extend_from_slice(dst.as_slice());
        unique_tag.extend_from_slice(&tag);
        let unique_tag = AddressHash::new_from_slice(&unique_tag);

        {
            let mut locked = self.locked.lock().expect("jobs lock poisoned");
            if !locked.tables.push_discovery_tag(unique_tag, self.config.max_pr_tags) {
                return;
            }
        }

        self.path_request(dst, false, receiving_interface, requestor_transport_id, Some(tag));
    }

    pub fn path_request(
        &self,
        destination: AddressHash,
        is_from_local_client: bool,
        attached_interface: InterfaceHandle,
        requestor_transport_id: Option<AddressHash>,
        tag: Option<[u8; 16]>,
    ) {
        if let Some(endpoints) = &self.endpoints {
            if endpoints.is_local(&destination) {
                let _ = self.request_path(destination, Some(attached_interface), tag);
                return;
            }
        }

        let mut locked = self.locked.lock().expect("jobs lock poisoned");

        if let Some(entry) = locked.tables.path.get(&destination).cloned() {
            if requestor_transport_id != Some(entry.next_hop) {
                hold_for_path_response(&mut locked.tables, &destination);

                let Some(outbound_iface) = self.interface(&entry.receiving_interface) else {
                    return;
                };

                let mut grace = if is_from_local_client { 0.0 } else { self.config.path_request_grace };
                if outbound_iface.mode() == InterfaceMode::Roaming {
                    grace += self.config.path_request_rg;
                }

                let retransmit_at = now_epoch_secs_f64() + grace;
                let packet = self.rebuild_cached_announce(&entry, destination);
                locked.tables.announce_table.insert(
                    destination,
                    AnnounceEntry {
                        timestamp: now_epoch_secs_f64(),
                        retransmit_at,
                        retries: self.config.pathfinder_r,
                        received_from: None,
                        hops: entry.hops,
                        packet,
                        local_rebroadcasts: 0,
                        block_rebroadcasts: true,
                        attached_interface: Some(attached_interface),
                    },
                );
            }
            return;
        }

        if is_from_local_client {
            for iface in self.out_interfaces() {
                if iface.get_hash() != attached_interface {
                    let _ = self.request_path(destination, Some(iface.get_hash()), tag);
                }
            }
            return;
        }

        let permits_discovery = self
            .interface(&attached_interface)
            .map(|iface| !matches!(iface.mode(), InterfaceMode::AccessPoint))
            .unwrap_or(false);

        if self.transport_enabled && permits_discovery {
            locked.tables.discovery_path_requests.insert(
                destination,
                DiscoveryPathRequest {
                    requestor_transport_id,
                    attached_interface,
                    timeout: now_epoch_secs_f64() + self.config.path_request_timeout as f64,
                },
            );
            drop(locked);
            for iface in self.out_interfaces() {
                if iface.get_hash() != attached_interface {
                    let _ = self.request_path(destination, Some(iface.get_hash()), tag);
                }
            }
            return;
        }

        drop(locked);
        for iface in self.out_interfaces() {
            if iface.is_local_client() {
                let _ = self.request_path(destination, Some(iface.get_hash()), tag);
            }
        }
    }

    /// §4.9 load-time check: a path entry with no resolvable cached announce
    /// packet is skipped. When no cache directory is configured there is
    /// nothing to check against, so every entry passes.
    fn has_cached_announce(&self, entry: &PathEntry) -> bool {
        let Some(cache_dir) = &self.cache_dir else { return true };
        let Some(hash_bytes) = entry.announce_packet_hash else { return false };
        matches!(storage::load_cached_announce(cache_dir, &Hash::new(hash_bytes)), Ok(Some(_)))
    }

    /// Rebuilds the announce to rebroadcast as a path-request answer (§4.6
    /// "Rebuild a rebroadcast announce from the cached announce packet").
    /// Loads the cached announce by `entry.announce_packet_hash` when a cache
    /// is configured and the packet is present; otherwise falls back to a
    /// bare re-announce carrying the stored path's hop count, so S5's
    /// `hops == stored path hops` requirement still holds without a cache.
    fn rebuild_cached_announce(&self, entry: &PathEntry, destination: AddressHash) -> Packet {
        if let (Some(cache_dir), Some(hash_bytes)) = (&self.cache_dir, entry.announce_packet_hash) {
            match storage::load_cached_announce(cache_dir, &Hash::new(hash_bytes)) {
                Ok(Some((mut cached, _iface_name))) => {
                    cached.header.hops = entry.hops;
                    cached.context = PacketContext::PathResponse;
                    return cached;
                }
                Ok(None) => {}
                Err(err) => warn!("failed to load cached announce for {destination}: {err}"),
            }
        }

        Packet {
            header: Header { packet_type: PacketType::Announce, hops: entry.hops, ..Default::default() },
            destination,
            context: PacketContext::PathResponse,
            ..Default::default()
        }
    }

    // ---- tunnel manager (§4.7) ----------------------------------------------

    pub fn synthesize_tunnel(&self, interface: InterfaceHandle, identity: &PrivateIdentity) -> Result<AddressHash, RnsError> {
        let mut random = [0u8; 16];
        rand_core::RngCore::fill_bytes(&mut OsRng, &mut random);

        let mut signed = Vec::with_capacity(32 + 16 + 16);
        signed.extend_from_slice(identity.as_identity().public_key_bytes());
        signed.extend_from_slice(interface.as_slice());
        signed.extend_from_slice(&random);
        let signature = identity.sign(&signed);

        let mut data = signed.clone();
        data.extend_from_slice(&signature.to_bytes());

        let mut tunnel_seed = Vec::with_capacity(48);
        tunnel_seed.extend_from_slice(identity.as_identity().public_key_bytes());
        tunnel_seed.extend_from_slice(interface.as_slice());
        let tunnel_id = AddressHash::new_from_slice(&tunnel_seed);

        let packet = Packet {
            header: Header { packet_type: PacketType::Data, destination_type: DestinationType::Plain, ..Default::default() },
            destination: tunnel_id,
            context: PacketContext::None,
            data: crate::packet::PacketDataBuffer::new_from_slice(&data),
            ..Default::default()
        };
        self.send_packet(packet, false, Some(interface))?;
        Ok(tunnel_id)
    }

    pub fn tunnel_synthesize_handler(&self, data: &[u8], receiving_interface: InterfaceHandle) {
        if data.len() < 32 + 16 + 16 + ed25519_dalek::SIGNATURE_LENGTH {
            return;
        }
        let public_key = &data[..32];
        let iface_hash = &data[32..48];
        let split = data.len() - ed25519_dalek::SIGNATURE_LENGTH;
        let (signed, sig_bytes) = data.split_at(split);

        let identity = Identity::new_from_slices(public_key, public_key);
        let Ok(signature) = ed25519_dalek::Signature::from_slice(sig_bytes) else { return };
        if identity.verify(signed, &signature).is_err() {
            warn!("tunnel synthesize signature mismatch on {receiving_interface}");
            return;
        }

        let mut tunnel_seed = Vec::with_capacity(48);
        tunnel_seed.extend_from_slice(public_key);
        tunnel_seed.extend_from_slice(iface_hash);
        let tunnel_id = AddressHash::new_from_slice(&tunnel_seed);

        self.handle_tunnel(tunnel_id, receiving_interface);
    }

    fn handle_tunnel(&self, tunnel_id: AddressHash, interface: InterfaceHandle) {
        let mut locked = self.locked.lock().expect("jobs lock poisoned");
        let now = now_epoch_secs_f64();

        let restored_paths: Vec<(AddressHash, PathEntry)> = {
            let tunnel = locked.tables.tunnels.entry(tunnel_id).or_insert_with(|| TunnelEntry {
                interface: Some(interface),
                paths: HashMap::new(),
                expires: now + self.config.tunnel_expiry as f64,
            });
            tunnel.interface = Some(interface);
            tunnel.expires = now + self.config.tunnel_expiry as f64;
            tunnel.paths.iter().map(|(dst, entry)| (*dst, entry.clone())).collect()
        };

        for (dst, mut entry) in restored_paths {
            let better_live_path = locked
                .tables
                .path
                .get(&dst)
                .map(|live| live.hops < entry.hops && now < live.expires)
                .unwrap_or(false);

            if better_live_path {
                continue;
            }

            let existing_hops_or_expired =
                locked.tables.path.get(&dst).map(|live| entry.hops <= live.hops || now >= live.expires).unwrap_or(true);

            if existing_hops_or_expired {
                entry.receiving_interface = interface;
                debug!("restoring tunnel path {dst} via {tunnel_id} on {interface}");
                locked.tables.insert_path(dst, entry);
            }
        }
    }

    // ---- maintenance loop (§4.8) --------------------------------------------

    /// Runs one `jobs()` sweep under the jobs lock. Intended to be called
    /// every `config.jobs_interval_ms`.
    pub fn jobs(&self) {
        let mut locked = self.locked.lock().expect("jobs lock poisoned");
        let now = now_epoch_secs_f64();

        locked.tables.link.retain(|_, link| {
            if link.validated {
                return true;
            }
            now <= link.proof_timeout
        });

        let evicted = locked.receipts.evict_over_capacity(self.config.max_receipts);
        if !evicted.is_empty() {
            debug!("{} receipts evicted over capacity", evicted.len());
        }
        let timed_out = locked.receipts.sweep_timeouts(now);
        if !timed_out.is_empty() {
            trace!("{} receipts timed out", timed_out.len());
        }

        let due = due_retransmits(&mut locked.tables.announce_table, now, &self.config);
        let mut pending = Vec::new();
        for (destination, block_rebroadcasts) in due {
            let Some(entry) = locked.tables.announce_table.get(&destination).cloned() else { continue };
            let mut packet = entry.packet;
            packet.context =
                if block_rebroadcasts { PacketContext::PathResponse } else { PacketContext::None };
            pending.extend(self.broadcast_announce(&mut locked, &packet));

            if block_rebroadcasts {
                locked.tables.announce_table.remove(&destination);
                release_held(&mut locked.tables, &destination);
            }
        }

        locked.hashlist.rotate_if_full();

        let live = |handle: &InterfaceHandle| self.live_interface(handle);
        locked.tables.cull_local_path_requests(live);

        locked.tables.cull_reverse(now, &self.config, live);
        locked.tables.cull_links(now, self.config.link_stale_time, live);
        locked.tables.cull_paths(now);
        locked.tables.cull_discovery_requests(now);
        locked.tables.cull_tunnels(now, self.config.tunnel_expiry as f64);

        for handle in self.all_interfaces().iter().map(|i| i.get_hash()).collect::<Vec<_>>() {
            if !self.live_interface(&handle) {
                locked.tables.unbind_tunnel_interface(&handle);
            }
        }

        for iface in self.all_interfaces() {
            for held in iface.process_held_announces() {
                pending.extend(self.broadcast_announce(&mut locked, &held));
            }
        }

        pending.extend(self.drain_announce_queues(&mut locked));

        drop(locked);
        self.flush_pending(pending);
    }

    /// `interface_jobs_interval` sub-task (§4.8): re-sort by bitrate and
    /// flush each interface's own announce-queue drain (distinct from the
    /// jobs-lock-owned queue in [`Transport::drain_announce_queues`] — this
    /// one belongs to the interface driver itself, per the `Interface`
    /// contract's `process_announce_queue`).
    pub fn interface_jobs(&self) {
        let mut pending = Vec::new();
        for iface in self.all_interfaces() {
            for packet in iface.process_announce_queue() {
                pending.push(PendingSend { interface: iface.get_hash(), packet });
            }
        }
        self.flush_pending(pending);
    }

    /// `cache_clean_interval` sub-task (§4.8).
    pub fn clean_cache(&self, cache_dir: &Path) {
        let removed = storage::clean_announce_cache(cache_dir, self.config.cache_clean_interval as f64 * 4.0, crate::transport::time::now_epoch_secs_u64());
        if removed > 0 {
            debug!("cleaned {removed} cached announce packets");
        }
    }

    /// Spawns the maintenance loop (`jobs()` at `jobs_interval_ms`) and the
    /// interface-jobs/cache-clean sweeps on their own cadences (§4.8). The
    /// returned handles are detached background tasks; drop `self` to let
    /// them end naturally once the last strong reference disappears, since
    /// each holds only a [`Arc<Transport>`] weak-free clone for its lifetime
    /// (cancel explicitly via `JoinHandle::abort` if eager shutdown matters).
    pub fn spawn_background_loops(self: &Arc<Self>, cache_dir: Option<std::path::PathBuf>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let maintenance = Arc::clone(self);
        let jobs_interval = std::time::Duration::from_millis(self.config.jobs_interval_ms);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(jobs_interval);
            loop {
                ticker.tick().await;
                maintenance.jobs();
            }
        }));

        let iface_jobs = Arc::clone(self);
        let iface_interval = std::time::Duration::from_secs(self.config.interface_jobs_interval);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(iface_interval);
            loop {
                ticker.tick().await;
                iface_jobs.interface_jobs();
            }
        }));

        if let Some(cache_dir) = cache_dir {
            let cache_jobs = Arc::clone(self);
            let cache_interval = std::time::Duration::from_secs(self.config.cache_clean_interval);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cache_interval);
                loop {
                    ticker.tick().await;
                    cache_jobs.clean_cache(&cache_dir);
                }
            }));
        }

        handles
    }

    // ---- persistence (§4.9) -------------------------------------------------

    pub fn save_snapshot(&self, storage_dir: &Path) -> Result<(), RnsError> {
        let locked = self.locked.lock().expect("jobs lock poisoned");
        if self.transport_enabled {
            storage::save_hashlist(&storage_dir.join("packet_hashlist"), locked.hashlist.current_hashes().copied())?;
        }
        storage::save_path_table(&storage_dir.join("destination_table"), &locked.tables.path, &self.config)?;
        storage::save_tunnels(&storage_dir.join("tunnels"), &locked.tables.tunnels, &self.config)?;
        Ok(())
    }

    pub fn load_snapshot(&self, storage_dir: &Path) -> Result<(), RnsError> {
        let live = |handle: &AddressHash| self.live_interface(handle);

        let mut locked = self.locked.lock().expect("jobs lock poisoned");

        if let Ok(hashes) = storage::load_hashlist(&storage_dir.join("packet_hashlist")) {
            locked.hashlist.load_current(hashes);
        }
        if let Ok(paths) = storage::load_path_table(&storage_dir.join("destination_table"), live) {
            for (dst, entry) in paths {
                if !self.has_cached_announce(&entry) {
                    warn!("skipping path entry for {dst}: announce packet missing from cache");
                    continue;
                }
                locked.tables.insert_path(dst, entry);
            }
        }
        if let Ok(tunnels) = storage::load_tunnels(&storage_dir.join("tunnels"), live) {
            locked.tables.tunnels = tunnels;
        }
        Ok(())
    }
}

fn blob_of(packet: &Packet) -> [u8; 10] {
    let mut blob = [0u8; 10];
    let data = packet.data.as_slice();
    let len = data.len().min(10);
    blob[..len].copy_from_slice(&data[..len]);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::iface::InterfaceMode;

    struct TestInterface {
        hash: AddressHash,
        sent: Mutex<Vec<Vec<u8>>>,
        mode: InterfaceMode,
        local_client: bool,
    }

    impl TestInterface {
        fn new(mode: InterfaceMode, local_client: bool) -> Arc<Self> {
            Arc::new(Self {
                hash: AddressHash::new_from_rand(OsRng),
                sent: Mutex::new(Vec::new()),
                mode,
                local_client,
            })
        }
    }

    impl Interface for TestInterface {
        fn get_hash(&self) -> InterfaceHandle {
            self.hash
        }
        fn name(&self) -> &str {
            "test"
        }
        fn out(&self) -> bool {
            true
        }
        fn bitrate(&self) -> u64 {
            0
        }
        fn mode(&self) -> InterfaceMode {
            self.mode
        }
        fn hw_mtu(&self) -> usize {
            500
        }
        fn autoconfigure_mtu(&self) -> bool {
            false
        }
        fn fixed_mtu(&self) -> Option<usize> {
            None
        }
        fn rxb(&self) -> u64 {
            0
        }
        fn txb(&self) -> u64 {
            0
        }
        fn ifac_key(&self) -> Option<&[u8]> {
            None
        }
        fn ifac_size(&self) -> Option<usize> {
            None
        }
        fn announce_rate_target(&self) -> Option<f64> {
            None
        }
        fn announce_rate_grace(&self) -> Option<f64> {
            None
        }
        fn announce_rate_penalty(&self) -> Option<f64> {
            None
        }
        fn parent_interface(&self) -> Option<InterfaceHandle> {
            None
        }
        fn tunnel_id(&self) -> Option<AddressHash> {
            None
        }
        fn detached(&self) -> bool {
            false
        }
        fn is_local_client(&self) -> bool {
            self.local_client
        }
        fn process_outgoing(&self, bytes: &[u8]) -> Result<(), RnsError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
        fn sent_announce(&self) {}
        fn received_announce(&self) {}
        fn should_ingress_limit(&self) -> bool {
            false
        }
        fn hold_announce(&self, _packet: Packet) {}
        fn process_held_announces(&self) -> Vec<Packet> {
            Vec::new()
        }
        fn process_announce_queue(&self) -> Vec<Packet> {
            Vec::new()
        }
        fn detach(&self) {}
    }

    fn transport() -> Transport {
        Transport::new(AddressHash::new_from_rand(OsRng), TransportConfig::default(), true)
    }

    #[test]
    fn direct_delivery_sends_unmodified_on_single_hop_path() {
        let transport = transport();
        let iface = TestInterface::new(InterfaceMode::Full, false);
        transport.register_interface(iface.clone());

        let dest = AddressHash::new_from_rand(OsRng);
        {
            let mut locked = transport.locked.lock().unwrap();
            locked.tables.insert_path(
                dest,
                PathEntry {
                    timestamp: 0.0,
                    next_hop: AddressHash::new_from_rand(OsRng),
                    hops: 1,
                    expires: now_epoch_secs_f64() + 1000.0,
                    random_blobs: VecDeque::new(),
                    receiving_interface: iface.get_hash(),
                    announce_packet_hash: None,
                },
            );
        }

        let packet = Packet { destination: dest, ..Default::default() };
        let outcome = transport.send_packet(packet, false, None).expect("send");
        assert_eq!(outcome, PacketOutcome::Forwarded);
        assert_eq!(iface.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn multi_hop_path_inserts_transport_header() {
        let transport = transport();
        let iface = TestInterface::new(InterfaceMode::Full, false);
        transport.register_interface(iface.clone());

        let dest = AddressHash::new_from_rand(OsRng);
        let next_hop = AddressHash::new_from_rand(OsRng);
        {
            let mut locked = transport.locked.lock().unwrap();
            locked.tables.insert_path(
                dest,
                PathEntry {
                    timestamp: 0.0,
                    next_hop,
                    hops: 3,
                    expires: now_epoch_secs_f64() + 1000.0,
                    random_blobs: VecDeque::new(),
                    receiving_interface: iface.get_hash(),
                    announce_packet_hash: None,
                },
            );
        }

        let packet = Packet { destination: dest, ..Default::default() };
        transport.send_packet(packet, false, None).expect("send");

        let sent = iface.sent.lock().unwrap();
        let decoded = Packet::from_bytes(&sent[0]).expect("decode");
        assert_eq!(decoded.header.header_type, HeaderType::Type2);
        assert_eq!(decoded.transport, Some(next_hop));
    }

    #[test]
    fn announce_admission_inserts_path_and_schedules_retransmit() {
        let transport = transport();
        let iface = TestInterface::new(InterfaceMode::Full, false);
        let iface_handle = iface.get_hash();
        transport.register_interface(iface);

        let dest = AddressHash::new_from_rand(OsRng);
        let blob = new_random_blob(OsRng, crate::transport::time::now_epoch_secs_u64());
        let mut data = blob.to_vec();
        data.extend_from_slice(b"announce-payload");

        let packet = Packet {
            header: Header { packet_type: PacketType::Announce, ..Default::default() },
            destination: dest,
            data: crate::packet::PacketDataBuffer::new_from_slice(&data),
            ..Default::default()
        };

        let outcome = transport.inbound(packet, iface_handle);
        assert_eq!(outcome, PacketOutcome::Admitted);

        let locked = transport.locked.lock().unwrap();
        assert!(locked.tables.path.contains_key(&dest));
        assert!(locked.tables.announce_table.contains_key(&dest));
        assert_eq!(locked.tables.path[&dest].hops, 1);
    }

    #[test]
    fn duplicate_data_packet_is_rejected_second_time() {
        let transport = transport();
        let iface = TestInterface::new(InterfaceMode::Full, false);
        let iface_handle = iface.get_hash();
        transport.register_interface(iface);

        let packet = Packet {
            destination: AddressHash::new_from_rand(OsRng),
            data: crate::packet::PacketDataBuffer::new_from_slice(b"hello"),
            ..Default::default()
        };

        let first = transport.inbound(packet, iface_handle);
        let second = transport.inbound(packet, iface_handle);

        assert!(!first.is_dropped());
        assert_eq!(second, PacketOutcome::Dropped(DropReason::Duplicate));
    }

    #[test]
    fn tunnel_restoration_grafts_stored_paths() {
        let transport = transport();
        let iface = TestInterface::new(InterfaceMode::Full, false);
        let iface_handle = iface.get_hash();
        transport.register_interface(iface);

        let dest = AddressHash::new_from_rand(OsRng);
        let tunnel_id = AddressHash::new_from_rand(OsRng);
        {
            let mut locked = transport.locked.lock().unwrap();
            let mut paths = HashMap::new();
            paths.insert(
                dest,
                PathEntry {
                    timestamp: 0.0,
                    next_hop: AddressHash::new_from_rand(OsRng),
                    hops: 2,
                    expires: now_epoch_secs_f64() + 1000.0,
                    random_blobs: VecDeque::new(),
                    receiving_interface: AddressHash::new_from_rand(OsRng),
                    announce_packet_hash: None,
                },
            );
            locked.tables.tunnels.insert(tunnel_id, TunnelEntry { interface: None, paths, expires: now_epoch_secs_f64() + 1000.0 });
        }

        transport.handle_tunnel(tunnel_id, iface_handle);

        let locked = transport.locked.lock().unwrap();
        assert_eq!(locked.tables.tunnels[&tunnel_id].interface, Some(iface_handle));
        assert_eq!(locked.tables.path[&dest].receiving_interface, iface_handle);
    }

    #[test]
    fn packet_filter_rejects_loop_on_plain_destination() {
        let transport = transport();
        let mut locked = Locked {
            tables: Tables::new(),
            hashlist: Hashlist::new(1000),
            receipts: ReceiptTable::new(),
            announce_queues: HashMap::new(),
            announce_allowed_at: HashMap::new(),
        };

        let packet = Packet {
            header: Header { destination_type: DestinationType::Plain, hops: 5, ..Default::default() },
            ..Default::default()
        };

        match transport.packet_filter(&mut locked, &packet) {
            FilterVerdict::Drop(DropReason::Loop) => {}
            other => panic!("expected Loop drop, got {other:?}"),
        }
    }

    impl std::fmt::Debug for FilterVerdict {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                FilterVerdict::Admit { defer_hash } => write!(f, "Admit{{defer_hash: {defer_hash}}}"),
                FilterVerdict::Drop(reason) => write!(f, "Drop({reason:?})"),
            }
        }
    }
}
