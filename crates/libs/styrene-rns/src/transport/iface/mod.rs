//! The Interface contract consumed by the transport core. Concrete drivers
//! (serial, UDP, TCP, radio) live in host/external crates and implement
//! [`Interface`]; this module only defines what the core needs from them.

pub mod driver;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMode {
    Full,
    Gateway,
    AccessPoint,
    Roaming,
    Boundary,
}

/// Stable handle used by tables to reference an interface without owning it.
pub type InterfaceHandle = AddressHash;

/// What the transport core needs from a concrete interface driver.
///
/// Drivers are registered with the core under a stable [`InterfaceHandle`]
/// (`get_hash`); table entries store the handle and dereference through the
/// core's interface registry, so "interface no longer exists" is a natural
/// nil-lookup rather than a dangling reference.
pub trait Interface: Send + Sync {
    fn get_hash(&self) -> InterfaceHandle;

    fn name(&self) -> &str;

    /// Whether this interface can carry outbound traffic at all.
    fn out(&self) -> bool;

    fn bitrate(&self) -> u64;

    fn mode(&self) -> InterfaceMode;

    fn hw_mtu(&self) -> usize;

    fn autoconfigure_mtu(&self) -> bool;

    fn fixed_mtu(&self) -> Option<usize>;

    fn rxb(&self) -> u64;

    fn txb(&self) -> u64;

    fn ifac_key(&self) -> Option<&[u8]>;

    fn ifac_size(&self) -> Option<usize>;

    fn announce_rate_target(&self) -> Option<f64>;

    fn announce_rate_grace(&self) -> Option<f64>;

    fn announce_rate_penalty(&self) -> Option<f64>;

    fn parent_interface(&self) -> Option<InterfaceHandle>;

    fn tunnel_id(&self) -> Option<AddressHash>;

    fn detached(&self) -> bool;

    /// Whether clients directly attached to this interface are local
    /// (used for the "shared instance hops spoofing" visibility flag, §9).
    fn is_local_client(&self) -> bool {
        false
    }

    fn process_outgoing(&self, bytes: &[u8]) -> Result<(), RnsError>;

    fn sent_announce(&self);

    fn received_announce(&self);

    fn should_ingress_limit(&self) -> bool;

    fn hold_announce(&self, packet: Packet);

    fn process_held_announces(&self) -> Vec<Packet>;

    fn process_announce_queue(&self) -> Vec<Packet>;

    fn detach(&self);
}

pub fn display_name(iface: &dyn Interface) -> String {
    alloc::string::ToString::to_string(iface.name())
}
