mod id;

use crate::hash::AddressHash;

/// Identifier for an established link, derived from the link-request packet
/// that created it (see [`id`]).
pub type LinkId = AddressHash;
