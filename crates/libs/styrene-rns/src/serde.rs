use alloc::vec::Vec;

use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::packet::{Header, Packet, PacketContext};

/// Wire serialization for types that appear inside a [`Packet`]. Built on
/// `Vec<u8>` rather than a fixed input/output cursor, since every caller in
/// this crate already has an owned buffer by the time it serializes.
pub trait Serialize {
    fn serialize_into(&self, out: &mut Vec<u8>) -> Result<(), RnsError>;
}

impl Serialize for AddressHash {
    fn serialize_into(&self, out: &mut Vec<u8>) -> Result<(), RnsError> {
        out.extend_from_slice(self.as_slice());
        Ok(())
    }
}

impl Serialize for Header {
    fn serialize_into(&self, out: &mut Vec<u8>) -> Result<(), RnsError> {
        out.push(self.to_meta());
        out.push(self.hops);
        Ok(())
    }
}

impl Serialize for PacketContext {
    fn serialize_into(&self, out: &mut Vec<u8>) -> Result<(), RnsError> {
        out.push(*self as u8);
        Ok(())
    }
}

impl Serialize for Packet {
    fn serialize_into(&self, out: &mut Vec<u8>) -> Result<(), RnsError> {
        out.extend_from_slice(&self.to_bytes()?);
        Ok(())
    }
}

pub fn deserialize_packet(bytes: &[u8]) -> Result<Packet, RnsError> {
    Packet::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use rand_core::OsRng;

    use crate::hash::AddressHash;
    use crate::packet::{
        ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
        PacketType, PropagationType,
    };

    use super::{deserialize_packet, Serialize};

    #[test]
    fn serialize_deserialize_packet() {
        let packet = Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: ContextFlag::Unset,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 0,
            },
            ifac: None,
            destination: AddressHash::new_from_rand(OsRng),
            transport: None,
            context: PacketContext::None,
            data: crate::packet::PacketDataBuffer::new_from_slice(b"Hello, world!"),
        };

        let mut out = Vec::new();
        packet.serialize_into(&mut out).expect("serialized packet");

        let new_packet = deserialize_packet(&out).expect("deserialized packet");

        assert_eq!(packet.header, new_packet.header);
        assert_eq!(packet.destination, new_packet.destination);
        assert_eq!(packet.transport, new_packet.transport);
        assert_eq!(packet.context, new_packet.context);
        assert_eq!(packet.data.as_slice(), new_packet.data.as_slice());
    }
}
