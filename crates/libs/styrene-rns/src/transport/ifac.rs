//! Interface Access Code framing: optional per-interface obfuscation and
//! authentication layered over the raw packet bytes before they hit the wire.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::RnsError;
use crate::identity::{hkdf_keystream, PrivateIdentity};

pub const IFAC_FLAG_BIT: u8 = 0x80;

/// Per-interface IFAC capability: a shared signing identity derived from the
/// interface's access-code passphrase, a salt, and the IFAC tag length.
pub struct IfacConfig<'a> {
    pub identity: &'a PrivateIdentity,
    pub key: &'a [u8],
    pub size: usize,
}

fn ifac_tag(identity: &PrivateIdentity, raw: &[u8], size: usize) -> Result<Vec<u8>, RnsError> {
    let signature = identity.sign(raw).to_bytes();
    if size > signature.len() {
        return Err(RnsError::InvalidArgument);
    }
    Ok(signature[signature.len() - size..].to_vec())
}

/// Frames `raw` (an unmasked, already-serialized packet) for transmission on
/// an IFAC-protected interface.
pub fn mask(raw: &[u8], config: &IfacConfig) -> Result<Vec<u8>, RnsError> {
    if raw.len() < 2 {
        return Err(RnsError::InvalidArgument);
    }

    let ifac = ifac_tag(config.identity, raw, config.size)?;

    let mut framed = Vec::with_capacity(2 + config.size + raw.len() - 2);
    framed.push(raw[0] | IFAC_FLAG_BIT);
    framed.push(raw[1]);
    framed.extend_from_slice(&ifac);
    framed.extend_from_slice(&raw[2..]);

    let mut keystream = vec![0u8; framed.len()];
    hkdf_keystream(&ifac, config.key, keystream.len(), &mut keystream)?;

    for (i, byte) in framed.iter_mut().enumerate() {
        if i >= 2 && i < 2 + config.size {
            continue;
        }
        *byte ^= keystream[i];
    }

    framed[0] |= IFAC_FLAG_BIT;

    Ok(framed)
}

/// Unmasks an IFAC-framed packet, verifying the attached tag against a
/// freshly recomputed one. Returns the cleaned bytes (IFAC flag bit cleared)
/// on success.
pub fn unmask(framed: &[u8], config: &IfacConfig) -> Result<Vec<u8>, RnsError> {
    if framed.len() < 2 + config.size {
        return Err(RnsError::InvalidArgument);
    }
    if framed[0] & IFAC_FLAG_BIT == 0 {
        return Err(RnsError::InvalidArgument);
    }

    let received_ifac = framed[2..2 + config.size].to_vec();

    let mut keystream = vec![0u8; framed.len()];
    hkdf_keystream(&received_ifac, config.key, keystream.len(), &mut keystream)?;

    let mut cleaned = framed.to_vec();
    for (i, byte) in cleaned.iter_mut().enumerate() {
        if i >= 2 && i < 2 + config.size {
            continue;
        }
        *byte ^= keystream[i];
    }
    cleaned[0] &= !IFAC_FLAG_BIT;

    let mut raw = Vec::with_capacity(framed.len() - config.size);
    raw.push(cleaned[0]);
    raw.push(cleaned[1]);
    raw.extend_from_slice(&cleaned[2 + config.size..]);

    let expected = ifac_tag(config.identity, &raw, config.size)?;
    if expected != received_ifac {
        return Err(RnsError::IncorrectSignature);
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{mask, unmask, IfacConfig, IFAC_FLAG_BIT};
    use crate::identity::PrivateIdentity;

    #[test]
    fn mask_then_unmask_recovers_original_and_sets_flag() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let config = IfacConfig { identity: &identity, key: b"interface-salt", size: 8 };

        let raw = b"\x01\x00destination-and-payload-bytes".to_vec();
        let framed = mask(&raw, &config).expect("mask");

        assert_eq!(framed[0] & IFAC_FLAG_BIT, IFAC_FLAG_BIT);

        let recovered = unmask(&framed, &config).expect("unmask");
        assert_eq!(recovered, raw);
    }

    #[test]
    fn unmask_rejects_tampered_frame() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let config = IfacConfig { identity: &identity, key: b"interface-salt", size: 8 };

        let raw = b"\x01\x00payload".to_vec();
        let mut framed = mask(&raw, &config).expect("mask");
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;

        assert!(unmask(&framed, &config).is_err());
    }
}
