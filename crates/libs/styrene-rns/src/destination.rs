use alloc::vec;
use alloc::vec::Vec;
use rand_core::OsRng;

use crate::crypt::fernet::{Fernet, PlainText, Token};
use crate::error::RnsError;
use crate::packet::DestinationType;

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

pub trait Type {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Plain;
pub struct Group;
pub struct Link;

impl Type for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Type for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

impl Type for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

impl Type for Link {
    fn destination_type() -> DestinationType {
        DestinationType::Link
    }
}

/// Encrypts `data` under a Fernet instance keyed directly by the 16-byte
/// group/plain key (no HKDF expansion), matching the GROUP destination
/// contract: identical key in, identical key out.
pub fn group_encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let fernet = Fernet::new_from_slices(key, key, OsRng);
    let mut out_buf = vec![0u8; data.len() + 64];
    let token = fernet.encrypt(PlainText::from(data), &mut out_buf)?;
    Ok(token.as_bytes().to_vec())
}

pub fn group_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let fernet = Fernet::new_from_slices(key, key, OsRng);
    let token = Token::from(data);
    let verified = fernet.verify(token)?;
    let mut out_buf = vec![0u8; data.len()];
    let plaintext = fernet.decrypt(verified, &mut out_buf)?;
    Ok(plaintext.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::{group_decrypt, group_encrypt};

    #[test]
    fn group_encrypt_decrypt_roundtrip() {
        let key = [7u8; 16];
        let token = group_encrypt(&key, b"group traffic").expect("encrypt");
        let plain = group_decrypt(&key, &token).expect("decrypt");
        assert_eq!(plain, b"group traffic");
    }
}
