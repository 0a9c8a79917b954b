use std::collections::HashSet;

use crate::hash::Hash;

/// Two-generation approximate sliding-window set for packet-hash de-duplication.
///
/// `current` absorbs new hashes; once it exceeds `hashlist_maxsize / 2` it is
/// rotated into `previous` and a fresh empty `current` is installed. A hash is
/// considered a duplicate if it is present in either generation.
pub struct Hashlist {
    current: HashSet<[u8; 32]>,
    previous: HashSet<[u8; 32]>,
    maxsize: usize,
}

impl Hashlist {
    pub fn new(maxsize: usize) -> Self {
        Self { current: HashSet::new(), previous: HashSet::new(), maxsize }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        let bytes = hash.to_bytes();
        self.current.contains(&bytes) || self.previous.contains(&bytes)
    }

    /// Inserts `hash`, rotating generations if `current` has grown past half
    /// of `maxsize`. Returns `true` if the hash was newly inserted.
    pub fn insert(&mut self, hash: &Hash) -> bool {
        let bytes = hash.to_bytes();
        if self.current.contains(&bytes) || self.previous.contains(&bytes) {
            return false;
        }

        if self.current.len() >= self.maxsize / 2 {
            self.previous = core::mem::take(&mut self.current);
        }

        self.current.insert(bytes)
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn previous_len(&self) -> usize {
        self.previous.len()
    }

    /// Forces a rotation regardless of size; used by the maintenance loop's
    /// hashlist-rotation sweep once `current` exceeds half of `maxsize`.
    pub fn rotate_if_full(&mut self) {
        if self.current.len() > self.maxsize / 2 {
            self.previous = core::mem::take(&mut self.current);
        }
    }

    /// Current-generation hashes, for persistence (§4.9: current only).
    pub fn current_hashes(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.current.iter()
    }

    pub fn load_current(&mut self, hashes: impl IntoIterator<Item = [u8; 32]>) {
        self.current.extend(hashes);
    }
}

#[cfg(test)]
mod tests {
    use super::Hashlist;
    use crate::hash::Hash;
    use rand_core::OsRng;

    #[test]
    fn duplicate_rejected_within_generation() {
        let mut list = Hashlist::new(1000);
        let hash = Hash::new_from_rand(OsRng);

        assert!(list.insert(&hash));
        assert!(!list.insert(&hash));
        assert!(list.contains(&hash));
    }

    #[test]
    fn rotation_preserves_previous_generation_membership() {
        let mut list = Hashlist::new(4);
        let first = Hash::new_from_rand(OsRng);
        list.insert(&first);
        // Fill current past half of maxsize (2) to force rotation on next insert.
        list.insert(&Hash::new_from_rand(OsRng));
        list.insert(&Hash::new_from_rand(OsRng));

        assert!(list.contains(&first));
    }
}
