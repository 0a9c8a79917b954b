//! Delivery receipts for locally originated DATA packets (§4.3 step 1,
//! §4.4 "Proof (non-LRPROOF)", §4.8 "Receipts").
//!
//! Receipts are kept in FIFO order so the oldest can be evicted first once
//! the table grows past `max_receipts`; that eviction calls the receipt's
//! timeout rather than silently dropping it, matching the "no table mutation
//! skips a callback" rule in §7.

use std::collections::VecDeque;

use crate::hash::{AddressHash, Hash};
use crate::packet::PacketContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Failed,
}

/// Contexts that never generate a receipt even when the caller asked for one
/// (§4.3 step 1: link-control and resource contexts).
fn is_receiptless_context(context: PacketContext) -> bool {
    context.is_link_protocol()
        || matches!(
            context,
            PacketContext::LinkIdentify
                | PacketContext::LinkClose
                | PacketContext::LinkProof
                | PacketContext::LinkRtt
                | PacketContext::LinkRequestProof
        )
}

/// Whether a locally originated packet is eligible for a receipt at all
/// (§4.3 step 1): `create_receipt` requested, a DATA packet, destination
/// type not PLAIN, and not a link/resource control context.
pub fn receipt_eligible(
    create_receipt: bool,
    is_data: bool,
    destination_is_plain: bool,
    context: PacketContext,
) -> bool {
    create_receipt && is_data && !destination_is_plain && !is_receiptless_context(context)
}

#[derive(Debug, Clone)]
pub struct Receipt {
    pub packet_hash: Hash,
    pub destination_hash: AddressHash,
    pub timestamp: f64,
    pub timeout_at: Option<f64>,
    pub status: ReceiptStatus,
}

impl Receipt {
    pub fn new(packet_hash: Hash, destination_hash: AddressHash, now: f64, timeout: Option<f64>) -> Self {
        Self {
            packet_hash,
            destination_hash,
            timestamp: now,
            timeout_at: timeout.map(|t| now + t),
            status: ReceiptStatus::Sent,
        }
    }

    pub fn is_timed_out(&self, now: f64) -> bool {
        matches!(self.timeout_at, Some(at) if now >= at)
    }
}

/// FIFO table of outstanding receipts, bounded at `max_receipts` (§4.8,
/// invariant-adjacent to §3's `MAX_RECEIPTS=1024`).
#[derive(Default)]
pub struct ReceiptTable {
    order: VecDeque<Hash>,
    by_hash: std::collections::HashMap<Hash, Receipt>,
}

impl ReceiptTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn insert(&mut self, receipt: Receipt) {
        self.order.push_back(receipt.packet_hash);
        self.by_hash.insert(receipt.packet_hash, receipt);
    }

    /// Evicts the oldest receipts until the table is at or below `max`,
    /// returning the evicted entries so the caller can invoke their timeout
    /// (§4.8 "pop oldest until <= MAX_RECEIPTS").
    pub fn evict_over_capacity(&mut self, max: usize) -> Vec<Receipt> {
        let mut evicted = Vec::new();
        while self.order.len() > max {
            if let Some(hash) = self.order.pop_front() {
                if let Some(receipt) = self.by_hash.remove(&hash) {
                    evicted.push(receipt);
                }
            }
        }
        evicted
    }

    /// Drops every receipt not in `Sent` state and every receipt whose
    /// timeout has elapsed, returning the removed ones (§4.8 "invoke
    /// per-receipt timeout; drop any not in SENT state").
    pub fn sweep_timeouts(&mut self, now: f64) -> Vec<Receipt> {
        let mut timed_out = Vec::new();
        self.order.retain(|hash| {
            let Some(receipt) = self.by_hash.get(hash) else { return false };
            let keep = receipt.status == ReceiptStatus::Sent && !receipt.is_timed_out(now);
            if !keep {
                if let Some(receipt) = self.by_hash.remove(hash) {
                    timed_out.push(receipt);
                }
            }
            keep
        });
        timed_out
    }

    /// Explicit-hash proof validation (§4.4 "Proof (non-LRPROOF)").
    pub fn validate_explicit(&mut self, hash: &Hash) -> Option<Receipt> {
        if let Some(receipt) = self.by_hash.get(hash) {
            if receipt.packet_hash == *hash {
                let hash = receipt.packet_hash;
                self.order.retain(|h| *h != hash);
                return self.by_hash.remove(&hash).map(|mut r| {
                    r.status = ReceiptStatus::Delivered;
                    r
                });
            }
        }
        None
    }

    /// Implicit validation: a proof with no explicit hash is tried against
    /// every outstanding receipt (§4.4, §9 "Open question — implicit proof
    /// scan"). Returns the first match, if any.
    pub fn validate_implicit(&mut self, matches: impl Fn(&Receipt) -> bool) -> Option<Receipt> {
        let found = self.order.iter().find(|hash| {
            self.by_hash.get(*hash).map(|r| matches(r)).unwrap_or(false)
        }).copied();

        found.and_then(|hash| {
            self.order.retain(|h| *h != hash);
            self.by_hash.remove(&hash).map(|mut r| {
                r.status = ReceiptStatus::Delivered;
                r
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn sample_receipt(now: f64) -> Receipt {
        Receipt::new(Hash::new_from_rand(OsRng), AddressHash::new_from_rand(OsRng), now, Some(10.0))
    }

    #[test]
    fn eviction_over_capacity_pops_oldest_first() {
        let mut table = ReceiptTable::new();
        let first = sample_receipt(0.0);
        let first_hash = first.packet_hash;
        table.insert(first);
        table.insert(sample_receipt(1.0));
        table.insert(sample_receipt(2.0));

        let evicted = table.evict_over_capacity(2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].packet_hash, first_hash);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn explicit_validation_removes_and_marks_delivered() {
        let mut table = ReceiptTable::new();
        let receipt = sample_receipt(0.0);
        let hash = receipt.packet_hash;
        table.insert(receipt);

        let validated = table.validate_explicit(&hash).expect("match");
        assert_eq!(validated.status, ReceiptStatus::Delivered);
        assert!(table.is_empty());
    }

    #[test]
    fn timeout_sweep_drops_expired_receipts() {
        let mut table = ReceiptTable::new();
        table.insert(sample_receipt(0.0));
        let timed_out = table.sweep_timeouts(20.0);
        assert_eq!(timed_out.len(), 1);
        assert!(table.is_empty());
    }
}
