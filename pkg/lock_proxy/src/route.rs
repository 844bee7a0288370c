//! Per-partition outstanding-request bookkeeping (SPEC_FULL.md §4.8). Pure
//! data structure, no networking, so the FIFO and failover-drain behavior
//! can be unit tested directly — mirroring `lock_table::partition`'s own
//! split between pure state and the `server.rs` networking around it.

use std::collections::VecDeque;

use cluster_wire::LockReply;
use common::async_std::channel;
use common::bytes::Bytes;

/// One request this proxy forwarded upstream and has not yet gotten a
/// reply for.
pub struct PendingEntry {
    pub subid: u64,
    pub key: Bytes,
    pub reply_tx: channel::Sender<LockReply>,
}

/// Tracks the outstanding FIFO for one partition plus whether its owning
/// node is currently believed reachable. `owner` is fixed at construction
/// (partition ownership is a static function of rank, see
/// `bin/ltpx.rs::owner_of`); what can change at runtime is `available`.
pub struct Route {
    pub owner: String,
    available: bool,
    pending: VecDeque<PendingEntry>,
}

impl Route {
    pub fn new(owner: String) -> Self {
        Route { owner, available: true, pending: VecDeque::new() }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn push(&mut self, entry: PendingEntry) {
        self.pending.push_back(entry);
    }

    /// Removes and returns the first pending entry whose (subid, key)
    /// matches an incoming `LockReply`. SPEC_FULL.md §4.8: "pop the
    /// matching request from the FIFO and forward to the client. If no
    /// match is found, drop and log."
    pub fn take_match(&mut self, subid: u64, key: &Bytes) -> Option<PendingEntry> {
        let pos = self.pending.iter().position(|e| e.subid == subid && e.key == *key)?;
        self.pending.remove(pos)
    }

    /// Drains every outstanding request, returning them so the caller can
    /// synthesize a `TryFailed` reply for each (SPEC_FULL.md §4.8
    /// partition-master failover).
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(subid: u64, key: &[u8]) -> (PendingEntry, channel::Receiver<LockReply>) {
        let (tx, rx) = channel::bounded(1);
        (PendingEntry { subid, key: Bytes::copy_from_slice(key), reply_tx: tx }, rx)
    }

    #[test]
    fn take_match_removes_only_the_matching_entry() {
        let mut route = Route::new("a".to_string());
        let (e1, _r1) = entry(1, b"x");
        let (e2, _r2) = entry(2, b"y");
        route.push(e1);
        route.push(e2);
        assert_eq!(route.len(), 2);

        let matched = route.take_match(2, &Bytes::copy_from_slice(b"y")).unwrap();
        assert_eq!(matched.subid, 2);
        assert_eq!(route.len(), 1);

        assert!(route.take_match(2, &Bytes::copy_from_slice(b"y")).is_none());
    }

    #[test]
    fn drain_empties_the_fifo() {
        let mut route = Route::new("a".to_string());
        let (e1, _r1) = entry(1, b"x");
        let (e2, _r2) = entry(2, b"y");
        route.push(e1);
        route.push(e2);

        let drained = route.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(route.len(), 0);
    }

    #[test]
    fn fresh_route_is_available() {
        let route = Route::new("a".to_string());
        assert!(route.is_available());
    }
}
