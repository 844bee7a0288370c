//! The node registry: every server/client this process has ever seen log
//! in, kept in an arena-indexed doubly-linked LRU so the heartbeat sweep
//! (see `heartbeat.rs`) can walk from the stalest entry without touching a
//! `HashMap` iterator's arbitrary order.
//!
//! Grounded on `examples/original_source/gulm/src/core_nodelists.c`'s
//! `move_to_mru`/`remove_from_lru`/`beat_node`/`check_beats` pair of
//! intrusive-list primitives and `add_node`/`Mark_Loggedin`/`Mark_Loggedout`/
//! `Mark_Expired`/`Mark_Old_Master_lgin` state transitions. The C original
//! threads an `LLi_t` list node through every `Node_t`; this rendition uses
//! a `Vec<Slot>` arena with `Option<usize>` links instead of raw pointers.

use std::collections::HashMap;

use cluster_wire::NodeState;

/// Decides whether a claimed (name, IP) pair is allowed to log in. The
/// default implementation trusts every claim; a real deployment would wire
/// this up to DNS plus `/etc/cluster/nodes` or equivalent (SPEC_FULL.md
/// §4.2's "external authorization hook").
pub trait AuthorizationHook: Send + Sync {
    fn authorize(&self, name: &str, ip: &[u8; 16]) -> bool;
}

pub struct AllowAll;

impl AuthorizationHook for AllowAll {
    fn authorize(&self, _name: &str, _ip: &[u8; 16]) -> bool {
        true
    }
}

/// Test/fixed-topology hook: a name is authorized only for the IP on file.
/// An unknown name is rejected outright.
pub struct StaticMap(HashMap<String, [u8; 16]>);

impl StaticMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, name: &str, ip: [u8; 16]) {
        self.0.insert(name.to_string(), ip);
    }
}

impl AuthorizationHook for StaticMap {
    fn authorize(&self, name: &str, ip: &[u8; 16]) -> bool {
        self.0.get(name).map(|known| known == ip).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub ip: [u8; 16],
    pub state: NodeState,
    pub last_beat_micros: u64,
    pub missed_beats: u16,
}

#[derive(Debug)]
pub enum LoginError {
    AuthRejected,
}

struct Slot {
    node: Node,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An intrusive LRU over an arena of slots. `head` is the most-recently
/// touched entry, `tail` the stalest (next in line for expiry scanning).
pub struct NodeRegistry {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|i| &self.slots[*i].as_ref().unwrap().node)
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = {
            let s = self.slots[i].as_ref().unwrap();
            (s.prev, s.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    /// Splices slot `i` in at the head (most-recently-touched position).
    fn push_front(&mut self, i: usize) {
        let old_head = self.head;
        {
            let s = self.slots[i].as_mut().unwrap();
            s.prev = None;
            s.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(i);
        }
        self.head = Some(i);
        if self.tail.is_none() {
            self.tail = Some(i);
        }
    }

    fn move_to_mru(&mut self, i: usize) {
        if self.head == Some(i) {
            return;
        }
        self.unlink(i);
        self.push_front(i);
    }

    fn alloc_slot(&mut self, node: Node) -> usize {
        let slot = Slot {
            node,
            prev: None,
            next: None,
        };
        if let Some(i) = self.free.pop() {
            self.slots[i] = Some(slot);
            i
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    /// Equivalent of `add_node`/`Mark_Loggedin`: inserts the node if unknown
    /// or updates an existing entry's IP and state, authorizes the claim,
    /// repositions to MRU, and stamps `last_beat_micros` so it is not
    /// immediately swept as missed (mirrors `beat_all_once` being implied
    /// by a fresh login).
    pub fn mark_login(
        &mut self,
        name: &str,
        ip: [u8; 16],
        now_micros: u64,
        hook: &dyn AuthorizationHook,
    ) -> Result<(), LoginError> {
        if !hook.authorize(name, &ip) {
            return Err(LoginError::AuthRejected);
        }

        if let Some(&i) = self.index.get(name) {
            {
                let node = &mut self.slots[i].as_mut().unwrap().node;
                node.ip = ip;
                node.state = NodeState::LoggedIn;
                node.last_beat_micros = now_micros;
                node.missed_beats = 0;
            }
            self.move_to_mru(i);
        } else {
            let node = Node {
                name: name.to_string(),
                ip,
                state: NodeState::LoggedIn,
                last_beat_micros: now_micros,
                missed_beats: 0,
            };
            let i = self.alloc_slot(node);
            self.index.insert(name.to_string(), i);
            self.push_front(i);
        }
        Ok(())
    }

    /// A node tagged `OldMasterLoggedIn` by the reconciliation sweep may
    /// re-authenticate directly without passing back through `LoggedOut`
    /// first (SPEC_FULL.md §4.3).
    pub fn mark_old_master_relogin(
        &mut self,
        name: &str,
        ip: [u8; 16],
        now_micros: u64,
        hook: &dyn AuthorizationHook,
    ) -> Result<(), LoginError> {
        self.mark_login(name, ip, now_micros, hook)
    }

    /// Applies a membership delta received from another process's
    /// authoritative replicator (SPEC_FULL.md §4.6's "slaves apply the
    /// triple verbatim to their local registry"). Bypasses
    /// `AuthorizationHook` entirely: the remote master already authorized
    /// the claim, and the hook's decision is not itself part of the wire
    /// triple, so there is nothing left here to re-check.
    pub fn apply_replicated_update(&mut self, name: &str, ip: [u8; 16], state: NodeState, now_micros: u64) {
        if let Some(&i) = self.index.get(name) {
            {
                let node = &mut self.slots[i].as_mut().unwrap().node;
                node.ip = ip;
                node.state = state;
                if state == NodeState::LoggedIn {
                    node.last_beat_micros = now_micros;
                    node.missed_beats = 0;
                }
            }
            self.move_to_mru(i);
        } else {
            let node = Node {
                name: name.to_string(),
                ip,
                state,
                last_beat_micros: now_micros,
                missed_beats: 0,
            };
            let i = self.alloc_slot(node);
            self.index.insert(name.to_string(), i);
            self.push_front(i);
        }
    }

    fn set_state(&mut self, name: &str, state: NodeState) -> bool {
        match self.index.get(name) {
            Some(&i) => {
                self.slots[i].as_mut().unwrap().node.state = state;
                true
            }
            None => false,
        }
    }

    pub fn mark_logout(&mut self, name: &str) -> bool {
        self.set_state(name, NodeState::LoggedOut)
    }

    pub fn mark_expired(&mut self, name: &str) -> bool {
        self.set_state(name, NodeState::Expired)
    }

    pub fn mark_killed(&mut self, name: &str) -> bool {
        self.set_state(name, NodeState::Killed)
    }

    /// `beat_node`: a heartbeat arrived for `name`. Resets missed-beats,
    /// stamps the current time and repositions to MRU.
    pub fn beat(&mut self, name: &str, now_micros: u64) -> bool {
        match self.index.get(name).copied() {
            Some(i) => {
                {
                    let node = &mut self.slots[i].as_mut().unwrap().node;
                    node.last_beat_micros = now_micros;
                    node.missed_beats = 0;
                }
                self.move_to_mru(i);
                true
            }
            None => false,
        }
    }

    /// `beat_all_once`: stamps every currently logged-in node with `now`,
    /// run once right after a Master takeover so a cascade of stale
    /// heartbeats does not look like a mass expiry.
    pub fn beat_all_once(&mut self, now_micros: u64) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.node.state == NodeState::LoggedIn {
                slot.node.last_beat_micros = now_micros;
                slot.node.missed_beats = 0;
            }
        }
    }

    /// `Mark_Old_Master_lgin`: on losing the master, every node this
    /// process still believes is logged in is tagged `OldMasterLoggedIn`
    /// rather than dropped, so the registry survives an election without
    /// forgetting who was present. Returns the names touched.
    pub fn mark_all_old_master_login(&mut self) -> Vec<String> {
        let mut touched = vec![];
        for slot in self.slots.iter_mut().flatten() {
            if slot.node.state == NodeState::LoggedIn {
                slot.node.state = NodeState::OldMasterLoggedIn;
                touched.push(slot.node.name.clone());
            }
        }
        touched
    }

    /// Removes a node entirely (used once a `Killed` update has been
    /// observed and its holders/waiters drained downstream).
    pub fn remove(&mut self, name: &str) -> Option<Node> {
        let i = self.index.remove(name)?;
        self.unlink(i);
        let slot = self.slots[i].take().unwrap();
        self.free.push(i);
        Some(slot.node)
    }

    /// Iterates from the LRU tail (stalest) towards the head, the order
    /// the heartbeat sweep (`check_beats`) walks in.
    pub fn iter_from_tail(&self) -> impl Iterator<Item = &Node> {
        TailIter {
            registry: self,
            cur: self.tail,
        }
    }

    /// Iterates by name, the order `fdump_nodes`/admin dumps use.
    pub fn iter_by_name(&self) -> impl Iterator<Item = &Node> {
        let mut names: Vec<&String> = self.index.keys().collect();
        names.sort();
        names.into_iter().map(move |n| self.get(n).unwrap())
    }

    /// Sets `missed_beats` directly without touching LRU position or
    /// `last_beat_micros`. Used by the heartbeat sweep, which needs to bump
    /// the counter and restamp the clock as two separate steps.
    pub fn set_missed_beats(&mut self, name: &str, missed_beats: u16) {
        if let Some(&i) = self.index.get(name) {
            self.slots[i].as_mut().unwrap().node.missed_beats = missed_beats;
        }
    }
}

struct TailIter<'a> {
    registry: &'a NodeRegistry,
    cur: Option<usize>,
}

impl<'a> Iterator for TailIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.cur?;
        let slot = self.registry.slots[i].as_ref().unwrap();
        self.cur = slot.prev;
        Some(&slot.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> [u8; 16] {
        let mut v = [0u8; 16];
        v[15] = n;
        v
    }

    #[test]
    fn login_inserts_and_authorizes() {
        let mut reg = NodeRegistry::new();
        assert!(reg.mark_login("a", ip(1), 100, &AllowAll).is_ok());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("a").unwrap().state, NodeState::LoggedIn);
    }

    #[test]
    fn login_rejected_by_hook() {
        let mut hook = StaticMap::new();
        hook.set("a", ip(9));
        let mut reg = NodeRegistry::new();
        assert!(reg.mark_login("a", ip(1), 100, &hook).is_err());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn beat_moves_to_mru_and_resets_misses() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();
        reg.mark_login("b", ip(2), 0, &AllowAll).unwrap();
        reg.set_missed_beats("a", 2);

        // tail should be "a" (oldest inserted, least-recently touched).
        let tail_name = reg.iter_from_tail().next().unwrap().name.clone();
        assert_eq!(tail_name, "a");

        reg.beat("a", 500);
        assert_eq!(reg.get("a").unwrap().missed_beats, 0);
        assert_eq!(reg.get("a").unwrap().last_beat_micros, 500);

        // "a" is now MRU, so "b" is the new tail.
        let tail_name = reg.iter_from_tail().next().unwrap().name.clone();
        assert_eq!(tail_name, "b");
    }

    #[test]
    fn old_master_relogin_skips_loggedout() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();
        let touched = reg.mark_all_old_master_login();
        assert_eq!(touched, vec!["a".to_string()]);
        assert_eq!(reg.get("a").unwrap().state, NodeState::OldMasterLoggedIn);

        reg.mark_old_master_relogin("a", ip(1), 1000, &AllowAll).unwrap();
        assert_eq!(reg.get("a").unwrap().state, NodeState::LoggedIn);
    }

    #[test]
    fn replicated_update_bypasses_auth_and_inserts() {
        let mut reg = NodeRegistry::new();
        reg.apply_replicated_update("a", ip(1), NodeState::LoggedIn, 100);
        assert_eq!(reg.get("a").unwrap().state, NodeState::LoggedIn);
        assert_eq!(reg.get("a").unwrap().last_beat_micros, 100);

        reg.apply_replicated_update("a", ip(1), NodeState::Expired, 200);
        assert_eq!(reg.get("a").unwrap().state, NodeState::Expired);
        // Expiry does not restamp the heartbeat clock.
        assert_eq!(reg.get("a").unwrap().last_beat_micros, 100);
    }

    #[test]
    fn remove_drops_from_lru_and_index() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();
        reg.mark_login("b", ip(2), 0, &AllowAll).unwrap();
        reg.remove("a");
        assert_eq!(reg.len(), 1);
        assert!(reg.get("a").is_none());
        let names: Vec<String> = reg.iter_from_tail().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();
        reg.remove("a");
        reg.mark_login("b", ip(2), 0, &AllowAll).unwrap();
        assert_eq!(reg.slots.len(), 1);
    }
}
