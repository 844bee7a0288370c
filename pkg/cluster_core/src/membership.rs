//! Membership replication fan-out (SPEC_FULL.md §4.6), grounded on
//! `core_nodelists.c`'s `send_mbrshp_to_slaves`/`_send_mbrshp_to_node` (push
//! triples to everyone who should know) and `Logout_leftovers`/
//! `_inner_Logout_leftovers` (the post-promotion "dirty sweep" that
//! synthesizes the update a subscriber missed while we had no master).

use cluster_wire::{MembershipUpdate, NodeState};

use crate::registry::NodeRegistry;

/// A connected peer/subscriber this process forwards membership deltas to.
/// The bounded channel mirrors SPEC_FULL.md §5's backpressure policy: a
/// full queue is dropped, never awaited, so one slow subscriber cannot
/// stall the registry's owning task.
pub struct Subscriber {
    pub name: String,
    pub sender: common::async_std::channel::Sender<MembershipUpdate>,
}

pub struct Replicator {
    subscribers: Vec<Subscriber>,
}

impl Replicator {
    pub fn new() -> Self {
        Self { subscribers: vec![] }
    }

    pub fn add(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn remove(&mut self, name: &str) {
        self.subscribers.retain(|s| s.name != name);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Pushes one update to every subscriber. A full or closed channel is
    /// silently dropped (`try_send`), matching the non-blocking fan-out
    /// policy; the subscriber is expected to catch up via a full
    /// membership list request if it falls behind.
    pub fn announce(&self, update: MembershipUpdate) {
        for sub in &self.subscribers {
            let _ = sub.sender.try_send(update.clone());
        }
    }
}

/// `Logout_leftovers`: run once right after a slave promotes to Master.
/// Every node the registry still thinks is not `LoggedIn` gets a synthetic
/// update describing what subscribers most likely missed while this
/// process had no master to relay through. `OldMasterLoggedIn` nodes are
/// excluded: they are still mid-reconciliation and get resolved by the
/// caller (`core.rs`) separately once it decides whether they re-logged in
/// within the forgiveness window.
pub fn dirty_sweep(registry: &NodeRegistry) -> Vec<MembershipUpdate> {
    let mut updates = vec![];
    for node in registry.iter_by_name() {
        // A `Killed` node always gets the `Expired` update synthesized
        // first too: SPEC_FULL.md §8.I5 requires every `Killed` on the wire
        // to be preceded by an `Expired` for the same node, and a sweep that
        // emitted `Killed` alone (because this process never relayed the
        // original `Expired` while it had no master) would violate that for
        // any subscriber that only now first hears about the node at all.
        let synthetic: &[NodeState] = match node.state {
            NodeState::LoggedOut => &[NodeState::LoggedOut],
            NodeState::Expired => &[NodeState::Expired],
            NodeState::Killed => &[NodeState::Expired, NodeState::Killed],
            NodeState::LoggedIn | NodeState::OldMasterLoggedIn => &[],
            NodeState::Unknown(_) => &[],
        };
        for &state in synthetic {
            updates.push(MembershipUpdate {
                node_name: node.name.clone(),
                new_state: state,
                node_ip: node.ip,
            });
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AllowAll;

    fn ip(n: u8) -> [u8; 16] {
        let mut v = [0u8; 16];
        v[15] = n;
        v
    }

    #[test]
    fn announce_skips_closed_or_full_channels() {
        let mut rep = Replicator::new();
        let (tx, rx) = common::async_std::channel::bounded(1);
        rep.add(Subscriber {
            name: "sub-a".to_string(),
            sender: tx,
        });
        rep.announce(MembershipUpdate {
            node_name: "x".to_string(),
            new_state: NodeState::LoggedIn,
            node_ip: ip(1),
        });
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn dirty_sweep_only_covers_non_loggedin_non_oldmaster() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();
        reg.mark_login("b", ip(2), 0, &AllowAll).unwrap();
        reg.mark_logout("a");
        reg.mark_all_old_master_login(); // tags "b" as OldMasterLoggedIn

        let updates = dirty_sweep(&reg);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].node_name, "a");
        assert_eq!(updates[0].new_state, NodeState::LoggedOut);
    }
}
