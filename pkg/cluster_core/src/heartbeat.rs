//! Heartbeat and expiry sweep. Grounded on `core_nodelists.c`'s
//! `check_beats`: walk the LRU from the tail, bump `missed_beats` for any
//! node past its deadline, restamp it so the next miss is one full
//! `heartbeat_rate` away, and stop the instant a node under deadline is
//! found (everything ahead of it in MRU order is by definition fresher).

use crate::registry::NodeRegistry;
use cluster_wire::NodeState;

/// One node the sweep decided is now expired (missed more than
/// `allowed_misses` heartbeats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub name: String,
}

/// Pure translation of `check_beats`. Takes `now_micros` as a parameter
/// (rather than reading the clock itself) so it can be exercised
/// deterministically in tests.
///
/// Nodes not in `LoggedIn` state are not subject to expiry (a node that is
/// `OldMasterLoggedIn`, `LoggedOut`, `Expired` or `Killed` already has its
/// own resolution path).
pub fn sweep(
    registry: &mut NodeRegistry,
    heartbeat_rate_micros: u64,
    allowed_misses: u16,
    now_micros: u64,
) -> Vec<Expiry> {
    let mut due: Vec<String> = Vec::new();
    for node in registry.iter_from_tail() {
        if node.state != NodeState::LoggedIn {
            continue;
        }
        if node.last_beat_micros + heartbeat_rate_micros >= now_micros {
            // This node (and everything more recently touched than it) is
            // still within its deadline; nothing further down the MRU
            // order can be overdue either.
            break;
        }
        due.push(node.name.clone());
    }

    let mut expired = Vec::new();
    for name in due {
        // Restamp so a node that misses one beat is only re-flagged after
        // another full heartbeat_rate, rather than every sweep tick.
        let missed = {
            let node = registry.get(&name).unwrap();
            node.missed_beats + 1
        };
        registry.set_missed_beats(&name, missed);
        registry.beat(&name, now_micros);
        registry.set_missed_beats(&name, missed);

        if missed as u32 > allowed_misses as u32 {
            expired.push(Expiry { name });
        }
    }
    expired
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
    fn fresh_node_is_not_swept() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 1_000_000, &AllowAll).unwrap();
        let expired = sweep(&mut reg, 15_000_000, 2, 1_500_000);
        assert!(expired.is_empty());
    }

    #[test]
    fn one_missed_beat_increments_without_expiring() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();
        let expired = sweep(&mut reg, 1000, 2, 1500);
        assert!(expired.is_empty());
        assert_eq!(reg.get("a").unwrap().missed_beats, 1);
    }

    #[test]
    fn exceeding_allowed_misses_expires() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("a", ip(1), 0, &AllowAll).unwrap();

        // Simulate three consecutive sweeps, each one heartbeat_rate apart,
        // none of which see a real heartbeat arrive.
        let mut now = 0u64;
        let mut last_expired = vec![];
        for _ in 0..3 {
            now += 1000;
            last_expired = sweep(&mut reg, 1000, 2, now);
        }
        assert_eq!(last_expired, vec![Expiry { name: "a".to_string() }]);
    }

    #[test]
    fn stops_at_first_node_under_deadline() {
        let mut reg = NodeRegistry::new();
        reg.mark_login("stale", ip(1), 0, &AllowAll).unwrap();
        reg.mark_login("fresh", ip(2), 900, &AllowAll).unwrap();
        // "stale" is tail (older), "fresh" is head (MRU).
        let expired = sweep(&mut reg, 1000, 5, 950);
        assert!(expired.is_empty());
        assert_eq!(reg.get("stale").unwrap().missed_beats, 1);
        assert_eq!(reg.get("fresh").unwrap().missed_beats, 0);
    }
}
