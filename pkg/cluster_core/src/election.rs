//! Election / arbitration state machine (SPEC_FULL.md §4.5), grounded on
//! `examples/original_source/gulm/src/core_fence.c`'s neighboring
//! arbitration logic and the distilled spec's own transition graph. The
//! network probing itself is behind the `PeerProbe` trait so the decision
//! function (`decide`) stays pure and unit-testable; `TcpPeerProbe` is the
//! real implementation used by `core.rs`.

use cluster_wire::NodeRole;

/// What a probed peer reported about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerClaim {
    pub rank: usize,
    pub role: NodeRole,
    pub config_hash_matches: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pending,
    Slave,
    Arbitrating,
    Master,
}

impl Role {
    pub fn to_wire(self) -> NodeRole {
        match self {
            Role::Pending => NodeRole::Pending,
            Role::Slave => NodeRole::Slave,
            Role::Arbitrating => NodeRole::Arbitrating,
            Role::Master => NodeRole::Master,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Stay Pending; not enough peers answered yet to make a call.
    StayPending,
    /// Become (or remain) Slave. The config-hash mismatch case is folded
    /// into this too, since a slave that cannot verify a master just waits.
    BecomeSlave,
    /// Become (or remain) Arbitrating; not yet a winner, no disqualifying
    /// higher-ranked competitor observed either.
    StayArbitrating,
    /// Win the election outright.
    BecomeMaster,
}

/// `calc_quorum`'s election counterpart: given this node's rank, the
/// configured quorum, and what every reachable peer claimed, decide the
/// next role. `self_rank` and one entry per reachable peer (unreachable
/// peers are simply absent from `visible`); `total_servers` is the
/// configured server count (self inclusive).
///
/// Rules (SPEC_FULL.md §4.5):
/// - A visible Master wins every tie: we become its Slave.
/// - Among Arbitrating peers, the lowest rank wins; a peer with a
///   mismatched config hash is disqualified from that comparison (treated
///   as `BadConfig`, i.e. not counted as "visible" at all by the caller).
/// - Winning requires (a) a majority of servers reachable including self
///   and (b) no higher-ranked (lower-numbered) Arbitrating peer visible.
/// - Single-server deployments (`total_servers == 1`) always win
///   immediately; callers should special-case this before ever calling
///   `decide` (fog mode is mandatory otherwise).
pub fn decide(self_rank: usize, quorum: usize, total_servers: usize, visible: &[PeerClaim]) -> Decision {
    if total_servers <= 1 {
        return Decision::BecomeMaster;
    }

    if let Some(_master) = visible.iter().find(|p| p.role == NodeRole::Master && p.config_hash_matches) {
        return Decision::BecomeSlave;
    }

    let reachable = visible.len() + 1; // +1 for self
    if reachable < quorum {
        return Decision::StayPending;
    }

    let higher_ranked_arbitrator = visible
        .iter()
        .any(|p| p.role == NodeRole::Arbitrating && p.config_hash_matches && p.rank < self_rank);

    if higher_ranked_arbitrator {
        return Decision::BecomeSlave;
    }

    Decision::BecomeMaster
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(rank: usize, role: NodeRole) -> PeerClaim {
        PeerClaim {
            rank,
            role,
            config_hash_matches: true,
        }
    }

    #[test]
    fn single_server_always_wins() {
        assert_eq!(decide(0, 1, 1, &[]), Decision::BecomeMaster);
    }

    #[test]
    fn visible_master_means_become_slave() {
        let visible = vec![claim(0, NodeRole::Master)];
        assert_eq!(decide(1, 2, 3, &visible), Decision::BecomeSlave);
    }

    #[test]
    fn insufficient_reachable_peers_stays_pending() {
        // 3 servers, quorum 2, nobody else reachable yet.
        assert_eq!(decide(0, 2, 3, &[]), Decision::StayPending);
    }

    #[test]
    fn higher_ranked_arbitrator_yields_to_it() {
        let visible = vec![claim(0, NodeRole::Arbitrating), claim(2, NodeRole::Arbitrating)];
        // self_rank=1, two peers reachable plus self = 3 >= quorum(2).
        assert_eq!(decide(1, 2, 3, &visible), Decision::BecomeSlave);
    }

    #[test]
    fn lowest_rank_wins_outright() {
        let visible = vec![claim(1, NodeRole::Arbitrating), claim(2, NodeRole::Arbitrating)];
        assert_eq!(decide(0, 2, 3, &visible), Decision::BecomeMaster);
    }

    #[test]
    fn config_hash_mismatch_peer_is_not_a_disqualifying_competitor() {
        let visible = vec![PeerClaim {
            rank: 0,
            role: NodeRole::Arbitrating,
            config_hash_matches: false,
        }];
        // Only 1 reachable (self) + 1 bad-hash peer = 2, still meets quorum 2,
        // but the bad-hash peer cannot block rank 1 from winning.
        assert_eq!(decide(1, 2, 3, &visible), Decision::BecomeMaster);
    }
}
