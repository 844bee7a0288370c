//! The core process: ties the node registry, heartbeat sweep, fence
//! dispatcher, election state machine and membership replicator together
//! into one runnable service (SPEC_FULL.md §2, §5).
//!
//! Grounded on `pkg/datastore/src/meta/store.rs`'s `Metastore::run()` shape
//! ("build a bundle, add each long-lived loop, join") adapted from
//! `raft::Node`/`rpc::Http2Server` to our own accept loop, heartbeat timer,
//! election prober and fence reaper, since this service solves its own
//! consensus problem rather than reusing `raft`.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cluster_config::Config;
use cluster_wire::{MembershipUpdate, NodeState};
use common::async_std::channel;
use common::async_std::net::TcpListener;
use common::async_std::sync::Mutex;
use common::bundle::TaskBundle;
use common::errors::*;
use common::signals::{register_signal_handler, Signal};

use crate::election::{self, Decision, Role};
use crate::fence::{FenceDispatcher, ReapOutcome};
use crate::membership::{dirty_sweep, Replicator};
use crate::peer_probe::{PeerProbe, TcpPeerProbe};
use crate::registry::{AuthorizationHook, NodeRegistry};

/// Number of heartbeat intervals an `OldMasterLoggedIn` node is given to
/// re-authenticate before the reconciliation sweep treats it as having
/// logged out (Open Question resolution, see DESIGN.md).
pub const OLD_MASTER_FORGIVENESS_HEARTBEATS: u32 = 3;

pub struct CoreState {
    pub registry: NodeRegistry,
    pub replicator: Replicator,
    pub fence: FenceDispatcher,
    pub role: Role,
    /// Per-node "please hang up" signal, populated while a connection is
    /// authenticated. Force-expiry sends on this before the fence is queued
    /// (SPEC_FULL.md §4.3's announce-then-close-then-fence ordering).
    pub connections: HashMap<String, channel::Sender<()>>,
    /// Set by the `SIGUSR1` handler's event-loop observer, consumed by the
    /// next loop iteration (DESIGN NOTES: never build the dump inside the
    /// signal handler itself).
    pub dump_requested: bool,
    /// Micros timestamp at which each `OldMasterLoggedIn` node was tagged,
    /// used to apply the forgiveness window.
    pub old_master_since: HashMap<String, u64>,
    /// Name of the peer `election_loop` most recently saw claiming `Master`
    /// with a matching config hash, `None` if no master is currently
    /// visible. Read by `replication_loop` to know who to subscribe to
    /// while this node is `Slave`.
    pub current_master: Option<String>,
}

impl CoreState {
    fn new(fence_bin: String) -> Self {
        Self {
            registry: NodeRegistry::new(),
            replicator: Replicator::new(),
            fence: FenceDispatcher::new(fence_bin),
            role: Role::Pending,
            connections: HashMap::new(),
            dump_requested: false,
            old_master_since: HashMap::new(),
            current_master: None,
        }
    }
}

pub struct Core {
    pub config: Config,
    pub config_hash: u32,
    pub auth_hook: Box<dyn AuthorizationHook>,
    pub state: Mutex<CoreState>,
}

impl Core {
    pub fn new(config: Config, auth_hook: Box<dyn AuthorizationHook>) -> Self {
        let config_hash = config.compute_hash();
        let state = CoreState::new(config.fence_bin.clone());
        Self {
            config,
            config_hash,
            auth_hook,
            state: Mutex::new(state),
        }
    }

    pub fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }

    pub fn rank(&self) -> Option<usize> {
        self.config.rank_of(&self.config.name)
    }

    /// SPEC_FULL.md §4.3's announce-then-close-then-fence sequence, also
    /// reachable via the `AdminForceExpire` opcode for operator-triggered
    /// expiry outside the normal heartbeat sweep.
    pub async fn force_expire(&self, name: &str) {
        let close_tx = {
            let mut state = self.state.lock().await;
            if !state.registry.mark_expired(name) {
                return;
            }
            let ip = state.registry.get(name).map(|n| n.ip).unwrap_or([0; 16]);
            state.replicator.announce(MembershipUpdate {
                node_name: name.to_string(),
                new_state: NodeState::Expired,
                node_ip: ip,
            });
            state.connections.remove(name)
        };

        if let Some(tx) = close_tx {
            let _ = tx.try_send(());
        }

        let mut state = self.state.lock().await;
        if !state.fence.is_pending(name) {
            let _ = state.fence.queue_node_for_fencing(name).await;
        }
    }

    fn is_authoritative_sync(role: Role) -> bool {
        matches!(role, Role::Master | Role::Arbitrating)
    }

    /// Top-level process entry point: binds the core port and runs the
    /// accept loop, heartbeat sweep, election prober, fence reaper and
    /// admin-dump observer concurrently inside one `TaskBundle`
    /// (SPEC_FULL.md §5's single-task-per-process-per-loop model).
    pub async fn run(self: std::sync::Arc<Self>) -> Result<()> {
        if self.config.is_fog() {
            let mut state = self.state.lock().await;
            state.role = Role::Pending;
        } else {
            let mut state = self.state.lock().await;
            state.role = Role::Master;
            state.current_master = Some(self.config.name.clone());
            let now = self.now_micros();
            state.registry.beat_all_once(now);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.core_port)).await?;

        let mut bundle = TaskBundle::new();
        bundle.add(Self::accept_loop(self.clone(), listener));
        bundle.add(Self::heartbeat_loop(self.clone()));
        bundle.add(Self::election_loop(self.clone(), TcpPeerProbe));
        bundle.add(Self::fence_reap_loop(self.clone()));
        bundle.add(Self::admin_dump_loop(self.clone()));
        bundle.add(Self::replication_loop(self.clone()));
        bundle.join().await;

        Ok(())
    }

    async fn accept_loop(self: std::sync::Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let core = self.clone();
            common::async_std::task::spawn(async move {
                let _ = crate::conn::handle_connection(core.as_ref(), stream, peer_addr).await;
            });
        }
    }

    async fn heartbeat_loop(self: std::sync::Arc<Self>) {
        let period = Duration::from_micros(self.config.heartbeat_rate_micros / 2);
        loop {
            common::wait_for(period).await;

            let now = self.now_micros();
            let expired = {
                let mut state = self.state.lock().await;
                crate::heartbeat::sweep(
                    &mut state.registry,
                    self.config.heartbeat_rate_micros,
                    self.config.allowed_misses,
                    now,
                )
            };

            for expiry in expired {
                self.force_expire(&expiry.name).await;
            }

            self.collapse_stale_old_masters(now).await;
        }
    }

    /// Nodes tagged `OldMasterLoggedIn` more than
    /// `OLD_MASTER_FORGIVENESS_HEARTBEATS` heartbeats ago without
    /// re-authenticating are treated as if they had logged out normally.
    async fn collapse_stale_old_masters(&self, now_micros: u64) {
        let window = self.config.heartbeat_rate_micros * OLD_MASTER_FORGIVENESS_HEARTBEATS as u64;
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .old_master_since
            .iter()
            .filter(|(_, &since)| now_micros.saturating_sub(since) > window)
            .map(|(name, _)| name.clone())
            .collect();

        for name in stale {
            state.old_master_since.remove(&name);
            if let Some(node) = state.registry.get(&name) {
                if node.state == NodeState::OldMasterLoggedIn {
                    let ip = node.ip;
                    state.registry.mark_logout(&name);
                    state.replicator.announce(MembershipUpdate {
                        node_name: name,
                        new_state: NodeState::LoggedOut,
                        node_ip: ip,
                    });
                }
            }
        }
    }

    async fn election_loop<P: PeerProbe>(self: std::sync::Arc<Self>, probe: P) {
        if !self.config.is_fog() {
            // Single-server deployments never arbitrate; already Master.
            return;
        }

        let period = Duration::from_micros(self.config.master_scan_delay_micros);
        let self_rank = match self.rank() {
            Some(r) => r,
            None => return, // not a configured server: pure client process.
        };
        let quorum = self.config.quorum() as usize;
        let total = self.config.servers.len();

        loop {
            let current_role = { self.state.lock().await.role };
            let claimed = current_role.to_wire();

            let mut visible = Vec::new();
            for (rank, server) in self.config.servers.iter().enumerate() {
                if rank == self_rank {
                    continue;
                }
                if let Some(claim) = probe
                    .probe(
                        &self.config.servers[self_rank].name,
                        &server.name,
                        rank,
                        self.config.core_port,
                        &self.config.cluster_name,
                        self.config_hash,
                        claimed,
                    )
                    .await
                {
                    visible.push(claim);
                }
            }

            let visible_master = visible
                .iter()
                .find(|c| c.config_hash_matches && c.role == cluster_wire::NodeRole::Master)
                .map(|c| self.config.servers[c.rank].name.clone());

            let decision = election::decide(self_rank, quorum, total, &visible);
            self.apply_decision(decision, visible_master).await;

            common::wait_for(period).await;
        }
    }

    async fn apply_decision(&self, decision: Decision, visible_master: Option<String>) {
        let mut state = self.state.lock().await;
        let was_master = state.role == Role::Master;
        let new_role = match decision {
            Decision::StayPending => Role::Pending,
            Decision::BecomeSlave => Role::Slave,
            Decision::StayArbitrating => Role::Arbitrating,
            Decision::BecomeMaster => Role::Master,
        };

        if was_master && new_role != Role::Master {
            // Losing the master: tag every known logged-in node so the
            // registry survives the election instead of being discarded.
            let now = self.now_micros();
            for name in state.registry.mark_all_old_master_login() {
                state.old_master_since.insert(name, now);
            }
        }

        let becoming_master = !was_master && new_role == Role::Master;
        state.role = new_role;
        state.current_master = if new_role == Role::Master {
            Some(self.config.name.clone())
        } else {
            visible_master
        };

        if becoming_master {
            let now = self.now_micros();
            state.registry.beat_all_once(now);
            let updates = dirty_sweep(&state.registry);
            for update in updates {
                state.replicator.announce(update);
            }
        }
    }

    /// While this node is `Slave`, keeps a membership subscription open to
    /// whichever peer `election_loop` last saw as `Master`, applying every
    /// received triple to this process's own registry (SPEC_FULL.md §4.6).
    /// A single-server deployment is always its own master and never runs
    /// this loop's connect branch.
    async fn replication_loop(self: std::sync::Arc<Self>) {
        if !self.config.is_fog() {
            return;
        }

        let retry_delay = Duration::from_micros(self.config.heartbeat_rate_micros);
        loop {
            let (role, master) = {
                let state = self.state.lock().await;
                (state.role, state.current_master.clone())
            };

            let target = match (role, master) {
                (Role::Slave, Some(name)) if name != self.config.name => name,
                _ => {
                    common::wait_for(retry_delay).await;
                    continue;
                }
            };

            if let Err(e) = crate::replicate::replicate_from(&self, &target).await {
                if self.config.verbosity > 0 {
                    println!("core: replication from {} ended: {}", target, e);
                }
            }

            common::wait_for(retry_delay).await;
        }
    }

    async fn fence_reap_loop(self: std::sync::Arc<Self>) {
        let mut sigchld = match register_signal_handler(Signal::SIGCHLD) {
            Ok(r) => r,
            Err(_) => return, // already registered elsewhere in this process
        };

        loop {
            sigchld.recv().await;

            loop {
                let status = match nix::sys::wait::waitpid(
                    Some(nix::unistd::Pid::from_raw(-1)),
                    Some(nix::sys::wait::WaitPidFlag::WNOHANG),
                ) {
                    Ok(nix::sys::wait::WaitStatus::StillAlive) => break,
                    Ok(s) => s,
                    Err(_) => break,
                };

                let authoritative = Self::is_authoritative_sync(self.state.lock().await.role);
                let outcome = {
                    let mut state = self.state.lock().await;
                    state.fence.reap(status, authoritative).await
                };

                match outcome {
                    Some(ReapOutcome::Killed(name)) => {
                        let mut state = self.state.lock().await;
                        state.registry.mark_killed(&name);
                        let ip = state.registry.get(&name).map(|n| n.ip).unwrap_or([0; 16]);
                        state.replicator.announce(MembershipUpdate {
                            node_name: name,
                            new_state: NodeState::Killed,
                            node_ip: ip,
                        });
                    }
                    Some(ReapOutcome::Retry(_)) | Some(ReapOutcome::SilentDrop(_)) | None => {}
                }
            }
        }
    }

    async fn admin_dump_loop(self: std::sync::Arc<Self>) {
        let mut sigusr1 = match register_signal_handler(Signal::SIGUSR1) {
            Ok(r) => r,
            Err(_) => return,
        };

        loop {
            sigusr1.recv().await;
            let mut state = self.state.lock().await;
            state.dump_requested = true;
            drop(state);

            // The flag is consumed on the very next iteration of this same
            // loop rather than inside the signal handler, matching the
            // DESIGN NOTES' "flag-then-snapshot" rule.
            let mut state = self.state.lock().await;
            if state.dump_requested {
                state.dump_requested = false;
                let snapshot = crate::dump::DumpSnapshot::capture(&state.registry);
                drop(state);
                let _ = snapshot.write_to_tmp(std::process::id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AllowAll;

    fn config(servers: &[&str]) -> Config {
        let mut c = Config::default();
        c.cluster_name = "t".to_string();
        c.servers = servers
            .iter()
            .map(|s| cluster_config::config::ServerEntry { name: s.to_string() })
            .collect();
        c.name = servers.get(0).cloned().unwrap_or("a").to_string();
        c
    }

    #[test]
    fn single_server_force_expire_marks_and_announces() {
        common::async_std::task::block_on(async {
            let core = Core::new(config(&["a"]), Box::new(AllowAll));
            {
                let mut state = core.state.lock().await;
                state.registry.mark_login("x", [0u8; 16], 0, &AllowAll).unwrap();
            }
            core.force_expire("x").await;
            let state = core.state.lock().await;
            assert_eq!(
                state.registry.get("x").unwrap().state,
                NodeState::Expired
            );
        });
    }

    #[test]
    fn apply_decision_tags_old_masters_on_losing_master() {
        common::async_std::task::block_on(async {
            let core = Core::new(config(&["a", "b", "c"]), Box::new(AllowAll));
            {
                let mut state = core.state.lock().await;
                state.role = Role::Master;
                state.registry.mark_login("x", [0u8; 16], 0, &AllowAll).unwrap();
            }
            core.apply_decision(Decision::BecomeSlave, Some("b".to_string())).await;
            let state = core.state.lock().await;
            assert_eq!(state.role, Role::Slave);
            assert_eq!(state.current_master, Some("b".to_string()));
            assert_eq!(
                state.registry.get("x").unwrap().state,
                NodeState::OldMasterLoggedIn
            );
        });
    }
}
