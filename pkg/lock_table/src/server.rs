//! The `lock_table` process: one `Partition` per owned partition index,
//! each behind its own TCP listener (SPEC_FULL.md §4.7, §6's "partition *k*
//! uses base+*k*" port scheme), plus a membership watch loop that mirrors
//! `Expired`/`Killed` deltas from `cluster_core` into the relevant
//! partitions.
//!
//! Grounded on `cluster_core::core::Core::run`'s "bind a listener, build a
//! bundle, add one loop per concern, join" shape and on
//! `cluster_core::conn::handle_connection`'s handshake-then-message-loop
//! structure, since this process speaks the same wire handshake to a
//! different set of opcodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_config::Config;
use cluster_wire::{
    read_frame, write_frame, Ack, DemotionKind, Login, LoginReply, LockActionCode, LockCallback,
    LockReply, LockRequest, LockState, LockStatus, LvbHoldRequest, LvbSync, Opcode, Record,
};
use common::async_std::channel;
use common::async_std::net::{TcpListener, TcpStream};
use common::async_std::sync::Mutex;
use common::bundle::TaskBundle;
use common::bytes::Bytes;
use common::errors::*;
use common::io::{Readable, Writeable};

use crate::partition::{Demotion, GrantedWaiter, Partition};

fn demotion_kind(d: &Demotion) -> DemotionKind {
    match d {
        Demotion::NeedExclusive => DemotionKind::NeedExclusive,
        Demotion::NeedShared => DemotionKind::NeedShared,
        Demotion::NeedDeferred => DemotionKind::NeedDeferred,
    }
}

/// Either side-channel push a connection can receive between its own
/// frames: a demotion hint on something it currently holds, or an
/// asynchronous grant of something it had been queued on (see
/// [`crate::partition::GrantedWaiter`]). Both travel through the same
/// per-caller callback hub since both are addressed by caller name and
/// both race the connection's next inbound frame the same way.
enum PartitionEvent {
    Demotion { key: Bytes, demotion: Demotion, caller: String },
    Granted(GrantedWaiter),
}

/// One owned partition plus the fan-out of demotion/grant callbacks to
/// whichever connection currently represents each holder. Keyed by caller
/// name since that is also the registry/identity key in `cluster_core`.
struct PartitionState {
    index: u16,
    table: Mutex<Partition>,
    callbacks: Mutex<HashMap<String, channel::Sender<PartitionEvent>>>,
}

impl PartitionState {
    fn new(index: u16) -> Self {
        PartitionState {
            index,
            table: Mutex::new(Partition::new(index)),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    async fn deliver(&self, key: &Bytes, callbacks: Vec<(String, Demotion)>) {
        if callbacks.is_empty() {
            return;
        }
        let hub = self.callbacks.lock().await;
        for (caller, demotion) in callbacks {
            if let Some(sender) = hub.get(&caller) {
                // Best-effort: a holder that never asked to be subscribed to
                // its own callbacks (or whose channel is full) just never
                // hears about it, per SPEC_FULL.md §4.7 ("receipt is not
                // required for progress").
                let _ = sender.try_send(PartitionEvent::Demotion { key: key.clone(), demotion, caller: caller.clone() });
            }
        }
    }

    /// Pushes a `LockReply(Granted)` to each waiter that a request/action
    /// drained straight into a holder (SPEC_FULL.md §4.7's waiter FIFO
    /// lifecycle) — these callers are not the one about to receive this
    /// call's own synchronous reply, so without this push they would wait
    /// forever despite already holding the lock.
    async fn deliver_granted(&self, granted_waiters: Vec<GrantedWaiter>) {
        if granted_waiters.is_empty() {
            return;
        }
        let hub = self.callbacks.lock().await;
        for waiter in granted_waiters {
            if let Some(sender) = hub.get(&waiter.caller) {
                let _ = sender.try_send(PartitionEvent::Granted(waiter));
            }
        }
    }
}

pub struct LtServer {
    config: Config,
    partitions: Vec<Arc<PartitionState>>,
}

impl LtServer {
    /// `owned` is the explicit set of partition indices this node hosts
    /// (SPEC_FULL.md §4.7: each partition is a cluster-wide singleton, so
    /// the set is disjoint across nodes — see the rank-based assignment in
    /// `bin/lock_table.rs::owned_partitions`).
    pub fn new(config: Config, owned: Vec<u16>) -> Self {
        let partitions = owned.into_iter().map(|i| Arc::new(PartitionState::new(i))).collect();
        LtServer { config, partitions }
    }

    /// Binds one listener per owned partition and runs them, the membership
    /// watcher and its applier loop concurrently until the process is
    /// killed.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut bundle = TaskBundle::new();

        for partition in &self.partitions {
            let listener = TcpListener::bind(("0.0.0.0", self.config.lt_port(partition.index))).await?;
            bundle.add(Self::accept_loop(self.clone(), partition.clone(), listener));
        }

        let (tx, rx) = channel::bounded(256);
        bundle.add(Self::membership_watch_loop(self.clone(), tx));
        bundle.add(Self::membership_apply_loop(self.clone(), rx));

        bundle.join().await;
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, partition: Arc<PartitionState>, listener: TcpListener) {
        loop {
            let (stream, _peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let server = self.clone();
            let partition = partition.clone();
            common::async_std::task::spawn(async move {
                let _ = handle_connection(server.as_ref(), partition, stream).await;
            });
        }
    }

    /// Subscribes to the `cluster_core` instance colocated on this same
    /// host for membership deltas. A true slave-to-master relay across
    /// `lock_table` hosts is out of scope for this build (DESIGN.md); every
    /// deployment is expected to run `lock_table` alongside its own node's
    /// `cluster_core`.
    async fn membership_watch_loop(self: Arc<Self>, tx: channel::Sender<cluster_wire::MembershipUpdate>) {
        let service_name = format!("lock_table-{}", self.config.name);
        let heartbeat_period = Duration::from_micros(self.config.heartbeat_rate_micros / 2);
        loop {
            let result = cluster_client::watch_membership(
                (self.config.name.as_str(), self.config.core_port),
                &self.config.cluster_name,
                &service_name,
                heartbeat_period,
                tx.clone(),
            )
            .await;
            if result.is_err() {
                // core not reachable yet (or restarting); back off and retry.
                common::wait_for(heartbeat_period).await;
            }
        }
    }

    async fn membership_apply_loop(self: Arc<Self>, rx: channel::Receiver<cluster_wire::MembershipUpdate>) {
        while let Ok(update) = rx.recv().await {
            for partition in &self.partitions {
                match update.new_state {
                    cluster_wire::NodeState::Expired => {
                        let mut table = partition.table.lock().await;
                        table.mark_expired_holder(&update.node_name);
                    }
                    cluster_wire::NodeState::Killed => {
                        let granted_waiters = {
                            let mut table = partition.table.lock().await;
                            table.clear_expired_holder(&update.node_name)
                        };
                        // The fenced caller's holders are now gone; whoever
                        // was queued behind them may have just been drained
                        // straight into a holder and needs its own push.
                        partition.deliver_granted(granted_waiters).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn read_login<S: Readable>(stream: &mut S) -> Result<Option<Login>> {
    match read_frame(stream).await? {
        None => Ok(None),
        Some((Opcode::Login, body)) => {
            let mut dec = cluster_wire::Decoder::new(body);
            Ok(Some(Login::decode(&mut dec)?))
        }
        Some((other, _)) => Err(format_err!("expected Login, got opcode {:?}", other.to_value())),
    }
}

async fn send_reply<S: Writeable>(stream: &mut S, accepted: bool, reason: &str) -> Result<()> {
    let reply = LoginReply { accepted, reason: reason.to_string() };
    let mut enc = cluster_wire::Encoder::new();
    reply.encode(&mut enc);
    write_frame(stream, Opcode::LoginReply, enc.finish()).await
}

/// Handshake then message loop for one connection against one partition.
/// `lock_table` does not re-validate the config hash the way `cluster_core`
/// does for peer logins: callers here are always filesystem clients or
/// `lock_proxy`, identified by name alone (SPEC_FULL.md §4.9's "service
/// identifier" case).
async fn handle_connection(server: &LtServer, partition: Arc<PartitionState>, mut stream: TcpStream) -> Result<()> {
    let deadline = Duration::from_micros(server.config.new_connection_timeout_micros);
    let login = match common::async_std::future::timeout(deadline, read_login(&mut stream)).await {
        Ok(Ok(Some(login))) => login,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(()),
    };

    if login.cluster_name != server.config.cluster_name {
        send_reply(&mut stream, false, "cluster name mismatch").await?;
        return Ok(());
    }

    send_reply(&mut stream, true, "ok").await?;
    let caller = login.node_name.clone();

    let (cb_tx, cb_rx) = channel::bounded(64);
    // `represented` starts with just the connection's own login name but
    // grows as `lock_proxy` forwards requests on behalf of other callers
    // (SPEC_FULL.md §4.8 multiplexing) — each one needs its own hub entry
    // so a demotion callback addressed to that caller still reaches this
    // connection instead of being silently dropped.
    let mut represented = std::collections::HashSet::new();
    represented.insert(caller.clone());
    {
        let mut hub = partition.callbacks.lock().await;
        hub.insert(caller.clone(), cb_tx.clone());
    }

    let result = message_loop(&partition, &mut stream, &caller, &cb_rx, &cb_tx, &mut represented).await;

    {
        let mut hub = partition.callbacks.lock().await;
        for name in &represented {
            hub.remove(name);
        }
    }
    let granted_waiters = {
        let mut table = partition.table.lock().await;
        let mut granted_waiters = vec![];
        for name in &represented {
            granted_waiters.extend(table.drop_all_for_caller(name));
        }
        granted_waiters
    };
    // Dropping every lock this connection (and whichever callers it was
    // proxying) held may have unblocked waiters belonging to *other*,
    // still-connected callers; push each of them its own grant.
    partition.deliver_granted(granted_waiters).await;

    result
}

enum ReadOutcome {
    Frame(Option<(Opcode, Bytes)>),
    Callback(PartitionEvent),
}

/// Races the next inbound frame against the next queued demotion/grant
/// callback, mirroring `cluster_core::conn::read_frame_or_update`'s
/// approach to the same problem for membership deltas.
async fn read_frame_or_callback<S: Readable>(
    stream: &mut S,
    rx: &channel::Receiver<PartitionEvent>,
) -> Result<ReadOutcome> {
    use common::futures::FutureExt;

    let frame_fut = read_frame(stream).fuse();
    let cb_fut = async { rx.recv().await }.fuse();
    common::futures::pin_mut!(frame_fut, cb_fut);

    common::futures::select! {
        frame = frame_fut => Ok(ReadOutcome::Frame(frame?)),
        cb = cb_fut => match cb {
            Ok(c) => Ok(ReadOutcome::Callback(c)),
            Err(_) => Ok(ReadOutcome::Frame(None)),
        },
    }
}

async fn message_loop<S: Readable + Writeable>(
    partition: &PartitionState,
    stream: &mut S,
    caller: &str,
    cb_rx: &channel::Receiver<PartitionEvent>,
    cb_tx: &channel::Sender<PartitionEvent>,
    represented: &mut std::collections::HashSet<String>,
) -> Result<()> {
    loop {
        match read_frame_or_callback(stream, cb_rx).await? {
            ReadOutcome::Frame(None) => return Ok(()),
            ReadOutcome::Frame(Some((Opcode::LockRequest, body))) | ReadOutcome::Frame(Some((Opcode::LockAction, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let req = LockRequest::decode(&mut dec)?;
                let effective = if req.caller.is_empty() { caller } else { req.caller.as_str() };
                if represented.insert(effective.to_string()) {
                    let mut hub = partition.callbacks.lock().await;
                    hub.insert(effective.to_string(), cb_tx.clone());
                }
                let reply = handle_lock_request(partition, effective, req).await;
                let mut enc = cluster_wire::Encoder::new();
                reply.encode(&mut enc);
                write_frame(stream, Opcode::LockReply, enc.finish()).await?;
            }
            ReadOutcome::Frame(Some((Opcode::LvbHold, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let req = LvbHoldRequest::decode(&mut dec)?;
                {
                    let mut table = partition.table.lock().await;
                    table.hold_lvb(&req.key);
                }
                send_ack(stream, true).await?;
            }
            ReadOutcome::Frame(Some((Opcode::LvbUnhold, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let req = LvbHoldRequest::decode(&mut dec)?;
                {
                    let mut table = partition.table.lock().await;
                    table.unhold_lvb(&req.key);
                }
                send_ack(stream, true).await?;
            }
            ReadOutcome::Frame(Some((Opcode::LvbSync, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let req = LvbSync::decode(&mut dec)?;
                let ok = {
                    let mut table = partition.table.lock().await;
                    table.sync_lvb(caller, req.subid, &req.key, req.lvb)
                };
                send_ack(stream, ok).await?;
            }
            ReadOutcome::Frame(Some((other, _))) => {
                log_unexpected(other);
            }
            ReadOutcome::Callback(PartitionEvent::Demotion { key, demotion, caller: owner }) => {
                let cb = LockCallback { key, kind: demotion_kind(&demotion), caller: owner };
                let mut enc = cluster_wire::Encoder::new();
                cb.encode(&mut enc);
                write_frame(stream, Opcode::LockCallback, enc.finish()).await?;
            }
            ReadOutcome::Callback(PartitionEvent::Granted(waiter)) => {
                let reply = LockReply {
                    subid: waiter.subid,
                    key: waiter.key,
                    state: waiter.state,
                    status: LockStatus::Granted,
                    lvb: waiter.lvb,
                };
                let mut enc = cluster_wire::Encoder::new();
                reply.encode(&mut enc);
                write_frame(stream, Opcode::LockReply, enc.finish()).await?;
            }
        }
    }
}

async fn send_ack<S: Writeable>(stream: &mut S, ok: bool) -> Result<()> {
    let ack = Ack { ok };
    let mut enc = cluster_wire::Encoder::new();
    ack.encode(&mut enc);
    write_frame(stream, Opcode::LvbAck, enc.finish()).await
}

async fn handle_lock_request(partition: &PartitionState, caller: &str, req: LockRequest) -> LockReply {
    let subid = req.subid;
    let key = req.key.clone();

    let outcome = {
        let mut table = partition.table.lock().await;
        match req.action {
            LockActionCode::Request => {
                table.request(caller, subid, req.key.clone(), req.requested_state, req.flags, req.lvb.clone())
            }
            LockActionCode::Convert => {
                table.convert(caller, subid, req.key.clone(), req.requested_state, req.flags, req.lvb.clone())
            }
            LockActionCode::Cancel => table.cancel(caller, subid, req.key.clone()),
            LockActionCode::Release => table.release(caller, subid, req.key.clone()),
            LockActionCode::DropAllForCaller => {
                let granted_waiters = table.drop_all_for_caller(caller);
                let mut out = crate::partition::Outcome::dropped();
                out.granted_waiters = granted_waiters;
                out
            }
            LockActionCode::Unknown(_) => crate::partition::Outcome::error(LockState::Unlocked),
        }
    };

    partition.deliver(&key, outcome.callbacks).await;
    partition.deliver_granted(outcome.granted_waiters).await;

    LockReply {
        subid,
        key: req.key,
        state: outcome.state,
        status: outcome.status,
        lvb: outcome.lvb,
    }
}

fn log_unexpected(opcode: Opcode) {
    // Plain eprintln, matching `cluster_core::conn::log`'s unconditional
    // text logging rather than pulling in a logging crate for one line.
    eprintln!("lock_table: unexpected opcode {:?}", opcode.to_value());
}
