//! The `lock_proxy` (`ltpx`) process: fans client lock requests out to the
//! partition owning their key, multiplexing many client connections over
//! one upstream connection per partition (SPEC_FULL.md §4.8).
//!
//! Grounded on `lock_table::server`'s accept-loop/handshake/message-loop
//! shape (same author, same wire handshake, different opcode set) and on
//! `cluster_core::conn::read_frame_or_update`'s pattern of racing an
//! inbound frame against a side channel of asynchronous pushes — reused
//! here both for forwarding demotion callbacks to clients and for racing a
//! client's next frame against the reply to its own in-flight request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_config::Config;
use cluster_wire::{
    partition_of, read_frame, write_frame, Login, LoginReply, LockReply, LockRequest, LockState,
    LockStatus, Opcode, Record,
};
use common::async_std::channel;
use common::async_std::net::{TcpListener, TcpStream};
use common::async_std::sync::Mutex;
use common::bundle::TaskBundle;
use common::bytes::Bytes;
use common::errors::*;
use common::io::{Readable, Writeable};

use crate::route::{PendingEntry, Route};

/// How many times `ensure_connected` retries a failed dial for a
/// non-`Try` request before giving up and reporting `TryFailed` anyway
/// (SPEC_FULL.md §4.8 doesn't bound this; an unbounded retry would let one
/// dead partition master wedge every client connection routed to it).
const CONNECT_RETRY_LIMIT: u32 = 3;

struct PartitionState {
    index: u16,
    route: Mutex<Route>,
    upstream: Mutex<Option<TcpStream>>,
    /// Forwarding targets for `LockCallback`s pushed by the upstream
    /// reader, keyed by the original client's login name.
    callbacks: Mutex<HashMap<String, channel::Sender<cluster_wire::LockCallback>>>,
}

impl PartitionState {
    fn new(index: u16, owner: String) -> Self {
        PartitionState {
            index,
            route: Mutex::new(Route::new(owner)),
            upstream: Mutex::new(None),
            callbacks: Mutex::new(HashMap::new()),
        }
    }
}

pub struct LtpxServer {
    config: Config,
    partitions: Vec<Arc<PartitionState>>,
}

impl LtpxServer {
    /// `owners[p]` is the node name hosting partition `p`, per the same
    /// rank assignment `lock_table` uses (see `bin/ltpx.rs::owner_of`).
    pub fn new(config: Config, owners: Vec<String>) -> Self {
        let partitions = owners
            .into_iter()
            .enumerate()
            .map(|(i, owner)| Arc::new(PartitionState::new(i as u16, owner)))
            .collect();
        LtpxServer { config, partitions }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut bundle = TaskBundle::new();

        let listener = TcpListener::bind(("0.0.0.0", self.config.ltpx_port)).await?;
        bundle.add(Self::accept_loop(self.clone(), listener));

        let (tx, rx) = channel::bounded(256);
        bundle.add(Self::membership_watch_loop(self.clone(), tx));
        bundle.add(Self::membership_apply_loop(self.clone(), rx));

        bundle.join().await;
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, _peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let server = self.clone();
            common::async_std::task::spawn(async move {
                let _ = handle_client_connection(server, stream).await;
            });
        }
    }

    /// Watches the node's own `cluster_core` for membership deltas so a
    /// partition can be marked unavailable the moment its owner expires,
    /// and available again once the owner is back (SPEC_FULL.md §4.8
    /// failover).
    async fn membership_watch_loop(self: Arc<Self>, tx: channel::Sender<cluster_wire::MembershipUpdate>) {
        let service_name = format!("ltpx-{}", self.config.name);
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
                common::wait_for(heartbeat_period).await;
            }
        }
    }

    async fn membership_apply_loop(self: Arc<Self>, rx: channel::Receiver<cluster_wire::MembershipUpdate>) {
        while let Ok(update) = rx.recv().await {
            for partition in &self.partitions {
                let owner_matches = {
                    let route = partition.route.lock().await;
                    route.owner == update.node_name
                };
                if !owner_matches {
                    continue;
                }
                match update.new_state {
                    cluster_wire::NodeState::Expired | cluster_wire::NodeState::LoggedOut => {
                        self.fail_partition(partition).await;
                    }
                    cluster_wire::NodeState::LoggedIn => {
                        let mut route = partition.route.lock().await;
                        route.set_available(true);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Marks a partition down and synthesizes `TryFailed` for every
    /// outstanding request on it (SPEC_FULL.md §4.8). The stale upstream
    /// connection, if any, is dropped too so the next request reconnects
    /// from scratch.
    async fn fail_partition(&self, partition: &Arc<PartitionState>) {
        let drained = {
            let mut route = partition.route.lock().await;
            route.set_available(false);
            route.drain()
        };
        *partition.upstream.lock().await = None;

        for entry in drained {
            let reply = LockReply {
                subid: entry.subid,
                key: entry.key,
                state: LockState::Unlocked,
                status: LockStatus::TryFailed,
                lvb: Bytes::new(),
            };
            let _ = entry.reply_tx.send(reply).await;
        }
    }

    /// Returns a writable clone of the upstream connection for `partition`,
    /// connecting (and spawning its reader task) on first use or after a
    /// prior failure, subject to `CONNECT_RETRY_LIMIT` when `try_only` is
    /// false.
    async fn ensure_connected(self: &Arc<Self>, partition: &Arc<PartitionState>, try_only: bool) -> Option<TcpStream> {
        {
            let guard = partition.upstream.lock().await;
            if let Some(stream) = guard.as_ref() {
                return Some(stream.clone());
            }
        }

        if !partition.route.lock().await.is_available() {
            return None;
        }

        let attempts = if try_only { 1 } else { CONNECT_RETRY_LIMIT };
        for attempt in 0..attempts {
            match self.connect_upstream(partition).await {
                Ok(stream) => {
                    *partition.upstream.lock().await = Some(stream.clone());
                    let server = self.clone();
                    let partition = partition.clone();
                    let reader_stream = stream.clone();
                    common::async_std::task::spawn(async move {
                        Self::upstream_reader(server, partition, reader_stream).await;
                    });
                    return Some(stream);
                }
                Err(_) if attempt + 1 < attempts => {
                    common::wait_for(Duration::from_millis(100)).await;
                }
                Err(_) => return None,
            }
        }
        None
    }

    async fn connect_upstream(&self, partition: &PartitionState) -> Result<TcpStream> {
        let owner = partition.route.lock().await.owner.clone();
        let port = self.config.lt_port(partition.index);
        let mut stream = TcpStream::connect((owner.as_str(), port)).await?;

        let login = cluster_client::client_login(&self.config.cluster_name, &format!("ltpx-{}", self.config.name), false);
        let mut enc = cluster_wire::Encoder::new();
        login.encode(&mut enc);
        write_frame(&mut stream, Opcode::Login, enc.finish()).await?;

        match read_frame(&mut stream).await? {
            Some((Opcode::LoginReply, body)) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let reply = LoginReply::decode(&mut dec)?;
                if !reply.accepted {
                    return Err(format_err!("lock_table login rejected: {}", reply.reason));
                }
            }
            _ => return Err(format_err!("lock_table handshake failed for partition {}", partition.index)),
        }

        Ok(stream)
    }

    /// Reads `LockReply`/`LockCallback` frames off one partition's upstream
    /// connection for as long as it stays up, dispatching each to the
    /// waiting client (by FIFO match) or the registered callback forwarder
    /// (by caller name).
    async fn upstream_reader(self: Arc<Self>, partition: Arc<PartitionState>, mut stream: TcpStream) {
        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(Some(f)) => f,
                _ => {
                    self.fail_partition(&partition).await;
                    return;
                }
            };
            match frame {
                (Opcode::LockReply, body) => {
                    let mut dec = cluster_wire::Decoder::new(body);
                    let reply = match LockReply::decode(&mut dec) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let matched = {
                        let mut route = partition.route.lock().await;
                        route.take_match(reply.subid, &reply.key)
                    };
                    if let Some(entry) = matched {
                        let _ = entry.reply_tx.send(reply).await;
                    }
                    // No match: drop and log (SPEC_FULL.md §4.8).
                }
                (Opcode::LockCallback, body) => {
                    let mut dec = cluster_wire::Decoder::new(body);
                    let cb = match cluster_wire::LockCallback::decode(&mut dec) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    let hub = partition.callbacks.lock().await;
                    if let Some(sender) = hub.get(&cb.caller) {
                        let _ = sender.try_send(cb);
                    }
                }
                _ => {}
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

async fn send_login_reply<S: Writeable>(stream: &mut S, accepted: bool, reason: &str) -> Result<()> {
    let reply = LoginReply { accepted, reason: reason.to_string() };
    let mut enc = cluster_wire::Encoder::new();
    reply.encode(&mut enc);
    write_frame(stream, Opcode::LoginReply, enc.finish()).await
}

async fn handle_client_connection(server: Arc<LtpxServer>, mut stream: TcpStream) -> Result<()> {
    let deadline = Duration::from_micros(server.config.new_connection_timeout_micros);
    let login = match common::async_std::future::timeout(deadline, read_login(&mut stream)).await {
        Ok(Ok(Some(login))) => login,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(()),
    };

    if login.cluster_name != server.config.cluster_name {
        send_login_reply(&mut stream, false, "cluster name mismatch").await?;
        return Ok(());
    }

    send_login_reply(&mut stream, true, "ok").await?;
    let caller = login.node_name.clone();

    let (cb_tx, cb_rx) = channel::bounded(64);
    let mut registered_on: Vec<Arc<PartitionState>> = vec![];

    let result = client_message_loop(&server, &mut stream, &caller, &cb_tx, &cb_rx, &mut registered_on).await;

    for partition in &registered_on {
        partition.callbacks.lock().await.remove(&caller);
    }

    result
}

enum ClientEvent {
    Frame(Option<(Opcode, Bytes)>),
    Callback(cluster_wire::LockCallback),
}

async fn next_client_event<S: Readable>(
    stream: &mut S,
    cb_rx: &channel::Receiver<cluster_wire::LockCallback>,
) -> Result<ClientEvent> {
    use common::futures::FutureExt;

    let frame_fut = read_frame(stream).fuse();
    let cb_fut = async { cb_rx.recv().await }.fuse();
    common::futures::pin_mut!(frame_fut, cb_fut);

    common::futures::select! {
        frame = frame_fut => Ok(ClientEvent::Frame(frame?)),
        cb = cb_fut => match cb {
            Ok(c) => Ok(ClientEvent::Callback(c)),
            Err(_) => Ok(ClientEvent::Frame(None)),
        },
    }
}

async fn client_message_loop<S: Readable + Writeable>(
    server: &Arc<LtpxServer>,
    stream: &mut S,
    caller: &str,
    cb_tx: &channel::Sender<cluster_wire::LockCallback>,
    cb_rx: &channel::Receiver<cluster_wire::LockCallback>,
    registered_on: &mut Vec<Arc<PartitionState>>,
) -> Result<()> {
    loop {
        match next_client_event(stream, cb_rx).await? {
            ClientEvent::Frame(None) => return Ok(()),
            ClientEvent::Frame(Some((Opcode::LockRequest, body))) | ClientEvent::Frame(Some((Opcode::LockAction, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let mut req = LockRequest::decode(&mut dec)?;
                req.caller = caller.to_string();
                let reply = forward_lock_request(server, caller, cb_tx, registered_on, req).await;
                let mut enc = cluster_wire::Encoder::new();
                reply.encode(&mut enc);
                write_frame(stream, Opcode::LockReply, enc.finish()).await?;
            }
            ClientEvent::Frame(Some((other, _))) => {
                eprintln!("ltpx: unexpected opcode {:?} from client {}", other.to_value(), caller);
            }
            ClientEvent::Callback(cb) => {
                let mut enc = cluster_wire::Encoder::new();
                cb.encode(&mut enc);
                write_frame(stream, Opcode::LockCallback, enc.finish()).await?;
            }
        }
    }
}

/// Routes one client lock request to the owning partition and returns the
/// reply to send back — either the real `LockReply` relayed from the
/// partition master, or a synthesized `TryFailed`/no-master reply when the
/// partition is unreachable (SPEC_FULL.md §4.8).
async fn forward_lock_request(
    server: &Arc<LtpxServer>,
    caller: &str,
    cb_tx: &channel::Sender<cluster_wire::LockCallback>,
    registered_on: &mut Vec<Arc<PartitionState>>,
    req: LockRequest,
) -> LockReply {
    let try_flag = req.flags & cluster_wire::lock_flags::TRY != 0;
    let index = partition_of(&req.key, server.config.lt_partitions) as usize;
    let partition = match server.partitions.get(index) {
        Some(p) => p.clone(),
        None => return no_master_reply(req),
    };

    if !registered_on.iter().any(|p| p.index == partition.index) {
        partition.callbacks.lock().await.insert(caller.to_string(), cb_tx.clone());
        registered_on.push(partition.clone());
    }

    let mut stream = match server.ensure_connected(&partition, try_flag).await {
        Some(s) => s,
        None => return no_master_reply(req),
    };

    let (reply_tx, reply_rx) = channel::bounded(1);
    {
        let mut route = partition.route.lock().await;
        route.push(PendingEntry { subid: req.subid, key: req.key.clone(), reply_tx });
    }

    let mut enc = cluster_wire::Encoder::new();
    req.encode(&mut enc);
    if write_frame(&mut stream, Opcode::LockRequest, enc.finish()).await.is_err() {
        server.fail_partition(&partition).await;
        return no_master_reply(req);
    }

    match reply_rx.recv().await {
        Ok(reply) => reply,
        Err(_) => no_master_reply(req),
    }
}

fn no_master_reply(req: LockRequest) -> LockReply {
    LockReply {
        subid: req.subid,
        key: req.key,
        state: req.requested_state,
        status: LockStatus::TryFailed,
        lvb: Bytes::new(),
    }
}
