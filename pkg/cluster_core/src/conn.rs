//! Per-connection handshake and message loop (SPEC_FULL.md §4.9), grounded
//! on `examples/original_source/gulm/src/core_fence.c`'s use of node
//! name/IP on the wire and the distilled spec's three-step handshake:
//! validate cluster name, validate config hash, then authorize name↔IP.

use std::net::SocketAddr;
use std::time::Duration;

use cluster_wire::{read_frame, write_frame, Login, LoginReply, Opcode, Record};
use common::errors::*;
use common::io::{Readable, Writeable};

use crate::core::Core;

/// Runs the handshake on a freshly-accepted connection and, if accepted,
/// the subsequent message loop. Never returns an error for a rejected
/// login (that is a normal outcome, logged and the socket closed); errors
/// here represent I/O failure only.
pub async fn handle_connection<S: Readable + Writeable>(core: &Core, mut stream: S, peer_addr: SocketAddr) -> Result<()> {
    let deadline = Duration::from_micros(core.config.new_connection_timeout_micros);
    let login = match common::async_std::future::timeout(deadline, read_login(&mut stream)).await {
        Ok(Ok(Some(login))) => login,
        Ok(Ok(None)) => return Ok(()), // peer hung up before authenticating
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(()), // handshake deadline exceeded
    };

    if login.cluster_name != core.config.cluster_name {
        send_reply(&mut stream, false, "cluster name mismatch").await?;
        return Ok(());
    }

    if login.role.to_value() != cluster_wire::NodeRole::Client.to_value()
        && login.config_hash != core.config_hash
    {
        send_reply(&mut stream, false, "config hash mismatch").await?;
        return Ok(());
    }

    let ip = login.node_ip;
    let name = login.node_name.clone();
    let authorized = {
        let mut state = core.state.lock().await;
        state.registry.mark_login(&name, ip, core.now_micros(), core.auth_hook.as_ref())
    };
    if authorized.is_err() {
        send_reply(&mut stream, false, "authorization rejected").await?;
        return Ok(());
    }

    send_reply(&mut stream, true, "ok").await?;
    log::info(core, &format!("login accepted from {} ({})", name, peer_addr));

    let subscribe_rx = if login.subscribe_membership {
        let (tx, rx) = common::async_std::channel::bounded(256);
        let mut state = core.state.lock().await;
        state.replicator.add(crate::membership::Subscriber {
            name: name.clone(),
            sender: tx,
        });
        Some(rx)
    } else {
        None
    };

    let result = message_loop(core, &mut stream, &name, subscribe_rx.as_ref()).await;

    {
        let mut state = core.state.lock().await;
        state.replicator.remove(&name);
    }

    result
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
    let reply = LoginReply {
        accepted,
        reason: reason.to_string(),
    };
    let mut enc = cluster_wire::Encoder::new();
    reply.encode(&mut enc);
    write_frame(stream, Opcode::LoginReply, enc.finish()).await
}

/// Services `HeartbeatRequest`/`AdminForceExpire` and forwards any queued
/// membership updates for subscribed connections. This loop is
/// necessarily simplified relative to a production implementation (it
/// does not yet speak `LockRequest`/`LvbSync`, which belong to
/// `lock_table`/`lock_proxy` instead since core only arbitrates
/// membership).
async fn message_loop<S: Readable + Writeable>(
    core: &Core,
    stream: &mut S,
    peer_name: &str,
    subscribe_rx: Option<&common::async_std::channel::Receiver<cluster_wire::MembershipUpdate>>,
) -> Result<()> {
    loop {
        let frame = match subscribe_rx {
            Some(rx) => read_frame_or_update(stream, rx).await?,
            None => ReadOutcome::Frame(read_frame(stream).await?),
        };

        match frame {
            ReadOutcome::Frame(None) => return Ok(()),
            ReadOutcome::Frame(Some((Opcode::HeartbeatRequest, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let beat = cluster_wire::Heartbeat::decode(&mut dec)?;
                let mut state = core.state.lock().await;
                state.registry.beat(peer_name, beat.timestamp_micros);
                drop(state);

                let reply = cluster_wire::Heartbeat {
                    timestamp_micros: core.now_micros(),
                };
                let mut enc = cluster_wire::Encoder::new();
                reply.encode(&mut enc);
                write_frame(stream, Opcode::HeartbeatReply, enc.finish()).await?;
            }
            ReadOutcome::Frame(Some((Opcode::PeerStatus, body))) => {
                // Server-to-server arbitration probe (see
                // `crate::peer_probe`). The peer already told us its claimed
                // role; we just report our own back.
                let mut dec = cluster_wire::Decoder::new(body);
                let _incoming = cluster_wire::PeerStatus::decode(&mut dec)?;
                let role = core.state.lock().await.role.to_wire();
                let reply = cluster_wire::PeerStatus {
                    role,
                    config_hash: core.config_hash,
                };
                let mut enc = cluster_wire::Encoder::new();
                reply.encode(&mut enc);
                write_frame(stream, Opcode::PeerStatus, enc.finish()).await?;
            }
            ReadOutcome::Frame(Some((Opcode::AdminForceExpire, body))) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let req = cluster_wire::AdminForceExpire::decode(&mut dec)?;
                core.force_expire(&req.node_name).await;
            }
            ReadOutcome::Frame(Some((Opcode::MembershipListRequest, _))) => {
                let state = core.state.lock().await;
                let nodes: Vec<cluster_wire::MembershipUpdate> = state
                    .registry
                    .iter_by_name()
                    .map(|n| cluster_wire::MembershipUpdate {
                        node_name: n.name.clone(),
                        new_state: n.state,
                        node_ip: n.ip,
                    })
                    .collect();
                drop(state);
                let reply = cluster_wire::MembershipListReply { nodes };
                let mut enc = cluster_wire::Encoder::new();
                reply.encode(&mut enc);
                write_frame(stream, Opcode::MembershipListReply, enc.finish()).await?;
            }
            ReadOutcome::Frame(Some((other, _))) => {
                log::info(core, &format!("unexpected opcode {:?} from {}", other.to_value(), peer_name));
            }
            ReadOutcome::Update(update) => {
                let mut enc = cluster_wire::Encoder::new();
                update.encode(&mut enc);
                write_frame(stream, Opcode::MembershipUpdate, enc.finish()).await?;
            }
        }
    }
}

enum ReadOutcome {
    Frame(Option<(Opcode, common::bytes::Bytes)>),
    Update(cluster_wire::MembershipUpdate),
}

/// Races the next inbound frame against the next queued subscriber update,
/// so a subscribed connection does not have to choose between reading the
/// client and flushing membership deltas.
async fn read_frame_or_update<S: Readable>(
    stream: &mut S,
    rx: &common::async_std::channel::Receiver<cluster_wire::MembershipUpdate>,
) -> Result<ReadOutcome> {
    use common::futures::FutureExt;

    let frame_fut = read_frame(stream).fuse();
    let update_fut = async { rx.recv().await }.fuse();
    common::futures::pin_mut!(frame_fut, update_fut);

    common::futures::select! {
        frame = frame_fut => Ok(ReadOutcome::Frame(frame?)),
        update = update_fut => match update {
            Ok(u) => Ok(ReadOutcome::Update(u)),
            Err(_) => Ok(ReadOutcome::Frame(None)),
        },
    }
}

mod log {
    use crate::core::Core;

    /// Plain `component: message` logging gated by the verbosity bitmap
    /// (SPEC_FULL.md §1.1's ambient-stack decision: no `log`/`tracing`
    /// crate, matching `examples/original_source/gulm`'s own `log_msg`
    /// severity-mask style).
    pub fn info(core: &Core, msg: &str) {
        if core.config.verbosity > 0 {
            println!("core: {}", msg);
        }
    }
}
