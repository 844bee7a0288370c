//! Slave-side consumption of another core's membership feed (SPEC_FULL.md
//! §4.6's "slaves apply the triple verbatim to their local registry").
//!
//! Grounded on `cluster_client::watch_membership`'s handshake-then-race
//! shape, adapted two ways: the login claims this node's real peer role
//! instead of `NodeRole::Client` (so the master's own registry learns this
//! node is up, same as `peer_probe`), and every received triple is applied
//! straight into this process's own `NodeRegistry` and re-announced to its
//! own subscribers, rather than forwarded onto an external channel.

use std::time::Duration;

use cluster_wire::{
    read_frame, write_frame, Login, LoginReply, MembershipListReply, MembershipUpdate, NodeRole,
    Opcode, Record,
};
use common::async_std::net::TcpStream;
use common::errors::*;
use common::futures::FutureExt;

use crate::core::Core;
use crate::election::Role;

/// Connects to `master_name`'s core port, logs in as a subscribing peer,
/// requests the full membership list to seed this registry, then applies
/// every subsequently pushed update until the connection drops or this
/// node's role stops being `Slave`.
pub async fn replicate_from(core: &Core, master_name: &str) -> Result<()> {
    let mut stream = TcpStream::connect((master_name, core.config.core_port)).await?;

    let login = Login {
        version: 1,
        role: NodeRole::Slave,
        cluster_name: core.config.cluster_name.clone(),
        config_hash: core.config_hash,
        node_name: core.config.name.clone(),
        node_ip: [0u8; 16],
        subscribe_membership: true,
    };
    let mut enc = cluster_wire::Encoder::new();
    login.encode(&mut enc);
    write_frame(&mut stream, Opcode::Login, enc.finish()).await?;

    match read_frame(&mut stream).await? {
        Some((Opcode::LoginReply, body)) => {
            let mut dec = cluster_wire::Decoder::new(body);
            if !LoginReply::decode(&mut dec)?.accepted {
                return Err(format_err!("replication login rejected by {}", master_name));
            }
        }
        Some((other, _)) => return Err(format_err!("expected LoginReply, got {:?}", other.to_value())),
        None => return Err(format_err!("connection closed during replication handshake")),
    }

    write_frame(&mut stream, Opcode::MembershipListRequest, common::bytes::Bytes::new()).await?;

    let heartbeat_period = Duration::from_micros(core.config.heartbeat_rate_micros / 2);

    loop {
        if core.state.lock().await.role != Role::Slave {
            return Ok(());
        }

        let tick = common::wait_for(heartbeat_period).fuse();
        let frame = read_frame(&mut stream).fuse();
        common::futures::pin_mut!(tick, frame);

        let frame = common::futures::select! {
            _ = tick => {
                let beat = cluster_wire::Heartbeat { timestamp_micros: core.now_micros() };
                let mut enc = cluster_wire::Encoder::new();
                beat.encode(&mut enc);
                write_frame(&mut stream, Opcode::HeartbeatRequest, enc.finish()).await?;
                continue;
            }
            frame = frame => frame?,
        };

        match frame {
            None => return Ok(()),
            Some((Opcode::MembershipUpdate, body)) => {
                let mut dec = cluster_wire::Decoder::new(body);
                apply_update(core, MembershipUpdate::decode(&mut dec)?).await;
            }
            Some((Opcode::MembershipListReply, body)) => {
                let mut dec = cluster_wire::Decoder::new(body);
                for update in MembershipListReply::decode(&mut dec)?.nodes {
                    apply_update(core, update).await;
                }
            }
            Some((_, _)) => {} // HeartbeatReply and anything else, ignored
        }
    }
}

async fn apply_update(core: &Core, update: MembershipUpdate) {
    let now = core.now_micros();
    let mut state = core.state.lock().await;
    state
        .registry
        .apply_replicated_update(&update.node_name, update.node_ip, update.new_state, now);
    state.replicator.announce(update);
}
