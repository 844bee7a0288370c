//! Network side of election probing (SPEC_FULL.md §4.5's "(impl)" note).
//! `election::decide` stays pure and unit-testable; this module is the one
//! piece of it that actually opens a socket.
//!
//! There is no published wire format for this exchange in
//! `examples/original_source/gulm` (the retrieved sources cover fencing and
//! node lists but not the core-to-core arbitration probe itself), so
//! `cluster_wire::PeerStatus` is this crate's own opcode for it. It never
//! reaches a filesystem client: a probe is a short-lived connection that
//! performs the same `Login` handshake as any other peer, exchanges one
//! `PeerStatus` each way, and disconnects.

use std::time::Duration;

use async_trait::async_trait;
use cluster_wire::{read_frame, write_frame, Login, LoginReply, NodeRole, Opcode, PeerStatus, Record};
use common::async_std::net::TcpStream;

use crate::election::PeerClaim;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait PeerProbe: Send + Sync {
    /// Attempts one probe of `peer_name:core_port`. `None` means
    /// unreachable or unresponsive within the timeout, which `election`
    /// treats the same as the peer simply being absent from `visible`.
    ///
    /// `self_name` is this node's own configured name: the probe performs
    /// the same `Login` handshake as any other peer connection, and the
    /// receiving `cluster_core` registers it under that name exactly like a
    /// real server login (SPEC_FULL.md §4.9 item 1's "server peer" case),
    /// so the peer's registry actually learns this node is up rather than
    /// accumulating an anonymous entry.
    async fn probe(
        &self,
        self_name: &str,
        peer_name: &str,
        peer_rank: usize,
        core_port: u16,
        cluster_name: &str,
        self_config_hash: u32,
        self_role: NodeRole,
    ) -> Option<PeerClaim>;
}

#[derive(Clone, Copy, Default)]
pub struct TcpPeerProbe;

#[async_trait]
impl PeerProbe for TcpPeerProbe {
    async fn probe(
        &self,
        self_name: &str,
        peer_name: &str,
        peer_rank: usize,
        core_port: u16,
        cluster_name: &str,
        self_config_hash: u32,
        self_role: NodeRole,
    ) -> Option<PeerClaim> {
        let attempt = probe_once(self_name, peer_name, core_port, cluster_name, self_config_hash, self_role);
        let (role, config_hash_matches) =
            common::async_std::future::timeout(PROBE_TIMEOUT, attempt)
                .await
                .ok()??;

        Some(PeerClaim {
            rank: peer_rank,
            role,
            config_hash_matches,
        })
    }
}

async fn probe_once(
    self_name: &str,
    peer_name: &str,
    core_port: u16,
    cluster_name: &str,
    self_config_hash: u32,
    self_role: NodeRole,
) -> Option<(NodeRole, bool)> {
    let mut stream = TcpStream::connect((peer_name, core_port)).await.ok()?;

    let login = Login {
        version: 1,
        role: self_role,
        cluster_name: cluster_name.to_string(),
        config_hash: self_config_hash,
        node_name: self_name.to_string(),
        node_ip: [0u8; 16],
        subscribe_membership: false,
    };
    let mut enc = cluster_wire::Encoder::new();
    login.encode(&mut enc);
    write_frame(&mut stream, Opcode::Login, enc.finish()).await.ok()?;

    let (opcode, body) = read_frame(&mut stream).await.ok()??;
    if opcode != Opcode::LoginReply {
        return None;
    }
    let mut dec = cluster_wire::Decoder::new(body);
    if !LoginReply::decode(&mut dec).ok()?.accepted {
        return None;
    }

    let status = PeerStatus {
        role: self_role,
        config_hash: self_config_hash,
    };
    let mut enc = cluster_wire::Encoder::new();
    status.encode(&mut enc);
    write_frame(&mut stream, Opcode::PeerStatus, enc.finish()).await.ok()?;

    let (opcode, body) = read_frame(&mut stream).await.ok()??;
    if opcode != Opcode::PeerStatus {
        return None;
    }
    let mut dec = cluster_wire::Decoder::new(body);
    let reply = PeerStatus::decode(&mut dec).ok()?;
    Some((reply.role, reply.config_hash == self_config_hash))
}
