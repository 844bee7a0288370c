//! Thin client library for the cluster wire protocol (SPEC_FULL.md §4.9),
//! grounded on `pkg/datastore/src/meta/client`'s role as a small connector
//! crate living alongside its server crate. Used by `lock_table` to watch
//! `cluster_core` membership, by `lock_proxy` to forward to LT partitions,
//! and by integration tests that need to drive a whole cluster end to end.

use cluster_wire::{
    read_frame, write_frame, Login, LoginReply, MembershipUpdate, NodeRole, Opcode, Record,
};
use common::async_std::net::TcpStream;
use common::errors::*;

/// One authenticated connection. Holds nothing beyond the socket: callers
/// drive the message loop themselves with `send`/`recv`.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Connects to `addr`, performs the login handshake, and returns the
    /// connection only if the peer accepted it.
    pub async fn connect(addr: (&str, u16), login: Login) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;

        let mut enc = cluster_wire::Encoder::new();
        login.encode(&mut enc);
        write_frame(&mut stream, Opcode::Login, enc.finish()).await?;

        match read_frame(&mut stream).await? {
            Some((Opcode::LoginReply, body)) => {
                let mut dec = cluster_wire::Decoder::new(body);
                let reply = LoginReply::decode(&mut dec)?;
                if !reply.accepted {
                    return Err(format_err!("login rejected: {}", reply.reason));
                }
            }
            Some((other, _)) => return Err(format_err!("expected LoginReply, got {:?}", other.to_value())),
            None => return Err(format_err!("connection closed during handshake")),
        }

        Ok(Connection { stream })
    }

    pub async fn send<R: Record>(&mut self, opcode: Opcode, record: &R) -> Result<()> {
        let mut enc = cluster_wire::Encoder::new();
        record.encode(&mut enc);
        write_frame(&mut self.stream, opcode, enc.finish()).await
    }

    pub async fn recv(&mut self) -> Result<Option<(Opcode, common::bytes::Bytes)>> {
        read_frame(&mut self.stream).await
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Builds the `Login` record a non-peer client sends: no node IP to report,
/// no cluster-name/config-hash requirement enforced by the server (that
/// check is skipped for `NodeRole::Client` — see `cluster_core::conn`).
pub fn client_login(cluster_name: &str, service_name: &str, subscribe_membership: bool) -> Login {
    Login {
        version: 1,
        role: NodeRole::Client,
        cluster_name: cluster_name.to_string(),
        config_hash: 0,
        node_name: service_name.to_string(),
        node_ip: [0u8; 16],
        subscribe_membership,
    }
}

/// Connects to `cluster_core` with membership subscription set and forwards
/// every delta it sends onto a bounded channel, until the connection drops.
/// Intended to be spawned as its own task by callers (`lock_table`'s
/// membership watcher, in particular).
///
/// `cluster_core::conn` tracks every accepted login in the same heartbeat
/// LRU regardless of role (SPEC_FULL.md's node model applies to `Client`
/// logins too, not just peers), so this loop heartbeats on `heartbeat_period`
/// just like a real logged-in node would — otherwise the watcher itself
/// would eventually miss enough beats to be marked `Expired` and queued for
/// fencing.
pub async fn watch_membership(
    addr: (&str, u16),
    cluster_name: &str,
    service_name: &str,
    heartbeat_period: std::time::Duration,
    updates: common::async_std::channel::Sender<MembershipUpdate>,
) -> Result<()> {
    use common::futures::FutureExt;

    let login = client_login(cluster_name, service_name, true);
    let mut conn = Connection::connect(addr, login).await?;

    enum Event {
        Tick,
        Frame(Result<Option<(Opcode, common::bytes::Bytes)>>),
    }

    loop {
        // Scoped so both futures (and their borrow of `conn`) are dropped
        // before `conn` is touched again below.
        let event = {
            let tick = common::wait_for(heartbeat_period).fuse();
            let frame = conn.recv().fuse();
            common::futures::pin_mut!(tick, frame);
            common::futures::select! {
                _ = tick => Event::Tick,
                result = frame => Event::Frame(result),
            }
        };

        match event {
            Event::Tick => {
                let beat = cluster_wire::Heartbeat { timestamp_micros: now_micros() };
                conn.send(Opcode::HeartbeatRequest, &beat).await?;
                // The server may interleave a MembershipUpdate before the
                // HeartbeatReply (its own message loop races the two); keep
                // reading until the reply actually shows up rather than
                // risking dropping a delta.
                loop {
                    match conn.recv().await? {
                        None => return Ok(()),
                        Some((Opcode::HeartbeatReply, _)) => break,
                        Some((Opcode::MembershipUpdate, body)) => {
                            let mut dec = cluster_wire::Decoder::new(body);
                            let update = MembershipUpdate::decode(&mut dec)?;
                            if updates.send(update).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some((_, _)) => {}
                    }
                }
            }
            Event::Frame(result) => match result? {
                None => return Ok(()),
                Some((Opcode::MembershipUpdate, body)) => {
                    let mut dec = cluster_wire::Decoder::new(body);
                    let update = MembershipUpdate::decode(&mut dec)?;
                    if updates.send(update).await.is_err() {
                        return Ok(());
                    }
                }
                Some((_, _)) => {} // ignore anything else on this connection
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_login_carries_no_peer_identity() {
        let login = client_login("mycluster", "lock_table-0", true);
        assert_eq!(login.role.to_value(), NodeRole::Client.to_value());
        assert!(login.subscribe_membership);
        assert_eq!(login.node_ip, [0u8; 16]);
    }
}
