//! Tagged record types exchanged once an opcode has identified which one
//! follows. Each record knows how to `encode` itself into an `Encoder` and
//! `decode` itself out of a `Decoder`; the opcode itself is written/read by
//! the caller (see `conn.rs`).

use common::bytes::Bytes;
use common::errors::*;

use crate::codec::{Decoder, Encoder};

common::enum_def_with_unknown!(NodeState u8 =>
    LoggedOut = 0,
    LoggedIn = 1,
    OldMasterLoggedIn = 2,
    Expired = 3,
    Killed = 4
);

common::enum_def_with_unknown!(NodeRole u8 =>
    Slave = 0,
    Pending = 1,
    Arbitrating = 2,
    Master = 3,
    Client = 4
);

common::enum_def_with_unknown!(LockState u8 =>
    Unlocked = 0,
    Exclusive = 1,
    Shared = 2,
    Deferred = 3,
    ExclusivePending = 4,
    ExclusiveSharedPending = 5
);

common::enum_def_with_unknown!(LockStatus u8 =>
    Granted = 0,
    Queued = 1,
    TryFailed = 2,
    Cancelled = 3,
    Error = 4
);

common::enum_def_with_unknown!(LockActionCode u8 =>
    Request = 0,
    Cancel = 1,
    DropAllForCaller = 2,
    Convert = 3,
    Release = 4
);

/// Bitset of request modifiers carried on a `LockRequest`. Mirrors the
/// per-holder flag set described for the lock table (Try, priority bypass,
/// recursion control, caching hints, ...).
pub mod lock_flags {
    pub const TRY: u32 = 1 << 0;
    pub const TRY_ONE_CB: u32 = 1 << 1;
    pub const NO_EXPIRE: u32 = 1 << 2;
    pub const ANY: u32 = 1 << 3;
    pub const PRIORITY: u32 = 1 << 4;
    pub const LOCAL_EXCLUSIVE: u32 = 1 << 5;
    pub const ASYNC: u32 = 1 << 6;
    pub const EXACT: u32 = 1 << 7;
    pub const SKIP_READ_AFTER_GRANT: u32 = 1 << 8;
    pub const UPDATE_ATIME: u32 = 1 << 9;
    pub const NO_CACHE: u32 = 1 << 10;
    pub const SYNC: u32 = 1 << 11;
    pub const NO_CANCEL: u32 = 1 << 12;
    pub const NEVER_RECURSE: u32 = 1 << 13;
}

pub trait Record: Sized {
    fn encode(&self, enc: &mut Encoder);
    fn decode(dec: &mut Decoder) -> Result<Self>;
}

#[derive(Debug, Clone)]
pub struct Login {
    pub version: u32,
    pub role: NodeRole,
    pub cluster_name: String,
    pub config_hash: u32,
    pub node_name: String,
    pub node_ip: [u8; 16],
    pub subscribe_membership: bool,
}

impl Record for Login {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.version);
        enc.put_u8(self.role.to_value());
        enc.put_str(&self.cluster_name);
        enc.put_u32(self.config_hash);
        enc.put_str(&self.node_name);
        enc.put_ipv6(&self.node_ip);
        enc.put_u8(self.subscribe_membership as u8);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(Login {
            version: dec.get_u32()?,
            role: NodeRole::from_value(dec.get_u8()?),
            cluster_name: dec.get_str()?,
            config_hash: dec.get_u32()?,
            node_name: dec.get_str()?,
            node_ip: dec.get_ipv6()?,
            subscribe_membership: dec.get_u8()? != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoginReply {
    pub accepted: bool,
    pub reason: String,
}

impl Record for LoginReply {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.accepted as u8);
        enc.put_str(&self.reason);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(LoginReply {
            accepted: dec.get_u8()? != 0,
            reason: dec.get_str()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MembershipUpdate {
    pub node_name: String,
    pub new_state: NodeState,
    pub node_ip: [u8; 16],
}

impl Record for MembershipUpdate {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(&self.node_name);
        enc.put_u8(self.new_state.to_value());
        enc.put_ipv6(&self.node_ip);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(MembershipUpdate {
            node_name: dec.get_str()?,
            new_state: NodeState::from_value(dec.get_u8()?),
            node_ip: dec.get_ipv6()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MembershipListReply {
    pub nodes: Vec<MembershipUpdate>,
}

impl Record for MembershipListReply {
    fn encode(&self, enc: &mut Encoder) {
        enc.start_list();
        for node in &self.nodes {
            node.encode(enc);
        }
        enc.stop_list();
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let mut nodes = vec![];
        while dec.list_continues()? {
            nodes.push(MembershipUpdate::decode(dec)?);
        }
        Ok(MembershipListReply { nodes })
    }
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub timestamp_micros: u64,
}

impl Record for Heartbeat {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.timestamp_micros);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(Heartbeat {
            timestamp_micros: dec.get_u64()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub action: LockActionCode,
    pub subid: u64,
    pub key: Bytes,
    pub requested_state: LockState,
    pub flags: u32,
    pub lvb: Bytes,
    /// Identity of the caller this request is made on behalf of. Empty
    /// when the sending connection's own login name should be used (the
    /// common case for a client talking to `lock_table` directly);
    /// non-empty when `lock_proxy` is forwarding one of several clients
    /// multiplexed over a single upstream connection, so the partition
    /// must not attribute every forwarded holder to `ltpx` itself.
    pub caller: String,
}

impl Record for LockRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.action.to_value());
        enc.put_u64(self.subid);
        enc.put_bytes(&self.key);
        enc.put_u8(self.requested_state.to_value());
        enc.put_u32(self.flags);
        enc.put_bytes(&self.lvb);
        enc.put_str(&self.caller);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(LockRequest {
            action: LockActionCode::from_value(dec.get_u8()?),
            subid: dec.get_u64()?,
            key: dec.get_bytes()?,
            requested_state: LockState::from_value(dec.get_u8()?),
            flags: dec.get_u32()?,
            lvb: dec.get_bytes()?,
            caller: dec.get_str()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LockReply {
    pub subid: u64,
    pub key: Bytes,
    pub state: LockState,
    pub status: LockStatus,
    pub lvb: Bytes,
}

impl Record for LockReply {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.subid);
        enc.put_bytes(&self.key);
        enc.put_u8(self.state.to_value());
        enc.put_u8(self.status.to_value());
        enc.put_bytes(&self.lvb);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(LockReply {
            subid: dec.get_u64()?,
            key: dec.get_bytes()?,
            state: LockState::from_value(dec.get_u8()?),
            status: LockStatus::from_value(dec.get_u8()?),
            lvb: dec.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LvbSync {
    pub subid: u64,
    pub key: Bytes,
    pub lvb: Bytes,
}

impl Record for LvbSync {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.subid);
        enc.put_bytes(&self.key);
        enc.put_bytes(&self.lvb);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(LvbSync {
            subid: dec.get_u64()?,
            key: dec.get_bytes()?,
            lvb: dec.get_bytes()?,
        })
    }
}

common::enum_def_with_unknown!(DemotionKind u8 =>
    NeedExclusive = 0,
    NeedShared = 1,
    NeedDeferred = 2
);

/// Server push telling a current holder that some other waiter needs an
/// incompatible mode (SPEC_FULL.md §4.7's demotion callback). Not a
/// request/reply pair: the lock table never waits on an acknowledgement.
#[derive(Debug, Clone)]
pub struct LockCallback {
    pub key: Bytes,
    pub kind: DemotionKind,
    /// Empty when the receiving connection represents exactly one caller
    /// (the direct-to-`lock_table` case). `lock_proxy` multiplexes several
    /// callers over one upstream connection, so it needs this to know
    /// which client to forward the callback to.
    pub caller: String,
}

impl Record for LockCallback {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_bytes(&self.key);
        enc.put_u8(self.kind.to_value());
        enc.put_str(&self.caller);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(LockCallback {
            key: dec.get_bytes()?,
            kind: DemotionKind::from_value(dec.get_u8()?),
            caller: dec.get_str()?,
        })
    }
}

/// Body shared by `LvbHold`/`LvbUnhold`: which existing holder's LVB
/// reference is being taken or released.
#[derive(Debug, Clone)]
pub struct LvbHoldRequest {
    pub subid: u64,
    pub key: Bytes,
}

impl Record for LvbHoldRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.subid);
        enc.put_bytes(&self.key);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(LvbHoldRequest {
            subid: dec.get_u64()?,
            key: dec.get_bytes()?,
        })
    }
}

/// Generic one-bit acknowledgement, used where a request either succeeds or
/// fails with no further data to report (`LvbHold`/`LvbUnhold`/`LvbSync`
/// replies).
#[derive(Debug, Clone)]
pub struct Ack {
    pub ok: bool,
}

impl Record for Ack {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.ok as u8);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(Ack { ok: dec.get_u8()? != 0 })
    }
}

/// Server-to-server-only status exchange used during election probing (see
/// `cluster_core::election`). Not part of the filesystem-client wire
/// contract.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub role: NodeRole,
    pub config_hash: u32,
}

impl Record for PeerStatus {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.role.to_value());
        enc.put_u32(self.config_hash);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(PeerStatus {
            role: NodeRole::from_value(dec.get_u8()?),
            config_hash: dec.get_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdminForceExpire {
    pub node_name: String,
}

impl Record for AdminForceExpire {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(&self.node_name);
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        Ok(AdminForceExpire {
            node_name: dec.get_str()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::bytes::Bytes;

    #[test]
    fn login_round_trips() {
        let login = Login {
            version: 1,
            role: NodeRole::Client,
            cluster_name: "mycluster".into(),
            config_hash: 0xdeadbeef,
            node_name: "node-a".into(),
            node_ip: [0u8; 16],
            subscribe_membership: true,
        };
        let mut enc = Encoder::new();
        login.encode(&mut enc);
        let mut dec = Decoder::new(enc.finish());
        let back = Login::decode(&mut dec).unwrap();
        assert_eq!(back.cluster_name, "mycluster");
        assert_eq!(back.config_hash, 0xdeadbeef);
        assert!(back.subscribe_membership);
    }

    #[test]
    fn peer_status_round_trips() {
        let status = PeerStatus {
            role: NodeRole::Arbitrating,
            config_hash: 0x1234,
        };
        let mut enc = Encoder::new();
        status.encode(&mut enc);
        let mut dec = Decoder::new(enc.finish());
        let back = PeerStatus::decode(&mut dec).unwrap();
        assert_eq!(back.role, NodeRole::Arbitrating);
        assert_eq!(back.config_hash, 0x1234);
    }

    #[test]
    fn lock_callback_round_trips() {
        let cb = LockCallback {
            key: Bytes::from_static(b"some-key"),
            kind: DemotionKind::NeedExclusive,
            caller: "client-a".to_string(),
        };
        let mut enc = Encoder::new();
        cb.encode(&mut enc);
        let mut dec = Decoder::new(enc.finish());
        let back = LockCallback::decode(&mut dec).unwrap();
        assert_eq!(&back.key[..], b"some-key");
        assert_eq!(back.kind, DemotionKind::NeedExclusive);
    }

    #[test]
    fn lock_request_round_trips() {
        let req = LockRequest {
            action: LockActionCode::Request,
            subid: 42,
            key: Bytes::from_static(b"some-key"),
            requested_state: LockState::Exclusive,
            flags: lock_flags::TRY,
            lvb: Bytes::new(),
            caller: String::new(),
        };
        let mut enc = Encoder::new();
        req.encode(&mut enc);
        let mut dec = Decoder::new(enc.finish());
        let back = LockRequest::decode(&mut dec).unwrap();
        assert_eq!(back.subid, 42);
        assert_eq!(&back.key[..], b"some-key");
        assert_eq!(back.flags, lock_flags::TRY);
    }
}
