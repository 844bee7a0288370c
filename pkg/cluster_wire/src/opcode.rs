//! Opcode values for the cluster wire protocol. Every frame on the wire
//! begins with one of these as a big-endian u32.

common::enum_def_with_unknown!(Opcode u32 =>
    // Handshake
    Login = 1,
    LoginReply = 2,
    Logout = 3,

    // Membership
    MembershipUpdate = 10,
    MembershipSubscribe = 11,
    MembershipListRequest = 12,
    MembershipListReply = 13,

    // Heartbeat
    HeartbeatRequest = 20,
    HeartbeatReply = 21,

    // Lock operations. `LockRequest` carries a fresh acquisition
    // (`LockActionCode::Request`); `LockAction` reuses the same record for
    // `Cancel`/`Convert`/`DropAllForCaller` — the action code inside the
    // record, not the opcode, tells the lock table which one it is.
    LockRequest = 30,
    LockReply = 31,
    LockAction = 32,
    // Server push: a waiter wants a mode incompatible with what a current
    // holder has (SPEC_FULL.md §4.7's demotion callback).
    LockCallback = 33,

    // LVB
    LvbHold = 40,
    LvbUnhold = 41,
    LvbSync = 42,
    LvbAck = 43,

    // Admin
    AdminStats = 50,
    AdminDump = 51,
    AdminForceExpire = 52,

    // Server-to-server arbitration (internal; never sent to filesystem
    // clients). Exchanged once per election probe right after a peer-role
    // Login is accepted, so each side learns what the other currently
    // believes its own role to be.
    PeerStatus = 60
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_values() {
        assert_eq!(Opcode::from_value(1).to_value(), 1);
        assert_eq!(Opcode::from_value(30).to_value(), 30);
    }

    #[test]
    fn unknown_values_are_preserved() {
        match Opcode::from_value(9999) {
            Opcode::Unknown(v) => assert_eq!(v, 9999),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
