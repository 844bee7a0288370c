//! Big-endian primitive encoder/decoder for the cluster wire protocol.
//!
//! Every message on the wire is a sequence of these primitives prefixed by an
//! opcode (see `opcode.rs`). There is no framing here: `Encoder`/`Decoder`
//! only deal with already-delimited buffers. Framing lives in `conn.rs`.

use common::bytes::{Buf, BufMut, Bytes, BytesMut};
use common::errors::*;
use common::failure::Fail;

/// Maximum size of any single length-prefixed byte array or string accepted
/// from the wire. Keeps a single malformed length field from causing an
/// unbounded allocation.
pub const MAX_BYTES_LEN: usize = 1 << 20;

/// Sentinel values framing a `List` primitive so the reader can tell where
/// the list ends without needing a count up front (matches the original
/// protocol's stream-oriented list encoding).
pub const LIST_START: u8 = 0x01;
pub const LIST_STOP: u8 = 0x00;

pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_ipv6(&mut self, v: &[u8; 16]) {
        self.buf.put_slice(v);
    }

    pub fn start_list(&mut self) {
        self.put_u8(LIST_START);
    }

    pub fn stop_list(&mut self) {
        self.put_u8(LIST_STOP);
    }
}

/// Cursor over a decode buffer. Every method either fully consumes the bytes
/// it needs or leaves the cursor untouched and returns `IncompleteFrame`-like
/// error (surfaced by the caller as `DecodeError::Incomplete`) so a partial
/// frame can simply be retried once more bytes arrive.
pub struct Decoder {
    buf: Bytes,
}

#[derive(Debug, Fail)]
pub enum DecodeError {
    #[fail(display = "not enough bytes to decode the next field")]
    Incomplete,
    #[fail(display = "length prefix {} exceeds the maximum frame field size", _0)]
    FieldTooLarge(usize),
    #[fail(display = "invalid list marker byte {:#x}", _0)]
    BadListMarker(u8),
    #[fail(display = "string field was not valid utf-8")]
    BadString,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> Bytes {
        self.buf
    }

    fn require(&self, n: usize) -> std::result::Result<(), DecodeError> {
        if self.buf.len() < n {
            Err(DecodeError::Incomplete)
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> std::result::Result<u8, DecodeError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> std::result::Result<u16, DecodeError> {
        self.require(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> std::result::Result<u32, DecodeError> {
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> std::result::Result<u64, DecodeError> {
        self.require(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn get_bytes(&mut self) -> std::result::Result<Bytes, DecodeError> {
        let len = self.get_u32()? as usize;
        if len > MAX_BYTES_LEN {
            return Err(DecodeError::FieldTooLarge(len));
        }
        self.require(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_str(&mut self) -> std::result::Result<String, DecodeError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadString)
    }

    pub fn get_ipv6(&mut self) -> std::result::Result<[u8; 16], DecodeError> {
        self.require(16)?;
        let mut out = [0u8; 16];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Returns `true` if a list continues (caller should decode one more
    /// item and call this again), `false` once the stop marker is seen.
    pub fn list_continues(&mut self) -> std::result::Result<bool, DecodeError> {
        let marker = self.get_u8()?;
        match marker {
            LIST_START => Ok(true),
            LIST_STOP => Ok(false),
            other => Err(DecodeError::BadListMarker(other)),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Error {
        format_err!("{}", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut enc = Encoder::new();
        enc.put_u8(7);
        enc.put_u16(1000);
        enc.put_u32(100000);
        enc.put_u64(1u64 << 40);
        enc.put_str("node-a");
        enc.put_ipv6(&[1u8; 16]);
        enc.start_list();
        enc.put_u8(1);
        enc.put_u8(2);
        enc.stop_list();

        let mut dec = Decoder::new(enc.finish());
        assert_eq!(dec.get_u8().unwrap(), 7);
        assert_eq!(dec.get_u16().unwrap(), 1000);
        assert_eq!(dec.get_u32().unwrap(), 100000);
        assert_eq!(dec.get_u64().unwrap(), 1u64 << 40);
        assert_eq!(dec.get_str().unwrap(), "node-a");
        assert_eq!(dec.get_ipv6().unwrap(), [1u8; 16]);
        assert!(dec.list_continues().unwrap());
        assert_eq!(dec.get_u8().unwrap(), 1);
        assert!(dec.list_continues().unwrap());
        assert_eq!(dec.get_u8().unwrap(), 2);
        assert!(!dec.list_continues().unwrap());
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn incomplete_frame_does_not_panic() {
        let mut dec = Decoder::new(Bytes::from_static(&[0, 0]));
        match dec.get_u32() {
            Err(DecodeError::Incomplete) => {}
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut enc = Encoder::new();
        enc.put_u32((MAX_BYTES_LEN + 1) as u32);
        let mut dec = Decoder::new(enc.finish());
        match dec.get_bytes() {
            Err(DecodeError::FieldTooLarge(_)) => {}
            other => panic!("expected FieldTooLarge, got {:?}", other),
        }
    }
}
