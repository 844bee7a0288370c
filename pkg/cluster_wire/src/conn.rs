//! Frame-level I/O shared by every process that speaks the cluster wire
//! protocol: core, lock_table, lock_proxy, and the client library.
//!
//! Wire format per frame: a 32-bit length (covering everything after the
//! length field itself), a 32-bit opcode, then the opcode-specific body.

use common::bytes::Bytes;
use common::errors::*;
use common::io::{Readable, Writeable};

use crate::codec::{Decoder, Encoder, MAX_BYTES_LEN};
use crate::opcode::Opcode;

/// Read one frame off `reader`. Returns `Ok(None)` on a clean EOF between
/// frames (the peer closed the connection); any other I/O error propagates.
pub async fn read_frame<R: Readable>(reader: &mut R) -> Result<Option<(Opcode, Bytes)>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf).await? {
        false => return Ok(None),
        true => {}
    };

    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 || len > MAX_BYTES_LEN {
        return Err(format_err!("invalid frame length {}", len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let mut dec = Decoder::new(Bytes::from(body));
    let opcode = Opcode::from_value(dec.get_u32()?);
    let payload = dec.into_inner();

    Ok(Some((opcode, payload)))
}

/// Like `Readable::read_exact` but reports a clean EOF (zero bytes read
/// before any were consumed) as `Ok(false)` instead of an error, so the
/// frame reader can distinguish "peer hung up between frames" from a
/// truncated frame mid-read.
async fn read_exact_or_eof<R: Readable>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let n = reader.read(buf).await?;
    if n == 0 {
        return Ok(false);
    }
    if n < buf.len() {
        reader.read_exact(&mut buf[n..]).await?;
    }
    Ok(true)
}

pub async fn write_frame<W: Writeable>(writer: &mut W, opcode: Opcode, body: Bytes) -> Result<()> {
    let mut enc = Encoder::new();
    enc.put_u32(opcode.to_value());
    let header = enc.finish();

    let total_len = (header.len() + body.len()) as u32;

    writer.write_all(&total_len.to_be_bytes()).await?;
    writer.write_all(&header).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::async_std::task::block_on;

    struct MemPipe {
        data: Vec<u8>,
        pos: usize,
    }

    #[common::async_trait]
    impl Readable for MemPipe {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let remaining = &self.data[self.pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[common::async_trait]
    impl Writeable for MemPipe {
        async fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frame_round_trips() {
        block_on(async {
            let mut pipe = MemPipe {
                data: vec![],
                pos: 0,
            };
            write_frame(&mut pipe, Opcode::HeartbeatRequest, Bytes::from_static(b"abc"))
                .await
                .unwrap();

            let (opcode, body) = read_frame(&mut pipe).await.unwrap().unwrap();
            assert_eq!(opcode.to_value(), Opcode::HeartbeatRequest.to_value());
            assert_eq!(&body[..], b"abc");
        });
    }

    #[test]
    fn eof_between_frames_is_none() {
        block_on(async {
            let mut pipe = MemPipe {
                data: vec![],
                pos: 0,
            };
            assert!(read_frame(&mut pipe).await.unwrap().is_none());
        });
    }
}
