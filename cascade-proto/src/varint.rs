//! Base-128 varint framing over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Each frame is: `varint(length)` followed by exactly `length` payload
//! bytes. The varint is little-endian unsigned LEB128: seven value bits
//! per byte, high bit set on every byte except the last.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded length of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Maximum allowed frame payload (256 MiB).
///
/// A corrupt length prefix must not be allowed to allocate unbounded
/// memory before the decode failure surfaces.
pub const MAX_FRAME: u64 = 256 * 1024 * 1024;

/// Encodes `value` into `buf`, returning the number of bytes used.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            return len + 1;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
}

/// Reads a varint, one byte at a time, from `r`.
///
/// Fails with [`io::ErrorKind::UnexpectedEof`] if the stream ends
/// mid-varint and with [`io::ErrorKind::InvalidData`] if more than
/// [`MAX_VARINT_LEN`] bytes arrive without a terminator or the encoded
/// value does not fit in a `u64`.
pub async fn read_varint(r: &mut (impl AsyncRead + Unpin)) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).await?;
        let b = byte[0];
        let bits = u64::from(b & 0x7f);
        // The tenth byte may only contribute the single remaining bit.
        if shift == 63 && bits > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows u64",
            ));
        }
        value |= bits << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift as usize >= MAX_VARINT_LEN * 7 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint exceeds 10 bytes without terminator",
            ));
        }
    }
}

/// Writes `value` as a varint to `w`. Does not flush.
pub async fn write_varint(w: &mut (impl AsyncWrite + Unpin), value: u64) -> io::Result<()> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = encode_varint(value, &mut buf);
    w.write_all(&buf[..len]).await
}

/// Reads one length-prefixed frame, blocking until the full payload is
/// available.
#[allow(clippy::cast_possible_truncation)]
pub async fn read_frame(r: &mut (impl AsyncRead + Unpin)) -> io::Result<Vec<u8>> {
    let len = read_varint(r).await?;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME} byte limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes one length-prefixed frame. Does not flush.
///
/// The prefix and payload are assembled into a single buffer so the frame
/// reaches the stream in one write.
pub async fn write_frame(w: &mut (impl AsyncWrite + Unpin), payload: &[u8]) -> io::Result<()> {
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let prefix_len = encode_varint(payload.len() as u64, &mut prefix);
    let mut frame = Vec::with_capacity(prefix_len + payload.len());
    frame.extend_from_slice(&prefix[..prefix_len]);
    frame.extend_from_slice(payload);
    w.write_all(&frame).await
}
