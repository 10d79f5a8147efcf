//! Length-prefixed big-endian frame primitives.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Upper bound accepted for any single length field read off the wire.
/// A header claiming more than this is treated as corrupt rather than
/// honored with an allocation.
pub const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// Errors produced while reading a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame header: {0}")]
    Malformed(&'static str),
    #[error("unknown message id {0}")]
    UnknownId(u32),
}

/// Appends a 64-bit millisecond timestamp as (high32, low32).
pub fn put_ms(buf: &mut Vec<u8>, ms: i64) {
    let v = ms as u64;
    buf.write_u32::<BigEndian>((v >> 32) as u32).expect("vec write");
    buf.write_u32::<BigEndian>((v & 0xffff_ffff) as u32)
        .expect("vec write");
}

/// Appends a big-endian u32.
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.write_u32::<BigEndian>(v).expect("vec write");
}

/// Appends a big-endian i32.
pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.write_i32::<BigEndian>(v).expect("vec write");
}

/// Appends a big-endian u64 as (high32, low32).
pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.write_u32::<BigEndian>((v >> 32) as u32).expect("vec write");
    buf.write_u32::<BigEndian>((v & 0xffff_ffff) as u32)
        .expect("vec write");
}

/// Patches the leading body-length word once a frame is fully assembled.
/// The length excludes the 4 bytes of the word itself.
pub fn patch_len(buf: &mut Vec<u8>) {
    let body = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&body.to_be_bytes());
}

/// Reads a 64-bit millisecond timestamp transmitted as (high32, low32).
pub fn read_ms<R: Read>(r: &mut R) -> io::Result<i64> {
    let hi = r.read_u32::<BigEndian>()? as u64;
    let lo = r.read_u32::<BigEndian>()? as u64;
    Ok(((hi << 32) | lo) as i64)
}

/// Reads a (high32, low32) pair as an unsigned 64-bit counter.
pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let hi = r.read_u32::<BigEndian>()? as u64;
    let lo = r.read_u32::<BigEndian>()? as u64;
    Ok((hi << 32) | lo)
}

/// Reads a length field, rejecting values that cannot describe a real
/// payload.
pub fn read_len<R: Read>(r: &mut R) -> Result<usize, FrameError> {
    let v = r.read_u32::<BigEndian>()?;
    if v > MAX_FIELD_LEN {
        return Err(FrameError::Malformed("length field out of range"));
    }
    Ok(v as usize)
}

/// Reads `len` bytes as a UTF-8 string. Non-UTF-8 bytes are replaced
/// rather than failing the whole frame.
pub fn read_string<R: Read>(r: &mut R, len: usize) -> io::Result<String> {
    let mut raw = vec![0u8; len];
    r.read_exact(&mut raw)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Reads the two leading words of a frame: body length and message id.
pub fn read_header<R: Read>(r: &mut R) -> Result<(usize, u32), FrameError> {
    let size = read_len(r)?;
    if size < 4 {
        return Err(FrameError::Malformed("frame shorter than its id"));
    }
    let id = r.read_u32::<BigEndian>()?;
    Ok((size, id))
}

/// Writes the whole buffer, mapping a short write to an error.
pub fn write_all<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    w.write_all(buf)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ms_round_trips_through_split_words() {
        let mut buf = Vec::new();
        put_ms(&mut buf, 0x0001_0203_0405_0607);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
        let back = read_ms(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back, 0x0001_0203_0405_0607);
    }

    #[test]
    fn patch_len_excludes_itself() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 5);
        put_u32(&mut buf, 7);
        patch_len(&mut buf);
        assert_eq!(&buf[0..4], &[0, 0, 0, 8]);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        put_u32(&mut buf, MAX_FIELD_LEN + 1);
        assert!(matches!(
            read_len(&mut Cursor::new(&buf)),
            Err(FrameError::Malformed(_))
        ));
    }
}
