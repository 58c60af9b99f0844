//! Framing and field encoding shared by every message.
//!
//! A frame is `len: u32 LE | tag: u8 | fields`, where `len` counts the tag
//! and the fields. Fields use little-endian fixed-width integers; strings,
//! byte blobs and id lists are prefixed with a `u32` element count.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use super::message::Message;
use crate::runtime::error::{Error, Result};

const LEN_BYTES: usize = 4;

/// Splits a byte stream into whole frame bodies. Oversized frames are
/// skipped so one bad message never takes the connection down.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    discarding: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            discarding: 0,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        loop {
            if self.discarding > 0 {
                let skip = self.discarding.min(src.len());
                src.advance(skip);
                self.discarding -= skip;
                if self.discarding > 0 {
                    return Ok(None);
                }
            }

            if src.len() < LEN_BYTES {
                return Ok(None);
            }
            let len = LittleEndian::read_u32(&src[..LEN_BYTES]) as usize;
            if len > self.max_frame_size {
                warn!(
                    "discarding {} byte frame, limit is {}",
                    len, self.max_frame_size
                );
                self.discarding = LEN_BYTES + len;
                continue;
            }

            if src.len() < LEN_BYTES + len {
                src.reserve(LEN_BYTES + len - src.len());
                return Ok(None);
            }
            src.advance(LEN_BYTES);
            return Ok(Some(src.split_to(len)));
        }
    }
}

/// Encodes a message into a complete frame, length prefix included.
pub fn encode_frame(msg: &Message) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&[0u8; LEN_BYTES]);
    msg.write(&mut buf)?;
    let len = buf.len() - LEN_BYTES;
    let len = u32::try_from(len).map_err(|_| Error::Decode(format!("{} byte frame", len)))?;
    LittleEndian::write_u32(&mut buf[..LEN_BYTES], len);
    Ok(Bytes::from(buf))
}

// Field helpers. Readers take a `&mut &[u8]` so every length can be checked
// against what is actually left in the frame before allocating.

fn check_remaining(input: &[u8], needed: usize) -> io::Result<()> {
    if input.len() < needed {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("need {} bytes, {} left in frame", needed, input.len()),
        ));
    }
    Ok(())
}

fn write_len<W: Write>(out: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too long"))?;
    out.write_u32::<LittleEndian>(len)
}

pub(crate) fn write_string<W: Write>(out: &mut W, s: &str) -> io::Result<()> {
    write_len(out, s.len())?;
    out.write_all(s.as_bytes())
}

pub(crate) fn read_string(input: &mut &[u8]) -> io::Result<String> {
    let bytes = read_bytes(input)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub(crate) fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_len(out, bytes.len())?;
    out.write_all(bytes)
}

pub(crate) fn read_bytes(input: &mut &[u8]) -> io::Result<Vec<u8>> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    check_remaining(input, len)?;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_ids<W: Write>(out: &mut W, ids: &[u32]) -> io::Result<()> {
    write_len(out, ids.len())?;
    for id in ids {
        out.write_u32::<LittleEndian>(*id)?;
    }
    Ok(())
}

pub(crate) fn read_ids(input: &mut &[u8]) -> io::Result<Vec<u32>> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    check_remaining(input, len.saturating_mul(4))?;
    (0..len).map(|_| input.read_u32::<LittleEndian>()).collect()
}

pub(crate) fn write_opt_string<W: Write>(out: &mut W, s: Option<&str>) -> io::Result<()> {
    match s {
        Some(s) => {
            out.write_u8(1)?;
            write_string(out, s)
        }
        None => out.write_u8(0),
    }
}

pub(crate) fn read_opt_string(input: &mut &[u8]) -> io::Result<Option<String>> {
    match input.read_u8()? {
        0 => Ok(None),
        _ => read_string(input).map(Some),
    }
}

pub(crate) fn write_strings<W: Write>(out: &mut W, strings: &[String]) -> io::Result<()> {
    write_len(out, strings.len())?;
    strings.iter().try_for_each(|s| write_string(out, s))
}

pub(crate) fn read_strings(input: &mut &[u8]) -> io::Result<Vec<String>> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    // each string carries at least its own length prefix
    check_remaining(input, len.saturating_mul(4))?;
    (0..len).map(|_| read_string(input)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::net::message::{Hello, HelloGo};

    #[test]
    fn partial_reads_never_yield_partial_frames() {
        let frame = encode_frame(&Message::Hello(Hello {
            port: 9000,
            thread_ids: vec![0, 1, 2],
        }))
        .unwrap();

        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        for byte in &frame[..frame.len() - 1] {
            buf.extend_from_slice(&[*byte]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let body = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(body.len(), frame.len() - LEN_BYTES);
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&Message::HelloGo(HelloGo)).unwrap());
        buf.extend_from_slice(&encode_frame(&Message::HelloGo(HelloGo)).unwrap());
        let mut codec = FrameCodec::new(1024);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_skipped() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&[7u8; 40]);
        let mut codec = FrameCodec::new(16);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // rest of the oversized frame, then a good one
        buf.extend_from_slice(&[7u8; 60]);
        buf.extend_from_slice(&encode_frame(&Message::HelloGo(HelloGo)).unwrap());
        let body = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Message::decode(&body).unwrap(), Message::HelloGo(HelloGo));
    }

    #[test]
    fn lengths_are_checked_against_the_frame() {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(1_000_000).unwrap();
        out.extend_from_slice(b"short");
        let mut input = &out[..];
        assert!(read_bytes(&mut input).is_err());

        let mut out = Vec::new();
        write_ids(&mut out, &[1, 2, 3]).unwrap();
        write_opt_string(&mut out, Some("x")).unwrap();
        write_opt_string(&mut out, None).unwrap();
        let mut input = &out[..];
        assert_eq!(read_ids(&mut input).unwrap(), vec![1, 2, 3]);
        assert_eq!(read_opt_string(&mut input).unwrap(), Some("x".into()));
        assert_eq!(read_opt_string(&mut input).unwrap(), None);
        assert!(input.is_empty());
    }
}
