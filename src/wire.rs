//! Length-prefixed frame codec.
//!
//! The wire carries frames of a 4-byte big-endian length followed by that
//! many payload bytes. A payload is a sequence of typed fields: `byte`,
//! `u32`/`u64` (big-endian), `string` (length-prefixed UTF-8) and `bytes`
//! (length-prefixed). Structs are just fields of a declared shape read in
//! order. The reader is bounded: any read that would cross the end of the
//! payload fails instead of touching adjacent data.

use std::fmt;
use std::io;
use std::io::Read;

use smallvec::SmallVec;
use zerocopy::byteorder::BigEndian;
use zerocopy::byteorder::U32;
use zerocopy::byteorder::U64;

use crate::error::Error;
use crate::error::ErrorKind;

/// Upper bound on a single frame's payload. Anything larger is treated as a
/// framing violation rather than an allocation request.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Error raised while decoding a frame payload.
#[derive(Debug)]
pub enum FrameError {
    /// A field read would cross the end of the payload.
    Truncated,
    /// A string field did not hold valid UTF-8.
    BadString,
    /// A tag or mode byte named no known variant.
    BadTag(u8),
    /// A declared length exceeds [`MAX_FRAME_SIZE`].
    Oversize(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "field crosses frame boundary"),
            FrameError::BadString => write!(f, "string field is not valid UTF-8"),
            FrameError::BadTag(tag) => write!(f, "unknown field tag {tag}"),
            FrameError::Oversize(len) => {
                write!(f, "declared length {len} exceeds frame limit")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Error {
        Error::new(ErrorKind::Io, format!("Malformed frame: {err}"))
    }
}

/// Bounded reader over a single frame payload.
///
/// Reads advance through the payload and never cross its end; each typed
/// accessor returns [`FrameError::Truncated`] once the remaining bytes run
/// short.
pub struct FrameReader<'a> {
    data: &'a [u8],
}

impl<'a> FrameReader<'a> {
    /// Position a reader at field 0 of the given payload.
    pub fn new(data: &'a [u8]) -> FrameReader<'a> {
        FrameReader { data }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// True once every byte of the payload has been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fetch a single byte.
    pub fn get_u8(&mut self) -> Result<u8, FrameError> {
        match self.data.split_first() {
            Some((b, rest)) => {
                self.data = rest;
                Ok(*b)
            }
            None => Err(FrameError::Truncated),
        }
    }

    /// Fetch a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, FrameError> {
        let (value, rest) = zerocopy::Ref::<_, U32<BigEndian>>::from_prefix(self.data)
            .map_err(|_| FrameError::Truncated)?;
        self.data = rest;
        Ok(value.get())
    }

    /// Fetch a big-endian `i32`.
    pub fn get_i32(&mut self) -> Result<i32, FrameError> {
        Ok(self.get_u32()? as i32)
    }

    /// Fetch a big-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64, FrameError> {
        let (value, rest) = zerocopy::Ref::<_, U64<BigEndian>>::from_prefix(self.data)
            .map_err(|_| FrameError::Truncated)?;
        self.data = rest;
        Ok(value.get())
    }

    /// Fetch a big-endian `i64`.
    pub fn get_i64(&mut self) -> Result<i64, FrameError> {
        Ok(self.get_u64()? as i64)
    }

    /// Take all remaining bytes.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.data;
        self.data = &[];
        rest
    }

    /// Fetch a length-prefixed byte field.
    pub fn get_bytes(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversize(len));
        }
        if len > self.data.len() {
            return Err(FrameError::Truncated);
        }
        let (out, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(out)
    }

    /// Fetch a length-prefixed UTF-8 string field.
    pub fn get_string(&mut self) -> Result<&'a str, FrameError> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| FrameError::BadString)
    }
}

impl fmt::Debug for FrameReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("remaining", &self.data.len())
            .finish()
    }
}

type FrameBuf = SmallVec<[u8; 64]>;

/// Accumulating frame writer.
///
/// [`FrameWriter::new`] reserves 4 bytes for the length prefix up front;
/// [`FrameWriter::finish`] back-patches the prefix with the accumulated
/// payload length. [`FrameWriter::body`] skips the prefix for payloads whose
/// framing is owned by the transport (bus message bodies).
#[derive(Debug)]
pub struct FrameWriter {
    buf: FrameBuf,
    framed: bool,
}

impl FrameWriter {
    /// Start a length-prefixed frame.
    pub fn new() -> FrameWriter {
        let mut buf = FrameBuf::new();
        buf.extend_from_slice(&[0; 4]);
        FrameWriter { buf, framed: true }
    }

    /// Start a bare payload with no length prefix.
    pub fn body() -> FrameWriter {
        FrameWriter {
            buf: FrameBuf::new(),
            framed: false,
        }
    }

    /// Append a single byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Append a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian `i32`.
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.put_u32(value as u32)
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian `i64`.
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.put_u64(value as u64)
    }

    /// Append a length-prefixed byte field.
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Append a length-prefixed UTF-8 string field.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Append raw bytes with no length prefix.
    pub fn put_raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Finish the frame, back-patching the length prefix when present.
    pub fn finish(mut self) -> Vec<u8> {
        if self.framed {
            let len = (self.buf.len() - 4) as u32;
            self.buf[..4].copy_from_slice(&len.to_be_bytes());
        }
        self.buf.into_vec()
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        FrameWriter::new()
    }
}

/// Read one length-prefixed frame from a byte stream, returning its payload.
///
/// Fails with `UnexpectedEof` on a short read and `InvalidData` when the
/// declared length exceeds [`MAX_FRAME_SIZE`].
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FrameError::Oversize(len).to_string(),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut w = FrameWriter::new();
        w.put_u8(7)
            .put_u32(0xdead_beef)
            .put_u64(0x0123_4567_89ab_cdef)
            .put_string("héllo")
            .put_bytes(b"\x00\x01\x02");
        let frame = w.finish();

        let mut cursor = io::Cursor::new(frame);
        let payload = read_frame(&mut cursor).unwrap();
        let mut r = FrameReader::new(&payload);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.get_string().unwrap(), "héllo");
        assert_eq!(r.get_bytes().unwrap(), b"\x00\x01\x02");
        assert!(r.is_empty());
    }

    #[test]
    fn length_prefix_is_backpatched() {
        let mut w = FrameWriter::new();
        w.put_u32(1).put_u8(2);
        let frame = w.finish();
        assert_eq!(&frame[..4], &5u32.to_be_bytes());
        assert_eq!(frame.len(), 9);
    }

    #[test]
    fn decoder_consumes_exactly_the_frame() {
        let mut w = FrameWriter::new();
        w.put_string("a").put_u32(9);
        let frame = w.finish();
        let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;

        let mut r = FrameReader::new(&frame[4..]);
        let consumed_before = r.remaining();
        r.get_string().unwrap();
        r.get_u32().unwrap();
        assert_eq!(consumed_before - r.remaining(), declared);
        assert!(r.is_empty());
    }

    #[test]
    fn bounded_reads() {
        let payload = [0u8, 0, 0];
        let mut r = FrameReader::new(&payload);
        assert!(matches!(r.get_u32(), Err(FrameError::Truncated)));
        // A failed read leaves the position untouched.
        assert_eq!(r.remaining(), 3);
        r.get_u8().unwrap();
        r.get_u8().unwrap();
        r.get_u8().unwrap();
        assert!(matches!(r.get_u8(), Err(FrameError::Truncated)));
    }

    #[test]
    fn string_field_must_be_utf8() {
        let mut w = FrameWriter::body();
        w.put_bytes(b"\xff\xfe");
        let payload = w.finish();
        let mut r = FrameReader::new(&payload);
        assert!(matches!(r.get_string(), Err(FrameError::BadString)));
    }

    #[test]
    fn bytes_field_cannot_cross_frame_end() {
        let mut w = FrameWriter::body();
        w.put_u32(1000); // declares more than is present
        w.put_raw(b"short");
        let payload = w.finish();
        let mut r = FrameReader::new(&payload);
        assert!(matches!(r.get_bytes(), Err(FrameError::Truncated)));
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(frame);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
