//! Length-prefixed frame codec.
//!
//! Every message on the wire is `u8 mtype | i32 length | body`, with the
//! length counting itself but not the type byte. All integers are
//! big-endian. Byte strings and UTF-8 strings are prefixed with an i32
//! length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::errors::Error;

/// Hard cap on a single frame. Oversized frames are a protocol violation,
/// not an allocation request.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

/// Type byte plus length field.
pub const HEADER_SIZE: usize = 5;

/// Negotiated protocol version. Ordering is lexicographic on
/// (major, minor), which the derive gives us from field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        ProtocolVersion { major, minor }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Oldest protocol generation still served.
pub const PROTO_VER_MIN: ProtocolVersion = ProtocolVersion::new(0, 13);
/// Most recent protocol generation.
pub const PROTO_VER_CURRENT: ProtocolVersion = ProtocolVersion::new(1, 0);
/// Oldest dump-file format accepted by restore.
pub const DUMP_VER_MIN: ProtocolVersion = ProtocolVersion::new(0, 7);

/// One complete inbound frame. Typed getters consume the body; callers must
/// end with [`Incoming::finish`], which rejects trailing garbage.
#[derive(Debug, Clone)]
pub struct Incoming {
    mtype: u8,
    body: Bytes,
}

impl Incoming {
    pub fn new(mtype: u8, body: Bytes) -> Self {
        Incoming { mtype, body }
    }

    #[inline]
    pub fn mtype(&self) -> u8 {
        self.mtype
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.body.len()
    }

    fn need(&self, n: usize) -> Result<(), Error> {
        if self.body.len() < n {
            return Err(Error::binary_protocol(format!(
                "message '{}' ended prematurely: wanted {n} more byte(s), have {}",
                self.mtype as char,
                self.body.len()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        self.need(1)?;
        Ok(self.body.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, Error> {
        self.need(2)?;
        Ok(self.body.get_u16())
    }

    pub fn get_i16(&mut self) -> Result<i16, Error> {
        self.need(2)?;
        Ok(self.body.get_i16())
    }

    pub fn get_i32(&mut self) -> Result<i32, Error> {
        self.need(4)?;
        Ok(self.body.get_i32())
    }

    pub fn get_i64(&mut self) -> Result<i64, Error> {
        self.need(8)?;
        Ok(self.body.get_i64())
    }

    pub fn get_u64(&mut self) -> Result<u64, Error> {
        self.need(8)?;
        Ok(self.body.get_u64())
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, Error> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.body.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// `i32 length | bytes`.
    pub fn get_len_bytes(&mut self) -> Result<Bytes, Error> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(Error::binary_protocol(format!(
                "negative byte-string length: {len}"
            )));
        }
        let len = len as usize;
        self.need(len)?;
        Ok(self.body.split_to(len))
    }

    /// Length-prefixed, validated UTF-8.
    pub fn get_utf8(&mut self) -> Result<String, Error> {
        let raw = self.get_len_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::binary_protocol("string is not valid UTF-8"))
    }

    /// Everything left in the body.
    pub fn get_rest(&mut self) -> Bytes {
        self.body.split_to(self.body.len())
    }

    /// `u16 count` followed by `(u16 key, len-pfx bytes)` pairs, as used by
    /// dump and restore requests and blocks.
    pub fn get_headers(&mut self) -> Result<Vec<(u16, Bytes)>, Error> {
        let count = self.get_u16()?;
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = self.get_u16()?;
            let value = self.get_len_bytes()?;
            headers.push((key, value));
        }
        Ok(headers)
    }

    /// `u16 count` followed by `(utf8 name, utf8 value)` pairs, as used by
    /// parse/execute annotations. All ignored today, but they must be
    /// consumed to keep framing aligned.
    pub fn skip_annotations(&mut self) -> Result<(), Error> {
        let count = self.get_u16()?;
        for _ in 0..count {
            self.get_utf8()?;
            self.get_utf8()?;
        }
        Ok(())
    }

    /// Asserts the body was fully consumed.
    pub fn finish(&self) -> Result<(), Error> {
        if !self.body.is_empty() {
            return Err(Error::binary_protocol(format!(
                "message '{}' has {} unconsumed byte(s)",
                self.mtype as char,
                self.body.len()
            )));
        }
        Ok(())
    }
}

/// Accumulates raw socket bytes and carves complete frames out of them.
/// `take_message` never blocks: it returns `None` until a whole frame has
/// arrived.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    pub(crate) buf: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        MessageBuffer {
            buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn take_message(&mut self) -> Result<Option<Incoming>, Error> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mtype = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(Error::binary_protocol(format!(
                "invalid message length {len} for message '{}'",
                mtype as char
            )));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::binary_protocol(format!(
                "message length {len} exceeds the {MAX_MESSAGE_SIZE} byte limit"
            )));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(HEADER_SIZE);
        Ok(Some(Incoming::new(mtype, frame.freeze())))
    }
}

/// Buffered frame reader over a raw async stream.
pub struct FrameReader<S> {
    stream: S,
    pub(crate) buffer: MessageBuffer,
}

impl<S> FrameReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S) -> Self {
        FrameReader {
            stream,
            buffer: MessageBuffer::new(),
        }
    }

    /// Suspend until one complete frame is available.
    pub async fn wait_for_message(&mut self) -> Result<Incoming, Error> {
        loop {
            if let Some(message) = self.buffer.take_message()? {
                return Ok(message);
            }
            let n = self.stream.read_buf(&mut self.buffer.buf).await?;
            if n == 0 {
                return Err(Error::aborted("connection closed by peer"));
            }
        }
    }
}

/// Builds outbound frames in a growable buffer. `begin` stamps the type
/// byte and a length placeholder; `end_message` backfills the real length.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
    msg_start: Option<usize>,
}

impl MessageWriter {
    pub fn new() -> Self {
        MessageWriter {
            buf: BytesMut::with_capacity(8192),
            msg_start: None,
        }
    }

    pub fn begin(&mut self, mtype: u8) {
        debug_assert!(self.msg_start.is_none(), "nested begin()");
        self.buf.put_u8(mtype);
        self.msg_start = Some(self.buf.len());
        self.buf.put_i32(0);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_uuid(&mut self, v: Uuid) {
        self.buf.put_slice(v.as_bytes());
    }

    pub fn put_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// `i32 length | bytes`.
    pub fn put_len_bytes(&mut self, v: &[u8]) {
        self.buf.put_i32(v.len() as i32);
        self.buf.put_slice(v);
    }

    pub fn put_utf8(&mut self, v: &str) {
        self.put_len_bytes(v.as_bytes());
    }

    pub fn end_message(&mut self) {
        let start = self
            .msg_start
            .take()
            .expect("end_message() without begin()");
        let len = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Detach everything written so far. Only whole messages should be
    /// taken; taking mid-message is a framing bug.
    pub fn take(&mut self) -> BytesMut {
        debug_assert!(self.msg_start.is_none(), "take() inside an open message");
        self.buf.split()
    }

    /// Write and flush all completed messages to the socket.
    pub async fn flush_to<W>(&mut self, stream: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        if self.buf.is_empty() {
            return Ok(());
        }
        let out = self.take();
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_message_waits_for_full_frame() {
        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&[b'S', 0, 0, 0, 8, 1, 2]);
        assert!(mbuf.take_message().unwrap().is_none());
        mbuf.feed(&[3, 4]);
        let msg = mbuf.take_message().unwrap().unwrap();
        assert_eq!(msg.mtype(), b'S');
        assert_eq!(msg.remaining(), 4);
    }

    #[test]
    fn test_take_message_rejects_short_length() {
        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&[b'S', 0, 0, 0, 3]);
        assert!(mbuf.take_message().is_err());
    }

    #[test]
    fn test_take_message_rejects_oversized_length() {
        let mut mbuf = MessageBuffer::new();
        let bad = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        mbuf.feed(&[b'S', bad[0], bad[1], bad[2], bad[3]]);
        assert!(mbuf.take_message().is_err());
    }

    #[test]
    fn test_writer_backfills_length() {
        let mut w = MessageWriter::new();
        w.begin(b'Z');
        w.put_u16(0);
        w.put_u8(b'I');
        w.end_message();
        let out = w.take();
        assert_eq!(out[0], b'Z');
        assert_eq!(
            i32::from_be_bytes([out[1], out[2], out[3], out[4]]),
            4 + 2 + 1
        );

        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&out);
        let mut msg = mbuf.take_message().unwrap().unwrap();
        assert_eq!(msg.get_u16().unwrap(), 0);
        assert_eq!(msg.get_u8().unwrap(), b'I');
        msg.finish().unwrap();
    }

    #[test]
    fn test_finish_rejects_trailing_bytes() {
        let mut msg = Incoming::new(b'S', Bytes::from_static(&[0, 0]));
        assert!(msg.finish().is_err());
        msg.get_u16().unwrap();
        msg.finish().unwrap();
    }

    #[test]
    fn test_len_prefixed_roundtrip() {
        let mut w = MessageWriter::new();
        w.begin(b'D');
        w.put_len_bytes(b"payload");
        w.put_utf8("text");
        let id = Uuid::from_u128(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00);
        w.put_uuid(id);
        w.end_message();

        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&w.take());
        let mut msg = mbuf.take_message().unwrap().unwrap();
        assert_eq!(&msg.get_len_bytes().unwrap()[..], b"payload");
        assert_eq!(msg.get_utf8().unwrap(), "text");
        assert_eq!(msg.get_uuid().unwrap(), id);
        msg.finish().unwrap();
    }

    #[test]
    fn test_invalid_utf8_is_a_protocol_error() {
        let mut w = MessageWriter::new();
        w.begin(b'D');
        w.put_len_bytes(&[0xff, 0xfe]);
        w.end_message();

        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&w.take());
        let mut msg = mbuf.take_message().unwrap().unwrap();
        assert!(msg.get_utf8().is_err());
    }

    #[test]
    fn test_headers_roundtrip() {
        let mut w = MessageWriter::new();
        w.begin(b'>');
        w.put_u16(1);
        w.put_u16(0xFF10);
        w.put_len_bytes(&[1]);
        w.end_message();

        let mut mbuf = MessageBuffer::new();
        mbuf.feed(&w.take());
        let mut msg = mbuf.take_message().unwrap().unwrap();
        let headers = msg.get_headers().unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, 0xFF10);
        assert_eq!(&headers[0].1[..], &[1]);
        msg.finish().unwrap();
    }

    #[test]
    fn test_protocol_version_ordering() {
        assert!(ProtocolVersion::new(0, 13) < ProtocolVersion::new(1, 0));
        assert!(ProtocolVersion::new(0, 7) < ProtocolVersion::new(0, 13));
        assert_eq!(ProtocolVersion::new(1, 0).to_string(), "1.0");
    }
}
