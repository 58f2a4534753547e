//! Reference codec and in-process dispatch server for tests.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! ┌──────────────┬──────┬───────┬────────────┬─────────┐
//! │ length (u32) │ kind │ flags │ channel    │ payload │
//! │ whole frame  │ (u8) │ (u8)  │ (u32)      │         │
//! └──────────────┴──────┴───────┴────────────┴─────────┘
//! ```
//!
//! Bit 0 of `flags` marks a frame carrying a channel id. Ping and pong
//! frames never carry one.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::codec::{Decoded, PacketCodec};
use crate::error::{TransportError, TransportResult};
use crate::packet::{Packet, PacketKind};

pub const HEADER_LEN: usize = 10;

/// Largest frame [`FrameCodec`] accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const FLAG_HAS_CHANNEL: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestKind {
    Data,
    Error,
    EndOfList,
    Ping,
    Pong,
}

impl TestKind {
    fn to_byte(self) -> u8 {
        match self {
            TestKind::Data => 0,
            TestKind::Error => 1,
            TestKind::EndOfList => 2,
            TestKind::Ping => 3,
            TestKind::Pong => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => TestKind::Data,
            1 => TestKind::Error,
            2 => TestKind::EndOfList,
            3 => TestKind::Ping,
            4 => TestKind::Pong,
            _ => return None,
        })
    }

    fn carries_channel(self) -> bool {
        !matches!(self, TestKind::Ping | TestKind::Pong)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestPacket {
    pub kind: TestKind,
    pub channel: Option<u32>,
    pub payload: Vec<u8>,
}

impl TestPacket {
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: TestKind::Data,
            channel: None,
            payload: payload.into(),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            kind: TestKind::Error,
            channel: None,
            payload: message.as_bytes().to_vec(),
        }
    }

    pub fn end_of_list() -> Self {
        Self {
            kind: TestKind::EndOfList,
            channel: None,
            payload: Vec::new(),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: TestKind::Ping,
            channel: None,
            payload: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: TestKind::Pong,
            channel: None,
            payload: Vec::new(),
        }
    }

    /// Tag with a channel id, as a server does when replying.
    pub fn on_channel(mut self, channel: u32) -> Self {
        if self.kind.carries_channel() {
            self.channel = Some(channel);
        }
        self
    }
}

impl Packet for TestPacket {
    fn channel_id(&self) -> Option<u32> {
        self.channel
    }

    fn kind(&self) -> PacketKind {
        match self.kind {
            TestKind::Data | TestKind::Ping => PacketKind::Data,
            TestKind::Error => PacketKind::Error,
            TestKind::EndOfList => PacketKind::EndOfList,
            TestKind::Pong => PacketKind::Pong,
        }
    }
}

/// Length-prefixed codec for [`TestPacket`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode for `channel_id`; ping and pong frames ignore it.
    pub fn encode_frame(packet: &TestPacket, channel_id: u32, size_hint: usize) -> Bytes {
        let len = HEADER_LEN + packet.payload.len();
        let mut buf = BytesMut::with_capacity(size_hint.max(len));
        buf.put_u32(len as u32);
        buf.put_u8(packet.kind.to_byte());
        if packet.kind.carries_channel() {
            buf.put_u8(FLAG_HAS_CHANNEL);
            buf.put_u32(channel_id);
        } else {
            buf.put_u8(0);
            buf.put_u32(0);
        }
        buf.put_slice(&packet.payload);
        buf.freeze()
    }

    fn frame_len(buf: &[u8]) -> TransportResult<Option<usize>> {
        let Some(prefix) = buf.get(..4) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(TransportError::Codec(format!("invalid frame length {len}")));
        }
        Ok(Some(len))
    }
}

impl PacketCodec for FrameCodec {
    type Packet = TestPacket;

    fn sniff_channel(&self, buf: &[u8]) -> Option<u32> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        if buf[5] & FLAG_HAS_CHANNEL == 0 {
            return Some(0);
        }
        Some(u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]))
    }

    fn decode(&self, buf: &[u8]) -> TransportResult<Decoded<TestPacket>> {
        let Some(len) = Self::frame_len(buf)? else {
            return Ok(Decoded::NeedMore {
                required: HEADER_LEN,
            });
        };
        if buf.len() < len {
            return Ok(Decoded::NeedMore { required: len });
        }
        let kind = TestKind::from_byte(buf[4])
            .ok_or_else(|| TransportError::Codec(format!("unknown packet kind {}", buf[4])))?;
        let channel = (buf[5] & FLAG_HAS_CHANNEL != 0)
            .then(|| u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]));
        Ok(Decoded::Packet {
            packet: TestPacket {
                kind,
                channel,
                payload: buf[HEADER_LEN..len].to_vec(),
            },
            consumed: len,
        })
    }

    fn encode(
        &self,
        packet: &TestPacket,
        channel_id: u32,
        size_hint: usize,
    ) -> TransportResult<Bytes> {
        if HEADER_LEN + packet.payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::Codec(format!(
                "payload of {} bytes exceeds frame limit",
                packet.payload.len()
            )));
        }
        Ok(Self::encode_frame(packet, channel_id, size_hint))
    }
}

type Handler = dyn Fn(TestPacket) -> Vec<TestPacket> + Send + Sync;

/// Blocking TCP server speaking [`FrameCodec`].
///
/// Every accepted connection gets its own thread, which decodes request
/// frames and writes back whatever the handler returns for each one.
/// Replies keep the request's channel unless the handler sets another.
pub struct MockDispatchServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl MockDispatchServer {
    pub fn start<F>(handler: F) -> io::Result<Self>
    where
        F: Fn(TestPacket) -> Vec<TestPacket> + Send + Sync + 'static,
    {
        Self::start_with(Arc::new(handler), false)
    }

    /// Like [`start`](Self::start), except that the first accepted
    /// connection answers its first request with a frame whose length
    /// prefix is shorter than a header, then goes silent until the peer
    /// hangs up. Later connections behave normally.
    pub fn start_corrupting_first_connection<F>(handler: F) -> io::Result<Self>
    where
        F: Fn(TestPacket) -> Vec<TestPacket> + Send + Sync + 'static,
    {
        Self::start_with(Arc::new(handler), true)
    }

    fn start_with(handler: Arc<Handler>, corrupt_first: bool) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        thread::Builder::new()
            .name("mock-dispatch-accept".to_string())
            .spawn(move || {
                while let Ok((stream, peer)) = listener.accept() {
                    let index = counter.fetch_add(1, Ordering::Relaxed);
                    let corrupt = corrupt_first && index == 0;
                    let handler = Arc::clone(&handler);
                    thread::spawn(move || {
                        if let Err(e) = serve(stream, handler.as_ref(), corrupt) {
                            debug!(peer = %peer, error = %e, "mock dispatch connection ended");
                        }
                    });
                }
            })?;

        Ok(Self { addr, accepted })
    }

    /// Server answering every ping with a pong and every other packet with
    /// nothing.
    pub fn pong_only() -> io::Result<Self> {
        Self::start(|packet| match packet.kind {
            TestKind::Ping => vec![TestPacket::pong()],
            _ => Vec::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Length prefix of 3, shorter than any valid frame.
const CORRUPT_FRAME: [u8; HEADER_LEN] = [0, 0, 0, 3, 0, 0, 0, 0, 0, 0];

fn serve(mut stream: TcpStream, handler: &Handler, corrupt: bool) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let codec = FrameCodec;
    loop {
        let mut frame = vec![0u8; 4];
        match stream.read_exact(&mut frame) {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            other => other?,
        }
        let len = FrameCodec::frame_len(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            .unwrap_or(HEADER_LEN);
        frame.resize(len, 0);
        stream.read_exact(&mut frame[4..])?;

        let request = match codec.decode(&frame) {
            Ok(Decoded::Packet { packet, .. }) => packet,
            Ok(Decoded::NeedMore { .. }) => continue,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        };
        if corrupt {
            stream.write_all(&CORRUPT_FRAME)?;
            stream.flush()?;
            // Discard everything until the peer hangs up.
            io::copy(&mut stream, &mut io::sink())?;
            return Ok(());
        }
        let channel = request.channel.unwrap_or(0);
        for reply in handler(request) {
            let reply_channel = reply.channel.unwrap_or(channel);
            stream.write_all(&FrameCodec::encode_frame(&reply, reply_channel, 0))?;
        }
        stream.flush()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_carries_channel() {
        let codec = FrameCodec;
        let bytes = codec
            .encode(&TestPacket::data(b"hits".to_vec()), 6, 0)
            .unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(codec.sniff_channel(&bytes), Some(6));

        match codec.decode(&bytes).unwrap() {
            Decoded::Packet { packet, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(packet.channel_id(), Some(6));
                assert_eq!(packet.payload, b"hits");
            }
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn pong_frame_sniffs_as_channel_zero() {
        let codec = FrameCodec;
        let bytes = codec.encode(&TestPacket::pong(), 12, 0).unwrap();
        assert_eq!(codec.sniff_channel(&bytes), Some(0));
        let Decoded::Packet { packet, .. } = codec.decode(&bytes).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(packet.channel_id(), None);
        assert_eq!(packet.kind(), PacketKind::Pong);
    }

    #[test]
    fn partial_frame_reports_full_length() {
        let codec = FrameCodec;
        let bytes = codec.encode(&TestPacket::data(vec![7; 100]), 2, 0).unwrap();
        assert_eq!(codec.sniff_channel(&bytes[..3]), None);
        assert_eq!(
            codec.decode(&bytes[..3]).unwrap(),
            Decoded::NeedMore {
                required: HEADER_LEN
            }
        );
        assert_eq!(
            codec.decode(&bytes[..50]).unwrap(),
            Decoded::NeedMore {
                required: HEADER_LEN + 100
            }
        );
    }

    #[test]
    fn rejects_corrupt_length() {
        let err = FrameCodec.decode(&[0, 0, 0, 3, 0]).unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[test]
    fn reply_tagging_skips_pongs() {
        assert_eq!(TestPacket::end_of_list().on_channel(4).channel, Some(4));
        assert_eq!(TestPacket::pong().on_channel(4).channel, None);
    }
}
