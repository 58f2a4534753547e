//! Codec capability used by connections to frame and unframe packets.
//!
//! The transport never interprets packet bytes itself. A [`PacketCodec`]
//! tells it which channel a partially buffered frame targets, extracts
//! complete packets, and encodes outbound packets for a channel id.

use bytes::Bytes;

use crate::error::TransportResult;
use crate::packet::Packet;

/// Outcome of one extraction attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<P> {
    /// A complete packet occupying the first `consumed` bytes.
    Packet { packet: P, consumed: usize },
    /// The frame is incomplete; at least `required` bytes must be buffered.
    NeedMore { required: usize },
}

/// Frames packets on the wire.
pub trait PacketCodec: Send + Sync + 'static {
    type Packet: Packet;

    /// Channel targeted by the frame at the start of `buf`.
    ///
    /// Returns `None` while too few bytes are buffered to tell and
    /// `Some(0)` for ping/pong frames.
    fn sniff_channel(&self, buf: &[u8]) -> Option<u32>;

    /// Extract one packet from the start of `buf`.
    ///
    /// An error means the stream is corrupt; the connection carrying it
    /// is invalidated.
    fn decode(&self, buf: &[u8]) -> TransportResult<Decoded<Self::Packet>>;

    /// Encode `packet` for `channel_id`. `size_hint` is the initial buffer
    /// capacity the codec should allocate.
    fn encode(
        &self,
        packet: &Self::Packet,
        channel_id: u32,
        size_hint: usize,
    ) -> TransportResult<Bytes>;
}
