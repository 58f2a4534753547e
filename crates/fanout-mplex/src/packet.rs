//! The slice of the packet taxonomy the transport has to understand.
//!
//! Everything else about a packet (fields, wire layout, query payloads) is
//! owned by the codec and the layers above the transport.

use std::fmt;

/// Packet kinds the transport distinguishes when collecting a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Any ordinary, non-terminal packet.
    Data,
    /// Backend reported an error for the exchange.
    Error,
    /// Backend finished sending the result list.
    EndOfList,
    /// Keep-alive reply to a ping.
    Pong,
}

impl PacketKind {
    /// Terminal packets end a `receive_packets` collection.
    pub fn is_terminal(self) -> bool {
        matches!(self, PacketKind::Error | PacketKind::EndOfList | PacketKind::Pong)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Data => write!(f, "data"),
            PacketKind::Error => write!(f, "error"),
            PacketKind::EndOfList => write!(f, "eol"),
            PacketKind::Pong => write!(f, "pong"),
        }
    }
}

/// A decoded packet as seen by the transport.
pub trait Packet: Send + Sync + fmt::Debug + 'static {
    /// Channel the packet belongs to, or `None` for ping/pong traffic.
    fn channel_id(&self) -> Option<u32>;

    fn kind(&self) -> PacketKind;

    fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds() {
        assert!(!PacketKind::Data.is_terminal());
        assert!(PacketKind::Error.is_terminal());
        assert!(PacketKind::EndOfList.is_terminal());
        assert!(PacketKind::Pong.is_terminal());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(PacketKind::EndOfList.to_string(), "eol");
        assert_eq!(PacketKind::Pong.to_string(), "pong");
    }
}
