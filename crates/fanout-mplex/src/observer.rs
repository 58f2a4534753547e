//! Packet observers for diagnostics and traffic recording.
//!
//! Observers see every packet a backend's connections send or receive,
//! together with the raw frame bytes. They run on the thread doing the
//! I/O and cannot fail it, so implementations must stay cheap.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::packet::Packet;

/// Receives copies of the traffic flowing through a backend.
pub trait PacketObserver<P>: Send + Sync {
    /// A packet was extracted from a connection.
    ///
    /// `channel` is the open channel the packet is routed to (`0` for the
    /// ping channel), or `None` when no open channel matches.
    fn packet_received(&self, channel: Option<u32>, packet: &P, raw: &[u8]) {
        let _ = (channel, packet, raw);
    }

    /// A packet was encoded for `channel_id` and queued on a connection.
    fn packet_sent(&self, channel_id: u32, packet: &P, raw: &[u8]) {
        let _ = (channel_id, packet, raw);
    }
}

/// Broadcasts to every registered observer.
pub struct ObserverSet<P> {
    observers: RwLock<Vec<Arc<dyn PacketObserver<P>>>>,
}

impl<P> ObserverSet<P> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, observer: Arc<dyn PacketObserver<P>>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    pub fn notify_received(&self, channel: Option<u32>, packet: &P, raw: &[u8]) {
        for observer in self.observers.read().iter() {
            observer.packet_received(channel, packet, raw);
        }
    }

    pub fn notify_sent(&self, channel_id: u32, packet: &P, raw: &[u8]) {
        for observer in self.observers.read().iter() {
            observer.packet_sent(channel_id, packet, raw);
        }
    }
}

impl<P> Default for ObserverSet<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for ObserverSet<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}

/// Records every packet at `trace` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl<P: Packet> PacketObserver<P> for TracingObserver {
    fn packet_received(&self, channel: Option<u32>, packet: &P, raw: &[u8]) {
        trace!(
            channel = ?channel,
            kind = %packet.kind(),
            bytes = raw.len(),
            "packet received"
        );
    }

    fn packet_sent(&self, channel_id: u32, packet: &P, raw: &[u8]) {
        trace!(
            channel = channel_id,
            kind = %packet.kind(),
            bytes = raw.len(),
            "packet sent"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Sample;

    impl Packet for Sample {
        fn channel_id(&self) -> Option<u32> {
            Some(2)
        }

        fn kind(&self) -> PacketKind {
            PacketKind::Data
        }
    }

    #[derive(Default)]
    struct Counting {
        received: AtomicUsize,
        sent_bytes: AtomicUsize,
    }

    impl PacketObserver<Sample> for Counting {
        fn packet_received(&self, _channel: Option<u32>, _packet: &Sample, _raw: &[u8]) {
            self.received.fetch_add(1, Ordering::Relaxed);
        }

        fn packet_sent(&self, _channel_id: u32, _packet: &Sample, raw: &[u8]) {
            self.sent_bytes.fetch_add(raw.len(), Ordering::Relaxed);
        }
    }

    #[test]
    fn broadcasts_to_all_observers() {
        let set: ObserverSet<Sample> = ObserverSet::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        set.add(a.clone());
        set.add(b.clone());
        set.add(Arc::new(TracingObserver));
        assert_eq!(set.len(), 3);

        set.notify_received(Some(2), &Sample, b"abc");
        set.notify_sent(2, &Sample, b"abcd");

        assert_eq!(a.received.load(Ordering::Relaxed), 1);
        assert_eq!(b.received.load(Ordering::Relaxed), 1);
        assert_eq!(a.sent_bytes.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn default_methods_are_no_ops() {
        struct Silent;
        impl PacketObserver<Sample> for Silent {}

        let set: ObserverSet<Sample> = ObserverSet::new();
        set.add(Arc::new(Silent));
        set.notify_received(None, &Sample, &[]);
        set.notify_sent(0, &Sample, &[]);
    }

    #[test]
    fn empty_set() {
        let set: ObserverSet<Sample> = ObserverSet::default();
        assert!(set.is_empty());
        set.notify_received(None, &Sample, &[]);
    }
}
