//! Channel registry for one backend.
//!
//! Holds the inbound side of every open channel: a map from channel id to
//! the sender feeding that channel's queue, and a FIFO of ping channels
//! waiting for pongs. Each has its own lock. The registry's only job is
//! atomic register, lookup and deregister; it never blocks on a queue.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Ids wrap back to zero before reaching this value.
pub const CHANNEL_ID_LIMIT: u32 = i32::MAX as u32 - 1;

/// Channel stride; ids handed out are always even.
const CHANNEL_ID_STEP: u32 = 2;

struct ChannelMap<P> {
    channels: HashMap<u32, mpsc::Sender<P>>,
    next_id: u32,
}

impl<P> ChannelMap<P> {
    fn advance(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += CHANNEL_ID_STEP;
        if self.next_id >= CHANNEL_ID_LIMIT {
            self.next_id = 0;
        }
        id
    }
}

struct PingQueue<P> {
    pings: VecDeque<(u64, mpsc::Sender<P>)>,
    next_token: u64,
}

pub struct ChannelRegistry<P> {
    channels: Mutex<ChannelMap<P>>,
    pings: Mutex<PingQueue<P>>,
}

impl<P> ChannelRegistry<P> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Registry whose first allocated id is `first_id` (rounded down to
    /// even). Lets tests exercise wraparound.
    pub fn starting_at(first_id: u32) -> Self {
        let first_id = (first_id & !1).min(CHANNEL_ID_LIMIT - CHANNEL_ID_STEP);
        Self {
            channels: Mutex::new(ChannelMap {
                channels: HashMap::new(),
                next_id: first_id,
            }),
            pings: Mutex::new(PingQueue {
                pings: VecDeque::new(),
                next_token: 0,
            }),
        }
    }

    /// Allocate the next free even id and register `sender` under it.
    ///
    /// After wraparound, ids still held by open channels are skipped.
    pub fn register(&self, sender: mpsc::Sender<P>) -> u32 {
        let mut map = self.channels.lock();
        let mut id = map.advance();
        while map.channels.contains_key(&id) {
            id = map.advance();
        }
        map.channels.insert(id, sender);
        id
    }

    pub fn lookup(&self, id: u32) -> Option<mpsc::Sender<P>> {
        self.channels.lock().channels.get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels.lock().channels.contains_key(&id)
    }

    pub fn deregister(&self, id: u32) -> bool {
        self.channels.lock().channels.remove(&id).is_some()
    }

    /// Append a ping channel; the returned token identifies it for removal.
    pub fn register_ping(&self, sender: mpsc::Sender<P>) -> u64 {
        let mut queue = self.pings.lock();
        let token = queue.next_token;
        queue.next_token += 1;
        queue.pings.push_back((token, sender));
        token
    }

    /// Oldest outstanding ping channel, left in place.
    pub fn head_ping(&self) -> Option<mpsc::Sender<P>> {
        self.pings
            .lock()
            .pings
            .front()
            .map(|(_, sender)| sender.clone())
    }

    pub fn deregister_ping(&self, token: u64) -> bool {
        let mut queue = self.pings.lock();
        match queue.pings.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                queue.pings.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn open_channels(&self) -> usize {
        self.channels.lock().channels.len()
    }

    pub fn pending_pings(&self) -> usize {
        self.pings.lock().pings.len()
    }

    /// Drop every registered sender; channels waiting on them observe
    /// their queue closing.
    pub fn clear(&self) {
        self.channels.lock().channels.clear();
        self.pings.lock().pings.clear();
    }
}

impl<P> Default for ChannelRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<u8> {
        mpsc::channel(1).0
    }

    #[test]
    fn ids_are_even_and_increasing_from_zero() {
        let registry = ChannelRegistry::new();
        let ids: Vec<u32> = (0..5).map(|_| registry.register(sender())).collect();
        assert_eq!(ids, vec![0, 2, 4, 6, 8]);
        assert_eq!(registry.open_channels(), 5);
    }

    #[test]
    fn ids_stay_increasing_after_deregister() {
        let registry = ChannelRegistry::new();
        let a = registry.register(sender());
        assert!(registry.deregister(a));
        let b = registry.register(sender());
        assert!(b > a);
        assert!(!registry.deregister(a));
    }

    #[test]
    fn ids_wrap_before_the_signed_limit() {
        let registry = ChannelRegistry::starting_at(CHANNEL_ID_LIMIT - 4);
        let ids: Vec<u32> = (0..3).map(|_| registry.register(sender())).collect();
        assert_eq!(ids, vec![CHANNEL_ID_LIMIT - 4, CHANNEL_ID_LIMIT - 2, 0]);
        assert!(ids.iter().all(|id| *id < CHANNEL_ID_LIMIT));
    }

    #[test]
    fn wraparound_skips_ids_still_open() {
        let registry = ChannelRegistry::new();
        let zero = registry.register(sender());
        assert_eq!(zero, 0);

        // Push the counter to the end of the range so it wraps onto 0.
        registry.channels.lock().next_id = CHANNEL_ID_LIMIT - 2;
        assert_eq!(registry.register(sender()), CHANNEL_ID_LIMIT - 2);
        assert_eq!(registry.register(sender()), 2);
    }

    #[test]
    fn odd_start_rounds_down() {
        let registry = ChannelRegistry::starting_at(7);
        assert_eq!(registry.register(sender()), 6);
    }

    #[test]
    fn lookup_finds_registered_sender() {
        let registry = ChannelRegistry::new();
        let id = registry.register(sender());
        assert!(registry.lookup(id).is_some());
        assert!(registry.lookup(id + 2).is_none());
        assert!(registry.contains(id));
    }

    #[test]
    fn ping_queue_is_fifo() {
        let registry = ChannelRegistry::new();
        let (first_tx, mut first_rx) = mpsc::channel::<u8>(1);
        let (second_tx, _second_rx) = mpsc::channel::<u8>(1);
        let first = registry.register_ping(first_tx);
        let second = registry.register_ping(second_tx);
        assert_eq!(registry.pending_pings(), 2);

        registry.head_ping().unwrap().try_send(1).unwrap();
        assert_eq!(first_rx.try_recv().unwrap(), 1);
        // Peeking does not remove the head.
        assert_eq!(registry.pending_pings(), 2);

        assert!(registry.deregister_ping(first));
        assert_eq!(registry.pending_pings(), 1);
        assert!(registry.deregister_ping(second));
        assert!(registry.head_ping().is_none());
        assert!(!registry.deregister_ping(second));
    }

    #[test]
    fn deregistering_a_later_ping_keeps_the_head() {
        let registry = ChannelRegistry::new();
        let (head_tx, mut head_rx) = mpsc::channel::<u8>(1);
        registry.register_ping(head_tx);
        let later = registry.register_ping(sender());

        registry.deregister_ping(later);
        registry.head_ping().unwrap().try_send(9).unwrap();
        assert_eq!(head_rx.try_recv().unwrap(), 9);
    }

    #[test]
    fn clear_closes_channel_queues() {
        let registry = ChannelRegistry::new();
        let (tx, mut rx) = mpsc::channel::<u8>(1);
        registry.register(tx);
        registry.clear();
        assert_eq!(registry.open_channels(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
