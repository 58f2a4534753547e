//! Logical request/response channels multiplexed over a backend's
//! connections.
//!
//! A channel is open from the moment [`Backend::open_channel`] returns it
//! until [`Channel::close`] runs (or it is dropped). There is no
//! half-closed state: a failed connection never closes a channel, it only
//! means nothing more will arrive and the caller's timeout fires.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::Backend;
use crate::codec::PacketCodec;
use crate::error::{TransportError, TransportResult};
use crate::packet::Packet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    Regular,
    /// Ping channels share id 0 and are told apart by registration token.
    Ping { token: u64 },
}

pub struct Channel<C: PacketCodec> {
    id: u32,
    kind: ChannelKind,
    backend: Arc<Backend<C>>,
    inbound: Option<mpsc::Receiver<C::Packet>>,
    context: Option<Box<dyn Any + Send + Sync>>,
}

impl<C: PacketCodec> Channel<C> {
    pub(crate) fn new(
        id: u32,
        kind: ChannelKind,
        backend: Arc<Backend<C>>,
        inbound: mpsc::Receiver<C::Packet>,
    ) -> Self {
        Self {
            id,
            kind,
            backend,
            inbound: Some(inbound),
            context: None,
        }
    }

    /// Channel id; always 0 for ping channels.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_ping(&self) -> bool {
        matches!(self.kind, ChannelKind::Ping { .. })
    }

    /// True until [`close`](Self::close) has run.
    pub fn is_valid(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn backend(&self) -> &Arc<Backend<C>> {
        &self.backend
    }

    /// Attach a caller-defined value, replacing any previous one.
    pub fn set_context<T: Any + Send + Sync>(&mut self, context: T) {
        self.context = Some(Box::new(context));
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref::<T>()
    }

    /// Remove and return the context if it has type `T`.
    pub fn take_context<T: Any>(&mut self) -> Option<T> {
        if !self.context.as_ref()?.is::<T>() {
            return None;
        }
        self.context
            .take()?
            .downcast::<T>()
            .ok()
            .map(|context| *context)
    }

    /// Send `packet` to the backend tagged with this channel's id.
    ///
    /// See [`Backend::send_packet`] for the meaning of the returned flag.
    pub async fn send_packet(&self, packet: &C::Packet) -> TransportResult<bool> {
        if !self.is_valid() {
            return Err(TransportError::ChannelInvalid(self.id));
        }
        self.backend.send_packet(packet, self.id).await
    }

    /// Collect the response to an exchange.
    ///
    /// Returns once a terminal packet arrives (it is included) or
    /// `packet_count` packets have been collected. `None` collects until a
    /// terminal packet. The deadline is fixed on entry; waiting for each
    /// packet spends the remaining budget. Packets carrying another
    /// channel's id are stray replies to an earlier exchange and are
    /// discarded. Fails with [`TransportError::ChannelTimeout`] if the
    /// deadline passes or the channel's queue is closed first.
    pub async fn receive_packets(
        &mut self,
        timeout: Duration,
        packet_count: Option<usize>,
    ) -> TransportResult<Vec<C::Packet>> {
        if !self.is_valid() {
            return Err(TransportError::ChannelInvalid(self.id));
        }
        if packet_count == Some(0) {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout;
        let is_ping = self.is_ping();
        let mut packets = Vec::new();

        loop {
            let Some(inbound) = self.inbound.as_mut() else {
                break;
            };
            let packet = match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Ok(Some(packet)) => packet,
                // Elapsed, or the backend dropped every sender.
                Ok(None) | Err(_) => break,
            };

            if !is_ping && packet.channel_id() != Some(self.id) {
                debug!(
                    channel = self.id,
                    packet_channel = ?packet.channel_id(),
                    kind = %packet.kind(),
                    "discarding stray packet"
                );
                continue;
            }

            let terminal = packet.is_terminal();
            packets.push(packet);
            if terminal || packet_count.is_some_and(|count| packets.len() >= count) {
                return Ok(packets);
            }
        }

        Err(TransportError::ChannelTimeout {
            channel_id: self.id,
            timeout,
            received: packets.len(),
        })
    }

    /// Deregister from the backend and discard anything still queued.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        self.context = None;
        let Some(mut inbound) = self.inbound.take() else {
            return;
        };
        match self.kind {
            ChannelKind::Regular => self.backend.remove_channel(self.id),
            ChannelKind::Ping { token } => self.backend.remove_ping_channel(token),
        }
        inbound.close();
        let mut discarded = 0usize;
        while inbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(channel = self.id, discarded, "discarded queued packets on close");
        }
    }
}

impl<C: PacketCodec> Drop for Channel<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: PacketCodec> std::fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("valid", &self.is_valid())
            .field("backend", &self.backend.address())
            .finish()
    }
}
