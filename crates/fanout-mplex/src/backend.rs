//! One dispatch backend, identified by host and port.
//!
//! A [`Backend`] owns the connection pool for its address, the registry of
//! open channels and the shutdown state. Callers open [`Channel`]s on it
//! and send through them; connections route every packet they extract
//! back through [`Backend::receive_packet`].
//!
//! Lifecycle: created once per backend address, then retired with
//! [`shutdown`](Backend::shutdown) followed by [`close`](Backend::close).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelKind};
use crate::codec::PacketCodec;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{TransportError, TransportResult};
use crate::listener::ListenerPool;
use crate::observer::{ObserverSet, PacketObserver};
use crate::packet::Packet;
use crate::pool::ConnectionPool;
use crate::registry::ChannelRegistry;

/// Point-in-time counters for one backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub active_connections: usize,
    pub passive_connections: usize,
    pub open_channels: usize,
    pub pending_pings: usize,
}

pub struct Backend<C: PacketCodec> {
    host: String,
    port: u16,
    codec: Arc<C>,
    config: TransportConfig,
    listeners: Arc<ListenerPool>,
    next_listener: AtomicUsize,
    pool: Arc<ConnectionPool<Connection<C>>>,
    registry: ChannelRegistry<C::Packet>,
    observers: Arc<ObserverSet<C::Packet>>,
    shutdown: AtomicBool,
    /// Set while connection attempts keep failing, so only the first
    /// failure of an outage is logged.
    unreachable: AtomicBool,
}

impl<C: PacketCodec> Backend<C> {
    /// Create a backend for `host:port` whose connections are driven by
    /// `listeners`. Starts the idle-connection sweep.
    ///
    /// Fails with [`TransportError::Config`] if `config` does not validate.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        codec: C,
        listeners: Arc<ListenerPool>,
        config: TransportConfig,
    ) -> TransportResult<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new());
        pool.start_sweeper(listeners.get(0).handle(), config.sweep_interval);

        let backend = Arc::new(Self {
            host: host.into(),
            port,
            codec: Arc::new(codec),
            config,
            listeners,
            next_listener: AtomicUsize::new(0),
            pool,
            registry: ChannelRegistry::new(),
            observers: Arc::new(ObserverSet::new()),
            shutdown: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        });
        debug!(backend = %backend.address(), "created backend");
        Ok(backend)
    }

    /// `host:port` of this backend.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pool(&self) -> &ConnectionPool<Connection<C>> {
        &self.pool
    }

    pub fn add_observer(&self, observer: Arc<dyn PacketObserver<C::Packet>>) {
        self.observers.add(observer);
    }

    /// Open a channel under the next free even id.
    pub fn open_channel(self: &Arc<Self>) -> Channel<C> {
        let (tx, rx) = mpsc::channel(self.config.channel_queue_capacity);
        let id = self.registry.register(tx);
        trace!(backend = %self.address(), channel = id, "opened channel");
        Channel::new(id, ChannelKind::Regular, Arc::clone(self), rx)
    }

    /// Open a ping channel. Pongs are delivered to outstanding ping
    /// channels in the order they were opened.
    pub fn open_ping_channel(self: &Arc<Self>) -> Channel<C> {
        let (tx, rx) = mpsc::channel(self.config.channel_queue_capacity);
        let token = self.registry.register_ping(tx);
        trace!(backend = %self.address(), token, "opened ping channel");
        Channel::new(0, ChannelKind::Ping { token }, Arc::clone(self), rx)
    }

    /// Inbound handle of the open channel `id`, if any.
    pub fn get_channel(&self, id: u32) -> Option<mpsc::Sender<C::Packet>> {
        self.registry.lookup(id)
    }

    /// Inbound handle of the oldest outstanding ping channel, if any.
    pub fn get_ping_channel(&self) -> Option<mpsc::Sender<C::Packet>> {
        self.registry.head_ping()
    }

    pub fn is_channel_open(&self, id: u32) -> bool {
        self.registry.contains(id)
    }

    pub fn has_ping_channel(&self) -> bool {
        self.registry.pending_pings() > 0
    }

    pub(crate) fn remove_channel(&self, id: u32) {
        if self.registry.deregister(id) {
            trace!(backend = %self.address(), channel = id, "closed channel");
        }
    }

    pub(crate) fn remove_ping_channel(&self, token: u64) {
        if self.registry.deregister_ping(token) {
            trace!(backend = %self.address(), token, "closed ping channel");
        }
    }

    /// Channel an observer should attribute a frame sniffed as `id` to.
    pub(crate) fn observed_channel(&self, id: u32) -> Option<u32> {
        if self.registry.contains(id) {
            Some(id)
        } else if id == 0 && self.has_ping_channel() {
            Some(0)
        } else {
            None
        }
    }

    /// Route a packet extracted by one of this backend's connections.
    ///
    /// Packets for channels that are no longer open, or whose queue is
    /// full, are dropped. Nothing here can fail the calling I/O loop.
    pub fn receive_packet(&self, packet: C::Packet) {
        let channel_id = packet.channel_id();
        let target = match channel_id {
            Some(id) => self.registry.lookup(id),
            None => self.registry.head_ping(),
        };
        let Some(target) = target else {
            debug!(
                backend = %self.address(),
                channel = ?channel_id,
                kind = %packet.kind(),
                "dropping packet for channel that is not open"
            );
            return;
        };
        match target.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => warn!(
                backend = %self.address(),
                channel = ?channel_id,
                kind = %packet.kind(),
                "channel queue full, dropping packet"
            ),
            Err(TrySendError::Closed(_)) => debug!(
                backend = %self.address(),
                channel = ?channel_id,
                "channel invalid, dropping packet"
            ),
        }
    }

    /// Send `packet` tagged with `channel_id` on a pooled connection.
    ///
    /// Returns `Ok(false)` after shutdown or when no connection could be
    /// obtained. An I/O failure on the chosen connection is returned as an
    /// error; the connection is handed back to the pool either way.
    pub async fn send_packet(
        self: &Arc<Self>,
        packet: &C::Packet,
        channel_id: u32,
    ) -> TransportResult<bool> {
        if self.is_shut_down() {
            debug!(backend = %self.address(), channel = channel_id, "send after shutdown ignored");
            return Ok(false);
        }
        let Some(connection) = self.acquire_connection().await else {
            return Ok(false);
        };
        let result = connection.send_packet(packet, channel_id);
        self.pool.release_connection(connection);
        result.map(|()| true)
    }

    /// Take a valid idle connection or create a new one.
    async fn acquire_connection(self: &Arc<Self>) -> Option<Arc<Connection<C>>> {
        while let Some(connection) = self.pool.get_connection() {
            if connection.is_valid() {
                return Some(connection);
            }
            self.pool.release_connection(connection);
        }
        self.create_connection().await
    }

    /// Connect on the next listener in round-robin order, bounded by the
    /// configured connect timeout.
    async fn create_connection(self: &Arc<Self>) -> Option<Arc<Connection<C>>> {
        let index = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener = self.listeners.get(index);

        let mut open = listener.spawn(Connection::open(
            self.host.clone(),
            self.port,
            Arc::clone(&self.codec),
            Arc::downgrade(self),
            Arc::clone(&self.observers),
            self.config.inbound_buffer_size,
            self.config.encode_size_hint,
        ));

        let error = match tokio::time::timeout(self.config.connect_timeout, &mut open).await {
            Ok(Ok(Ok(connection))) => {
                if self.unreachable.swap(false, Ordering::Relaxed) {
                    info!(backend = %self.address(), "backend reachable again");
                }
                self.pool.created_connection();
                trace!(
                    backend = %self.address(),
                    connection = connection.id(),
                    listener = listener.index(),
                    "created connection"
                );
                return Some(connection);
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(e)) => format!("connect task failed: {e}"),
            Err(_) => {
                open.abort();
                // The connect may have completed between the timeout firing
                // and the abort; such a connection is never pooled.
                if let Ok(Ok(connection)) = (&mut open).await {
                    trace!(
                        backend = %self.address(),
                        connection = connection.id(),
                        "closing connection established after timeout"
                    );
                    if let Err(e) = connection.close() {
                        debug!(connection = connection.id(), error = %e, "error closing connection");
                    }
                }
                format!("timed out after {:?}", self.config.connect_timeout)
            }
        };

        if !self.unreachable.swap(true, Ordering::Relaxed) {
            warn!(backend = %self.address(), error = %error, "could not connect to backend");
        } else {
            trace!(backend = %self.address(), error = %error, "connect attempt failed");
        }
        None
    }

    /// Reject all further sends. Calling this twice is an error.
    pub fn shutdown(&self) -> TransportResult<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyShutDown(self.address()));
        }
        info!(backend = %self.address(), "backend shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Close every idle connection and release all channel registrations,
    /// so pending receives end instead of waiting out their deadline.
    /// Returns the number of connections closed.
    pub fn close(&self) -> usize {
        let drained = self.pool.drain();
        self.registry.clear();
        debug!(backend = %self.address(), drained, "closed backend connections");
        drained
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            active_connections: self.pool.active_connections(),
            passive_connections: self.pool.passive_connections(),
            open_channels: self.registry.open_channels(),
            pending_pings: self.registry.pending_pings(),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            backend = %self.address(),
            active = stats.active_connections,
            passive = stats.passive_connections,
            channels = stats.open_channels,
            pings = stats.pending_pings,
            "backend stats"
        );
    }
}

impl<C: PacketCodec> Drop for Backend<C> {
    fn drop(&mut self) {
        self.pool.drain();
    }
}

impl<C: PacketCodec> std::fmt::Debug for Backend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address())
            .field("shut_down", &self.is_shut_down())
            .field("stats", &self.stats())
            .finish()
    }
}
