//! One physical TCP connection to a backend.
//!
//! A connection carries traffic for many channels interleaved by channel
//! id. Its socket is registered with a single listener, where a driver
//! task waits for read readiness (plus write readiness while a write
//! backlog exists) and runs the non-blocking state machine:
//!
//! ```text
//! caller: send_packet ──► encode ──► current / backlog ──► write()
//!                                          │ would block
//!                                          ▼
//! driver: ready(READ | WRITE) ──► write()  (drain backlog, disarm when empty)
//!                             └─► read()   ──► extract ──► Backend::receive_packet
//! ```
//!
//! Any I/O failure invalidates and closes the connection. It is never
//! revalidated; pools drop invalid connections instead of reusing them.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::backend::Backend;
use crate::buffer::InboundBuffer;
use crate::codec::{Decoded, PacketCodec};
use crate::error::{TransportError, TransportResult};
use crate::observer::ObserverSet;
use crate::pool::PooledConnection;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound buffers waiting to be written, guarded by the connection lock.
#[derive(Debug, Default)]
struct Outbound {
    /// Buffer currently being written, advanced past the bytes already sent.
    current: Option<Bytes>,
    /// Buffers queued behind `current`, in send order.
    backlog: VecDeque<Bytes>,
    /// Whether the driver should wait for write readiness.
    write_interest: bool,
}

/// A pooled, multiplexed connection to one backend.
pub struct Connection<C: PacketCodec> {
    id: u64,
    stream: TcpStream,
    codec: Arc<C>,
    backend: Weak<Backend<C>>,
    observers: Arc<ObserverSet<C::Packet>>,
    encode_size_hint: usize,
    outbound: Mutex<Outbound>,
    inbound: Mutex<InboundBuffer>,
    valid: AtomicBool,
    /// Wakes the driver to re-evaluate its readiness interest.
    wake: Notify,
}

impl<C: PacketCodec> Connection<C> {
    /// Connect to `host:port` and start the driver task.
    ///
    /// Must run on the listener that will own the connection: the socket is
    /// registered with the reactor of the runtime this future is polled on.
    pub(crate) async fn open(
        host: String,
        port: u16,
        codec: Arc<C>,
        backend: Weak<Backend<C>>,
        observers: Arc<ObserverSet<C::Packet>>,
        inbound_buffer_size: usize,
        encode_size_hint: usize,
    ) -> io::Result<Arc<Self>> {
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        // Request/response traffic; don't batch small frames.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(host = %host, port, error = %e, "could not disable nagle");
        }

        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            codec,
            backend,
            observers,
            encode_size_hint,
            outbound: Mutex::new(Outbound::default()),
            inbound: Mutex::new(InboundBuffer::new(inbound_buffer_size)),
            valid: AtomicBool::new(true),
            wake: Notify::new(),
        });

        debug!(
            connection = connection.id,
            host = %host,
            port,
            "established connection"
        );

        tokio::spawn(Arc::clone(&connection).drive());
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection can still carry traffic. Safe from any thread.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Current inbound buffer capacity.
    pub fn inbound_capacity(&self) -> usize {
        self.inbound.lock().capacity()
    }

    /// Bytes queued for writing and not yet accepted by the socket.
    pub fn pending_write_bytes(&self) -> usize {
        let outbound = self.outbound.lock();
        outbound.current.as_ref().map_or(0, Bytes::len)
            + outbound.backlog.iter().map(Bytes::len).sum::<usize>()
    }

    /// Encode `packet` for `channel_id`, queue it and try to write at once.
    ///
    /// Fails fast once the connection has been invalidated.
    pub fn send_packet(&self, packet: &C::Packet, channel_id: u32) -> TransportResult<()> {
        if !self.is_valid() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        let encoded = self
            .codec
            .encode(packet, channel_id, self.encode_size_hint)?;
        self.observers.notify_sent(channel_id, packet, &encoded);

        {
            let mut outbound = self.outbound.lock();
            if outbound.current.is_none() {
                outbound.current = Some(encoded);
            } else {
                outbound.backlog.push_back(encoded);
                self.arm_write(&mut outbound);
            }
        }
        self.write()
    }

    /// Write as much buffered output as the socket accepts without blocking.
    ///
    /// Write interest stays armed while anything is left and is disarmed
    /// once the backlog is empty. An I/O error closes the connection and is
    /// returned to the caller.
    pub fn write(&self) -> TransportResult<()> {
        let mut outbound = self.outbound.lock();
        loop {
            let Some(current) = outbound.current.as_mut() else {
                break;
            };
            if current.is_empty() {
                outbound.current = outbound.backlog.pop_front();
                continue;
            }
            match self.stream.try_write(current) {
                Ok(0) => {
                    drop(outbound);
                    return Err(self.fail(io::Error::from(io::ErrorKind::WriteZero)));
                }
                Ok(n) => {
                    current.advance(n);
                    trace!(connection = self.id, bytes = n, "wrote");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.arm_write(&mut outbound);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(outbound);
                    return Err(self.fail(e));
                }
            }
        }
        outbound.write_interest = false;
        Ok(())
    }

    /// Read everything immediately available, then extract packets.
    ///
    /// End of stream closes the connection after any complete packets
    /// already buffered have been delivered.
    pub fn read(&self) -> TransportResult<()> {
        let mut inbound = self.inbound.lock();
        let mut eof = false;
        loop {
            let spare = inbound.writable_mut();
            match self.stream.try_read(spare) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    inbound.commit(n);
                    trace!(connection = self.id, bytes = n, "read");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(inbound);
                    return Err(self.fail(e));
                }
            }
        }

        if let Err(e) = self.extract_packets(&mut inbound) {
            drop(inbound);
            warn!(connection = self.id, error = %e, "undecodable inbound data");
            self.close_quietly();
            return Err(e);
        }

        if eof {
            drop(inbound);
            debug!(connection = self.id, "connection closed by backend");
            self.close_quietly();
            return Err(TransportError::ConnectionClosed(self.id));
        }
        Ok(())
    }

    /// Hand every complete buffered packet to the backend.
    fn extract_packets(&self, inbound: &mut InboundBuffer) -> TransportResult<()> {
        loop {
            if inbound.is_empty() {
                inbound.reset_if_drained();
                return Ok(());
            }
            let sniffed = self.codec.sniff_channel(inbound.readable());
            match self.codec.decode(inbound.readable())? {
                Decoded::NeedMore { required } => {
                    inbound.reserve_frame(required);
                    return Ok(());
                }
                Decoded::Packet { packet, consumed } => {
                    let backend = self.backend.upgrade();
                    let channel = match (&backend, sniffed) {
                        (Some(backend), Some(id)) => backend.observed_channel(id),
                        _ => None,
                    };
                    self.observers
                        .notify_received(channel, &packet, &inbound.readable()[..consumed]);

                    inbound.consume(consumed);
                    inbound.reset_if_drained();

                    match backend {
                        Some(backend) => backend.receive_packet(packet),
                        None => trace!(connection = self.id, "backend gone, dropping packet"),
                    }
                }
            }
        }
    }

    /// Invalidate and close the socket. Later calls are no-ops.
    pub fn close(&self) -> io::Result<()> {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.wake.notify_one();
        debug!(connection = self.id, "closing connection");
        match socket2::SockRef::from(&self.stream).shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn close_quietly(&self) {
        if let Err(e) = self.close() {
            debug!(connection = self.id, error = %e, "error closing connection");
        }
    }

    /// Close after an I/O failure and convert the error.
    fn fail(&self, error: io::Error) -> TransportError {
        warn!(connection = self.id, error = %error, "connection i/o failure");
        self.close_quietly();
        TransportError::Io(error)
    }

    fn arm_write(&self, outbound: &mut Outbound) {
        if !outbound.write_interest {
            outbound.write_interest = true;
            self.wake.notify_one();
        }
    }

    fn wants_write(&self) -> bool {
        self.outbound.lock().write_interest
    }

    /// Event loop for this connection. Runs on the owning listener until
    /// the connection is invalidated or its backend is dropped.
    async fn drive(self: Arc<Self>) {
        while self.is_valid() {
            if self.backend.strong_count() == 0 {
                self.close_quietly();
                break;
            }
            let interest = if self.wants_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            let ready = tokio::select! {
                ready = self.stream.ready(interest) => ready,
                () = self.wake.notified() => continue,
            };

            let ready = match ready {
                Ok(ready) => ready,
                Err(e) => {
                    let _ = self.fail(e);
                    break;
                }
            };

            // Failures are contained here: the connection closes itself and
            // the listener keeps serving its other connections.
            if ready.is_writable() {
                if let Err(e) = self.write() {
                    debug!(connection = self.id, error = %e, "write failed");
                }
            }
            if ready.is_readable() || ready.is_read_closed() {
                if let Err(e) = self.read() {
                    debug!(connection = self.id, error = %e, "read ended");
                }
            }
        }
        trace!(connection = self.id, "connection driver exited");
    }
}

impl<C: PacketCodec> PooledConnection for Connection<C> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_valid(&self) -> bool {
        Connection::is_valid(self)
    }

    fn close(&self) -> io::Result<()> {
        Connection::close(self)
    }
}

impl<C: PacketCodec> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .field("peer", &self.stream.peer_addr().ok())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketKind};
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct Blank;

    impl Packet for Blank {
        fn channel_id(&self) -> Option<u32> {
            None
        }

        fn kind(&self) -> PacketKind {
            PacketKind::Data
        }
    }

    struct BlankCodec;

    impl PacketCodec for BlankCodec {
        type Packet = Blank;

        fn sniff_channel(&self, _buf: &[u8]) -> Option<u32> {
            None
        }

        fn decode(&self, buf: &[u8]) -> TransportResult<Decoded<Blank>> {
            Ok(Decoded::NeedMore {
                required: buf.len() + 1,
            })
        }

        fn encode(&self, _packet: &Blank, _channel_id: u32, _hint: usize) -> TransportResult<Bytes> {
            Ok(Bytes::from_static(b"x"))
        }
    }

    async fn open_orphan() -> (Arc<Connection<BlankCodec>>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connection = Connection::open(
            "127.0.0.1".to_string(),
            port,
            Arc::new(BlankCodec),
            Weak::new(),
            Arc::new(ObserverSet::new()),
            64,
            16,
        )
        .await
        .unwrap();
        let (peer, _) = listener.accept().unwrap();
        (connection, peer)
    }

    #[tokio::test]
    async fn nagle_is_disabled() {
        let (connection, _peer) = open_orphan().await;
        assert!(connection.stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn connection_without_backend_closes_itself() {
        let (connection, _peer) = open_orphan().await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while connection.is_valid() {
            assert!(Instant::now() < deadline, "driver never closed the connection");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let err = connection.send_packet(&Blank, 2).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed(_)));
        assert_eq!(connection.pending_write_bytes(), 0);
        // Closing again is a no-op.
        connection.close().unwrap();
    }
}
