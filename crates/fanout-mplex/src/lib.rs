//! fanout-mplex: multiplexed channel transport for search dispatch backends.
//!
//! Many logical request/response exchanges share a small pool of TCP
//! connections per backend. Each exchange gets a [`Channel`] with its own
//! id; packets are tagged with that id on the way out and routed back to
//! the channel's inbound queue on the way in.
//!
//! - **listener**: Fixed pool of I/O event loops, one thread each
//! - **backend**: Per-address connection pool, channel registry and routing
//! - **connection**: Non-blocking read/write state machine for one socket
//! - **channel**: Send plus deadline-bounded collection of a response
//! - **pool** / **registry**: Idle connection queue and open channel map
//! - **codec** / **packet** / **observer**: Capabilities supplied by the user
//!
//! ```no_run
//! # async fn run<C: fanout_mplex::PacketCodec>(codec: C, ping: C::Packet) -> fanout_mplex::TransportResult<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fanout_mplex::{Backend, ListenerPool, TransportConfig};
//!
//! let config = TransportConfig::default();
//! let listeners = Arc::new(ListenerPool::new(config.listener_threads)?);
//! let backend = Backend::new("127.0.0.1", 19100, codec, listeners, config)?;
//!
//! let mut channel = backend.open_ping_channel();
//! if channel.send_packet(&ping).await? {
//!     let pong = channel.receive_packets(Duration::from_millis(100), None).await?;
//!     assert_eq!(pong.len(), 1);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod observer;
pub mod packet;
pub mod pool;
pub mod registry;

#[cfg(feature = "testkit")]
pub mod testkit;

pub use backend::{Backend, BackendStats};
pub use channel::Channel;
pub use codec::{Decoded, PacketCodec};
pub use config::{TransportConfig, TransportConfigFile};
pub use connection::Connection;
pub use error::{TransportError, TransportResult};
pub use listener::{Listener, ListenerPool};
pub use observer::{ObserverSet, PacketObserver, TracingObserver};
pub use packet::{Packet, PacketKind};
