//! Fixed pool of I/O listeners.
//!
//! Each [`Listener`] is a dedicated thread running a single-threaded tokio
//! runtime. Connections are registered with exactly one listener's reactor
//! for their whole lifetime and their read/write readiness is driven there.
//! Backends pick listeners round-robin through [`ListenerPool::get`].

use std::future::Future;
use std::thread;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// One I/O event loop.
pub struct Listener {
    index: usize,
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Listener {
    fn start(index: usize) -> TransportResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("mplex-listener-{index}"))
            .spawn(move || {
                runtime.block_on(async {
                    // Either an explicit stop or the pool being dropped ends the loop.
                    let _ = stop_rx.await;
                });
                debug!(listener = index, "listener stopped");
            })?;

        debug!(listener = index, "listener started");
        Ok(Self {
            index,
            handle,
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Runtime handle of this listener's event loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` on this listener's event loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    fn signal_stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }

    fn join(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // Closing from inside this listener; the thread exits on its own.
            return;
        }
        if thread.join().is_err() {
            warn!(listener = self.index, "listener thread panicked");
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("index", &self.index)
            .field("running", &self.thread.lock().is_some())
            .finish()
    }
}

/// Fixed-size set of listeners shared by any number of backends.
#[derive(Debug)]
pub struct ListenerPool {
    listeners: Vec<Listener>,
}

impl ListenerPool {
    /// Start `size` listener threads.
    pub fn new(size: usize) -> TransportResult<Self> {
        if size == 0 {
            return Err(TransportError::Config(
                "listener pool needs at least one listener".to_string(),
            ));
        }
        let listeners = (0..size)
            .map(Listener::start)
            .collect::<TransportResult<Vec<_>>>()?;
        Ok(Self { listeners })
    }

    /// Listener at `index`, taken modulo the pool size.
    pub fn get(&self, index: usize) -> &Listener {
        &self.listeners[index % self.listeners.len()]
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Stop every listener and wait for its thread to finish.
    ///
    /// Connections driven by a stopped listener stop making progress.
    /// Calling this more than once is harmless.
    pub fn close(&self) {
        for listener in &self.listeners {
            listener.signal_stop();
        }
        for listener in &self.listeners {
            listener.join();
        }
    }
}

impl Drop for ListenerPool {
    fn drop(&mut self) {
        self.close();
    }
}
