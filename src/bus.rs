//! IPC bus interface.
//!
//! The bus library itself is an external collaborator; this module defines
//! the narrow surface the core depends on: posting one-way messages to
//! object paths, registering per-path filters, pumping the connection, and
//! replying to request envelopes. [`LoopbackBus`] is a complete in-process
//! implementation used by the tests and by single-process embeddings.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

/// Receiver for messages posted to one object path.
pub trait MessageFilter: Send + Sync {
    /// Handle one message. Called from within [`Bus::read_dispatch`] on the
    /// pumping thread.
    fn handle(&self, member: &str, body: &[u8]);
}

/// The connection surface the core uses.
pub trait Bus: Send + Sync {
    /// Post a one-way message to an object path.
    fn post(&self, path: &str, member: &str, body: &[u8]) -> Result<()>;

    /// Register the filter receiving messages for `path`.
    fn register_filter(&self, path: &str, filter: Arc<dyn MessageFilter>);

    /// Drop the filter for `path`.
    fn unregister_filter(&self, path: &str);

    /// Block until at least one inbound message has been dispatched to its
    /// filter. Returns `false` once the connection is closed.
    fn read_dispatch(&self) -> bool;
}

/// Write half for request replies; the bus serializes replies per peer in
/// the order they are sent.
pub trait ReplySink: Send + Sync {
    /// Send a reply payload for the request with the given serial.
    fn send(&self, serial: u64, payload: Vec<u8>);
}

/// The originating request a job replies to. Opaque to the core: the serial
/// is echoed verbatim and the payload handed to the peer's sink.
#[derive(Clone)]
pub struct Envelope {
    serial: u64,
    sink: Arc<dyn ReplySink>,
}

impl Envelope {
    /// Wrap a request serial and the sink its reply goes to.
    pub fn new(serial: u64, sink: Arc<dyn ReplySink>) -> Envelope {
        Envelope { serial, sink }
    }

    /// The request serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Send the reply payload back to the requesting peer.
    pub fn reply(&self, payload: Vec<u8>) {
        self.sink.send(self.serial, payload);
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope").field("serial", &self.serial).finish()
    }
}

struct LoopbackInner {
    queue: VecDeque<(String, String, Vec<u8>)>,
    closed: bool,
}

/// In-process bus: messages posted on any thread are delivered to filters
/// from whichever thread is pumping [`Bus::read_dispatch`].
pub struct LoopbackBus {
    filters: Mutex<HashMap<String, Arc<dyn MessageFilter>>>,
    inner: Mutex<LoopbackInner>,
    cvar: Condvar,
}

impl LoopbackBus {
    /// Create an open loopback connection.
    pub fn new() -> Arc<LoopbackBus> {
        Arc::new(LoopbackBus {
            filters: Mutex::new(HashMap::new()),
            inner: Mutex::new(LoopbackInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            cvar: Condvar::new(),
        })
    }

    /// Close the connection: pending messages still drain, then
    /// [`Bus::read_dispatch`] reports `false`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cvar.notify_all();
    }
}

impl Bus for LoopbackBus {
    fn post(&self, path: &str, member: &str, body: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::new(ErrorKind::Io, "Bus connection is closed"));
        }
        inner
            .queue
            .push_back((path.to_owned(), member.to_owned(), body.to_vec()));
        self.cvar.notify_all();
        Ok(())
    }

    fn register_filter(&self, path: &str, filter: Arc<dyn MessageFilter>) {
        self.filters.lock().insert(path.to_owned(), filter);
    }

    fn unregister_filter(&self, path: &str) {
        self.filters.lock().remove(path);
    }

    fn read_dispatch(&self) -> bool {
        let message = {
            let mut inner = self.inner.lock();
            loop {
                if let Some(message) = inner.queue.pop_front() {
                    break message;
                }
                if inner.closed {
                    return false;
                }
                self.cvar.wait(&mut inner);
            }
        };
        let (path, member, body) = message;
        let filter = self.filters.lock().get(&path).cloned();
        match filter {
            // Dispatch outside both locks; filters take their own.
            Some(filter) => filter.handle(&member, &body),
            None => warn!("dropping message {member} for unknown path {path}"),
        }
        true
    }
}

impl fmt::Debug for LoopbackBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LoopbackBus")
            .field("queued", &inner.queue.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Reply sink that records every payload it is handed.
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub(crate) replies: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl ReplySink for CollectingSink {
        fn send(&self, serial: u64, payload: Vec<u8>) {
            self.replies.lock().push((serial, payload));
        }
    }

    impl CollectingSink {
        pub(crate) fn single(&self) -> (u64, Vec<u8>) {
            let replies = self.replies.lock();
            assert_eq!(replies.len(), 1, "expected exactly one reply");
            replies[0].clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct Counter(AtomicUsize);

    impl MessageFilter for Counter {
        fn handle(&self, _member: &str, _body: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn posts_reach_registered_filter() {
        let bus = LoopbackBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.register_filter("/obj/1", counter.clone());
        bus.post("/obj/1", "Ping", b"").unwrap();
        bus.post("/obj/other", "Ping", b"").unwrap();
        assert!(bus.read_dispatch());
        assert!(bus.read_dispatch());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_drains_then_ends() {
        let bus = LoopbackBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.register_filter("/obj/1", counter.clone());
        bus.post("/obj/1", "Ping", b"").unwrap();
        bus.close();
        assert!(bus.read_dispatch());
        assert!(!bus.read_dispatch());
        assert!(bus.post("/obj/1", "Ping", b"").is_err());
    }
}
