//! Streaming file enumerator channel.
//!
//! An enumerate job opens an [`EnumeratorSession`] named by an object path
//! of the form `/org/vfsd/client/enumerator/<id>`. The backend (producer)
//! posts `GotInfo` messages carrying batches of file infos to that path and
//! a single `Done` when exhausted; the client-side [`FileEnumerator`]
//! (consumer) collects batches from a bus filter and hands them out as a
//! blocking lazy sequence. Exactly one producer and one consumer are
//! assumed; a single mutex makes the pull safe against the asynchronous
//! filter callback.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::bus::MessageFilter;
use crate::error::Result;
use crate::info::FileInfo;
use crate::info::decode_infos;
use crate::info::encode_infos;

/// Object-path prefix for enumerator sessions.
pub const OBJ_PATH_PREFIX: &str = "/org/vfsd/client/enumerator/";

/// Message member carrying a batch of file infos.
pub const MEMBER_GOT_INFO: &str = "GotInfo";

/// Message member signalling the end of the enumeration.
pub const MEMBER_DONE: &str = "Done";

/// Infos buffered before a batch is flushed to the bus.
const BATCH_SIZE: usize = 100;

/// Allocator of enumerator session ids; ids are process-wide monotonic
/// starting at 1.
#[derive(Debug)]
pub struct Enumerators {
    next_id: AtomicU64,
}

impl Enumerators {
    /// Create the id registry.
    pub fn new() -> Arc<Enumerators> {
        Arc::new(Enumerators {
            next_id: AtomicU64::new(1),
        })
    }

    /// Open a fresh producer session streaming over the given bus.
    pub fn open(&self, bus: Arc<dyn Bus>) -> Arc<EnumeratorSession> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(EnumeratorSession {
            object_path: format!("{OBJ_PATH_PREFIX}{id}"),
            bus,
            batch: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        })
    }
}

/// Producer side of the channel, owned by the backend serving the
/// enumerate job.
pub struct EnumeratorSession {
    object_path: String,
    bus: Arc<dyn Bus>,
    batch: Mutex<Vec<FileInfo>>,
    done: AtomicBool,
}

impl EnumeratorSession {
    /// The session's object path; the enumerate reply carries it.
    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Queue one info for delivery, flushing a full batch.
    pub fn send_info(&self, info: FileInfo) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            debug_assert!(false, "send_info after done");
            warn!("dropping info sent after enumeration end on {}", self.object_path);
            return Ok(());
        }
        let flush = {
            let mut batch = self.batch.lock();
            batch.push(info);
            if batch.len() >= BATCH_SIZE {
                Some(std::mem::take(&mut *batch))
            } else {
                None
            }
        };
        match flush {
            Some(batch) => self.post_batch(&batch),
            None => Ok(()),
        }
    }

    /// Flush any buffered infos without ending the session.
    pub fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.batch.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.post_batch(&batch)
    }

    /// End the session. Flushes buffered infos, then posts `Done` exactly
    /// once; later calls are no-ops.
    pub fn done(&self) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let batch = std::mem::take(&mut *self.batch.lock());
        if !batch.is_empty() {
            self.post_batch(&batch)?;
        }
        debug!("enumeration on {} done", self.object_path);
        self.bus.post(&self.object_path, MEMBER_DONE, &[])
    }

    fn post_batch(&self, batch: &[FileInfo]) -> Result<()> {
        self.bus
            .post(&self.object_path, MEMBER_GOT_INFO, &encode_infos(batch))
    }
}

impl fmt::Debug for EnumeratorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumeratorSession")
            .field("object_path", &self.object_path)
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Default)]
struct ConsumerInner {
    infos: VecDeque<FileInfo>,
    done: bool,
}

#[derive(Default)]
struct ConsumerState {
    inner: Mutex<ConsumerInner>,
}

impl MessageFilter for ConsumerState {
    fn handle(&self, member: &str, body: &[u8]) {
        match member {
            MEMBER_GOT_INFO => {
                let infos = match decode_infos(body) {
                    Ok(infos) => infos,
                    Err(err) => {
                        warn!("discarding malformed info batch: {err}");
                        return;
                    }
                };
                let mut inner = self.inner.lock();
                if inner.done {
                    warn!("discarding info batch received after Done");
                    return;
                }
                inner.infos.extend(infos);
            }
            MEMBER_DONE => {
                self.inner.lock().done = true;
            }
            other => debug!("ignoring enumerator message {other}"),
        }
    }
}

/// Consumer side of the channel: a blocking lazy sequence of file infos.
pub struct FileEnumerator {
    bus: Arc<dyn Bus>,
    object_path: String,
    state: Arc<ConsumerState>,
}

impl FileEnumerator {
    /// Attach to a session's object path. Attach before pumping the
    /// connection so no batch is dispatched without a filter in place.
    pub fn attach(bus: Arc<dyn Bus>, object_path: &str) -> FileEnumerator {
        let state = Arc::new(ConsumerState::default());
        bus.register_filter(object_path, state.clone());
        FileEnumerator {
            bus,
            object_path: object_path.to_owned(),
            state,
        }
    }

    /// Pull the next info, blocking on the bus until one arrives. Returns
    /// `None` at end-of-stream (after `Done`, or if the connection closes).
    pub fn next_file(&self) -> Option<FileInfo> {
        loop {
            {
                let mut inner = self.state.inner.lock();
                if let Some(info) = inner.infos.pop_front() {
                    return Some(info);
                }
                if inner.done {
                    return None;
                }
            }
            if !self.bus.read_dispatch() {
                return None;
            }
        }
    }
}

impl Iterator for FileEnumerator {
    type Item = FileInfo;

    fn next(&mut self) -> Option<FileInfo> {
        self.next_file()
    }
}

impl Drop for FileEnumerator {
    fn drop(&mut self) {
        self.bus.unregister_filter(&self.object_path);
    }
}

impl fmt::Debug for FileEnumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("FileEnumerator")
            .field("object_path", &self.object_path)
            .field("buffered", &inner.infos.len())
            .field("done", &inner.done)
            .finish()
    }
}
