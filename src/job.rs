//! Job lifecycle.
//!
//! A [`Job`] is one unit of client-requested work: constructed from a
//! request envelope by the bus adapter, offered to the backend's fast path,
//! run on a worker if the fast path declines, finished with exactly one
//! terminal outcome, and replied to exactly once. The job keeps its backend
//! alive for its whole duration; the reply is dispatched from whichever
//! thread performs the terminal transition, which may be an I/O thread.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::bus::Envelope;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::wire::FrameWriter;

pub mod ops;

pub use ops::JobKind;

/// Error domain written into reply frames.
pub const ERROR_DOMAIN: &str = "org.vfsd.Error";

/// Cooperative cancellation flag shared between a job and whoever may cancel
/// it (the client via a cancel request, or backend shutdown).
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A fresh, untripped token.
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    /// Trip the token. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out if the token has been tripped. Backends call this at every
    /// suspension point.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Mutable job outcome; transitions from `Pending` exactly once.
#[derive(Debug)]
enum Outcome {
    Pending,
    Succeeded,
    Failed(Error),
}

/// One unit of client-requested work.
pub struct Job {
    id: u64,
    envelope: Envelope,
    backend: Arc<dyn Backend>,
    token: CancellationToken,
    outcome: Mutex<Outcome>,
    replied: AtomicBool,
    kind: JobKind,
}

impl Job {
    /// Construct a job over its originating envelope. The backend reference
    /// is held for the job's whole lifetime.
    pub fn new(id: u64, envelope: Envelope, backend: Arc<dyn Backend>, kind: JobKind) -> Job {
        Job {
            id,
            envelope,
            backend,
            token: CancellationToken::new(),
            outcome: Mutex::new(Outcome::Pending),
            replied: AtomicBool::new(false),
            kind,
        }
    }

    /// The job id used by cancel requests.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The typed operation this job carries.
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    /// The backend this job is bound to.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// This job's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once a terminal outcome has been set.
    pub fn is_finished(&self) -> bool {
        !matches!(*self.outcome.lock(), Outcome::Pending)
    }

    /// Finish the job successfully and dispatch the reply.
    pub fn succeeded(&self) {
        self.finish(Outcome::Succeeded);
    }

    /// Finish the job with an error and dispatch the reply.
    pub fn fail(&self, error: Error) {
        self.finish(Outcome::Failed(error));
    }

    /// First terminal transition wins; a second call is a logic error and is
    /// ignored outside debug builds.
    fn finish(&self, outcome: Outcome) {
        {
            let mut slot = self.outcome.lock();
            match *slot {
                Outcome::Pending => *slot = outcome,
                _ => {
                    debug_assert!(false, "job {} finished twice", self.id);
                    warn!("job {} finished twice; keeping first outcome", self.id);
                    return;
                }
            }
        }
        self.send_reply();
    }

    /// Serialize the outcome and write it back onto the bus. Runs at most
    /// once; the mount variant routes through mount registration first.
    fn send_reply(&self) {
        if self.replied.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "job {} replied twice", self.id);
            return;
        }
        let failure = {
            let outcome = self.outcome.lock();
            match &*outcome {
                Outcome::Failed(error) => {
                    debug!("job {} ({}) failed: {}", self.id, self.kind.name(), error);
                    Some(encode_error(error))
                }
                Outcome::Succeeded => None,
                Outcome::Pending => {
                    debug_assert!(false, "job {} replied while pending", self.id);
                    let error =
                        Error::new(ErrorKind::Failed, "job finished without an outcome");
                    Some(encode_error(&error))
                }
            }
        };

        if let JobKind::Mount(op) = &self.kind {
            op.finish_mount(self, failure);
            return;
        }

        match failure {
            Some(frame) => self.envelope.reply(frame),
            None => {
                let mut w = FrameWriter::body();
                w.put_u8(0);
                self.kind.encode_success(&mut w);
                self.envelope.reply(w.finish());
            }
        }
    }

    pub(crate) fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Encode a failed outcome as a reply payload: result byte 1, then the
/// `(domain, code, message)` triple.
pub(crate) fn encode_error(error: &Error) -> Vec<u8> {
    let mut w = FrameWriter::body();
    w.put_u8(1)
        .put_string(ERROR_DOMAIN)
        .put_i32(error.kind().into())
        .put_string(error.message());
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Capabilities;
    use crate::bus::testutil::CollectingSink;
    use crate::wire::FrameReader;

    /// Backend stub advertising nothing; job tests drive outcomes directly.
    #[derive(Debug)]
    struct NullBackend;

    impl Backend for NullBackend {
        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn registration(&self) -> Option<crate::mount::MountRef> {
            None
        }
    }

    fn make_job(sink: &Arc<CollectingSink>) -> Job {
        let envelope = Envelope::new(7, sink.clone() as Arc<dyn crate::bus::ReplySink>);
        Job::new(
            1,
            envelope,
            Arc::new(NullBackend),
            JobKind::Delete(ops::PathOp::new("/x")),
        )
    }

    #[test]
    fn failure_reply_carries_error_triple() {
        let sink = Arc::new(CollectingSink::default());
        let job = make_job(&sink);
        job.fail(Error::new(ErrorKind::NotFound, "no such file"));

        let (serial, payload) = sink.single();
        assert_eq!(serial, 7);
        let mut r = FrameReader::new(&payload);
        assert_eq!(r.get_u8().unwrap(), 1);
        assert_eq!(r.get_string().unwrap(), ERROR_DOMAIN);
        assert_eq!(r.get_i32().unwrap(), i32::from(ErrorKind::NotFound));
        assert_eq!(r.get_string().unwrap(), "no such file");
    }

    #[test]
    fn success_reply_is_sent_once() {
        let sink = Arc::new(CollectingSink::default());
        let job = make_job(&sink);
        job.succeeded();
        assert!(job.is_finished());
        let (_, payload) = sink.single();
        assert_eq!(payload[0], 0);
    }

    #[test]
    fn cancellation_token_checks() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check().unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
