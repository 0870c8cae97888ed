//! Job queue and worker pool.
//!
//! `submit` offers every job to the backend's fast path on the calling
//! (dispatcher) thread; jobs the fast path declines are queued for a fixed
//! pool of worker threads that run the blocking handlers. Cancel requests
//! reference jobs by id and trip their tokens; queue shutdown cancels
//! everything still in flight and joins the workers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::backend::TryDispatch;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::job::Job;

/// Default number of worker threads.
const DEFAULT_WORKERS: usize = 8;

/// Upper bound to keep a typo from exhausting the machine.
const MAX_WORKERS: usize = 1024;

/// Worker-pool configuration.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Number of worker threads executing blocking handlers.
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            workers: DEFAULT_WORKERS,
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values.
    pub fn new() -> QueueConfig {
        QueueConfig::default()
    }

    /// Set the worker count.
    pub fn workers(mut self, workers: usize) -> QueueConfig {
        self.workers = workers;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> io::Result<()> {
        if self.workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "workers must be at least 1",
            ));
        }
        if self.workers > MAX_WORKERS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("workers cannot exceed {MAX_WORKERS}"),
            ));
        }
        Ok(())
    }
}

struct QueueInner {
    pending: VecDeque<Arc<Job>>,
    shutdown: bool,
}

struct QueueState {
    inner: Mutex<QueueInner>,
    cvar: Condvar,
    inflight: Mutex<HashMap<u64, Weak<Job>>>,
}

impl QueueState {
    fn forget(&self, id: u64) {
        self.inflight.lock().remove(&id);
    }
}

/// The job dispatch queue.
pub struct JobQueue {
    state: Arc<QueueState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Start the queue and its worker pool.
    pub fn start(config: QueueConfig) -> io::Result<JobQueue> {
        config.validate()?;
        let state = Arc::new(QueueState {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                shutdown: false,
            }),
            cvar: Condvar::new(),
            inflight: Mutex::new(HashMap::new()),
        });
        let mut workers = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let state = state.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("vfsd-worker-{idx}"))
                    .spawn(move || worker_main(&state))?,
            );
        }
        Ok(JobQueue {
            state,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a job for execution.
    ///
    /// Runs on the bus/dispatcher thread: a capability miss fails the job
    /// immediately, the fast path may complete it synchronously, anything
    /// else lands on the worker pool. The returned handle is for
    /// observation; the queue owns dispatch.
    pub fn submit(&self, job: Job) -> Arc<Job> {
        let job = Arc::new(job);
        self.state
            .inflight
            .lock()
            .insert(job.id(), Arc::downgrade(&job));

        let capability = job.kind().capability();
        if !job.backend().capabilities().contains(capability) {
            job.fail(Error::not_supported());
            self.state.forget(job.id());
            return job;
        }

        match job.kind().try_dispatch(&job, job.backend().as_ref()) {
            TryDispatch::Handled => {
                debug_assert!(job.is_finished(), "fast path claimed an unfinished job");
                self.state.forget(job.id());
            }
            TryDispatch::NotHandled => {
                let mut inner = self.state.inner.lock();
                if inner.shutdown {
                    drop(inner);
                    job.fail(Error::new(ErrorKind::Cancelled, "Job queue is shut down"));
                    self.state.forget(job.id());
                } else {
                    inner.pending.push_back(job.clone());
                    self.state.cvar.notify_one();
                }
            }
        }
        job
    }

    /// Trip the cancellation token of an in-flight job.
    pub fn cancel(&self, job_id: u64) {
        let job = self.state.inflight.lock().get(&job_id).and_then(Weak::upgrade);
        if let Some(job) = job {
            debug!("cancelling job {job_id}");
            job.token().cancel();
        }
    }

    /// Shut the queue down: cancel everything in flight, wake the workers
    /// and join them. Queued jobs that never ran complete with `CANCELLED`.
    pub fn shutdown(&self) {
        {
            let mut inner = self.state.inner.lock();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }
        for job in self.state.inflight.lock().values().filter_map(Weak::upgrade) {
            job.token().cancel();
        }
        self.state.cvar.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("JobQueue")
            .field("pending", &inner.pending.len())
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}

fn worker_main(state: &QueueState) {
    loop {
        let job = {
            let mut inner = state.inner.lock();
            loop {
                if let Some(job) = inner.pending.pop_front() {
                    break job;
                }
                if inner.shutdown {
                    return;
                }
                state.cvar.wait(&mut inner);
            }
        };

        if job.is_cancelled() {
            job.fail(Error::cancelled());
        } else {
            job.kind().run(&job, job.backend().as_ref());
            if !job.is_finished() {
                debug_assert!(false, "handler returned without a terminal outcome");
                warn!(
                    "job {} ({}) handler returned without an outcome",
                    job.id(),
                    job.kind().name()
                );
                job.fail(Error::new(
                    ErrorKind::Failed,
                    "backend returned without completing the job",
                ));
            }
        }
        state.forget(job.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::backend::Capabilities;
    use crate::bus::Envelope;
    use crate::bus::testutil::CollectingSink;
    use crate::job::JobKind;
    use crate::job::ops::PathOp;
    use crate::job::ops::QueryInfoOp;
    use crate::mount::MountRef;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct TestBackend {
        fast_info: bool,
        block_forever: AtomicBool,
    }

    impl Backend for TestBackend {
        fn capabilities(&self) -> Capabilities {
            Capabilities::QUERY_INFO | Capabilities::DELETE
        }

        fn registration(&self) -> Option<MountRef> {
            None
        }

        fn try_query_info(&self, job: &Job, op: &QueryInfoOp) -> TryDispatch {
            if self.fast_info {
                let mut info = crate::info::FileInfo::new();
                info.set_name(op.path());
                op.set_info(info);
                job.succeeded();
                TryDispatch::Handled
            } else {
                TryDispatch::NotHandled
            }
        }

        fn query_info(&self, job: &Job, op: &QueryInfoOp) {
            let mut info = crate::info::FileInfo::new();
            info.set_name(op.path());
            op.set_info(info);
            job.succeeded();
        }

        fn delete(&self, job: &Job, _op: &PathOp) {
            if self.block_forever.load(Ordering::SeqCst) {
                // Poll the token the way a blocking handler would.
                while job.token().check().is_ok() {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            match job.token().check() {
                Ok(()) => job.succeeded(),
                Err(err) => job.fail(err),
            }
        }
    }

    fn submit_one(
        queue: &JobQueue,
        backend: Arc<TestBackend>,
        sink: &Arc<CollectingSink>,
        id: u64,
        kind: JobKind,
    ) -> Arc<Job> {
        let envelope = Envelope::new(id, sink.clone() as Arc<dyn crate::bus::ReplySink>);
        queue.submit(Job::new(id, envelope, backend, kind))
    }

    fn wait_finished(job: &Arc<Job>) {
        for _ in 0..500 {
            if job.is_finished() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("job did not finish");
    }

    #[test]
    fn missing_capability_fails_not_supported() {
        let queue = JobQueue::start(QueueConfig::new().workers(1)).unwrap();
        let sink = Arc::new(CollectingSink::default());
        let backend = Arc::new(TestBackend::default());
        let job = submit_one(
            &queue,
            backend,
            &sink,
            1,
            JobKind::Move(crate::job::ops::MoveOp::new("/a", "/b", Default::default())),
        );
        assert!(job.is_finished());
        let (_, payload) = sink.single();
        assert_eq!(payload[0], 1);
    }

    #[test]
    fn fast_path_completes_on_caller_thread() {
        let queue = JobQueue::start(QueueConfig::new().workers(1)).unwrap();
        let sink = Arc::new(CollectingSink::default());
        let backend = Arc::new(TestBackend {
            fast_info: true,
            ..Default::default()
        });
        let job = submit_one(
            &queue,
            backend,
            &sink,
            2,
            JobKind::QueryInfo(QueryInfoOp::new("/x", "standard::*", Default::default())),
        );
        // Completed synchronously, before any worker could have run.
        assert!(job.is_finished());
        let (_, payload) = sink.single();
        assert_eq!(payload[0], 0);
    }

    #[test]
    fn slow_path_runs_on_worker() {
        let queue = JobQueue::start(QueueConfig::new().workers(2)).unwrap();
        let sink = Arc::new(CollectingSink::default());
        let backend = Arc::new(TestBackend::default());
        let job = submit_one(
            &queue,
            backend,
            &sink,
            3,
            JobKind::QueryInfo(QueryInfoOp::new("/x", "standard::*", Default::default())),
        );
        wait_finished(&job);
        let (_, payload) = sink.single();
        assert_eq!(payload[0], 0);
    }

    #[test]
    fn cancel_trips_running_job() {
        let queue = JobQueue::start(QueueConfig::new().workers(1)).unwrap();
        let sink = Arc::new(CollectingSink::default());
        let backend = Arc::new(TestBackend {
            block_forever: AtomicBool::new(true),
            ..Default::default()
        });
        let job = submit_one(
            &queue,
            backend,
            &sink,
            4,
            JobKind::Delete(PathOp::new("/victim")),
        );
        // Give the worker a moment to pick it up, then cancel.
        thread::sleep(Duration::from_millis(20));
        queue.cancel(4);
        wait_finished(&job);
        let (_, payload) = sink.single();
        let mut r = crate::wire::FrameReader::new(&payload);
        assert_eq!(r.get_u8().unwrap(), 1);
        r.get_string().unwrap();
        assert_eq!(
            r.get_i32().unwrap(),
            i32::from(crate::error::ErrorKind::Cancelled)
        );
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(JobQueue::start(QueueConfig::new().workers(0)).is_err());
    }
}
