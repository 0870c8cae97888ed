//! Backend interface.
//!
//! A backend implements file operations against one transport or storage
//! target. It advertises the operations it supports through a capability
//! table; for each advertised operation it provides a synchronous fast path
//! (`try_*`, called on the dispatcher thread, must not block), a blocking
//! handler (`do_*`, called on a worker thread), or both. Operations that are
//! not advertised fail `NOT_SUPPORTED` before reaching the backend.
//!
//! Handlers signal completion by driving the job to its terminal outcome
//! (`job.succeeded()` / `job.fail(..)`), usually synchronously from `try_*`
//! or before returning from `do_*`.

use std::fmt::Debug;

use bitflags::bitflags;

use crate::error::Error;
use crate::job::Job;
use crate::job::ops::EnumerateOp;
use crate::job::ops::MountOp;
use crate::job::ops::MoveOp;
use crate::job::ops::OpenForReadOp;
use crate::job::ops::OpenForWriteOp;
use crate::job::ops::PathOp;
use crate::job::ops::QueryAttributesOp;
use crate::job::ops::QueryInfoOp;
use crate::job::ops::ReadOp;
use crate::job::ops::SeekOp;
use crate::job::ops::SetDisplayNameOp;
use crate::job::ops::StreamOp;
use crate::job::ops::WriteOp;
use crate::mount::MountRef;

bitflags! {
    /// Operations a backend advertises.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Capabilities: u32 {
        /// Mounting the backend's target.
        const MOUNT = 1 << 0;
        /// Opening a file for reading.
        const OPEN_FOR_READ = 1 << 1;
        /// Reading from an open read stream.
        const READ = 1 << 2;
        /// Seeking an open read stream.
        const SEEK_ON_READ = 1 << 3;
        /// Closing a read stream.
        const CLOSE_READ = 1 << 4;
        /// Opening a file for writing (create, replace or append).
        const OPEN_FOR_WRITE = 1 << 5;
        /// Writing to an open write stream.
        const WRITE = 1 << 6;
        /// Seeking an open write stream.
        const SEEK_ON_WRITE = 1 << 7;
        /// Closing a write stream.
        const CLOSE_WRITE = 1 << 8;
        /// Enumerating a directory.
        const ENUMERATE = 1 << 9;
        /// Querying file info.
        const QUERY_INFO = 1 << 10;
        /// Querying settable attributes / writable namespaces.
        const QUERY_ATTRIBUTES = 1 << 11;
        /// Renaming a file in place.
        const SET_DISPLAY_NAME = 1 << 15;
        /// Creating a directory.
        const MAKE_DIRECTORY = 1 << 12;
        /// Deleting a file or directory.
        const DELETE = 1 << 13;
        /// Moving / renaming within the mount.
        const MOVE = 1 << 14;
    }
}

/// Result of a fast-path attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TryDispatch {
    /// The backend set the job's outcome; no worker dispatch follows.
    Handled,
    /// The slow path should run on a worker thread.
    NotHandled,
}

fn unsupported(job: &Job) {
    job.fail(Error::not_supported());
}

/// The backend capability table.
///
/// Every `try_*` default declines; every `do_*` default fails the job
/// `NOT_SUPPORTED`. A backend implements the pair it wants for each
/// operation it advertises in [`Backend::capabilities`]; advertising an
/// operation while overriding neither slot is a bug that surfaces as
/// `NOT_SUPPORTED` at run time.
#[allow(unused_variables)]
pub trait Backend: Send + Sync + Debug {
    /// The operations this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// The registration this backend publishes once mounted, if any yet.
    fn registration(&self) -> Option<MountRef>;

    /// Tear down the backend: cancel in-flight work and release transport
    /// resources. Called on backend-fatal errors and on unmount.
    fn shutdown(&self) {}

    /// Fast path for mount.
    fn try_mount(&self, job: &Job, op: &MountOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking mount handler.
    fn mount(&self, job: &Job, op: &MountOp) {
        unsupported(job);
    }

    /// Fast path for open-for-read.
    fn try_open_for_read(&self, job: &Job, op: &OpenForReadOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking open-for-read handler.
    fn open_for_read(&self, job: &Job, op: &OpenForReadOp) {
        unsupported(job);
    }

    /// Fast path for read.
    fn try_read(&self, job: &Job, op: &ReadOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking read handler.
    fn read(&self, job: &Job, op: &ReadOp) {
        unsupported(job);
    }

    /// Fast path for seek on a read stream.
    fn try_seek_on_read(&self, job: &Job, op: &SeekOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking seek handler for a read stream.
    fn seek_on_read(&self, job: &Job, op: &SeekOp) {
        unsupported(job);
    }

    /// Fast path for closing a read stream.
    fn try_close_read(&self, job: &Job, op: &StreamOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking close handler for a read stream.
    fn close_read(&self, job: &Job, op: &StreamOp) {
        unsupported(job);
    }

    /// Fast path for open-for-write.
    fn try_open_for_write(&self, job: &Job, op: &OpenForWriteOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking open-for-write handler.
    fn open_for_write(&self, job: &Job, op: &OpenForWriteOp) {
        unsupported(job);
    }

    /// Fast path for write.
    fn try_write(&self, job: &Job, op: &WriteOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking write handler.
    fn write(&self, job: &Job, op: &WriteOp) {
        unsupported(job);
    }

    /// Fast path for seek on a write stream.
    fn try_seek_on_write(&self, job: &Job, op: &SeekOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking seek handler for a write stream.
    fn seek_on_write(&self, job: &Job, op: &SeekOp) {
        unsupported(job);
    }

    /// Fast path for closing a write stream.
    fn try_close_write(&self, job: &Job, op: &StreamOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking close handler for a write stream.
    fn close_write(&self, job: &Job, op: &StreamOp) {
        unsupported(job);
    }

    /// Fast path for enumerate.
    fn try_enumerate(&self, job: &Job, op: &EnumerateOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking enumerate handler.
    fn enumerate(&self, job: &Job, op: &EnumerateOp) {
        unsupported(job);
    }

    /// Fast path for query-info.
    fn try_query_info(&self, job: &Job, op: &QueryInfoOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking query-info handler.
    fn query_info(&self, job: &Job, op: &QueryInfoOp) {
        unsupported(job);
    }

    /// Fast path for query-attributes.
    fn try_query_attributes(&self, job: &Job, op: &QueryAttributesOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking query-attributes handler.
    fn query_attributes(&self, job: &Job, op: &QueryAttributesOp) {
        unsupported(job);
    }

    /// Fast path for set-display-name.
    fn try_set_display_name(&self, job: &Job, op: &SetDisplayNameOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking set-display-name handler.
    fn set_display_name(&self, job: &Job, op: &SetDisplayNameOp) {
        unsupported(job);
    }

    /// Fast path for make-directory.
    fn try_make_directory(&self, job: &Job, op: &PathOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking make-directory handler.
    fn make_directory(&self, job: &Job, op: &PathOp) {
        unsupported(job);
    }

    /// Fast path for delete.
    fn try_delete(&self, job: &Job, op: &PathOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking delete handler.
    fn delete(&self, job: &Job, op: &PathOp) {
        unsupported(job);
    }

    /// Fast path for move.
    fn try_move(&self, job: &Job, op: &MoveOp) -> TryDispatch {
        TryDispatch::NotHandled
    }
    /// Blocking move handler.
    fn do_move(&self, job: &Job, op: &MoveOp) {
        unsupported(job);
    }
}
