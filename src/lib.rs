//! User-space virtual filesystem broker.
//!
//! A long-lived daemon core that exposes a uniform file-operation surface
//! over an IPC bus while delegating each operation to a pluggable backend.
//! Clients address an abstract mount spec; the daemon resolves it to a live
//! backend, marshals the call as a [`Job`], executes it asynchronously on a
//! worker pool, and streams the reply (and, for enumerations, out-of-band
//! file-info batches) back over the bus. The bus library itself, mount-spec
//! parsing and the mount-registry service are external collaborators; only
//! their interfaces appear here.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::backend::Backend;
pub use crate::backend::Capabilities;
pub use crate::backend::TryDispatch;
pub use crate::bus::Bus;
pub use crate::bus::Envelope;
pub use crate::bus::LoopbackBus;
pub use crate::bus::MessageFilter;
pub use crate::bus::ReplySink;
pub use crate::enumerator::EnumeratorSession;
pub use crate::enumerator::Enumerators;
pub use crate::enumerator::FileEnumerator;
pub use crate::enumerator::MEMBER_DONE;
pub use crate::enumerator::MEMBER_GOT_INFO;
pub use crate::enumerator::OBJ_PATH_PREFIX;
pub use crate::error::Error;
pub use crate::error::ErrorKind;
pub use crate::error::Result;
pub use crate::info::AttrValue;
pub use crate::info::FileInfo;
pub use crate::info::FileType;
pub use crate::info::attrs;
pub use crate::info::decode_infos;
pub use crate::info::encode_infos;
pub use crate::job::CancellationToken;
pub use crate::job::ERROR_DOMAIN;
pub use crate::job::Job;
pub use crate::job::JobKind;
pub use crate::job::ops::AttributeInfo;
pub use crate::job::ops::EnumerateOp;
pub use crate::job::ops::MountOp;
pub use crate::job::ops::MoveFlags;
pub use crate::job::ops::MoveOp;
pub use crate::job::ops::OpenForReadOp;
pub use crate::job::ops::OpenForWriteOp;
pub use crate::job::ops::PathOp;
pub use crate::job::ops::QueryAttributesOp;
pub use crate::job::ops::QueryFlags;
pub use crate::job::ops::QueryInfoOp;
pub use crate::job::ops::ReadOp;
pub use crate::job::ops::SeekOp;
pub use crate::job::ops::SeekWhence;
pub use crate::job::ops::SetDisplayNameOp;
pub use crate::job::ops::StreamOp;
pub use crate::job::ops::WriteMode;
pub use crate::job::ops::WriteOp;
pub use crate::local::LocalBackend;
pub use crate::mount::AskPasswordFlags;
pub use crate::mount::MountRef;
pub use crate::mount::MountRegistry;
pub use crate::mount::MountSource;
pub use crate::mount::MountSpec;
pub use crate::mount::PasswordReply;
pub use crate::mount::PasswordSave;
pub use crate::mount::QuestionReply;
pub use crate::queue::JobQueue;
pub use crate::queue::QueueConfig;
pub use crate::sftp::SftpBackend;
pub use crate::wire::FrameError;
pub use crate::wire::FrameReader;
pub use crate::wire::FrameWriter;
pub use crate::wire::MAX_FRAME_SIZE;
pub use crate::wire::read_frame;

mod backend;
mod bus;
mod enumerator;
mod error;
mod info;
mod job;
mod local;
mod mount;
mod queue;
mod sftp;
mod wire;
