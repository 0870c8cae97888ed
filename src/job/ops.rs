//! Typed job variants.
//!
//! Each variant owns its inputs (decoded from the request frame in its
//! constructor), its outputs (set by the backend handler), and its reply
//! serializer. Dispatch pairs the variant tag with the backend's capability
//! table.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::backend::Capabilities;
use crate::backend::TryDispatch;
use crate::bus::Bus;
use crate::enumerator::EnumeratorSession;
use crate::enumerator::Enumerators;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::info::FileInfo;
use crate::job::Job;
use crate::job::encode_error;
use crate::mount::MountRegistry;
use crate::mount::MountSource;
use crate::mount::MountSpec;
use crate::wire::FrameError;
use crate::wire::FrameReader;
use crate::wire::FrameWriter;

bitflags! {
    /// Flags modifying info queries and enumeration.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct QueryFlags: u32 {
        /// Describe symlinks themselves instead of their targets.
        const NOFOLLOW_SYMLINKS = 1 << 0;
    }
}

bitflags! {
    /// Flags modifying move operations.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MoveFlags: u32 {
        /// Replace an existing destination.
        const OVERWRITE = 1 << 0;
        /// Keep a backup of a replaced destination.
        const BACKUP = 1 << 1;
    }
}

/// Where a seek offset is measured from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekWhence {
    /// From the start of the stream.
    Set,
    /// From the current position.
    Cur,
    /// From the end of the stream.
    End,
}

impl SeekWhence {
    /// Decode the wire byte; unknown values are kept raw so the backend can
    /// fail them `NOT_SUPPORTED`.
    pub fn from_raw(raw: u8) -> Option<SeekWhence> {
        match raw {
            0 => Some(SeekWhence::Set),
            1 => Some(SeekWhence::Cur),
            2 => Some(SeekWhence::End),
            _ => None,
        }
    }
}

/// How a file is opened for writing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteMode {
    /// Create a new file; fail `EXISTS` if the target exists.
    Create,
    /// Truncate an existing file or create a new one.
    Replace,
    /// Append to an existing file, creating it when absent.
    Append,
}

/// Mount a backend against a mount spec.
pub struct MountOp {
    spec: MountSpec,
    source: Arc<dyn MountSource>,
    registry: Arc<dyn MountRegistry>,
    is_automount: bool,
}

impl MountOp {
    /// Build from already-parsed parts.
    pub fn new(
        spec: MountSpec,
        source: Arc<dyn MountSource>,
        registry: Arc<dyn MountRegistry>,
        is_automount: bool,
    ) -> MountOp {
        MountOp {
            spec,
            source,
            registry,
            is_automount,
        }
    }

    /// Decode the request frame: mount-spec struct, then an automount byte.
    pub fn decode(
        r: &mut FrameReader<'_>,
        source: Arc<dyn MountSource>,
        registry: Arc<dyn MountRegistry>,
    ) -> std::result::Result<MountOp, FrameError> {
        let spec = MountSpec::decode(r)?;
        let is_automount = r.get_u8()? != 0;
        Ok(MountOp::new(spec, source, registry, is_automount))
    }

    /// The spec being mounted.
    pub fn spec(&self) -> &MountSpec {
        &self.spec
    }

    /// The credential source driving interactive login.
    pub fn source(&self) -> &Arc<dyn MountSource> {
        &self.source
    }

    /// Whether this mount was triggered automatically.
    pub fn is_automount(&self) -> bool {
        self.is_automount
    }

    /// Terminal reply path for mount jobs. On success the backend is first
    /// registered with the mount registry; only then does the requester get
    /// its (empty) reply. Registration failure, like mount failure, removes
    /// the backend from the daemon.
    pub(crate) fn finish_mount(&self, job: &Job, failure: Option<Vec<u8>>) {
        if let Some(frame) = failure {
            job.envelope().reply(frame);
            job.backend().shutdown();
            return;
        }
        match job.backend().registration() {
            None => {
                let error = Error::new(
                    ErrorKind::Failed,
                    "backend did not publish a mount registration",
                );
                job.envelope().reply(encode_error(&error));
                job.backend().shutdown();
            }
            Some(mount) => match self.registry.register(&mount) {
                Ok(()) => {
                    debug!("mount {} registered at {}", mount.spec, mount.object_path);
                    let mut w = FrameWriter::body();
                    w.put_u8(0);
                    job.envelope().reply(w.finish());
                }
                Err(error) => {
                    warn!("mount registration failed: {error}");
                    job.envelope().reply(encode_error(&error));
                    job.backend().shutdown();
                }
            },
        }
    }
}

#[derive(Debug, Default)]
struct OpenOutput {
    handle: u32,
    can_seek: bool,
    initial_offset: u64,
}

/// Open a file for reading.
#[derive(Debug)]
pub struct OpenForReadOp {
    path: String,
    output: Mutex<OpenOutput>,
}

impl OpenForReadOp {
    /// Build from an already-parsed path.
    pub fn new(path: &str) -> OpenForReadOp {
        OpenForReadOp {
            path: path.to_owned(),
            output: Mutex::new(OpenOutput::default()),
        }
    }

    /// Decode the request frame: path string.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<OpenForReadOp, FrameError> {
        Ok(OpenForReadOp::new(r.get_string()?))
    }

    /// The path to open.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record the backend handle for the opened stream.
    pub fn set_handle(&self, handle: u32) {
        self.output.lock().handle = handle;
    }

    /// Record whether the stream supports seeking.
    pub fn set_can_seek(&self, can_seek: bool) {
        self.output.lock().can_seek = can_seek;
    }

    fn encode(&self, w: &mut FrameWriter) {
        let output = self.output.lock();
        w.put_u32(output.handle).put_u8(u8::from(output.can_seek));
    }
}

/// Open a file for writing in one of the three write modes.
#[derive(Debug)]
pub struct OpenForWriteOp {
    path: String,
    mode: WriteMode,
    output: Mutex<OpenOutput>,
}

impl OpenForWriteOp {
    /// Build from already-parsed parts.
    pub fn new(path: &str, mode: WriteMode) -> OpenForWriteOp {
        OpenForWriteOp {
            path: path.to_owned(),
            mode,
            output: Mutex::new(OpenOutput::default()),
        }
    }

    /// Decode the request frame: path string, then a mode byte.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<OpenForWriteOp, FrameError> {
        let path = r.get_string()?.to_owned();
        let mode = match r.get_u8()? {
            0 => WriteMode::Create,
            1 => WriteMode::Replace,
            2 => WriteMode::Append,
            tag => return Err(FrameError::BadTag(tag)),
        };
        Ok(OpenForWriteOp {
            path,
            mode,
            output: Mutex::new(OpenOutput::default()),
        })
    }

    /// The path to open.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The requested write mode.
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Record the backend handle for the opened stream.
    pub fn set_handle(&self, handle: u32) {
        self.output.lock().handle = handle;
    }

    /// Record whether the stream supports seeking.
    pub fn set_can_seek(&self, can_seek: bool) {
        self.output.lock().can_seek = can_seek;
    }

    /// Record the stream's starting position (append opens).
    pub fn set_initial_offset(&self, offset: u64) {
        self.output.lock().initial_offset = offset;
    }

    fn encode(&self, w: &mut FrameWriter) {
        let output = self.output.lock();
        w.put_u32(output.handle)
            .put_u8(u8::from(output.can_seek))
            .put_u64(output.initial_offset);
    }
}

/// Read up to a byte count from an open stream.
#[derive(Debug)]
pub struct ReadOp {
    handle: u32,
    count: u32,
    data: Mutex<Vec<u8>>,
}

impl ReadOp {
    /// Build from already-parsed parts.
    pub fn new(handle: u32, count: u32) -> ReadOp {
        ReadOp {
            handle,
            count,
            data: Mutex::new(Vec::new()),
        }
    }

    /// Decode the request frame: handle, then byte count.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<ReadOp, FrameError> {
        Ok(ReadOp::new(r.get_u32()?, r.get_u32()?))
    }

    /// The stream handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The requested byte count; the result may be shorter.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Record the bytes read.
    pub fn set_data(&self, data: Vec<u8>) {
        debug_assert!(data.len() <= self.count as usize);
        *self.data.lock() = data;
    }

    fn encode(&self, w: &mut FrameWriter) {
        w.put_bytes(&self.data.lock());
    }
}

/// Reposition an open stream.
#[derive(Debug)]
pub struct SeekOp {
    handle: u32,
    offset: i64,
    whence_raw: u8,
    new_offset: AtomicU64,
}

impl SeekOp {
    /// Build from already-parsed parts.
    pub fn new(handle: u32, offset: i64, whence: SeekWhence) -> SeekOp {
        let whence_raw = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => 1,
            SeekWhence::End => 2,
        };
        SeekOp {
            handle,
            offset,
            whence_raw,
            new_offset: AtomicU64::new(0),
        }
    }

    /// Decode the request frame: handle, offset, whence byte. An unknown
    /// whence is preserved so the backend can reject it.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<SeekOp, FrameError> {
        Ok(SeekOp {
            handle: r.get_u32()?,
            offset: r.get_i64()?,
            whence_raw: r.get_u8()?,
            new_offset: AtomicU64::new(0),
        })
    }

    /// The stream handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The seek offset relative to [`SeekOp::whence`].
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The decoded whence, or `None` for an unsupported value.
    pub fn whence(&self) -> Option<SeekWhence> {
        SeekWhence::from_raw(self.whence_raw)
    }

    /// Record the resulting absolute position.
    pub fn set_new_offset(&self, offset: u64) {
        self.new_offset.store(offset, Ordering::SeqCst);
    }

    fn encode(&self, w: &mut FrameWriter) {
        w.put_u64(self.new_offset.load(Ordering::SeqCst));
    }
}

/// Close an open stream. Also used for any handle-only operation.
#[derive(Debug)]
pub struct StreamOp {
    handle: u32,
}

impl StreamOp {
    /// Build from an already-parsed handle.
    pub fn new(handle: u32) -> StreamOp {
        StreamOp { handle }
    }

    /// Decode the request frame: handle.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<StreamOp, FrameError> {
        Ok(StreamOp::new(r.get_u32()?))
    }

    /// The stream handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }
}

/// Write a buffer to an open stream.
#[derive(Debug)]
pub struct WriteOp {
    handle: u32,
    data: Vec<u8>,
    written: AtomicU64,
}

impl WriteOp {
    /// Build from already-parsed parts.
    pub fn new(handle: u32, data: Vec<u8>) -> WriteOp {
        WriteOp {
            handle,
            data,
            written: AtomicU64::new(0),
        }
    }

    /// Decode the request frame: handle, then the data field.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<WriteOp, FrameError> {
        let handle = r.get_u32()?;
        let data = r.get_bytes()?.to_vec();
        Ok(WriteOp::new(handle, data))
    }

    /// The stream handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The bytes to write.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Record how many bytes were written.
    pub fn set_written(&self, written: u64) {
        self.written.store(written, Ordering::SeqCst);
    }

    fn encode(&self, w: &mut FrameWriter) {
        w.put_u64(self.written.load(Ordering::SeqCst));
    }
}

/// Enumerate a directory, streaming file infos through an enumerator
/// session.
pub struct EnumerateOp {
    path: String,
    attributes: String,
    flags: QueryFlags,
    enumerators: Arc<Enumerators>,
    bus: Arc<dyn Bus>,
    object_path: Mutex<Option<String>>,
}

impl EnumerateOp {
    /// Build from already-parsed parts.
    pub fn new(
        path: &str,
        attributes: &str,
        flags: QueryFlags,
        enumerators: Arc<Enumerators>,
        bus: Arc<dyn Bus>,
    ) -> EnumerateOp {
        EnumerateOp {
            path: path.to_owned(),
            attributes: attributes.to_owned(),
            flags,
            enumerators,
            bus,
            object_path: Mutex::new(None),
        }
    }

    /// Decode the request frame: path, attribute list, flags.
    pub fn decode(
        r: &mut FrameReader<'_>,
        enumerators: Arc<Enumerators>,
        bus: Arc<dyn Bus>,
    ) -> std::result::Result<EnumerateOp, FrameError> {
        let path = r.get_string()?.to_owned();
        let attributes = r.get_string()?.to_owned();
        let flags = QueryFlags::from_bits_truncate(r.get_u32()?);
        Ok(EnumerateOp {
            path,
            attributes,
            flags,
            enumerators,
            bus,
            object_path: Mutex::new(None),
        })
    }

    /// The directory to enumerate.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The requested attribute list.
    pub fn attributes(&self) -> &str {
        &self.attributes
    }

    /// Query flags.
    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    /// Open the enumerator session for this job and record its object path
    /// as the reply output.
    pub fn open_session(&self) -> Arc<EnumeratorSession> {
        let session = self.enumerators.open(self.bus.clone());
        *self.object_path.lock() = Some(session.object_path().to_owned());
        session
    }

    fn encode(&self, w: &mut FrameWriter) {
        let path = self.object_path.lock();
        debug_assert!(path.is_some(), "enumerate succeeded without a session");
        w.put_string(path.as_deref().unwrap_or(""));
    }
}

/// Query info about one file.
#[derive(Debug)]
pub struct QueryInfoOp {
    path: String,
    attributes: String,
    flags: QueryFlags,
    info: Mutex<Option<FileInfo>>,
}

impl QueryInfoOp {
    /// Build from already-parsed parts.
    pub fn new(path: &str, attributes: &str, flags: QueryFlags) -> QueryInfoOp {
        QueryInfoOp {
            path: path.to_owned(),
            attributes: attributes.to_owned(),
            flags,
            info: Mutex::new(None),
        }
    }

    /// Decode the request frame: path, attribute list, flags.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<QueryInfoOp, FrameError> {
        let path = r.get_string()?.to_owned();
        let attributes = r.get_string()?.to_owned();
        let flags = QueryFlags::from_bits_truncate(r.get_u32()?);
        Ok(QueryInfoOp::new(&path, &attributes, flags))
    }

    /// The path to describe.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The requested attribute list.
    pub fn attributes(&self) -> &str {
        &self.attributes
    }

    /// Query flags.
    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    /// Record the resulting info.
    pub fn set_info(&self, info: FileInfo) {
        *self.info.lock() = Some(info);
    }

    fn encode(&self, w: &mut FrameWriter) {
        let info = self.info.lock();
        debug_assert!(info.is_some(), "query-info succeeded without an info");
        info.as_ref().unwrap_or(&FileInfo::new()).encode(w);
    }
}

/// One entry of a query-attributes reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeInfo {
    /// Qualified attribute name.
    pub name: String,
    /// Wire tag of the value type the attribute takes.
    pub value_tag: u8,
}

/// Query the attributes a backend can set (or the writable namespaces).
#[derive(Debug)]
pub struct QueryAttributesOp {
    path: String,
    namespaces: bool,
    list: Mutex<Vec<AttributeInfo>>,
}

impl QueryAttributesOp {
    /// Build from already-parsed parts. `namespaces` selects writable
    /// namespaces over settable attributes.
    pub fn new(path: &str, namespaces: bool) -> QueryAttributesOp {
        QueryAttributesOp {
            path: path.to_owned(),
            namespaces,
            list: Mutex::new(Vec::new()),
        }
    }

    /// Decode the request frame: path, then a namespaces byte.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<QueryAttributesOp, FrameError> {
        let path = r.get_string()?.to_owned();
        let namespaces = r.get_u8()? != 0;
        Ok(QueryAttributesOp::new(&path, namespaces))
    }

    /// The path queried.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when writable namespaces are queried instead of settable
    /// attributes.
    pub fn namespaces(&self) -> bool {
        self.namespaces
    }

    /// Record the attribute info list.
    pub fn set_list(&self, list: Vec<AttributeInfo>) {
        *self.list.lock() = list;
    }

    fn encode(&self, w: &mut FrameWriter) {
        let list = self.list.lock();
        w.put_u32(list.len() as u32);
        for entry in list.iter() {
            w.put_string(&entry.name).put_u8(entry.value_tag);
        }
    }
}

/// Rename a file in place (change its display name).
#[derive(Debug)]
pub struct SetDisplayNameOp {
    path: String,
    display_name: String,
    new_path: Mutex<Option<String>>,
}

impl SetDisplayNameOp {
    /// Build from already-parsed parts.
    pub fn new(path: &str, display_name: &str) -> SetDisplayNameOp {
        SetDisplayNameOp {
            path: path.to_owned(),
            display_name: display_name.to_owned(),
            new_path: Mutex::new(None),
        }
    }

    /// Decode the request frame: path, then the new display name.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<SetDisplayNameOp, FrameError> {
        let path = r.get_string()?.to_owned();
        let display_name = r.get_string()?.to_owned();
        Ok(SetDisplayNameOp::new(&path, &display_name))
    }

    /// The file being renamed.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The requested display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Record the path the file lives at after the rename.
    pub fn set_new_path(&self, new_path: &str) {
        *self.new_path.lock() = Some(new_path.to_owned());
    }

    fn encode(&self, w: &mut FrameWriter) {
        let new_path = self.new_path.lock();
        debug_assert!(new_path.is_some(), "rename succeeded without a new path");
        w.put_string(new_path.as_deref().unwrap_or(""));
    }
}

/// A path-only operation (make-directory, delete).
#[derive(Debug)]
pub struct PathOp {
    path: String,
}

impl PathOp {
    /// Build from an already-parsed path.
    pub fn new(path: &str) -> PathOp {
        PathOp {
            path: path.to_owned(),
        }
    }

    /// Decode the request frame: path string.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<PathOp, FrameError> {
        Ok(PathOp::new(r.get_string()?))
    }

    /// The target path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Move or rename within the mount.
#[derive(Debug)]
pub struct MoveOp {
    source: String,
    destination: String,
    flags: MoveFlags,
}

impl MoveOp {
    /// Build from already-parsed parts.
    pub fn new(source: &str, destination: &str, flags: MoveFlags) -> MoveOp {
        MoveOp {
            source: source.to_owned(),
            destination: destination.to_owned(),
            flags,
        }
    }

    /// Decode the request frame: source, destination, flags.
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<MoveOp, FrameError> {
        let source = r.get_string()?.to_owned();
        let destination = r.get_string()?.to_owned();
        let flags = MoveFlags::from_bits_truncate(r.get_u32()?);
        Ok(MoveOp::new(&source, &destination, flags))
    }

    /// The path being moved.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The destination path.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Move flags.
    pub fn flags(&self) -> MoveFlags {
        self.flags
    }
}

/// The tagged set of job variants.
pub enum JobKind {
    /// Mount the backend's target.
    Mount(MountOp),
    /// Open a file for reading.
    OpenForRead(OpenForReadOp),
    /// Read from a stream.
    Read(ReadOp),
    /// Seek a read stream.
    SeekOnRead(SeekOp),
    /// Close a read stream.
    CloseRead(StreamOp),
    /// Open a file for writing.
    OpenForWrite(OpenForWriteOp),
    /// Write to a stream.
    Write(WriteOp),
    /// Seek a write stream.
    SeekOnWrite(SeekOp),
    /// Close a write stream.
    CloseWrite(StreamOp),
    /// Enumerate a directory.
    Enumerate(EnumerateOp),
    /// Query file info.
    QueryInfo(QueryInfoOp),
    /// Query settable attributes or writable namespaces.
    QueryAttributes(QueryAttributesOp),
    /// Rename in place.
    SetDisplayName(SetDisplayNameOp),
    /// Create a directory.
    MakeDirectory(PathOp),
    /// Delete a file or directory.
    Delete(PathOp),
    /// Move or rename.
    Move(MoveOp),
}

impl JobKind {
    /// Operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Mount(_) => "mount",
            JobKind::OpenForRead(_) => "open-for-read",
            JobKind::Read(_) => "read",
            JobKind::SeekOnRead(_) => "seek-on-read",
            JobKind::CloseRead(_) => "close-read",
            JobKind::OpenForWrite(_) => "open-for-write",
            JobKind::Write(_) => "write",
            JobKind::SeekOnWrite(_) => "seek-on-write",
            JobKind::CloseWrite(_) => "close-write",
            JobKind::Enumerate(_) => "enumerate",
            JobKind::QueryInfo(_) => "query-info",
            JobKind::QueryAttributes(_) => "query-attributes",
            JobKind::SetDisplayName(_) => "set-display-name",
            JobKind::MakeDirectory(_) => "make-directory",
            JobKind::Delete(_) => "delete",
            JobKind::Move(_) => "move",
        }
    }

    /// The capability bit a backend must advertise to receive this job.
    pub fn capability(&self) -> Capabilities {
        match self {
            JobKind::Mount(_) => Capabilities::MOUNT,
            JobKind::OpenForRead(_) => Capabilities::OPEN_FOR_READ,
            JobKind::Read(_) => Capabilities::READ,
            JobKind::SeekOnRead(_) => Capabilities::SEEK_ON_READ,
            JobKind::CloseRead(_) => Capabilities::CLOSE_READ,
            JobKind::OpenForWrite(_) => Capabilities::OPEN_FOR_WRITE,
            JobKind::Write(_) => Capabilities::WRITE,
            JobKind::SeekOnWrite(_) => Capabilities::SEEK_ON_WRITE,
            JobKind::CloseWrite(_) => Capabilities::CLOSE_WRITE,
            JobKind::Enumerate(_) => Capabilities::ENUMERATE,
            JobKind::QueryInfo(_) => Capabilities::QUERY_INFO,
            JobKind::QueryAttributes(_) => Capabilities::QUERY_ATTRIBUTES,
            JobKind::SetDisplayName(_) => Capabilities::SET_DISPLAY_NAME,
            JobKind::MakeDirectory(_) => Capabilities::MAKE_DIRECTORY,
            JobKind::Delete(_) => Capabilities::DELETE,
            JobKind::Move(_) => Capabilities::MOVE,
        }
    }

    /// Offer the job to the backend's fast path.
    pub(crate) fn try_dispatch(&self, job: &Job, backend: &dyn Backend) -> TryDispatch {
        match self {
            JobKind::Mount(op) => backend.try_mount(job, op),
            JobKind::OpenForRead(op) => backend.try_open_for_read(job, op),
            JobKind::Read(op) => backend.try_read(job, op),
            JobKind::SeekOnRead(op) => backend.try_seek_on_read(job, op),
            JobKind::CloseRead(op) => backend.try_close_read(job, op),
            JobKind::OpenForWrite(op) => backend.try_open_for_write(job, op),
            JobKind::Write(op) => backend.try_write(job, op),
            JobKind::SeekOnWrite(op) => backend.try_seek_on_write(job, op),
            JobKind::CloseWrite(op) => backend.try_close_write(job, op),
            JobKind::Enumerate(op) => backend.try_enumerate(job, op),
            JobKind::QueryInfo(op) => backend.try_query_info(job, op),
            JobKind::QueryAttributes(op) => backend.try_query_attributes(job, op),
            JobKind::SetDisplayName(op) => backend.try_set_display_name(job, op),
            JobKind::MakeDirectory(op) => backend.try_make_directory(job, op),
            JobKind::Delete(op) => backend.try_delete(job, op),
            JobKind::Move(op) => backend.try_move(job, op),
        }
    }

    /// Run the blocking handler on the current (worker) thread.
    pub(crate) fn run(&self, job: &Job, backend: &dyn Backend) {
        match self {
            JobKind::Mount(op) => backend.mount(job, op),
            JobKind::OpenForRead(op) => backend.open_for_read(job, op),
            JobKind::Read(op) => backend.read(job, op),
            JobKind::SeekOnRead(op) => backend.seek_on_read(job, op),
            JobKind::CloseRead(op) => backend.close_read(job, op),
            JobKind::OpenForWrite(op) => backend.open_for_write(job, op),
            JobKind::Write(op) => backend.write(job, op),
            JobKind::SeekOnWrite(op) => backend.seek_on_write(job, op),
            JobKind::CloseWrite(op) => backend.close_write(job, op),
            JobKind::Enumerate(op) => backend.enumerate(job, op),
            JobKind::QueryInfo(op) => backend.query_info(job, op),
            JobKind::QueryAttributes(op) => backend.query_attributes(job, op),
            JobKind::SetDisplayName(op) => backend.set_display_name(job, op),
            JobKind::MakeDirectory(op) => backend.make_directory(job, op),
            JobKind::Delete(op) => backend.delete(job, op),
            JobKind::Move(op) => backend.do_move(job, op),
        }
    }

    /// Serialize the variant's outputs into a success reply.
    pub(crate) fn encode_success(&self, w: &mut FrameWriter) {
        match self {
            // Mount replies flow through registration, not through here.
            JobKind::Mount(_) => {}
            JobKind::OpenForRead(op) => op.encode(w),
            JobKind::Read(op) => op.encode(w),
            JobKind::SeekOnRead(op) | JobKind::SeekOnWrite(op) => op.encode(w),
            JobKind::CloseRead(_) | JobKind::CloseWrite(_) => {}
            JobKind::OpenForWrite(op) => op.encode(w),
            JobKind::Write(op) => op.encode(w),
            JobKind::Enumerate(op) => op.encode(w),
            JobKind::QueryInfo(op) => op.encode(w),
            JobKind::QueryAttributes(op) => op.encode(w),
            JobKind::SetDisplayName(op) => op.encode(w),
            JobKind::MakeDirectory(_) | JobKind::Delete(_) | JobKind::Move(_) => {}
        }
    }
}

impl fmt::Debug for MountOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOp")
            .field("spec", &self.spec)
            .field("is_automount", &self.is_automount)
            .finish()
    }
}

impl fmt::Debug for EnumerateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumerateOp")
            .field("path", &self.path)
            .field("attributes", &self.attributes)
            .field("flags", &self.flags)
            .finish()
    }
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Envelope;
    use crate::bus::ReplySink;
    use crate::bus::testutil::CollectingSink;
    use crate::error::Result;
    use crate::mount::AskPasswordFlags;
    use crate::mount::MountRef;
    use crate::mount::PasswordReply;
    use crate::mount::QuestionReply;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering as AtomicOrdering;

    /// Registry double that refuses every mount.
    #[derive(Debug)]
    struct FailingRegistry;

    impl MountRegistry for FailingRegistry {
        fn register(&self, _mount: &MountRef) -> Result<()> {
            Err(Error::new(
                ErrorKind::PermissionDenied,
                "registry refused the mount",
            ))
        }

        fn unregister(&self, _object_path: &str) {}
    }

    /// Credential source that never answers anything.
    struct NoPrompts;

    impl MountSource for NoPrompts {
        fn ask_password(
            &self,
            _prompt: &str,
            _default_user: &str,
            _flags: AskPasswordFlags,
        ) -> PasswordReply {
            PasswordReply {
                cancelled: true,
                ..Default::default()
            }
        }

        fn ask_question(&self, _prompt: &str) -> QuestionReply {
            QuestionReply {
                cancelled: true,
                answer: false,
            }
        }
    }

    /// Backend double that records whether it was torn down.
    #[derive(Debug, Default)]
    struct TrackingBackend {
        shut_down: AtomicBool,
    }

    impl Backend for TrackingBackend {
        fn capabilities(&self) -> Capabilities {
            Capabilities::MOUNT
        }

        fn registration(&self) -> Option<MountRef> {
            Some(MountRef {
                peer_id: ":1.5".to_owned(),
                object_path: "/org/vfsd/mount/test".to_owned(),
                spec: MountSpec::new("test"),
                filename_encoding: None,
            })
        }

        fn shutdown(&self) {
            self.shut_down.store(true, AtomicOrdering::SeqCst);
        }
    }

    fn mount_job(
        registry: Arc<dyn MountRegistry>,
        backend: Arc<TrackingBackend>,
        sink: &Arc<CollectingSink>,
    ) -> Job {
        let op = MountOp::new(MountSpec::new("test"), Arc::new(NoPrompts), registry, false);
        let envelope = Envelope::new(1, sink.clone() as Arc<dyn ReplySink>);
        Job::new(1, envelope, backend, JobKind::Mount(op))
    }

    #[test]
    fn registration_failure_tears_backend_down() {
        let sink = Arc::new(CollectingSink::default());
        let backend = Arc::new(TrackingBackend::default());
        let job = mount_job(Arc::new(FailingRegistry), backend.clone(), &sink);

        // The mount handler finished; the reply path performs registration.
        job.succeeded();

        assert!(backend.shut_down.load(AtomicOrdering::SeqCst));
        let (_, payload) = sink.single();
        let mut r = FrameReader::new(&payload);
        assert_eq!(r.get_u8().unwrap(), 1);
        r.get_string().unwrap();
        assert_eq!(
            r.get_i32().unwrap(),
            i32::from(ErrorKind::PermissionDenied)
        );
        assert_eq!(r.get_string().unwrap(), "registry refused the mount");
    }

    #[test]
    fn mount_failure_tears_backend_down() {
        let sink = Arc::new(CollectingSink::default());
        let backend = Arc::new(TrackingBackend::default());
        let job = mount_job(Arc::new(FailingRegistry), backend.clone(), &sink);

        job.fail(Error::new(ErrorKind::TimedOut, "Timed out when logging in"));

        // The failed backend is removed without touching the registry.
        assert!(backend.shut_down.load(AtomicOrdering::SeqCst));
        let (_, payload) = sink.single();
        let mut r = FrameReader::new(&payload);
        assert_eq!(r.get_u8().unwrap(), 1);
        r.get_string().unwrap();
        assert_eq!(r.get_i32().unwrap(), i32::from(ErrorKind::TimedOut));
    }

    #[test]
    fn open_for_read_decode() {
        let mut w = FrameWriter::body();
        w.put_string("/etc/hosts");
        let body = w.finish();
        let op = OpenForReadOp::decode(&mut FrameReader::new(&body)).unwrap();
        assert_eq!(op.path(), "/etc/hosts");
    }

    #[test]
    fn seek_keeps_unknown_whence() {
        let mut w = FrameWriter::body();
        w.put_u32(3).put_i64(-16).put_u8(9);
        let body = w.finish();
        let op = SeekOp::decode(&mut FrameReader::new(&body)).unwrap();
        assert_eq!(op.handle(), 3);
        assert_eq!(op.offset(), -16);
        assert_eq!(op.whence(), None);
    }

    #[test]
    fn open_for_write_rejects_unknown_mode() {
        let mut w = FrameWriter::body();
        w.put_string("/tmp/x").put_u8(9);
        let body = w.finish();
        assert!(matches!(
            OpenForWriteOp::decode(&mut FrameReader::new(&body)),
            Err(FrameError::BadTag(9))
        ));
    }

    #[test]
    fn read_reply_carries_data() {
        let op = ReadOp::new(1, 16);
        op.set_data(b"abc".to_vec());
        let mut w = FrameWriter::body();
        op.encode(&mut w);
        let body = w.finish();
        let mut r = FrameReader::new(&body);
        assert_eq!(r.get_bytes().unwrap(), b"abc");
    }
}
