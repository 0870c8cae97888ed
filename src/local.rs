//! Local filesystem backend.
//!
//! The reference backend: every operation maps directly onto an OS file
//! primitive, errors surface through errno mapped into the unified
//! taxonomy, and `EINTR` is retried locally. Cheap calls (attribute
//! queries, seek, close) run on the fast path; open, bulk transfer and
//! enumeration go to the worker pool.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::backend::Capabilities;
use crate::backend::TryDispatch;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::info::AttrValue;
use crate::info::FileInfo;
use crate::info::FileType;
use crate::info::attrs;
use crate::job::CancellationToken;
use crate::job::Job;
use crate::job::ops::AttributeInfo;
use crate::job::ops::EnumerateOp;
use crate::job::ops::MountOp;
use crate::job::ops::MoveFlags;
use crate::job::ops::MoveOp;
use crate::job::ops::OpenForReadOp;
use crate::job::ops::OpenForWriteOp;
use crate::job::ops::PathOp;
use crate::job::ops::QueryAttributesOp;
use crate::job::ops::QueryFlags;
use crate::job::ops::QueryInfoOp;
use crate::job::ops::ReadOp;
use crate::job::ops::SeekOp;
use crate::job::ops::SeekWhence;
use crate::job::ops::SetDisplayNameOp;
use crate::job::ops::StreamOp;
use crate::job::ops::WriteMode;
use crate::job::ops::WriteOp;
use crate::mount::MountRef;
use crate::mount::MountSpec;

/// Backend serving the local filesystem.
#[derive(Debug)]
pub struct LocalBackend {
    peer_id: String,
    object_path: String,
    registration: Mutex<Option<MountRef>>,
    handles: Mutex<HashMap<u32, RawFd>>,
    next_handle: AtomicU32,
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn to_cstring(path: &str) -> Result<CString> {
    CString::new(path)
        .map_err(|_| Error::new(ErrorKind::InvalidArgument, "path contains a NUL byte"))
}

impl LocalBackend {
    /// Create a backend serving jobs at the given bus address.
    pub fn new(peer_id: &str, object_path: &str) -> LocalBackend {
        LocalBackend {
            peer_id: peer_id.to_owned(),
            object_path: object_path.to_owned(),
            registration: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    fn insert_handle(&self, fd: RawFd) -> u32 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(handle, fd);
        handle
    }

    #[cfg(test)]
    pub(crate) fn insert_handle_for_test(&self, fd: RawFd) -> u32 {
        self.insert_handle(fd)
    }

    fn lookup(&self, handle: u32) -> Result<RawFd> {
        self.handles
            .lock()
            .get(&handle)
            .copied()
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "Unknown stream handle"))
    }

    fn remove_handle(&self, handle: u32) -> Result<RawFd> {
        self.handles
            .lock()
            .remove(&handle)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "Unknown stream handle"))
    }

    fn open_fd(&self, path: &str, flags: libc::c_int, mode: libc::mode_t) -> Result<RawFd> {
        let cpath = to_cstring(path)?;
        loop {
            let fd = unsafe { libc::open(cpath.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
            if fd >= 0 {
                return Ok(fd);
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::from_errno(errno, "Error opening file"));
        }
    }

    fn fd_can_seek(fd: RawFd) -> bool {
        unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) != -1 }
    }

    fn do_read(&self, token: &CancellationToken, fd: RawFd, count: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; count];
        loop {
            token.check()?;
            let res = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), count) };
            if res >= 0 {
                buffer.truncate(res as usize);
                return Ok(buffer);
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::from_errno(errno, "Error reading from file"));
        }
    }

    fn do_write(&self, token: &CancellationToken, fd: RawFd, data: &[u8]) -> Result<u64> {
        loop {
            token.check()?;
            let res = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
            if res >= 0 {
                return Ok(res as u64);
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(Error::from_errno(errno, "Error writing to file"));
        }
    }

    fn do_seek(&self, op: &SeekOp) -> Result<u64> {
        let whence = match op.whence() {
            Some(SeekWhence::Set) => libc::SEEK_SET,
            Some(SeekWhence::Cur) => libc::SEEK_CUR,
            Some(SeekWhence::End) => libc::SEEK_END,
            None => {
                return Err(Error::new(ErrorKind::NotSupported, "Unsupported seek type"));
            }
        };
        let fd = self.lookup(op.handle())?;
        let res = unsafe { libc::lseek(fd, op.offset(), whence) };
        if res == -1 {
            return Err(Error::from_errno(last_errno(), "Error seeking in file"));
        }
        Ok(res as u64)
    }

    fn do_close(&self, op: &StreamOp) -> Result<()> {
        let fd = self.remove_handle(op.handle())?;
        // No retry here: after EINTR the fd state is unspecified.
        let res = unsafe { libc::close(fd) };
        if res == -1 {
            return Err(Error::from_errno(last_errno(), "Error closing file"));
        }
        Ok(())
    }

    fn stat_info(path: &Path, name: &str, flags: QueryFlags) -> Result<FileInfo> {
        let stat = if flags.contains(QueryFlags::NOFOLLOW_SYMLINKS) {
            nix::sys::stat::lstat(path)
        } else {
            nix::sys::stat::stat(path)
        };
        let stat = stat.map_err(|errno| Error::from_errno(errno as i32, "Error getting file info"))?;

        let mut info = FileInfo::new();
        info.set_name(name);
        info.set_file_type(FileType::from_mode(stat.st_mode as u32));
        info.set_size(stat.st_size.max(0) as u64);
        info.set(attrs::TIME_MODIFIED, AttrValue::Time(stat.st_mtime.max(0) as u64));
        info.set(
            attrs::UNIX_MODE,
            AttrValue::Int64((stat.st_mode as u32 & 0o7777) as i64),
        );
        info.set(attrs::UNIX_UID, AttrValue::Int64(stat.st_uid as i64));
        info.set(attrs::UNIX_GID, AttrValue::Int64(stat.st_gid as i64));
        Ok(info)
    }

    fn file_name_of(path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_owned())
    }

    fn do_enumerate(&self, job: &Job, op: &EnumerateOp) -> Result<()> {
        let dir = Path::new(op.path());
        let entries = std::fs::read_dir(dir)
            .map_err(|err| Error::from_errno(err.raw_os_error().unwrap_or(libc::EIO), "Error reading directory"))?;

        // The reply (carrying the session path) goes out on success; the
        // batches follow out-of-band on the session.
        let session = op.open_session();
        job.succeeded();

        for entry in entries {
            if job.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("skipping unreadable entry in {}: {err}", op.path());
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            match Self::stat_info(&entry.path(), &name, op.flags()) {
                Ok(info) => {
                    if let Err(err) = session.send_info(info) {
                        warn!("enumerator delivery failed on {}: {err}", op.path());
                        break;
                    }
                }
                Err(err) => debug!("skipping {name}: {err}"),
            }
        }
        if let Err(err) = session.done() {
            warn!("enumerator completion failed on {}: {err}", op.path());
        }
        Ok(())
    }

    fn do_set_display_name(&self, op: &SetDisplayNameOp) -> Result<String> {
        let old = Path::new(op.path());
        let parent = old
            .parent()
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "Cannot rename the root"))?;
        let new = parent.join(op.display_name());
        if nix::sys::stat::lstat(&new).is_ok() {
            return Err(Error::new(ErrorKind::Exists, "Target file already exists"));
        }
        std::fs::rename(old, &new)?;
        Ok(new.to_string_lossy().into_owned())
    }

    fn do_delete(&self, path: &str) -> Result<()> {
        let target = Path::new(path);
        let stat = nix::sys::stat::lstat(target)
            .map_err(|errno| Error::from_errno(errno as i32, "Error deleting file"))?;
        if FileType::from_mode(stat.st_mode as u32) == FileType::Directory {
            std::fs::remove_dir(target).map_err(Error::from)
        } else {
            nix::unistd::unlink(target)
                .map_err(|errno| Error::from_errno(errno as i32, "Error deleting file"))
        }
    }

    fn move_file(&self, op: &MoveOp) -> Result<()> {
        if !op.flags().contains(MoveFlags::OVERWRITE)
            && nix::sys::stat::lstat(Path::new(op.destination())).is_ok()
        {
            return Err(Error::new(ErrorKind::Exists, "Target file already exists"));
        }
        std::fs::rename(op.source(), op.destination()).map_err(Error::from)
    }

    fn complete(job: &Job, result: Result<()>) {
        match result {
            Ok(()) => job.succeeded(),
            Err(error) => job.fail(error),
        }
    }
}

impl Backend for LocalBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn registration(&self) -> Option<MountRef> {
        self.registration.lock().clone()
    }

    fn shutdown(&self) {
        *self.registration.lock() = None;
        for (_, fd) in self.handles.lock().drain() {
            unsafe { libc::close(fd) };
        }
    }

    fn try_mount(&self, job: &Job, op: &MountOp) -> TryDispatch {
        let mut spec = MountSpec::new("local");
        if let Some(root) = op.spec().get("root") {
            spec.set("root", root);
        }
        *self.registration.lock() = Some(MountRef {
            peer_id: self.peer_id.clone(),
            object_path: self.object_path.clone(),
            spec,
            filename_encoding: None,
        });
        job.succeeded();
        TryDispatch::Handled
    }

    fn open_for_read(&self, job: &Job, op: &OpenForReadOp) {
        let result = self.open_fd(op.path(), libc::O_RDONLY, 0).map(|fd| {
            op.set_can_seek(Self::fd_can_seek(fd));
            op.set_handle(self.insert_handle(fd));
        });
        Self::complete(job, result);
    }

    fn read(&self, job: &Job, op: &ReadOp) {
        let result = self
            .lookup(op.handle())
            .and_then(|fd| self.do_read(job.token(), fd, op.count() as usize))
            .map(|data| op.set_data(data));
        Self::complete(job, result);
    }

    fn try_seek_on_read(&self, job: &Job, op: &SeekOp) -> TryDispatch {
        Self::complete(job, self.do_seek(op).map(|offset| op.set_new_offset(offset)));
        TryDispatch::Handled
    }

    fn try_close_read(&self, job: &Job, op: &StreamOp) -> TryDispatch {
        Self::complete(job, self.do_close(op));
        TryDispatch::Handled
    }

    fn open_for_write(&self, job: &Job, op: &OpenForWriteOp) {
        let flags = match op.mode() {
            WriteMode::Create => libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
            WriteMode::Replace => libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            WriteMode::Append => libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
        };
        let result = self.open_fd(op.path(), flags, 0o666).map(|fd| {
            if op.mode() == WriteMode::Append {
                let end = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
                if end == -1 {
                    op.set_can_seek(false);
                } else {
                    op.set_initial_offset(end as u64);
                    op.set_can_seek(true);
                }
            } else {
                op.set_can_seek(Self::fd_can_seek(fd));
            }
            op.set_handle(self.insert_handle(fd));
        });
        Self::complete(job, result);
    }

    fn write(&self, job: &Job, op: &WriteOp) {
        let result = self
            .lookup(op.handle())
            .and_then(|fd| self.do_write(job.token(), fd, op.data()))
            .map(|written| op.set_written(written));
        Self::complete(job, result);
    }

    fn try_seek_on_write(&self, job: &Job, op: &SeekOp) -> TryDispatch {
        Self::complete(job, self.do_seek(op).map(|offset| op.set_new_offset(offset)));
        TryDispatch::Handled
    }

    fn try_close_write(&self, job: &Job, op: &StreamOp) -> TryDispatch {
        Self::complete(job, self.do_close(op));
        TryDispatch::Handled
    }

    fn enumerate(&self, job: &Job, op: &EnumerateOp) {
        // On success the job was already completed before streaming began.
        if let Err(error) = self.do_enumerate(job, op) {
            job.fail(error);
        }
    }

    fn try_query_info(&self, job: &Job, op: &QueryInfoOp) -> TryDispatch {
        let name = Self::file_name_of(op.path());
        let result = Self::stat_info(Path::new(op.path()), &name, op.flags())
            .map(|info| op.set_info(info));
        Self::complete(job, result);
        TryDispatch::Handled
    }

    fn try_query_attributes(&self, job: &Job, op: &QueryAttributesOp) -> TryDispatch {
        let list = if op.namespaces() {
            vec![AttributeInfo {
                name: "unix".to_owned(),
                value_tag: 0,
            }]
        } else {
            vec![
                AttributeInfo {
                    name: attrs::UNIX_MODE.to_owned(),
                    value_tag: 3,
                },
                AttributeInfo {
                    name: attrs::TIME_MODIFIED.to_owned(),
                    value_tag: 6,
                },
            ]
        };
        op.set_list(list);
        job.succeeded();
        TryDispatch::Handled
    }

    fn set_display_name(&self, job: &Job, op: &SetDisplayNameOp) {
        let result = self
            .do_set_display_name(op)
            .map(|new_path| op.set_new_path(&new_path));
        Self::complete(job, result);
    }

    fn make_directory(&self, job: &Job, op: &PathOp) {
        let result = nix::unistd::mkdir(
            Path::new(op.path()),
            nix::sys::stat::Mode::from_bits_truncate(0o777),
        )
        .map_err(|errno| Error::from_errno(errno as i32, "Error creating directory"));
        Self::complete(job, result);
    }

    fn delete(&self, job: &Job, op: &PathOp) {
        Self::complete(job, self.do_delete(op.path()));
    }

    fn do_move(&self, job: &Job, op: &MoveOp) {
        Self::complete(job, self.move_file(op));
    }
}
