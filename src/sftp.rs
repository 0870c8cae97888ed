//! SFTP backend.
//!
//! File operations over an `sftp` subsystem channel spawned through the
//! local ssh client. Mounting probes the client vendor, spawns ssh (under a
//! pseudo-terminal when one can be allocated, so interactive credential
//! prompts can be answered), walks the login dialog, then negotiates SFTP
//! v3 over the child's stdio. After that every operation is a framed
//! request multiplexed by a 32-bit id; a single reader thread demuxes
//! replies onto per-request completion slots.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStderr;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use memchr::memmem;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::backend::Capabilities;
use crate::backend::TryDispatch;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::info::FileType;
use crate::job::CancellationToken;
use crate::job::Job;
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
use crate::mount::MountSource;
use crate::mount::MountSpec;
use crate::mount::AskPasswordFlags;
use crate::wire::FrameReader;
use crate::wire::FrameWriter;
use crate::wire::read_frame;

mod proto;

use proto::FILEXFER_VERSION;
use proto::FileAttributes;
use proto::OpenFlags;
use proto::PacketType;
use proto::StatusCode;
use proto::status_error;

/// Default ssh client binary; override with `VFSD_SSH_PATH`.
const SSH_PROGRAM: &str = "ssh";

/// Environment variable naming the ssh binary to use.
const SSH_PATH_ENV: &str = "VFSD_SSH_PATH";

/// Per-iteration select timeout during login.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(20);

/// How long unmount waits for pending replies before closing the streams.
const TEARDOWN_DRAIN: Duration = Duration::from_secs(1);

/// The detected identity of the local ssh client, which selects the argv
/// template and the prompt-source fd.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ClientVendor {
    /// OpenSSH or Sun_SSH.
    OpenSsh,
    /// SSH Secure Shell (prompts arrive on stderr).
    LegacySsh,
}

fn unsupported_ssh() -> Error {
    Error::new(
        ErrorKind::NotSupported,
        "Unable to find supported ssh command",
    )
}

/// Probe the ssh client by capturing `ssh -V` stderr.
fn detect_client_vendor(program: &Path) -> Result<ClientVendor> {
    let output = Command::new(program)
        .arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|_| unsupported_ssh())?;
    let stderr = &output.stderr;
    if memmem::find(stderr, b"OpenSSH").is_some() || memmem::find(stderr, b"Sun_SSH").is_some() {
        Ok(ClientVendor::OpenSsh)
    } else if memmem::find(stderr, b"SSH Secure Shell").is_some() {
        Ok(ClientVendor::LegacySsh)
    } else {
        Err(unsupported_ssh())
    }
}

/// Build the argv tail for the chosen vendor.
fn ssh_command_line(
    vendor: ClientVendor,
    host: &str,
    user: &str,
    batch_mode: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    match vendor {
        ClientVendor::OpenSsh => {
            args.push("-oForwardX11=no".into());
            args.push("-oForwardAgent=no".into());
            args.push("-oClearAllForwardings=yes".into());
            args.push("-oProtocol=2".into());
            args.push("-oNoHostAuthenticationForLocalhost=yes".into());
            if batch_mode {
                args.push("-oBatchMode=yes".into());
            }
            args.push("-l".into());
            args.push(user.into());
            args.push("-s".into());
            args.push(host.into());
            args.push("sftp".into());
        }
        ClientVendor::LegacySsh => {
            args.push("-x".into());
            args.push("-l".into());
            args.push(user.into());
            args.push("-s".into());
            args.push("sftp".into());
            args.push(host.into());
        }
    }
    args
}

/// A spawned ssh child with its stdio pipes and the pty master, when one
/// was allocated.
struct SpawnedSsh {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tty: Option<OwnedFd>,
}

/// Kill and reap a child whose mount failed, closing all of its fds.
fn cleanup_spawn(spawned: SpawnedSsh) {
    let SpawnedSsh {
        mut child,
        stdin,
        stdout,
        stderr,
        tty,
    } = spawned;
    drop(stdin);
    drop(stdout);
    drop(stderr);
    drop(tty);
    if let Err(err) = child.kill() {
        debug!("failed to kill ssh child: {err}");
    }
    if let Err(err) = child.wait() {
        warn!("failed to reap ssh child: {err}");
    }
}

/// Spawn ssh for the given mount configuration. A pseudo-terminal is
/// attached as the child's controlling terminal when one can be allocated;
/// otherwise the command line pins batch mode and prompting is unavailable.
fn spawn_ssh(program: &Path, vendor: ClientVendor, host: &str, user: &str) -> Result<SpawnedSsh> {
    let pty = match nix::pty::openpty(None, None) {
        Ok(pty) => Some(pty),
        Err(errno) => {
            debug!("pty allocation failed ({errno}), falling back to batch mode");
            None
        }
    };

    let mut command = Command::new(program);
    command
        .args(ssh_command_line(vendor, host, user, pty.is_none()))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let tty = match pty {
        Some(pty) => {
            let master_fd = pty.master.as_raw_fd();
            let slave_fd = pty.slave.as_raw_fd();
            unsafe {
                command.pre_exec(move || {
                    // Become a session leader and adopt the pty slave as the
                    // controlling terminal, so ssh prompts on it.
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    libc::close(master_fd);
                    libc::close(slave_fd);
                    Ok(())
                });
            }
            Some(pty)
        }
        None => None,
    };

    let mut child = command.spawn().map_err(|err| {
        Error::new(ErrorKind::Failed, "Unable to spawn ssh program").with_cause(err)
    })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    match (stdin, stdout, stderr) {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok(SpawnedSsh {
            child,
            stdin,
            stdout,
            stderr,
            // The slave lives on in the child; the master stays with us.
            tty: tty.map(|pty| pty.master),
        }),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            Err(Error::new(ErrorKind::Failed, "Unable to spawn ssh program"))
        }
    }
}

fn login_timed_out() -> Error {
    Error::new(ErrorKind::TimedOut, "Timed out when logging in")
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    PollTimeout::from(timeout.as_millis().min(u128::from(u16::MAX)) as u16)
}

fn readable(revents: Option<PollFlags>) -> bool {
    revents.is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
}

fn write_all_fd(fd: BorrowedFd<'_>, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return Err(nix::errno::Errno::EIO),
            Ok(n) => buf = &buf[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
    Ok(())
}

fn is_password_prompt(buf: &[u8]) -> bool {
    buf.ends_with(b"password: ")
        || buf.ends_with(b"Password: ")
        || buf.ends_with(b"Password:")
        || buf.starts_with(b"Enter passphrase for key")
}

fn is_host_key_prompt(buf: &[u8]) -> bool {
    buf.starts_with(b"The authenticity of host '")
        || memmem::find(buf, b"Key fingerprint:").is_some()
}

/// Wait for the `VERSION` reply to become readable when no prompting is
/// possible (no pty).
fn wait_for_reply(stdout_fd: BorrowedFd<'_>, timeout: Duration) -> Result<()> {
    loop {
        let mut fds = [PollFd::new(stdout_fd, PollFlags::POLLIN)];
        match nix::poll::poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => return Err(login_timed_out()),
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Drive the interactive login dialog.
///
/// Watches the prompt fd (pty master for OpenSSH, stderr for the legacy
/// client) and the protocol stdout; a readable stdout means the `INIT`
/// request got its reply and login is over. Prompts are answered through
/// the credential source; anything unrecognized is ignored. When the mount
/// spec already carried a password it is tried exactly once, and a repeated
/// prompt fails the login outright.
fn handle_login(
    source: &dyn MountSource,
    default_user: &str,
    initial_password: Option<&str>,
    prompt_fd: BorrowedFd<'_>,
    reply_fd: BorrowedFd<'_>,
    stdout_fd: BorrowedFd<'_>,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let mut used_initial = false;
    loop {
        let mut fds = [
            PollFd::new(stdout_fd, PollFlags::POLLIN),
            PollFd::new(prompt_fd, PollFlags::POLLIN),
        ];
        match nix::poll::poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => return Err(login_timed_out()),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
        if readable(fds[0].revents()) {
            // Reply to the initial INIT request is ready.
            return Ok(());
        }
        if !readable(fds[1].revents()) {
            continue;
        }

        let len = match nix::unistd::read(prompt_fd, &mut buffer) {
            Ok(0) => {
                return Err(Error::new(
                    ErrorKind::Io,
                    "Unexpected EOF from ssh program",
                ));
            }
            Ok(len) => len,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        };
        let buf = &buffer[..len];

        if is_password_prompt(buf) {
            let password = match initial_password {
                Some(password) if !used_initial => {
                    used_initial = true;
                    password.to_owned()
                }
                Some(_) => {
                    // The supplied password was rejected; one attempt only.
                    return Err(Error::new(ErrorKind::PermissionDenied, "Permission denied"));
                }
                None => {
                    let prompt = if buf.starts_with(b"Enter passphrase for key") {
                        "Enter passphrase for key"
                    } else {
                        "Enter password"
                    };
                    let reply = source.ask_password(
                        prompt,
                        default_user,
                        AskPasswordFlags::NEED_PASSWORD,
                    );
                    match (reply.cancelled, reply.password) {
                        (false, Some(password)) => password,
                        _ => {
                            return Err(Error::new(
                                ErrorKind::PermissionDenied,
                                "Password dialog cancelled",
                            ));
                        }
                    }
                }
            };
            if write_all_fd(reply_fd, password.as_bytes()).is_err()
                || write_all_fd(reply_fd, b"\n").is_err()
            {
                return Err(Error::new(
                    ErrorKind::PermissionDenied,
                    "Can't send password",
                ));
            }
        } else if is_host_key_prompt(buf) {
            let question = String::from_utf8_lossy(buf);
            let reply = source.ask_question(&question);
            if reply.cancelled || !reply.answer {
                let _ = write_all_fd(reply_fd, b"no\n");
                return Err(Error::new(
                    ErrorKind::PermissionDenied,
                    "Host key verification failed",
                ));
            }
            if write_all_fd(reply_fd, b"yes\n").is_err() {
                return Err(Error::new(
                    ErrorKind::Io,
                    "Can't reply to ssh host key prompt",
                ));
            }
        }
        // Anything else (banners, warnings) is ignored.
    }
}

/// Read and validate the `VERSION` reply to `INIT`.
fn read_version(reader: &mut impl Read) -> Result<u32> {
    let payload = read_frame(reader).map_err(|err| {
        Error::new(ErrorKind::Io, format!("Failed to read SFTP version: {err}"))
    })?;
    let mut r = FrameReader::new(&payload);
    let ptype = r.get_u8().map_err(Error::from)?;
    if ptype != u8::from(PacketType::Version) {
        return Err(Error::new(
            ErrorKind::Io,
            "Protocol error: unexpected packet during handshake",
        ));
    }
    Ok(r.get_u32().map_err(Error::from)?)
}

/// A demultiplexed SFTP reply: the packet type and the body following the
/// request id.
#[derive(Debug)]
struct Packet {
    ptype: u8,
    body: Vec<u8>,
}

#[derive(Default)]
struct PendingSlot {
    cell: Mutex<Option<Result<Packet>>>,
    cvar: Condvar,
}

impl PendingSlot {
    fn fill(&self, result: Result<Packet>) {
        *self.cell.lock() = Some(result);
        self.cvar.notify_all();
    }
}

/// Request-id multiplexed command channel over the child's stdio.
struct SftpTransport {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    pending: Mutex<HashMap<u32, Arc<PendingSlot>>>,
    next_id: AtomicU32,
    failed: AtomicBool,
}

impl SftpTransport {
    /// Wire the channel and start the reader thread. The reader exits when
    /// the reply stream hits EOF or a framing violation, failing every
    /// pending request.
    fn start(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> io::Result<Arc<SftpTransport>> {
        let transport = Arc::new(SftpTransport {
            writer: Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            failed: AtomicBool::new(false),
        });
        let shared = transport.clone();
        thread::Builder::new()
            .name("vfsd-sftp-reader".to_owned())
            .spawn(move || reader_main(shared, reader))?;
        Ok(transport)
    }

    /// Send one request and block until its reply (or cancellation, or
    /// transport failure).
    fn request(
        &self,
        ptype: PacketType,
        token: &CancellationToken,
        build: impl FnOnce(&mut FrameWriter),
    ) -> Result<Packet> {
        token.check()?;
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Io, "SFTP connection lost"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(PendingSlot::default());
        self.pending.lock().insert(id, slot.clone());

        let mut w = FrameWriter::new();
        w.put_u8(ptype.into()).put_u32(id);
        build(&mut w);
        let frame = w.finish();

        let write_result = {
            let mut writer = self.writer.lock();
            match writer.as_mut() {
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed")),
                Some(writer) => writer.write_all(&frame).and_then(|()| writer.flush()),
            }
        };
        if let Err(err) = write_result {
            self.pending.lock().remove(&id);
            let message = format!("SFTP transport failed: {err}");
            self.fail_all(&message);
            return Err(Error::new(ErrorKind::Io, message));
        }

        let mut cell = slot.cell.lock();
        loop {
            if let Some(result) = cell.take() {
                return result;
            }
            if token.is_cancelled() {
                drop(cell);
                // Leave the reply to be read through and discarded.
                self.pending.lock().remove(&id);
                return Err(Error::cancelled());
            }
            // A slot registered while fail_all was draining would otherwise
            // wait forever.
            if self.failed.load(Ordering::SeqCst) {
                drop(cell);
                self.pending.lock().remove(&id);
                return Err(Error::new(ErrorKind::Io, "SFTP connection lost"));
            }
            let _ = slot
                .cvar
                .wait_for(&mut cell, Duration::from_millis(100));
        }
    }

    fn fail_all(&self, message: &str) {
        self.failed.store(true, Ordering::SeqCst);
        let slots: Vec<_> = self.pending.lock().drain().collect();
        for (_, slot) in slots {
            slot.fill(Err(Error::new(ErrorKind::Io, message)));
        }
    }

    /// Drain pending replies up to a short deadline, then close the command
    /// stream. The reader thread exits once the child's stdout reaches EOF.
    fn close(&self, drain: Duration) {
        let deadline = Instant::now() + drain;
        while !self.pending.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        *self.writer.lock() = None;
        self.fail_all("SFTP connection closed");
    }
}

impl fmt::Debug for SftpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpTransport")
            .field("pending", &self.pending.lock().len())
            .field("failed", &self.failed.load(Ordering::SeqCst))
            .finish()
    }
}

fn reader_main(transport: Arc<SftpTransport>, mut reader: impl Read) {
    loop {
        let payload = match read_frame(&mut reader) {
            Ok(payload) => payload,
            Err(err) => {
                transport.fail_all(&format!("SFTP transport failed: {err}"));
                return;
            }
        };
        let mut r = FrameReader::new(&payload);
        let (ptype, id) = match (r.get_u8(), r.get_u32()) {
            (Ok(ptype), Ok(id)) => (ptype, id),
            _ => {
                transport.fail_all("SFTP transport failed: malformed reply");
                return;
            }
        };
        let body = r.take_rest().to_vec();
        match transport.pending.lock().remove(&id) {
            Some(slot) => slot.fill(Ok(Packet { ptype, body })),
            // Cancelled requests are read through and discarded.
            None => debug!("discarding reply for abandoned request {id}"),
        }
    }
}

fn protocol_error() -> Error {
    Error::new(ErrorKind::Io, "Protocol error: unexpected SFTP reply")
}

/// Decode a `STATUS` body into `(code, message)`.
fn decode_status(packet: &Packet) -> Result<(u32, String)> {
    if packet.ptype != u8::from(PacketType::Status) {
        return Err(protocol_error());
    }
    let mut r = FrameReader::new(&packet.body);
    let code = r.get_u32().map_err(Error::from)?;
    // Some servers omit the trailing message and language tag.
    let message = r.get_string().map(str::to_owned).unwrap_or_default();
    Ok((code, message))
}

/// Expect `STATUS(OK)`.
fn expect_ok(packet: Packet) -> Result<()> {
    let (code, message) = decode_status(&packet)?;
    if code == StatusCode::Ok as u32 {
        Ok(())
    } else {
        Err(status_error(code, &message))
    }
}

/// Expect a `HANDLE` reply.
fn expect_handle(packet: Packet) -> Result<Vec<u8>> {
    match PacketType::try_from(packet.ptype) {
        Ok(PacketType::Handle) => {
            let mut r = FrameReader::new(&packet.body);
            Ok(r.get_bytes().map_err(Error::from)?.to_vec())
        }
        Ok(PacketType::Status) => {
            let (code, message) = decode_status(&packet)?;
            Err(status_error(code, &message))
        }
        _ => Err(protocol_error()),
    }
}

/// Expect `DATA`, or `STATUS(EOF)` mapped to `None`.
fn expect_data(packet: Packet) -> Result<Option<Vec<u8>>> {
    match PacketType::try_from(packet.ptype) {
        Ok(PacketType::Data) => {
            let mut r = FrameReader::new(&packet.body);
            Ok(Some(r.get_bytes().map_err(Error::from)?.to_vec()))
        }
        Ok(PacketType::Status) => {
            let (code, message) = decode_status(&packet)?;
            if code == StatusCode::Eof as u32 {
                Ok(None)
            } else {
                Err(status_error(code, &message))
            }
        }
        _ => Err(protocol_error()),
    }
}

/// Expect an `ATTRS` reply.
fn expect_attrs(packet: Packet) -> Result<FileAttributes> {
    match PacketType::try_from(packet.ptype) {
        Ok(PacketType::Attrs) => {
            let mut r = FrameReader::new(&packet.body);
            Ok(FileAttributes::decode(&mut r).map_err(Error::from)?)
        }
        Ok(PacketType::Status) => {
            let (code, message) = decode_status(&packet)?;
            Err(status_error(code, &message))
        }
        _ => Err(protocol_error()),
    }
}

/// Expect a `NAME` reply, or `STATUS(EOF)` mapped to `None`.
fn expect_names(packet: Packet) -> Result<Option<Vec<(String, FileAttributes)>>> {
    match PacketType::try_from(packet.ptype) {
        Ok(PacketType::Name) => {
            let mut r = FrameReader::new(&packet.body);
            let count = r.get_u32().map_err(Error::from)?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let filename = r.get_string().map_err(Error::from)?.to_owned();
                let _longname = r.get_string().map_err(Error::from)?;
                let attrs = FileAttributes::decode(&mut r).map_err(Error::from)?;
                entries.push((filename, attrs));
            }
            Ok(Some(entries))
        }
        Ok(PacketType::Status) => {
            let (code, message) = decode_status(&packet)?;
            if code == StatusCode::Eof as u32 {
                Ok(None)
            } else {
                Err(status_error(code, &message))
            }
        }
        _ => Err(protocol_error()),
    }
}

#[derive(Clone, Debug)]
struct MountConfig {
    vendor: ClientVendor,
    host: String,
    user: String,
    user_specified: bool,
    password: Option<String>,
}

#[derive(Clone, Debug)]
struct SftpHandle {
    remote: Vec<u8>,
    offset: u64,
}

fn default_user_name() -> String {
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::current()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned())
}

fn resolve_ssh_program() -> PathBuf {
    match std::env::var_os(SSH_PATH_ENV) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(SSH_PROGRAM),
    }
}

/// Backend serving a remote host over the ssh `sftp` subsystem.
#[derive(Debug)]
pub struct SftpBackend {
    ssh_program: PathBuf,
    peer_id: String,
    object_path: String,
    config: Mutex<Option<MountConfig>>,
    transport: Mutex<Option<Arc<SftpTransport>>>,
    child: Mutex<Option<Child>>,
    tty: Mutex<Option<OwnedFd>>,
    stderr: Mutex<Option<ChildStderr>>,
    handles: Mutex<HashMap<u32, SftpHandle>>,
    next_handle: AtomicU32,
    registration: Mutex<Option<MountRef>>,
}

impl SftpBackend {
    /// Create a backend serving jobs at the given bus address.
    pub fn new(peer_id: &str, object_path: &str) -> SftpBackend {
        SftpBackend {
            ssh_program: resolve_ssh_program(),
            peer_id: peer_id.to_owned(),
            object_path: object_path.to_owned(),
            config: Mutex::new(None),
            transport: Mutex::new(None),
            child: Mutex::new(None),
            tty: Mutex::new(None),
            stderr: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            registration: Mutex::new(None),
        }
    }

    /// Override the ssh binary, bypassing `VFSD_SSH_PATH` and `PATH`.
    pub fn with_ssh_program(mut self, program: impl Into<PathBuf>) -> SftpBackend {
        self.ssh_program = program.into();
        self
    }

    fn transport_ref(&self) -> Result<Arc<SftpTransport>> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::Io, "Backend is not mounted"))
    }

    fn call(
        &self,
        token: &CancellationToken,
        ptype: PacketType,
        build: impl FnOnce(&mut FrameWriter),
    ) -> Result<Packet> {
        self.transport_ref()?.request(ptype, token, build)
    }

    fn insert_handle(&self, remote: Vec<u8>, offset: u64) -> u32 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .insert(handle, SftpHandle { remote, offset });
        handle
    }

    fn handle_state(&self, handle: u32) -> Result<SftpHandle> {
        self.handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "Unknown stream handle"))
    }

    fn set_offset(&self, handle: u32, offset: u64) {
        if let Some(state) = self.handles.lock().get_mut(&handle) {
            state.offset = offset;
        }
    }

    fn remove_handle(&self, handle: u32) -> Result<SftpHandle> {
        self.handles
            .lock()
            .remove(&handle)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "Unknown stream handle"))
    }

    fn sftp_open(
        &self,
        token: &CancellationToken,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Vec<u8>> {
        let packet = self.call(token, PacketType::Open, |w| {
            w.put_string(path).put_u32(flags.bits());
            FileAttributes::default().encode(w);
        })?;
        expect_handle(packet)
    }

    fn sftp_close(&self, token: &CancellationToken, remote: &[u8]) -> Result<()> {
        let packet = self.call(token, PacketType::Close, |w| {
            w.put_bytes(remote);
        })?;
        expect_ok(packet)
    }

    fn sftp_fstat(&self, token: &CancellationToken, remote: &[u8]) -> Result<FileAttributes> {
        let packet = self.call(token, PacketType::Fstat, |w| {
            w.put_bytes(remote);
        })?;
        expect_attrs(packet)
    }

    fn sftp_path_stat(
        &self,
        token: &CancellationToken,
        path: &str,
        follow: bool,
    ) -> Result<FileAttributes> {
        let ptype = if follow {
            PacketType::Stat
        } else {
            PacketType::Lstat
        };
        let packet = self.call(token, ptype, |w| {
            w.put_string(path);
        })?;
        expect_attrs(packet)
    }

    fn do_mount(&self, job: &Job, op: &MountOp) -> Result<()> {
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::Failed, "mount fast path did not run"))?;

        let mut spawned = spawn_ssh(
            &self.ssh_program,
            config.vendor,
            &config.host,
            &config.user,
        )?;

        // Ask for the protocol before login; the VERSION reply becoming
        // readable is what ends the prompt loop.
        let mut init = FrameWriter::new();
        init.put_u8(PacketType::Init.into())
            .put_u32(FILEXFER_VERSION);
        let init_frame = init.finish();
        if let Err(err) = spawned
            .stdin
            .write_all(&init_frame)
            .and_then(|()| spawned.stdin.flush())
        {
            cleanup_spawn(spawned);
            return Err(Error::new(ErrorKind::Io, format!("Unable to reach ssh program: {err}")));
        }

        let login = match &spawned.tty {
            Some(master) => {
                let prompt_fd = match config.vendor {
                    ClientVendor::LegacySsh => spawned.stderr.as_fd(),
                    ClientVendor::OpenSsh => master.as_fd(),
                };
                handle_login(
                    op.source().as_ref(),
                    &config.user,
                    config.password.as_deref(),
                    prompt_fd,
                    master.as_fd(),
                    spawned.stdout.as_fd(),
                    LOGIN_TIMEOUT,
                )
            }
            None => wait_for_reply(spawned.stdout.as_fd(), LOGIN_TIMEOUT),
        };
        if let Err(error) = login {
            cleanup_spawn(spawned);
            return Err(error);
        }

        let version = match read_version(&mut spawned.stdout) {
            Ok(version) => version,
            Err(error) => {
                cleanup_spawn(spawned);
                return Err(error);
            }
        };
        debug!("sftp server speaks version {version}");

        // The command stream is the child's stdin, the reply stream its
        // stdout; stderr stays open for the child's diagnostics.
        let SpawnedSsh {
            child,
            stdin,
            stdout,
            stderr,
            tty,
        } = spawned;
        let transport = match SftpTransport::start(stdout, stdin) {
            Ok(transport) => transport,
            Err(err) => {
                drop(stderr);
                drop(tty);
                let mut child = child;
                if child.kill().is_ok() {
                    let _ = child.wait();
                }
                return Err(Error::new(
                    ErrorKind::Failed,
                    format!("Unable to start SFTP transport: {err}"),
                ));
            }
        };

        let mut spec = MountSpec::new("sftp");
        if config.user_specified {
            spec.set("user", &config.user);
        }
        spec.set("host", &config.host);
        *self.registration.lock() = Some(MountRef {
            peer_id: self.peer_id.clone(),
            object_path: self.object_path.clone(),
            spec,
            filename_encoding: None,
        });

        *self.transport.lock() = Some(transport);
        *self.tty.lock() = tty;
        *self.stderr.lock() = Some(stderr);
        *self.child.lock() = Some(child);
        job.succeeded();
        Ok(())
    }

    fn do_seek(&self, token: &CancellationToken, op: &SeekOp) -> Result<u64> {
        let state = self.handle_state(op.handle())?;
        let target = match op.whence() {
            Some(SeekWhence::Set) => i128::from(op.offset()),
            Some(SeekWhence::Cur) => i128::from(state.offset) + i128::from(op.offset()),
            Some(SeekWhence::End) => {
                let attrs = self.sftp_fstat(token, &state.remote)?;
                let size = attrs.size.ok_or_else(|| {
                    Error::new(ErrorKind::Failed, "Server reported no file size")
                })?;
                i128::from(size) + i128::from(op.offset())
            }
            None => {
                return Err(Error::new(ErrorKind::NotSupported, "Unsupported seek type"));
            }
        };
        if target < 0 || target > i128::from(u64::MAX) {
            return Err(Error::new(ErrorKind::InvalidArgument, "Invalid seek offset"));
        }
        let target = target as u64;
        self.set_offset(op.handle(), target);
        Ok(target)
    }

    fn do_enumerate(&self, job: &Job, op: &EnumerateOp) -> Result<()> {
        let token = job.token().clone();
        let dir = self.sftp_open_dir(&token, op.path())?;

        let session = op.open_session();
        job.succeeded();

        loop {
            if token.is_cancelled() {
                break;
            }
            let packet = match self.call(&token, PacketType::Readdir, |w| {
                w.put_bytes(&dir);
            }) {
                Ok(packet) => packet,
                Err(error) => {
                    warn!("readdir failed on {}: {error}", op.path());
                    break;
                }
            };
            match expect_names(packet) {
                Ok(None) => break,
                Ok(Some(entries)) => {
                    for (name, attrs) in entries {
                        if name == "." || name == ".." {
                            continue;
                        }
                        if let Err(error) = session.send_info(attrs.into_info(&name)) {
                            warn!("enumerator delivery failed on {}: {error}", op.path());
                            break;
                        }
                    }
                }
                Err(error) => {
                    warn!("readdir failed on {}: {error}", op.path());
                    break;
                }
            }
        }
        if let Err(error) = self.sftp_close(&token, &dir) {
            debug!("closing remote directory failed: {error}");
        }
        if let Err(error) = session.done() {
            warn!("enumerator completion failed on {}: {error}", op.path());
        }
        Ok(())
    }

    fn sftp_open_dir(&self, token: &CancellationToken, path: &str) -> Result<Vec<u8>> {
        let packet = self.call(token, PacketType::Opendir, |w| {
            w.put_string(path);
        })?;
        expect_handle(packet)
    }

    fn do_set_display_name(
        &self,
        token: &CancellationToken,
        op: &SetDisplayNameOp,
    ) -> Result<String> {
        let old = Path::new(op.path());
        let parent = old
            .parent()
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "Cannot rename the root"))?;
        let new = parent.join(op.display_name());
        let new = new.to_string_lossy().into_owned();
        if self.sftp_path_stat(token, &new, false).is_ok() {
            return Err(Error::new(ErrorKind::Exists, "Target file already exists"));
        }
        let packet = self.call(token, PacketType::Rename, |w| {
            w.put_string(op.path()).put_string(&new);
        })?;
        expect_ok(packet)?;
        Ok(new)
    }

    fn do_delete(&self, token: &CancellationToken, path: &str) -> Result<()> {
        let attrs = self.sftp_path_stat(token, path, false)?;
        let is_dir = attrs
            .permissions
            .map(FileType::from_mode)
            .is_some_and(|t| t == FileType::Directory);
        let ptype = if is_dir {
            PacketType::Rmdir
        } else {
            PacketType::Remove
        };
        let packet = self.call(token, ptype, |w| {
            w.put_string(path);
        })?;
        expect_ok(packet)
    }

    fn move_file(&self, token: &CancellationToken, op: &MoveOp) -> Result<()> {
        if op.flags().contains(MoveFlags::OVERWRITE) {
            // v3 RENAME refuses to clobber; drop the target first.
            let remove = self
                .call(token, PacketType::Remove, |w| {
                    w.put_string(op.destination());
                })
                .and_then(expect_ok);
            match remove {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
        let packet = self.call(token, PacketType::Rename, |w| {
            w.put_string(op.source()).put_string(op.destination());
        })?;
        expect_ok(packet)
    }

    fn complete(job: &Job, result: Result<()>) {
        match result {
            Ok(()) => job.succeeded(),
            Err(error) => job.fail(error),
        }
    }
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_owned())
}

impl Backend for SftpBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn registration(&self) -> Option<MountRef> {
        self.registration.lock().clone()
    }

    fn shutdown(&self) {
        if let Some(transport) = self.transport.lock().take() {
            transport.close(TEARDOWN_DRAIN);
        }
        if let Some(mut child) = self.child.lock().take() {
            if let Err(err) = child.kill() {
                debug!("failed to kill ssh child: {err}");
            }
            if let Err(err) = child.wait() {
                warn!("failed to reap ssh child: {err}");
            }
        }
        *self.tty.lock() = None;
        *self.stderr.lock() = None;
        self.handles.lock().clear();
        *self.registration.lock() = None;
    }

    fn try_mount(&self, job: &Job, op: &MountOp) -> TryDispatch {
        let vendor = match detect_client_vendor(&self.ssh_program) {
            Ok(vendor) => vendor,
            Err(error) => {
                job.fail(error);
                return TryDispatch::Handled;
            }
        };
        let spec = op.spec();
        if spec.mount_type() != Some("sftp") {
            job.fail(Error::new(ErrorKind::InvalidArgument, "Invalid mount spec"));
            return TryDispatch::Handled;
        }
        let Some(host) = spec.get("host") else {
            job.fail(Error::new(ErrorKind::InvalidArgument, "Invalid mount spec"));
            return TryDispatch::Handled;
        };
        let (user, user_specified) = match spec.get("user") {
            Some(user) => (user.to_owned(), true),
            None => (default_user_name(), false),
        };
        *self.config.lock() = Some(MountConfig {
            vendor,
            host: host.to_owned(),
            user,
            user_specified,
            password: spec.get("password").map(str::to_owned),
        });
        TryDispatch::NotHandled
    }

    fn mount(&self, job: &Job, op: &MountOp) {
        if let Err(error) = self.do_mount(job, op) {
            job.fail(error);
        }
    }

    fn open_for_read(&self, job: &Job, op: &OpenForReadOp) {
        let result = self
            .sftp_open(job.token(), op.path(), OpenFlags::READ)
            .map(|remote| {
                op.set_handle(self.insert_handle(remote, 0));
                op.set_can_seek(true);
            });
        Self::complete(job, result);
    }

    fn read(&self, job: &Job, op: &ReadOp) {
        let result = (|| {
            let state = self.handle_state(op.handle())?;
            let packet = self.call(job.token(), PacketType::Read, |w| {
                w.put_bytes(&state.remote)
                    .put_u64(state.offset)
                    .put_u32(op.count());
            })?;
            let mut data = expect_data(packet)?.unwrap_or_default();
            data.truncate(op.count() as usize);
            self.set_offset(op.handle(), state.offset + data.len() as u64);
            op.set_data(data);
            Ok(())
        })();
        Self::complete(job, result);
    }

    fn seek_on_read(&self, job: &Job, op: &SeekOp) {
        let result = self
            .do_seek(job.token(), op)
            .map(|offset| op.set_new_offset(offset));
        Self::complete(job, result);
    }

    fn close_read(&self, job: &Job, op: &StreamOp) {
        let result = self
            .remove_handle(op.handle())
            .and_then(|state| self.sftp_close(job.token(), &state.remote));
        Self::complete(job, result);
    }

    fn open_for_write(&self, job: &Job, op: &OpenForWriteOp) {
        let flags = match op.mode() {
            WriteMode::Create => OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL,
            WriteMode::Replace => OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
            WriteMode::Append => OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::APPEND,
        };
        let result = (|| {
            let remote = self.sftp_open(job.token(), op.path(), flags)?;
            let offset = if op.mode() == WriteMode::Append {
                match self.sftp_fstat(job.token(), &remote).map(|a| a.size) {
                    Ok(Some(size)) => {
                        op.set_initial_offset(size);
                        op.set_can_seek(true);
                        size
                    }
                    Ok(None) | Err(_) => {
                        op.set_can_seek(false);
                        0
                    }
                }
            } else {
                op.set_can_seek(true);
                0
            };
            op.set_handle(self.insert_handle(remote, offset));
            Ok(())
        })();
        Self::complete(job, result);
    }

    fn write(&self, job: &Job, op: &WriteOp) {
        let result = (|| {
            let state = self.handle_state(op.handle())?;
            let packet = self.call(job.token(), PacketType::Write, |w| {
                w.put_bytes(&state.remote)
                    .put_u64(state.offset)
                    .put_bytes(op.data());
            })?;
            expect_ok(packet)?;
            let written = op.data().len() as u64;
            self.set_offset(op.handle(), state.offset + written);
            op.set_written(written);
            Ok(())
        })();
        Self::complete(job, result);
    }

    fn seek_on_write(&self, job: &Job, op: &SeekOp) {
        let result = self
            .do_seek(job.token(), op)
            .map(|offset| op.set_new_offset(offset));
        Self::complete(job, result);
    }

    fn close_write(&self, job: &Job, op: &StreamOp) {
        let result = self
            .remove_handle(op.handle())
            .and_then(|state| self.sftp_close(job.token(), &state.remote));
        Self::complete(job, result);
    }

    fn enumerate(&self, job: &Job, op: &EnumerateOp) {
        if let Err(error) = self.do_enumerate(job, op) {
            job.fail(error);
        }
    }

    fn query_info(&self, job: &Job, op: &QueryInfoOp) {
        let follow = !op.flags().contains(QueryFlags::NOFOLLOW_SYMLINKS);
        let result = self
            .sftp_path_stat(job.token(), op.path(), follow)
            .map(|attrs| op.set_info(attrs.into_info(&file_name_of(op.path()))));
        Self::complete(job, result);
    }

    fn try_query_attributes(&self, job: &Job, op: &QueryAttributesOp) -> TryDispatch {
        // Nothing is settable over this backend yet.
        op.set_list(Vec::new());
        job.succeeded();
        TryDispatch::Handled
    }

    fn set_display_name(&self, job: &Job, op: &SetDisplayNameOp) {
        let result = self
            .do_set_display_name(job.token(), op)
            .map(|new_path| op.set_new_path(&new_path));
        Self::complete(job, result);
    }

    fn make_directory(&self, job: &Job, op: &PathOp) {
        let result = self
            .call(job.token(), PacketType::Mkdir, |w| {
                w.put_string(op.path());
                FileAttributes::default().encode(w);
            })
            .and_then(expect_ok);
        Self::complete(job, result);
    }

    fn delete(&self, job: &Job, op: &PathOp) {
        Self::complete(job, self.do_delete(job.token(), op.path()));
    }

    fn do_move(&self, job: &Job, op: &MoveOp) {
        Self::complete(job, self.move_file(job.token(), op));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::PasswordReply;
    use crate::mount::QuestionReply;
    use std::fs::File;
    use std::io::BufRead;
    use std::io::BufReader;
    use std::os::unix::fs::PermissionsExt;

    /// Credential source with scripted answers.
    struct ScriptedSource {
        cancelled: bool,
        password: Option<&'static str>,
        trust_host: bool,
    }

    impl ScriptedSource {
        fn with_password(password: &'static str) -> ScriptedSource {
            ScriptedSource {
                cancelled: false,
                password: Some(password),
                trust_host: true,
            }
        }

        fn cancelling() -> ScriptedSource {
            ScriptedSource {
                cancelled: true,
                password: None,
                trust_host: false,
            }
        }
    }

    impl MountSource for ScriptedSource {
        fn ask_password(
            &self,
            _prompt: &str,
            _default_user: &str,
            flags: AskPasswordFlags,
        ) -> PasswordReply {
            assert!(flags.contains(AskPasswordFlags::NEED_PASSWORD));
            PasswordReply {
                cancelled: self.cancelled,
                password: self.password.map(str::to_owned),
                ..Default::default()
            }
        }

        fn ask_question(&self, _prompt: &str) -> QuestionReply {
            QuestionReply {
                cancelled: self.cancelled,
                answer: self.trust_host,
            }
        }
    }

    fn fake_ssh(dir: &std::path::Path, banner: &str) -> PathBuf {
        let path = dir.join("ssh");
        std::fs::write(&path, format!("#!/bin/sh\necho '{banner}' >&2\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn vendor_probe_classifies_banners() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            detect_client_vendor(&fake_ssh(dir.path(), "OpenSSH_9.6p1 Ubuntu")).unwrap(),
            ClientVendor::OpenSsh
        );
        assert_eq!(
            detect_client_vendor(&fake_ssh(dir.path(), "Sun_SSH_1.1")).unwrap(),
            ClientVendor::OpenSsh
        );
        assert_eq!(
            detect_client_vendor(&fake_ssh(dir.path(), "SSH Secure Shell 3.2.9")).unwrap(),
            ClientVendor::LegacySsh
        );
        assert_eq!(
            detect_client_vendor(&fake_ssh(dir.path(), "dropbear v2022.83"))
                .unwrap_err()
                .kind(),
            ErrorKind::NotSupported
        );
    }

    #[test]
    fn missing_ssh_fails_mount_not_supported() {
        let backend = Arc::new(
            SftpBackend::new(":1.9", "/org/vfsd/mount/sftp_h_u")
                .with_ssh_program("/nonexistent/vfsd-test-ssh"),
        );
        let mut spec = MountSpec::new("sftp");
        spec.set("host", "h");
        spec.set("user", "u");
        let registry = Arc::new(NullRegistry);
        let op = MountOp::new(
            spec,
            Arc::new(ScriptedSource::cancelling()),
            registry,
            false,
        );
        let sink = Arc::new(crate::bus::testutil::CollectingSink::default());
        let envelope = crate::bus::Envelope::new(
            1,
            sink.clone() as Arc<dyn crate::bus::ReplySink>,
        );
        let job = Arc::new(Job::new(
            1,
            envelope,
            backend.clone(),
            crate::job::JobKind::Mount(op),
        ));
        let crate::job::JobKind::Mount(op) = job.kind() else {
            unreachable!()
        };
        assert_eq!(backend.try_mount(&job, op), TryDispatch::Handled);

        let (_, payload) = sink.single();
        let mut r = FrameReader::new(&payload);
        assert_eq!(r.get_u8().unwrap(), 1);
        r.get_string().unwrap();
        assert_eq!(
            r.get_i32().unwrap(),
            i32::from(ErrorKind::NotSupported)
        );
        assert_eq!(
            r.get_string().unwrap(),
            "Unable to find supported ssh command"
        );
    }

    #[derive(Debug)]
    struct NullRegistry;

    impl crate::mount::MountRegistry for NullRegistry {
        fn register(&self, _mount: &MountRef) -> Result<()> {
            Ok(())
        }

        fn unregister(&self, _object_path: &str) {}
    }

    #[test]
    fn command_line_templates() {
        let args = ssh_command_line(ClientVendor::OpenSsh, "h", "u", false);
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "-oForwardX11=no",
                "-oForwardAgent=no",
                "-oClearAllForwardings=yes",
                "-oProtocol=2",
                "-oNoHostAuthenticationForLocalhost=yes",
                "-l",
                "u",
                "-s",
                "h",
                "sftp",
            ]
        );

        let args = ssh_command_line(ClientVendor::OpenSsh, "h", "u", true);
        assert!(args.iter().any(|a| a == "-oBatchMode=yes"));

        let args = ssh_command_line(ClientVendor::LegacySsh, "h", "u", false);
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, ["-x", "-l", "u", "-s", "sftp", "h"]);
    }

    struct LoginFixture {
        prompt_w: OwnedFd,
        reply_r: OwnedFd,
        stdout_w: OwnedFd,
        prompt_r: OwnedFd,
        reply_w: OwnedFd,
        stdout_r: OwnedFd,
    }

    fn login_fixture() -> LoginFixture {
        let (prompt_r, prompt_w) = nix::unistd::pipe().unwrap();
        let (reply_r, reply_w) = nix::unistd::pipe().unwrap();
        let (stdout_r, stdout_w) = nix::unistd::pipe().unwrap();
        LoginFixture {
            prompt_w,
            reply_r,
            stdout_w,
            prompt_r,
            reply_w,
            stdout_r,
        }
    }

    #[test]
    fn login_answers_password_prompt() {
        let fixture = login_fixture();
        let LoginFixture {
            prompt_w,
            reply_r,
            stdout_w,
            prompt_r,
            reply_w,
            stdout_r,
        } = fixture;

        let peer = thread::spawn(move || {
            write_all_fd(prompt_w.as_fd(), b"user@h's password: ").unwrap();
            let mut line = String::new();
            BufReader::new(File::from(reply_r)).read_line(&mut line).unwrap();
            assert_eq!(line, "secret\n");
            // Password accepted; the VERSION reply becomes readable.
            write_all_fd(stdout_w.as_fd(), b"\x00").unwrap();
        });

        let source = ScriptedSource::with_password("secret");
        handle_login(
            &source,
            "user",
            None,
            prompt_r.as_fd(),
            reply_w.as_fd(),
            stdout_r.as_fd(),
            Duration::from_secs(5),
        )
        .unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn login_cancelled_dialog_is_permission_denied() {
        let fixture = login_fixture();

        write_all_fd(fixture.prompt_w.as_fd(), b"Password: ").unwrap();
        let source = ScriptedSource::cancelling();
        let err = handle_login(
            &source,
            "user",
            None,
            fixture.prompt_r.as_fd(),
            fixture.reply_w.as_fd(),
            fixture.stdout_r.as_fd(),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.message(), "Password dialog cancelled");
    }

    #[test]
    fn login_times_out_without_prompts() {
        let fixture = login_fixture();
        let source = ScriptedSource::cancelling();
        let err = handle_login(
            &source,
            "user",
            None,
            fixture.prompt_r.as_fd(),
            fixture.reply_w.as_fd(),
            fixture.stdout_r.as_fd(),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(err.message(), "Timed out when logging in");
    }

    #[test]
    fn login_uses_spec_password_once() {
        let fixture = login_fixture();
        let LoginFixture {
            prompt_w,
            reply_r,
            stdout_w: _stdout_w,
            prompt_r,
            reply_w,
            stdout_r,
        } = fixture;

        let peer = thread::spawn(move || {
            write_all_fd(prompt_w.as_fd(), b"Password: ").unwrap();
            let mut line = String::new();
            let mut reader = BufReader::new(File::from(reply_r));
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "fromspec\n");
            // Wrong password; prompt again.
            write_all_fd(prompt_w.as_fd(), b"Password: ").unwrap();
        });

        let source = ScriptedSource::with_password("unused");
        let err = handle_login(
            &source,
            "user",
            Some("fromspec"),
            prompt_r.as_fd(),
            reply_w.as_fd(),
            stdout_r.as_fd(),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        peer.join().unwrap();
    }

    #[test]
    fn login_surfaces_host_key_prompt() {
        let fixture = login_fixture();
        let LoginFixture {
            prompt_w,
            reply_r,
            stdout_w,
            prompt_r,
            reply_w,
            stdout_r,
        } = fixture;

        let peer = thread::spawn(move || {
            write_all_fd(
                prompt_w.as_fd(),
                b"The authenticity of host 'h (10.0.0.1)' can't be established.\n\
                  Are you sure you want to continue connecting (yes/no)? ",
            )
            .unwrap();
            let mut line = String::new();
            BufReader::new(File::from(reply_r)).read_line(&mut line).unwrap();
            assert_eq!(line, "yes\n");
            write_all_fd(stdout_w.as_fd(), b"\x00").unwrap();
        });

        let source = ScriptedSource::with_password("secret");
        handle_login(
            &source,
            "user",
            None,
            prompt_r.as_fd(),
            reply_w.as_fd(),
            stdout_r.as_fd(),
            Duration::from_secs(5),
        )
        .unwrap();
        peer.join().unwrap();
    }

    fn transport_fixture() -> (Arc<SftpTransport>, File, File) {
        let (req_r, req_w) = nix::unistd::pipe().unwrap();
        let (resp_r, resp_w) = nix::unistd::pipe().unwrap();
        let transport =
            SftpTransport::start(File::from(resp_r), File::from(req_w)).unwrap();
        (transport, File::from(req_r), File::from(resp_w))
    }

    fn read_request(reader: &mut File) -> (u8, u32, Vec<u8>) {
        let payload = read_frame(reader).unwrap();
        let mut r = FrameReader::new(&payload);
        let ptype = r.get_u8().unwrap();
        let id = r.get_u32().unwrap();
        (ptype, id, r.take_rest().to_vec())
    }

    fn write_reply(writer: &mut File, ptype: PacketType, id: u32, body: &[u8]) {
        let mut w = FrameWriter::new();
        w.put_u8(ptype.into()).put_u32(id).put_raw(body);
        writer.write_all(&w.finish()).unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn replies_demux_by_id_even_reversed() {
        let (transport, mut requests, mut replies) = transport_fixture();

        let responder = thread::spawn(move || {
            // Read both requests before answering, then answer in reverse.
            let first = read_request(&mut requests);
            let second = read_request(&mut requests);
            for (_, id, body) in [second, first] {
                let mut reply = FrameWriter::body();
                reply.put_bytes(&body);
                write_reply(&mut replies, PacketType::Handle, id, &reply.finish());
            }
        });

        let t1 = {
            let transport = transport.clone();
            thread::spawn(move || {
                let token = CancellationToken::new();
                let packet = transport
                    .request(PacketType::Open, &token, |w| {
                        w.put_raw(b"alpha");
                    })
                    .unwrap();
                expect_handle(packet).unwrap()
            })
        };
        let t2 = {
            let transport = transport.clone();
            thread::spawn(move || {
                let token = CancellationToken::new();
                let packet = transport
                    .request(PacketType::Open, &token, |w| {
                        w.put_raw(b"bravo");
                    })
                    .unwrap();
                expect_handle(packet).unwrap()
            })
        };

        assert_eq!(t1.join().unwrap(), b"alpha");
        assert_eq!(t2.join().unwrap(), b"bravo");
        responder.join().unwrap();
    }

    #[test]
    fn cancelled_request_reply_is_read_through() {
        let (transport, mut requests, mut replies) = transport_fixture();
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                token.cancel();
            })
        };
        let err = transport
            .request(PacketType::Open, &token, |w| {
                w.put_string("/x");
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        canceller.join().unwrap();

        // The stale reply is discarded; the next request still works.
        let (_, stale_id, _) = read_request(&mut requests);
        let mut status = FrameWriter::body();
        status
            .put_u32(StatusCode::Ok as u32)
            .put_string("")
            .put_string("");
        write_reply(&mut replies, PacketType::Status, stale_id, &status.finish());

        let responder = thread::spawn(move || {
            let (_, id, _) = read_request(&mut requests);
            let mut status = FrameWriter::body();
            status
                .put_u32(StatusCode::Ok as u32)
                .put_string("")
                .put_string("");
            write_reply(&mut replies, PacketType::Status, id, &status.finish());
        });

        let token = CancellationToken::new();
        let packet = transport
            .request(PacketType::Remove, &token, |w| {
                w.put_string("/y");
            })
            .unwrap();
        expect_ok(packet).unwrap();
        responder.join().unwrap();
    }

    #[test]
    fn transport_failure_fails_pending_requests() {
        let (transport, requests, replies) = transport_fixture();
        let token = CancellationToken::new();

        // Closing the responder ends the reply stream mid-request.
        drop(replies);
        drop(requests);
        let err = transport
            .request(PacketType::Open, &token, |w| {
                w.put_string("/x");
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn failed_spawn_reaps_child() {
        let mut child = Command::new("/bin/sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let spawned = SpawnedSsh {
            stdin: child.stdin.take().unwrap(),
            stdout: child.stdout.take().unwrap(),
            stderr: child.stderr.take().unwrap(),
            tty: None,
            child,
        };
        cleanup_spawn(spawned);

        // Already reaped: waiting again reports no such child.
        let res = nix::sys::wait::waitpid(
            nix::unistd::Pid::from_raw(pid),
            Some(nix::sys::wait::WaitPidFlag::WNOHANG),
        );
        assert_eq!(res.unwrap_err(), nix::errno::Errno::ECHILD);
    }
}
