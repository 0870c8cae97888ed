//! SFTP version 3 protocol constants and attribute encoding.
//!
//! Packets are length-prefixed frames: a packet type byte, a 4-byte request
//! id (absent only on `INIT`/`VERSION`, which carry the protocol version
//! instead), then the operation parameters.

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::info::AttrValue;
use crate::info::FileInfo;
use crate::info::FileType;
use crate::info::attrs;
use crate::wire::FrameError;
use crate::wire::FrameReader;
use crate::wire::FrameWriter;

/// The protocol version this backend speaks.
pub(crate) const FILEXFER_VERSION: u32 = 3;

/// SFTP packet types.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
}

/// Status codes carried by `SSH_FXP_STATUS`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub(crate) enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

bitflags::bitflags! {
    /// `pflags` for `SSH_FXP_OPEN`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const CREAT = 1 << 3;
        const TRUNC = 1 << 4;
        const EXCL = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Attribute validity bits in the `ATTRS` structure.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct AttrFlags: u32 {
        const SIZE = 1 << 0;
        const UIDGID = 1 << 1;
        const PERMISSIONS = 1 << 2;
        const ACMODTIME = 1 << 3;
    }
}

/// Map an SFTP status to the unified taxonomy. `EOF` is not an error and is
/// handled at the call sites that expect it.
pub(crate) fn status_error(code: u32, message: &str) -> Error {
    let kind = match StatusCode::try_from(code) {
        Ok(StatusCode::NoSuchFile) => ErrorKind::NotFound,
        Ok(StatusCode::PermissionDenied) => ErrorKind::PermissionDenied,
        Ok(StatusCode::OpUnsupported) => ErrorKind::NotSupported,
        Ok(StatusCode::NoConnection) | Ok(StatusCode::ConnectionLost) => ErrorKind::Io,
        Ok(StatusCode::BadMessage) => ErrorKind::Io,
        Ok(StatusCode::Ok) | Ok(StatusCode::Eof) | Ok(StatusCode::Failure) | Err(_) => {
            ErrorKind::Failed
        }
    };
    let message = if message.is_empty() {
        format!("SFTP operation failed with status {code}")
    } else {
        message.to_owned()
    };
    Error::new(kind, message)
}

/// The v3 `ATTRS` structure: a validity word followed by the fields it
/// declares.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct FileAttributes {
    pub(crate) size: Option<u64>,
    pub(crate) uid_gid: Option<(u32, u32)>,
    pub(crate) permissions: Option<u32>,
    pub(crate) times: Option<(u32, u32)>,
}

impl FileAttributes {
    pub(crate) fn encode(&self, w: &mut FrameWriter) {
        let mut flags = AttrFlags::empty();
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        w.put_u32(flags.bits());
        if let Some(size) = self.size {
            w.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            w.put_u32(uid).put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            w.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            w.put_u32(atime).put_u32(mtime);
        }
    }

    pub(crate) fn decode(r: &mut FrameReader<'_>) -> Result<FileAttributes, FrameError> {
        let flags = AttrFlags::from_bits_truncate(r.get_u32()?);
        let mut out = FileAttributes::default();
        if flags.contains(AttrFlags::SIZE) {
            out.size = Some(r.get_u64()?);
        }
        if flags.contains(AttrFlags::UIDGID) {
            out.uid_gid = Some((r.get_u32()?, r.get_u32()?));
        }
        if flags.contains(AttrFlags::PERMISSIONS) {
            out.permissions = Some(r.get_u32()?);
        }
        if flags.contains(AttrFlags::ACMODTIME) {
            out.times = Some((r.get_u32()?, r.get_u32()?));
        }
        Ok(out)
    }

    /// Express the attributes as a file info for the given name.
    pub(crate) fn into_info(self, name: &str) -> FileInfo {
        let mut info = FileInfo::new();
        info.set_name(name);
        if let Some(permissions) = self.permissions {
            info.set_file_type(FileType::from_mode(permissions));
            info.set(
                attrs::UNIX_MODE,
                AttrValue::Int64((permissions & 0o7777) as i64),
            );
        }
        if let Some(size) = self.size {
            info.set_size(size);
        }
        if let Some((_, mtime)) = self.times {
            info.set(attrs::TIME_MODIFIED, AttrValue::Time(mtime as u64));
        }
        if let Some((uid, gid)) = self.uid_gid {
            info.set(attrs::UNIX_UID, AttrValue::Int64(uid as i64));
            info.set(attrs::UNIX_GID, AttrValue::Int64(gid as i64));
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrs_round_trip() {
        let attrs = FileAttributes {
            size: Some(1234),
            uid_gid: Some((1000, 100)),
            permissions: Some(libc::S_IFREG as u32 | 0o644),
            times: Some((1, 1_700_000_000)),
        };
        let mut w = FrameWriter::body();
        attrs.encode(&mut w);
        let body = w.finish();
        let decoded = FileAttributes::decode(&mut FrameReader::new(&body)).unwrap();
        assert_eq!(decoded, attrs);

        let info = decoded.into_info("f");
        assert_eq!(info.file_type(), Some(FileType::RegularFile));
        assert_eq!(info.size(), Some(1234));
    }

    #[test]
    fn partial_attrs_decode() {
        let mut w = FrameWriter::body();
        FileAttributes {
            size: Some(9),
            ..Default::default()
        }
        .encode(&mut w);
        let body = w.finish();
        let decoded = FileAttributes::decode(&mut FrameReader::new(&body)).unwrap();
        assert_eq!(decoded.size, Some(9));
        assert_eq!(decoded.permissions, None);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_error(StatusCode::NoSuchFile as u32, "gone").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            status_error(StatusCode::PermissionDenied as u32, "").kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            status_error(StatusCode::OpUnsupported as u32, "").kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(
            status_error(StatusCode::ConnectionLost as u32, "").kind(),
            ErrorKind::Io
        );
        assert_eq!(status_error(99, "").kind(), ErrorKind::Failed);
    }
}
