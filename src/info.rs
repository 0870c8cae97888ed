//! File information attribute bags.
//!
//! A [`FileInfo`] is an ordered set of `namespace:attribute` keys mapping to
//! tagged values. Backends fill one per file; the enumerator channel and
//! query-info replies carry them over the wire as structs of
//! `(name, value)` pairs. Infos are immutable once emitted from a backend.

#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::wire::FrameError;
use crate::wire::FrameReader;
use crate::wire::FrameWriter;

/// Well-known attribute names.
pub mod attrs {
    /// File name within its parent directory.
    pub const NAME: &str = "standard::name";
    /// File type, stored as the [`FileType`](super::FileType) wire code.
    pub const TYPE: &str = "standard::type";
    /// Size in bytes.
    pub const SIZE: &str = "standard::size";
    /// Modification time, seconds since the epoch.
    pub const TIME_MODIFIED: &str = "time::modified";
    /// Unix mode bits.
    pub const UNIX_MODE: &str = "unix::mode";
    /// Owning user id.
    pub const UNIX_UID: &str = "unix::uid";
    /// Owning group id.
    pub const UNIX_GID: &str = "unix::gid";
}

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    /// Type could not be determined
    Unknown,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Derive the type from Unix mode bits.
    pub fn from_mode(mode: u32) -> FileType {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::RegularFile,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// Stable wire code for the type.
    pub fn code(self) -> i64 {
        match self {
            FileType::Unknown => 0,
            FileType::RegularFile => 1,
            FileType::Directory => 2,
            FileType::Symlink => 3,
            FileType::NamedPipe => 4,
            FileType::CharDevice => 5,
            FileType::BlockDevice => 6,
            FileType::Socket => 7,
        }
    }

    /// Inverse of [`FileType::code`]; unknown codes collapse to `Unknown`.
    pub fn from_code(code: i64) -> FileType {
        match code {
            1 => FileType::RegularFile,
            2 => FileType::Directory,
            3 => FileType::Symlink,
            4 => FileType::NamedPipe,
            5 => FileType::CharDevice,
            6 => FileType::BlockDevice,
            7 => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// Tagged attribute value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttrValue {
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Signed integer.
    Int64(i64),
    /// Boolean flag.
    Bool(bool),
    /// Bus object path.
    ObjectPath(String),
    /// Seconds since the Unix epoch.
    Time(u64),
}

const TAG_STRING: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_OBJECT_PATH: u8 = 5;
const TAG_TIME: u8 = 6;

impl AttrValue {
    fn encode(&self, w: &mut FrameWriter) {
        match self {
            AttrValue::String(s) => {
                w.put_u8(TAG_STRING).put_string(s);
            }
            AttrValue::Bytes(b) => {
                w.put_u8(TAG_BYTES).put_bytes(b);
            }
            AttrValue::Int64(v) => {
                w.put_u8(TAG_INT64).put_i64(*v);
            }
            AttrValue::Bool(v) => {
                w.put_u8(TAG_BOOL).put_u8(u8::from(*v));
            }
            AttrValue::ObjectPath(p) => {
                w.put_u8(TAG_OBJECT_PATH).put_string(p);
            }
            AttrValue::Time(t) => {
                w.put_u8(TAG_TIME).put_u64(*t);
            }
        }
    }

    fn decode(r: &mut FrameReader<'_>) -> Result<AttrValue, FrameError> {
        match r.get_u8()? {
            TAG_STRING => Ok(AttrValue::String(r.get_string()?.to_owned())),
            TAG_BYTES => Ok(AttrValue::Bytes(r.get_bytes()?.to_vec())),
            TAG_INT64 => Ok(AttrValue::Int64(r.get_i64()?)),
            TAG_BOOL => Ok(AttrValue::Bool(r.get_u8()? != 0)),
            TAG_OBJECT_PATH => Ok(AttrValue::ObjectPath(r.get_string()?.to_owned())),
            TAG_TIME => Ok(AttrValue::Time(r.get_u64()?)),
            tag => Err(FrameError::BadTag(tag)),
        }
    }
}

/// Ordered attribute bag describing one file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileInfo {
    attributes: Vec<(String, AttrValue)>,
}

impl FileInfo {
    /// An empty info.
    pub fn new() -> FileInfo {
        FileInfo::default()
    }

    /// Set an attribute, replacing an earlier value for the same key.
    pub fn set(&mut self, name: &str, value: AttrValue) {
        if let Some(slot) = self.attributes.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.attributes.push((name.to_owned(), value));
        }
    }

    /// Look up an attribute by qualified name.
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attributes.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of attributes set.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// True if no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Set the file name.
    pub fn set_name(&mut self, name: &str) {
        self.set(attrs::NAME, AttrValue::String(name.to_owned()));
    }

    /// The file name, when present.
    pub fn name(&self) -> Option<&str> {
        match self.get(attrs::NAME) {
            Some(AttrValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Set the file type.
    pub fn set_file_type(&mut self, file_type: FileType) {
        self.set(attrs::TYPE, AttrValue::Int64(file_type.code()));
    }

    /// The file type, when present.
    pub fn file_type(&self) -> Option<FileType> {
        match self.get(attrs::TYPE) {
            Some(AttrValue::Int64(code)) => Some(FileType::from_code(*code)),
            _ => None,
        }
    }

    /// Set the size in bytes.
    pub fn set_size(&mut self, size: u64) {
        self.set(attrs::SIZE, AttrValue::Int64(size as i64));
    }

    /// The size in bytes, when present.
    pub fn size(&self) -> Option<u64> {
        match self.get(attrs::SIZE) {
            Some(AttrValue::Int64(v)) => Some(*v as u64),
            _ => None,
        }
    }

    /// Encode as a wire struct: attribute count, then `(name, value)` pairs.
    pub fn encode(&self, w: &mut FrameWriter) {
        w.put_u32(self.attributes.len() as u32);
        for (name, value) in &self.attributes {
            w.put_string(name);
            value.encode(w);
        }
    }

    /// Decode one wire struct. An entry with no attributes parses to `None`;
    /// consumers skip such null entries silently.
    pub fn decode(r: &mut FrameReader<'_>) -> Result<Option<FileInfo>, FrameError> {
        let count = r.get_u32()? as usize;
        if count == 0 {
            return Ok(None);
        }
        let mut info = FileInfo::new();
        for _ in 0..count {
            let name = r.get_string()?.to_owned();
            let value = AttrValue::decode(r)?;
            info.attributes.push((name, value));
        }
        Ok(Some(info))
    }
}

/// Encode a batch of infos as a message body: count, then structs.
pub fn encode_infos(infos: &[FileInfo]) -> Vec<u8> {
    let mut w = FrameWriter::body();
    w.put_u32(infos.len() as u32);
    for info in infos {
        info.encode(&mut w);
    }
    w.finish()
}

/// Decode a batch body, silently skipping null entries.
pub fn decode_infos(body: &[u8]) -> Result<Vec<FileInfo>, FrameError> {
    let mut r = FrameReader::new(body);
    let count = r.get_u32()? as usize;
    let mut infos = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if let Some(info) = FileInfo::decode(&mut r)? {
            infos.push(info);
        }
    }
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> FileInfo {
        let mut info = FileInfo::new();
        info.set_name(name);
        info.set_file_type(FileType::RegularFile);
        info.set_size(42);
        info.set(attrs::TIME_MODIFIED, AttrValue::Time(1_700_000_000));
        info
    }

    #[test]
    fn batch_round_trip_preserves_order() {
        let batch = vec![sample("a"), sample("b"), sample("c")];
        let body = encode_infos(&batch);
        let decoded = decode_infos(&body).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn null_entries_are_skipped() {
        let mut w = FrameWriter::body();
        w.put_u32(3);
        sample("a").encode(&mut w);
        FileInfo::new().encode(&mut w); // null entry
        sample("b").encode(&mut w);
        let decoded = decode_infos(&w.finish()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].name(), Some("a"));
        assert_eq!(decoded[1].name(), Some("b"));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut info = sample("a");
        info.set_size(7);
        assert_eq!(info.size(), Some(7));
        assert_eq!(info.len(), 4);
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(
            FileType::from_mode(libc::S_IFDIR | 0o755),
            FileType::Directory
        );
        assert_eq!(
            FileType::from_mode(libc::S_IFREG | 0o644),
            FileType::RegularFile
        );
        assert_eq!(FileType::from_mode(libc::S_IFLNK), FileType::Symlink);
    }
}
