//! Mount model: specs, resolved mounts, credentials, and the registry.
//!
//! A [`MountSpec`] identifies a mountable target by typed key→value pairs
//! (`{type: "sftp", host: "h", user: "u"}`). Once a backend has mounted it,
//! the pairing of bus address and spec is published to the mount registry as
//! a [`MountRef`], making the mount addressable by clients. Mount-spec
//! parsing and the registry service itself are external; only their
//! surfaces appear here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::wire::FrameError;
use crate::wire::FrameReader;
use crate::wire::FrameWriter;

/// Immutable key→value identifier of a mount target. Cheap to clone; all
/// clones share one allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountSpec {
    inner: Arc<BTreeMap<String, String>>,
}

impl MountSpec {
    /// Create a spec of the given type (the `type` key).
    pub fn new(mount_type: &str) -> MountSpec {
        let mut map = BTreeMap::new();
        map.insert("type".to_owned(), mount_type.to_owned());
        MountSpec {
            inner: Arc::new(map),
        }
    }

    /// Set a key. Copies on write if the spec is already shared.
    pub fn set(&mut self, key: &str, value: &str) {
        Arc::make_mut(&mut self.inner).insert(key.to_owned(), value.to_owned());
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    /// The `type` key. Every well-formed spec has one.
    pub fn mount_type(&self) -> Option<&str> {
        self.get("type")
    }

    /// Keys and values in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode as a wire struct: pair count, then string pairs.
    pub fn encode(&self, w: &mut FrameWriter) {
        w.put_u32(self.inner.len() as u32);
        for (key, value) in self.inner.iter() {
            w.put_string(key);
            w.put_string(value);
        }
    }

    /// Decode a wire struct written by [`MountSpec::encode`].
    pub fn decode(r: &mut FrameReader<'_>) -> std::result::Result<MountSpec, FrameError> {
        let count = r.get_u32()? as usize;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = r.get_string()?.to_owned();
            let value = r.get_string()?.to_owned();
            map.insert(key, value);
        }
        Ok(MountSpec {
            inner: Arc::new(map),
        })
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.inner.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// The resolved locator for a mounted target, shared by every client that
/// has the mount open.
#[derive(Clone, Debug)]
pub struct MountRef {
    /// Bus peer owning the backend.
    pub peer_id: String,
    /// Object path the backend serves jobs on.
    pub object_path: String,
    /// The spec the backend mounted.
    pub spec: MountSpec,
    /// Preferred filename encoding; `None` means UTF-8.
    pub filename_encoding: Option<String>,
}

/// The mount-registry service interface. The real registry is a bus peer;
/// registration is a blocking call from the mount job's reply path.
pub trait MountRegistry: Send + Sync {
    /// Publish a live mount. On success the mount is addressable by clients.
    fn register(&self, mount: &MountRef) -> Result<()>;

    /// Withdraw a mount after backend teardown.
    fn unregister(&self, object_path: &str);
}

bitflags! {
    /// What a credential prompt is asking for.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AskPasswordFlags: u32 {
        /// A password (or key passphrase) is required.
        const NEED_PASSWORD = 1 << 0;
        /// A username is required.
        const NEED_USERNAME = 1 << 1;
        /// The source may offer to persist the credential.
        const SAVING_SUPPORTED = 1 << 2;
    }
}

/// Where the user asked a provided credential to be stored. Storage itself
/// is external; the value is carried opaquely.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PasswordSave {
    /// Do not store.
    #[default]
    Never,
    /// Keep for this login session.
    ForSession,
    /// Store permanently.
    Permanently,
}

/// Outcome of a password prompt.
#[derive(Clone, Debug, Default)]
pub struct PasswordReply {
    /// The user dismissed the dialog.
    pub cancelled: bool,
    /// The password, when provided.
    pub password: Option<String>,
    /// A changed username, when provided.
    pub username: Option<String>,
    /// Requested storage disposition.
    pub save: PasswordSave,
}

/// Outcome of a yes/no prompt (host-key trust).
#[derive(Clone, Copy, Debug, Default)]
pub struct QuestionReply {
    /// The user dismissed the dialog.
    pub cancelled: bool,
    /// The affirmative choice.
    pub answer: bool,
}

/// Client-side credential source driving interactive login. Only used and
/// set during mount.
pub trait MountSource: Send + Sync {
    /// Ask for a password. `default_user` seeds the username field.
    fn ask_password(
        &self,
        prompt: &str,
        default_user: &str,
        flags: AskPasswordFlags,
    ) -> PasswordReply;

    /// Ask a yes/no question, e.g. whether to trust an unknown host key.
    fn ask_question(&self, prompt: &str) -> QuestionReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_round_trip() {
        let mut spec = MountSpec::new("sftp");
        spec.set("host", "h");
        spec.set("user", "u");

        let mut w = FrameWriter::body();
        spec.encode(&mut w);
        let body = w.finish();
        let decoded = MountSpec::decode(&mut FrameReader::new(&body)).unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(decoded.mount_type(), Some("sftp"));
        assert_eq!(decoded.get("host"), Some("h"));
    }

    #[test]
    fn clones_share_until_written() {
        let mut spec = MountSpec::new("sftp");
        spec.set("host", "h");
        let shared = spec.clone();
        spec.set("host", "other");
        assert_eq!(shared.get("host"), Some("h"));
        assert_eq!(spec.get("host"), Some("other"));
    }
}
