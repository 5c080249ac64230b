//! Ordered file groups consumed as one logical stream.

use std::fmt;

use sha1::{Digest, Sha1};

/// Stable key for an ordered list of paths.
///
/// SHA-1 over the paths with a NUL separator, so `["a", "bc"]` and
/// `["ab", "c"]` never collide and order matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilesetKey(String);

impl FilesetKey {
    /// Hashes the ordered path list.
    pub fn from_paths<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut hasher = Sha1::new();
        for path in paths {
            hasher.update(path.as_ref().as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilesetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..12])
    }
}

/// Intent to consume a group of files in order, e.g. a multi-part archive.
///
/// Lives for the life of the torrent. `started` flips once its activation
/// priorities have been applied successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetIntent {
    pub started: bool,
    /// File-table indices, in consumption order.
    pub files: Vec<usize>,
}

impl FilesetIntent {
    /// Creates an intent that has not been activated yet.
    pub fn new(files: Vec<usize>) -> Self {
        Self {
            started: false,
            files,
        }
    }
}
