//! Key to path transforms.

use crate::SHARD_WIDTH;
use sha1::{Digest, Sha1};

/// Location of an object relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// Slash-joined directory segments
    pub path_name: String,
    /// Leaf file name
    pub file_name: String,
}

impl PathKey {
    /// Top-level directory under the store root.
    ///
    /// Deleting a key removes this whole directory.
    #[must_use]
    pub fn first_segment(&self) -> &str {
        self.path_name
            .split('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.path_name)
    }

    /// `path_name/file_name`
    #[must_use]
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }
}

/// Pure mapping from a user key to its on-disk location.
pub type PathTransform = fn(&str) -> PathKey;

/// Content-addressed layout.
///
/// The SHA-1 hex digest of the key is split into 5-character directory
/// segments; the full digest is the file name.
#[must_use]
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = digest
        .as_bytes()
        .chunks(SHARD_WIDTH)
        // hex output is ASCII, every chunk is valid UTF-8
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();

    PathKey {
        path_name: segments.join("/"),
        file_name: digest,
    }
}

/// Identity layout: the key is both the directory and the file name.
#[must_use]
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}
