use std::fmt::{Debug, Display};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used as the content descriptor of input files.
///
/// Input file dependencies reported by tasks are remembered together with
/// this fingerprint, a later build compares it against the current content to
/// decide whether the task has to run again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// A file read by a task, together with its content hash.
#[derive(Clone, Debug)]
pub struct FileContent {
    pub path: Utf8PathBuf,
    pub bytes: Arc<[u8]>,
    pub hash: Hash32,
}

impl FileContent {
    pub fn new(path: impl Into<Utf8PathBuf>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            path: path.into(),
            hash: Hash32::hash(&bytes),
            bytes,
        }
    }

    pub fn parent(&self) -> &Utf8Path {
        self.path.parent().unwrap_or(Utf8Path::new("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_lowercase_and_full_length() {
        let hash = Hash32::from([0xABu8; 32]);
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("abab"));
    }

    #[test]
    fn test_file_content_hash_matches_buffer() {
        let file = FileContent::new("/tmp/build.kmk", b"targets".to_vec());

        assert_eq!(file.hash, Hash32::hash(b"targets"));
        assert_eq!(file.parent(), Utf8Path::new("/tmp"));
    }
}
