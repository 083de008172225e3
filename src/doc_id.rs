use std::path::Path;

use sha2::{Digest, Sha256};

/// A stable document identifier derived from the document's absolute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId {
    /// The numeric ID used as the key in redb tables and the lexical index.
    pub numeric: u64,
}

impl DocumentId {
    /// First eight bytes of SHA-256 over the path, big-endian.
    pub fn from_path(path: &Path) -> Self {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self {
            numeric: u64::from_be_bytes(bytes),
        }
    }

    /// The short hex string for human display (e.g. "a1b2c3").
    pub fn short(&self) -> String {
        format!("{:016x}", self.numeric)[..6].to_string()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short())
    }
}

/// Lowercase hex encoding of a digest.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn deterministic() {
        let a = DocumentId::from_path(Path::new("/docs/hello.md"));
        let b = DocumentId::from_path(&PathBuf::from("/docs/hello.md"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_paths_differ() {
        let a = DocumentId::from_path(Path::new("/docs/hello.md"));
        let b = DocumentId::from_path(Path::new("/docs/world.md"));
        assert_ne!(a.numeric, b.numeric);
    }

    #[test]
    fn display_has_hash_prefix() {
        let id = DocumentId::from_path(Path::new("/docs/hello.md"));
        let s = id.to_string();
        assert!(s.starts_with('#'));
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn hex_encodes_lowercase() {
        assert_eq!(hex(&[0x00, 0xab, 0x0f]), "00ab0f");
    }
}
