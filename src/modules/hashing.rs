//! Versioned content digests for parser invariants.
//!
//! Every hash incorporates the handler version and any extra identity
//! fields, each terminated by a NUL delimiter, so a handler upgrade or an
//! identity change invalidates prior digests. File hashing streams in fixed
//! blocks; whole trees are never buffered.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::error::RagmillError;

const DELIMITER: &[u8] = b"\x00";
const FILE_CHUNK_SIZE: usize = 128 * 1024;

/// Compute a stable hex digest over `payloads`, prefixed by the handler
/// version and `extra` identity fields.
pub fn hash_stream<I, P>(handler_version: &str, extra: &[&[u8]], payloads: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut digest = Sha256::new();
    digest.update(handler_version.as_bytes());
    digest.update(DELIMITER);
    for field in extra {
        digest.update(field);
        digest.update(DELIMITER);
    }
    for payload in payloads {
        let bytes = payload.as_ref();
        if !bytes.is_empty() {
            digest.update(bytes);
        }
    }
    format!("{:x}", digest.finalize())
}

/// Hash a file's contents using streaming IO.
pub fn hash_file(path: &Path, handler_version: &str, extra: &[&[u8]]) -> Result<String, RagmillError> {
    let mut digest = Sha256::new();
    digest.update(handler_version.as_bytes());
    digest.update(DELIMITER);
    for field in extra {
        digest.update(field);
        digest.update(DELIMITER);
    }

    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
    }
    Ok(format!("{:x}", digest.finalize()))
}

/// Hash a text payload after normalizing to UTF-8 bytes.
pub fn hash_text(text: &str, handler_version: &str, extra: &[&str]) -> String {
    let extra_bytes: Vec<&[u8]> = extra.iter().map(|value| value.as_bytes()).collect();
    hash_stream(handler_version, &extra_bytes, [text.as_bytes()])
}

/// Plain sha256 hex of raw bytes (file checksums in handler metadata).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut digest = Sha256::new();
    digest.update(bytes);
    format!("{:x}", digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_changes_digest() {
        let a = hash_text("body", "1.0.0", &[]);
        let b = hash_text("body", "1.0.1", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_extra_fields_change_digest() {
        let a = hash_text("body", "1.0.0", &["chunk-a"]);
        let b = hash_text("body", "1.0.0", &["chunk-b"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_hash_matches_stream_hash() {
        let dir = std::env::temp_dir().join(format!("ragmill-hash-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.txt");
        std::fs::write(&path, b"streaming payload").unwrap();
        let from_file = hash_file(&path, "1.0.0", &[b"rel.txt"]).unwrap();
        let from_stream = hash_stream("1.0.0", &[b"rel.txt"], [b"streaming payload".as_slice()]);
        assert_eq!(from_file, from_stream);
        let _ = std::fs::remove_dir_all(dir);
    }
}
