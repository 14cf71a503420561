//! Canonical JSON serialization and content digests.
//!
//! Every document that participates in a capsule or release digest is
//! serialized through [`to_canonical_json`]: the value is first lowered into
//! a [`serde_json::Value`] tree (whose object maps keep keys in sorted
//! order) and then emitted with two-space indentation and no trailing
//! newline. Key order, whitespace, and escaping are therefore identical no
//! matter which struct produced the document or in what order its fields
//! were populated.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serializes a value to canonical JSON bytes.
///
/// # Errors
///
/// Returns a [`serde_json::Error`] if the value cannot be represented as
/// JSON (e.g. a map with non-string keys).
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    // Round-trip through a value tree so object keys come out sorted
    // regardless of struct field order.
    let tree = serde_json::to_value(value)?;
    serde_json::to_vec_pretty(&tree)
}

/// Computes the `sha256:<hex>` digest string over a byte slice.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Computes the bare hex SHA-256 of a file's contents, streaming.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Reversed {
        zulu: u32,
        alpha: u32,
    }

    #[test]
    fn object_keys_are_sorted() {
        let bytes = to_canonical_json(&Reversed { zulu: 1, alpha: 2 }).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zulu").unwrap());
    }

    #[test]
    fn hash_map_order_does_not_matter() {
        let mut a = HashMap::new();
        a.insert("b", 1);
        a.insert("a", 2);
        a.insert("c", 3);
        let mut b = HashMap::new();
        b.insert("c", 3);
        b.insert("a", 2);
        b.insert("b", 1);
        assert_eq!(
            to_canonical_json(&a).unwrap(),
            to_canonical_json(&b).unwrap()
        );
    }

    #[test]
    fn no_trailing_newline() {
        let bytes = to_canonical_json(&serde_json::json!({"k": "v"})).unwrap();
        assert_ne!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn digest_is_prefixed_and_stable() {
        let d = digest(b"metaclaw");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
        assert_eq!(d, digest(b"metaclaw"));
    }

    #[test]
    fn sha256_file_matches_digest_of_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"capsule contents").unwrap();
        drop(f);

        let hashed = sha256_file(&path).unwrap();
        assert_eq!(format!("sha256:{hashed}"), digest(b"capsule contents"));
    }
}
