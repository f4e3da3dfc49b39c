//! Content addressing for blobs.

use sha1::{Digest, Sha1};

/// Git-style blob id: `sha1("blob " + byte_length + "\0" + content)`, hex encoded.
pub fn blob_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", bytes.len()).as_bytes());
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Blob id of UTF-8 text.
pub fn blob_hash_from_str(content: &str) -> String {
    blob_hash(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::{blob_hash, blob_hash_from_str};

    #[test]
    fn matches_git_object_ids() {
        assert_eq!(blob_hash(b""), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        assert_eq!(
            blob_hash_from_str("hello world\n"),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
    }
}
