//! Content-addressed destination layout: a digest maps to a sharded key
//! whose leading directories are the first `depth` characters of the
//! digest, one character per level, keeping any single destination
//! directory from growing unbounded.

/// Build the destination key for a digest. The stored name is the full
/// digest plus the original file extension, so the key stays unique per
/// content regardless of how many sources share it.
///
/// `depth` is clamped to the digest length; a digest shorter than the
/// configured depth simply nests less deep. Keys use `/` separators on
/// every platform since they also serve as object-store keys.
pub fn dest_key(digest: &str, extension: &str, depth: usize) -> String {
    let depth = depth.min(digest.len());
    let mut key = String::with_capacity(digest.len() * 2 + extension.len() + depth);
    for ch in digest.chars().take(depth) {
        key.push(ch);
        key.push('/');
    }
    key.push_str(digest);
    key.push_str(extension);
    key
}

/// Recover the digest from a destination key: the final path segment with
/// the extension stripped. Returns `None` for keys that do not look like
/// content-addressed entries (empty stem, or a stem that is not hex).
pub fn digest_from_key(key: &str) -> Option<String> {
    let name = key.rsplit('/').next()?;
    let stem = match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    };
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(stem.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_by_leading_characters() {
        assert_eq!(
            dest_key("ab12cd34ef56ab12cd34ef56ab12cd34", ".jpg", 3),
            "a/b/1/ab12cd34ef56ab12cd34ef56ab12cd34.jpg"
        );
    }

    #[test]
    fn zero_depth_is_flat() {
        assert_eq!(dest_key("abcdef", ".txt", 0), "abcdef.txt");
    }

    #[test]
    fn depth_clamped_to_digest_length() {
        assert_eq!(dest_key("ab", "", 5), "a/b/ab");
    }

    #[test]
    fn empty_extension_supported() {
        assert_eq!(dest_key("abcd", "", 2), "a/b/abcd");
    }

    #[test]
    fn same_content_same_key() {
        let a = dest_key("5eb63bbbe01eeed093cb22bb8f5acdc3", ".txt", 3);
        let b = dest_key("5eb63bbbe01eeed093cb22bb8f5acdc3", ".txt", 3);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_recovered_from_key() {
        assert_eq!(
            digest_from_key("a/b/1/ab12cd34ef56ab12cd34ef56ab12cd34.jpg").as_deref(),
            Some("ab12cd34ef56ab12cd34ef56ab12cd34")
        );
        assert_eq!(
            digest_from_key("abcdef").as_deref(),
            Some("abcdef")
        );
    }

    #[test]
    fn non_content_keys_rejected() {
        assert_eq!(digest_from_key("metadata/job/2026/08/backup.csv"), None);
        assert_eq!(digest_from_key("a/b/.hidden"), None);
        assert_eq!(digest_from_key(""), None);
    }
}
