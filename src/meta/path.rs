//! Path Handling
//!
//! Turns raw request paths into canonical keys and classifies them against
//! the namespace layout. A canonical key is absolute, percent-decoded, has
//! no repeated or trailing slashes, and starts with the account name.

use crate::error::{MuskieError, MuskieResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// The fixed set of per-account root directories
static ROOT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/[^/]+(/(public|stor|reports|uploads))?$").expect("root regex")
});

/// Subtrees whose entries are backed by storage
static STORAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/[^/]+/(public|stor|reports|uploads)(/.*)?$").expect("storage regex")
});

/// Canonicalize a raw request path into a key.
///
/// Collapses repeated slashes, strips one trailing slash (except for the
/// account root itself), and percent-decodes. Anything that cannot become a
/// well-formed absolute key fails with `InvalidPath`.
pub fn normalize(raw: &str) -> MuskieResult<String> {
    if !raw.starts_with('/') {
        return Err(MuskieError::InvalidPath(raw.to_string()));
    }

    let decoded = urlencoding::decode(raw)
        .map_err(|_| MuskieError::InvalidPath(raw.to_string()))?
        .into_owned();
    if decoded.contains('\0') {
        return Err(MuskieError::InvalidPath(raw.to_string()));
    }

    let mut key = String::with_capacity(decoded.len());
    let mut last_was_slash = false;
    for ch in decoded.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        key.push(ch);
    }
    if key.len() > 1 && key.ends_with('/') {
        key.pop();
    }

    // an account segment must exist and path segments must be non-dot
    let mut segments = key.split('/').skip(1);
    let account = segments.next().unwrap_or("");
    if account.is_empty() {
        return Err(MuskieError::InvalidPath(raw.to_string()));
    }
    for segment in key.split('/').skip(1) {
        if segment == "." || segment == ".." {
            return Err(MuskieError::InvalidPath(raw.to_string()));
        }
    }

    Ok(key)
}

/// True for `/:account` and the fixed top-level directories under it
pub fn is_root(key: &str) -> bool {
    ROOT_RE.is_match(key)
}

/// True when the key lives in a storage-backed subtree
pub fn is_storage_path(key: &str) -> bool {
    STORAGE_RE.is_match(key)
}

/// The account segment of a canonical key
pub fn account_of(key: &str) -> &str {
    key.split('/').nth(1).unwrap_or("")
}

/// Parent directory of a canonical key. The account root is its own parent.
pub fn dirname(key: &str) -> String {
    match key.rsplit_once('/') {
        Some(("", _)) | None => key.to_string(),
        Some((dir, _)) => dir.to_string(),
    }
}

/// Final segment of a canonical key
pub fn basename(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, name)| name).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_and_strips() {
        assert_eq!(normalize("/alice//stor///x").unwrap(), "/alice/stor/x");
        assert_eq!(normalize("/alice/stor/dir/").unwrap(), "/alice/stor/dir");
        assert_eq!(normalize("/alice").unwrap(), "/alice");
        assert_eq!(normalize("/alice/").unwrap(), "/alice");
    }

    #[test]
    fn test_normalize_percent_decodes() {
        assert_eq!(
            normalize("/alice/stor/a%20file").unwrap(),
            "/alice/stor/a file"
        );
        assert_eq!(normalize("/alice/stor/%E2%98%83").unwrap(), "/alice/stor/☃");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize("alice/stor").is_err());
        assert!(normalize("//").is_err());
        assert!(normalize("/alice/stor/..").is_err());
        assert!(normalize("/alice/./x").is_err());
    }

    #[test]
    fn test_root_classification() {
        for key in ["/alice", "/alice/stor", "/alice/public", "/alice/reports", "/alice/uploads"] {
            assert!(is_root(key), "{key} should be a root");
        }
        for key in ["/alice/stor/x", "/alice/jobs", "/alice/stor/a/b"] {
            assert!(!is_root(key), "{key} should not be a root");
        }
    }

    #[test]
    fn test_storage_classification() {
        assert!(is_storage_path("/alice/stor"));
        assert!(is_storage_path("/alice/stor/deep/object"));
        assert!(is_storage_path("/alice/public/www"));
        assert!(!is_storage_path("/alice"));
        assert!(!is_storage_path("/alice/jobs/x"));
    }

    #[test]
    fn test_dirname_and_basename() {
        assert_eq!(dirname("/alice/stor/a/b"), "/alice/stor/a");
        assert_eq!(dirname("/alice/stor"), "/alice");
        assert_eq!(dirname("/alice"), "/alice");
        assert_eq!(basename("/alice/stor/a/b"), "b");
        assert_eq!(account_of("/alice/stor/x"), "alice");
    }
}
