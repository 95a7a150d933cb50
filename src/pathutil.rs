//! Path-string helpers for URL paths and sandbox joins.
//!
//! URL paths are handled as strings (segments separated by `/`) until the
//! moment they are joined onto a filesystem root; from there on
//! [`Path`]/[`PathBuf`] take over.

use crate::prelude::*;

/// Removes `.` and `..` segments and redundant separators from an URL path.
///
/// A `..` at the root is dropped rather than rejected, so the result never
/// escapes upwards. The leading `/` is always present in the output and a
/// trailing `/` is preserved, since Gemini distinguishes `/dir` from `/dir/`.
///
/// ```
/// # use fyr::pathutil::del_ups;
/// assert_eq!(del_ups("/a/../b"), "/b");
/// assert_eq!(del_ups("/../etc/passwd"), "/etc/passwd");
/// assert_eq!(del_ups("/pub/"), "/pub/");
/// ```
#[must_use]
pub fn del_ups(path: &str) -> String {
    let trailing = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    normalized.push_str(&segments.join("/"));
    if trailing && !segments.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Joins a normalized URL path onto a filesystem root.
///
/// The path must already have passed [`del_ups`]; no upward traversal is
/// possible from here.
#[must_use]
pub fn join(root: &Path, url_path: &str) -> PathBuf {
    let relative = url_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Strips a handler's base prefix from an URL path.
///
/// Returns `None` when the path does not live under the base. The boundary
/// must fall on a segment: base `/files` matches `/files` and `/files/x`,
/// never `/filesystem`.
#[must_use]
pub fn strip_base<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(base)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Component-wise containment check used by the realpath sandbox.
#[inline]
#[must_use]
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}

/// The parent of an URL path, with a trailing `/`.
///
/// `/a/b` and `/a/b/` both yield `/a/`; the root is its own parent.
#[must_use]
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => format!("{}/", &trimmed[..idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn del_ups_removes_up_dirs() {
        assert_eq!(del_ups("/a/../b"), "/b");
        assert_eq!(del_ups("/a/b/../../c"), "/c");
        assert_eq!(del_ups("/a/./b"), "/a/b");
    }

    #[test]
    fn del_ups_is_rooted() {
        assert_eq!(del_ups("/../etc/passwd"), "/etc/passwd");
        assert_eq!(del_ups("/../../.."), "/");
        assert_eq!(del_ups(""), "/");
    }

    #[test]
    fn del_ups_keeps_trailing_slash() {
        assert_eq!(del_ups("/pub/"), "/pub/");
        assert_eq!(del_ups("/a/../pub/"), "/pub/");
        assert_eq!(del_ups("/"), "/");
    }

    #[test]
    fn del_ups_collapses_separators() {
        assert_eq!(del_ups("//a///b"), "/a/b");
    }

    #[test]
    fn del_ups_is_idempotent() {
        for path in ["/a/../b", "/x//y/./", "/..", "/a/b/c"] {
            let once = del_ups(path);
            assert_eq!(del_ups(&once), once);
        }
    }

    #[test]
    fn join_stays_under_root() {
        assert_eq!(join(Path::new("/srv"), "/x/y"), PathBuf::from("/srv/x/y"));
        assert_eq!(join(Path::new("/srv"), "/"), PathBuf::from("/srv"));
    }

    #[test]
    fn strip_base_respects_boundaries() {
        assert_eq!(strip_base("/files/a", "/files"), Some("/a"));
        assert_eq!(strip_base("/files", "/files"), Some("/"));
        assert_eq!(strip_base("/filesystem", "/files"), None);
        assert_eq!(strip_base("/a", ""), Some("/a"));
        assert_eq!(strip_base("/other", "/files"), None);
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent("/a/b"), "/a/");
        assert_eq!(parent("/a/b/"), "/a/");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
    }

    #[test]
    fn containment() {
        assert!(is_within(Path::new("/srv"), Path::new("/srv/a/b")));
        assert!(!is_within(Path::new("/srv"), Path::new("/srvx/a")));
        assert!(!is_within(Path::new("/srv"), Path::new("/etc/passwd")));
    }
}
