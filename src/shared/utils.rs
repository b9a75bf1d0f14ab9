//! Path and name helpers

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Unicode-normalized (NFC) form of a file name, used for all name equality
/// checks between the two replicas.
pub fn normalized_name(name: &str) -> String {
    name.nfc().collect()
}

/// Number of components in a relative path.
pub fn path_depth(path: &Path) -> usize {
    path.components().count()
}

/// True when `path` equals `ancestor` or lives below it.
pub fn is_descendant_or_equal(path: &Path, ancestor: &Path) -> bool {
    path.starts_with(ancestor)
}

/// Append a conflict marker to a file name, keeping the extension:
/// `report.txt` becomes `report (conflict 20250114-103000).txt`.
pub fn conflicted_name(name: &str, now: DateTime<Utc>) -> String {
    let marker = format!(" (conflict {})", now.format("%Y%m%d-%H%M%S"));
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{marker}.{ext}"),
        _ => format!("{name}{marker}"),
    }
}

/// Random alphanumeric suffix used to break operation cycles.
pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Join a parent path and a name without touching either.
pub fn join_name(parent: &Path, name: &str) -> PathBuf {
    if parent.as_os_str().is_empty() {
        PathBuf::from(name)
    } else {
        parent.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn nfc_normalization_unifies_decomposed_names() {
        // "é" precomposed vs "e" + combining acute
        assert_eq!(normalized_name("caf\u{00e9}"), normalized_name("cafe\u{0301}"));
    }

    #[test]
    fn conflicted_name_keeps_extension() {
        let at = Utc.with_ymd_and_hms(2025, 1, 14, 10, 30, 0).unwrap();
        assert_eq!(
            conflicted_name("report.txt", at),
            "report (conflict 20250114-103000).txt"
        );
        assert_eq!(
            conflicted_name("Makefile", at),
            "Makefile (conflict 20250114-103000)"
        );
        // A leading dot is not an extension separator
        assert_eq!(
            conflicted_name(".env", at),
            ".env (conflict 20250114-103000)"
        );
    }

    #[test]
    fn descendant_check() {
        assert!(is_descendant_or_equal(Path::new("a/b/c"), Path::new("a/b")));
        assert!(is_descendant_or_equal(Path::new("a/b"), Path::new("a/b")));
        assert!(!is_descendant_or_equal(Path::new("a/bc"), Path::new("a/b")));
    }

    #[test]
    fn depth_of_relative_paths() {
        assert_eq!(path_depth(Path::new("")), 0);
        assert_eq!(path_depth(Path::new("a")), 1);
        assert_eq!(path_depth(Path::new("a/b/c")), 3);
    }
}
