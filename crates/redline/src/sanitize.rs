//! Helpers for sanitizing data before it enters log fields or messages
//! returned to clients.
//!
//! Logs are safe to share for debugging: these functions ensure storage
//! paths and raw upload names do not leak into spans or job records.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Longest message stored in a job's `error_message`.
const MAX_PUBLIC_MESSAGE_LEN: usize = 300;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Reduces a client supplied file name to a safe display name.
///
/// Directory components are dropped, control characters removed and the
/// result capped at 255 bytes. Falls back to `document` when nothing
/// printable remains.
pub fn display_name(original: &str) -> String {
    let last = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original)
        .trim();

    let mut cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    if cleaned.trim_matches('.').is_empty() {
        return "document".to_string();
    }

    while cleaned.len() > 255 {
        cleaned.pop();
    }
    cleaned
}

/// Strips absolute paths and stack detail from a message before it is shown
/// to a client.
///
/// Only the first line is kept. Any whitespace separated token that looks
/// like an absolute path is replaced by its file name.
pub fn public_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();

    let mut out = first_line
        .split(' ')
        .map(|token| {
            let trimmed = token.trim_matches(|c| c == '\'' || c == '"' || c == ':');
            if trimmed.starts_with('/') || trimmed.contains(":\\") {
                token.replace(trimmed, &redact_path(Path::new(trimmed)))
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if out.len() > MAX_PUBLIC_MESSAGE_LEN {
        let mut cut = MAX_PUBLIC_MESSAGE_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push('…');
    }
    out
}

/// Returns a short deterministic hash of a path for correlation without
/// exposing the actual path.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let hash = hasher.finish();
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/home/user/Documents/essay.docx")),
            "essay.docx"
        );
    }

    #[test]
    fn test_redact_path_no_filename() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_display_name_drops_directories() {
        assert_eq!(display_name("../../etc/passwd"), "passwd");
        assert_eq!(display_name("C:\\Users\\me\\thesis.docx"), "thesis.docx");
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(display_name(".."), "document");
        assert_eq!(display_name("dir/"), "document");
        assert_eq!(display_name("\u{0007}"), "document");
    }

    #[test]
    fn test_display_name_caps_length() {
        let long = "a".repeat(400);
        assert_eq!(display_name(&long).len(), 255);
    }

    #[test]
    fn test_public_message_strips_paths_and_lines() {
        let msg = "failed to open '/srv/redline/storage/upload/abc': denied\n  at frame 1";
        assert_eq!(public_message(msg), "failed to open 'abc': denied");
    }

    #[test]
    fn test_public_message_truncates() {
        let msg = "x".repeat(1000);
        let out = public_message(&msg);
        assert!(out.chars().count() <= MAX_PUBLIC_MESSAGE_LEN + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn test_hash_path_deterministic() {
        let path = PathBuf::from("/srv/storage/upload/1");
        assert_eq!(hash_path(&path), hash_path(&path));
        assert_eq!(hash_path(&path).len(), 16);
    }
}
