//! Filename derivation, sanitization, and unique destination resolution.

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use url::Url;

/// Name used when neither the resolver nor the URL yields anything usable.
const FALLBACK_FILENAME: &str = "download.bin";

/// Highest numeric suffix tried before falling back to a timestamp.
const MAX_SUFFIX: usize = 1000;

/// Picks the file name for a submission: the resolver's suggestion when it
/// survives sanitization, otherwise the last URL path segment.
#[must_use]
pub fn choose_filename(suggested: Option<&str>, url: &Url) -> String {
    suggested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(sanitize_filename)
        .filter(|name| !name.trim_matches('_').is_empty())
        .unwrap_or_else(|| filename_from_url(url))
}

/// Sanitizes a filename for safe filesystem use.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

/// Resolves a destination path under `dir` that neither exists on disk nor is
/// reserved by another download, adding `_N` before the extension when needed.
///
/// Destinations only appear on disk after a merge, so in-flight downloads must
/// be reported through `is_reserved`.
pub fn resolve_unique_path<F>(dir: &Path, filename: &str, is_reserved: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            FALLBACK_FILENAME.to_string()
        } else {
            sanitized
        }
    };
    let taken = |path: &Path| path.exists() || is_reserved(path);

    let base_path = dir.join(&filename);
    if !taken(&base_path) {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename.as_str(), ""),
    };

    for i in 1..MAX_SUFFIX {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !taken(&candidate) {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Last percent-decoded URL path segment, or `download.bin`.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    let Some(last) = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|last| !last.is_empty())
    else {
        return FALLBACK_FILENAME.to_string();
    };

    let decoded = urlencoding::decode(last).map_or_else(
        |e| {
            debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
            last.to_string()
        },
        std::borrow::Cow::into_owned,
    );
    let sanitized = sanitize_filename(&decoded);
    if sanitized.trim_matches('_').is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use tempfile::TempDir;

    fn never(_: &Path) -> bool {
        false
    }

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.iso"), "file_name.iso");
        assert_eq!(sanitize_filename("file\\name.iso"), "file_name.iso");
        assert_eq!(sanitize_filename("file:name.iso"), "file_name.iso");
        assert_eq!(sanitize_filename("file<name>.iso"), "file_name_.iso");
        assert_eq!(sanitize_filename("a\u{0}b"), "a_b");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "__");
    }

    #[test]
    fn test_sanitize_filename_preserves_unicode() {
        assert_eq!(sanitize_filename("映画 (1).mp4"), "映画 (1).mp4");
    }

    #[test]
    fn test_filename_from_url_decodes_last_segment() {
        let url = Url::parse("https://cdn.example.com/media/my%20video.mp4?token=abc").unwrap();
        assert_eq!(filename_from_url(&url), "my video.mp4");
    }

    #[test]
    fn test_filename_from_url_without_path_falls_back() {
        let url = Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(filename_from_url(&url), "download.bin");
    }

    #[test]
    fn test_choose_filename_prefers_suggestion() {
        let url = Url::parse("https://cdn.example.com/abc123").unwrap();
        assert_eq!(choose_filename(Some("Holiday.mp4"), &url), "Holiday.mp4");
        assert_eq!(choose_filename(Some("   "), &url), "abc123");
        assert_eq!(choose_filename(None, &url), "abc123");
    }

    #[test]
    fn test_resolve_unique_path_no_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let path = resolve_unique_path(temp_dir.path(), "video.mp4", never);
        assert_eq!(path, temp_dir.path().join("video.mp4"));
    }

    #[test]
    fn test_resolve_unique_path_skips_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("video.mp4"), b"1").unwrap();
        std::fs::write(temp_dir.path().join("video_1.mp4"), b"2").unwrap();

        let path = resolve_unique_path(temp_dir.path(), "video.mp4", never);
        assert_eq!(path, temp_dir.path().join("video_2.mp4"));
    }

    #[test]
    fn test_resolve_unique_path_skips_reserved_paths() {
        let temp_dir = TempDir::new().unwrap();
        let reserved: HashSet<PathBuf> = [temp_dir.path().join("video.mp4")].into_iter().collect();

        let path = resolve_unique_path(temp_dir.path(), "video.mp4", |p| reserved.contains(p));
        assert_eq!(path, temp_dir.path().join("video_1.mp4"));
    }

    #[test]
    fn test_resolve_unique_path_stays_under_dir() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        for malicious in ["../../etc/passwd", "..", "a/\\b\\c"] {
            let path = resolve_unique_path(base, malicious, never);
            assert!(path.starts_with(base), "escaped: {}", path.display());
            assert!(!path.components().any(|c| c == Component::ParentDir));
        }
    }

    #[test]
    fn test_resolve_unique_path_dotfile_keeps_name() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(".hidden"), b"1").unwrap();
        let path = resolve_unique_path(temp_dir.path(), ".hidden", never);
        assert_eq!(path, temp_dir.path().join(".hidden_1"));
    }
}
