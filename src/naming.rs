//! Project directory to container name mapping.
//!
//! The container name is derived from the last path component of the project
//! directory, sanitized for Docker. When two directories share a basename the
//! second gets a stable hash suffix derived from its absolute path, so the
//! mapping stays injective.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Prefix applied to every managed container name.
pub const CONTAINER_PREFIX: &str = "boxctl-";

/// Number of hex characters in the collision-escape suffix.
const HASH_SUFFIX_LEN: usize = 8;

/// Sanitize an arbitrary string into a Docker-safe name fragment:
/// lowercase, runs of non-alphanumerics collapsed to a single `-`, and no
/// leading or trailing `-`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    out
}

/// First 8 hex chars of a stable hash of the absolute project path.
pub fn path_hash(project_dir: &Path) -> String {
    let digest = Sha256::digest(project_dir.to_string_lossy().as_bytes());
    hex::encode(digest)[..HASH_SUFFIX_LEN].to_string()
}

fn project_basename(project_dir: &Path) -> String {
    project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Derive the container name for a project directory, without the collision
/// escape.
pub fn container_name(project_dir: &Path) -> String {
    format!("{CONTAINER_PREFIX}{}", sanitize_name(&project_basename(project_dir)))
}

/// Derive the collision-escaped container name for a project directory.
pub fn hashed_container_name(project_dir: &Path) -> String {
    format!(
        "{CONTAINER_PREFIX}{}-{}",
        sanitize_name(&project_basename(project_dir)),
        path_hash(project_dir)
    )
}

/// Resolve the container name for `project_dir`, applying the collision
/// escape when an existing container with the plain name records a different
/// origin directory.
pub fn resolve_container_name(project_dir: &Path, recorded_origin: Option<&str>) -> String {
    match recorded_origin {
        Some(origin) if Path::new(origin) != project_dir => hashed_container_name(project_dir),
        _ => container_name(project_dir),
    }
}

/// Extract the project name from a managed container name. Returns `None`
/// for containers without the managed prefix. A trailing `-xxxxxxxx` hash
/// suffix is stripped.
pub fn extract_project_name(container: &str) -> Option<String> {
    let rest = container.strip_prefix(CONTAINER_PREFIX)?;
    if rest.is_empty() {
        return None;
    }

    if let Some((stem, suffix)) = rest.rsplit_once('-') {
        if suffix.len() == HASH_SUFFIX_LEN
            && suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            && !stem.is_empty()
        {
            return Some(stem.to_string());
        }
    }

    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_name("My Project"), "my-project");
        assert_eq!(sanitize_name("foo_bar.baz"), "foo-bar-baz");
        assert_eq!(sanitize_name("--weird--"), "weird");
        assert_eq!(sanitize_name("a///b"), "a-b");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for input in ["My Project", "foo_bar", "ALL-CAPS", "..dots..", "a1-b2"] {
            let once = sanitize_name(input);
            assert_eq!(sanitize_name(&once), once);
        }
    }

    #[test]
    fn test_sanitize_charset_and_length() {
        for input in ["Ünïcode Näme", "tabs\t\tand spaces", "x"] {
            let out = sanitize_name(input);
            assert!(out.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            assert!(!out.starts_with('-') && !out.ends_with('-'));
            assert!(out.len() <= input.len());
        }
    }

    #[test]
    fn test_container_name() {
        let dir = PathBuf::from("/home/dev/My Project");
        assert_eq!(container_name(&dir), "boxctl-my-project");
    }

    #[test]
    fn test_round_trip() {
        for raw in ["api-server", "Data Pipeline", "web.ui"] {
            let dir = PathBuf::from(format!("/work/{raw}"));
            let name = container_name(&dir);
            assert_eq!(extract_project_name(&name).unwrap(), sanitize_name(raw));
        }
    }

    #[test]
    fn test_round_trip_with_hash_suffix() {
        let dir = PathBuf::from("/somewhere/else/api-server");
        let name = hashed_container_name(&dir);
        assert_eq!(extract_project_name(&name).unwrap(), "api-server");
    }

    #[test]
    fn test_hash_is_stable_and_differs_by_path() {
        let a = PathBuf::from("/home/a/proj");
        let b = PathBuf::from("/home/b/proj");
        assert_eq!(path_hash(&a), path_hash(&a));
        assert_ne!(path_hash(&a), path_hash(&b));
        assert_eq!(path_hash(&a).len(), 8);
    }

    #[test]
    fn test_resolve_applies_escape_only_on_foreign_origin() {
        let dir = PathBuf::from("/home/a/proj");
        assert_eq!(resolve_container_name(&dir, None), "boxctl-proj");
        assert_eq!(
            resolve_container_name(&dir, Some("/home/a/proj")),
            "boxctl-proj"
        );
        let escaped = resolve_container_name(&dir, Some("/home/b/proj"));
        assert!(escaped.starts_with("boxctl-proj-"));
        assert_eq!(escaped.len(), "boxctl-proj-".len() + 8);
    }

    #[test]
    fn test_extract_ignores_foreign_containers() {
        assert_eq!(extract_project_name("postgres"), None);
        assert_eq!(extract_project_name("boxctl-"), None);
        assert_eq!(extract_project_name("boxctl-web"), Some("web".to_string()));
    }
}
