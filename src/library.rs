//! MCP server and skill catalog enumeration.
//!
//! The library itself (install requirements, sync) lives outside the daemon;
//! completions only need the entry names, which are the subdirectory names
//! under `<boxctl_dir>/library/{mcp,skills}`.

use std::path::Path;

/// Names of MCP servers available in the library. Errors read as an empty
/// catalog.
pub fn list_mcp_servers(boxctl_dir: &Path) -> Vec<String> {
    list_entries(&boxctl_dir.join("library").join("mcp"))
}

/// Names of skills available in the library.
pub fn list_skills(boxctl_dir: &Path) -> Vec<String> {
    list_entries(&boxctl_dir.join("library").join("skills"))
}

fn list_entries(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_mcp_servers(dir.path()).is_empty());
        assert!(list_skills(dir.path()).is_empty());
    }

    #[test]
    fn test_lists_directory_names_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let mcp = dir.path().join("library").join("mcp");
        std::fs::create_dir_all(mcp.join("playwright")).unwrap();
        std::fs::create_dir_all(mcp.join("context7")).unwrap();
        std::fs::create_dir_all(mcp.join(".hidden")).unwrap();
        std::fs::write(mcp.join("notes.txt"), "x").unwrap();

        assert_eq!(
            list_mcp_servers(dir.path()),
            vec!["context7".to_string(), "playwright".to_string()]
        );
    }
}
