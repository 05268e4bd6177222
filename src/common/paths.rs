//! Configuration and source paths
//!
//! The config location comes from the `directories` crate:
//! - Linux: `~/.config/dap-bridge/`
//! - macOS: `~/Library/Application Support/dap-bridge/`
//! - Windows: `%APPDATA%\dap-bridge\`

use std::path::{Component, Path, PathBuf};

/// Application name used for platform directories
const APP_NAME: &str = "dap-bridge";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Resolve a source path to the form used as breakpoint table key
///
/// Existing files are canonicalized. Paths that don't exist (yet) are made
/// absolute against the working directory and cleaned lexically, so a client
/// and the execution engine agree on the key either way.
pub fn normalize_source(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_is_valid() {
        let dir = config_dir();
        assert!(dir.is_some());
    }

    #[test]
    fn test_normalize_missing_path_is_absolute_and_clean() {
        let path = normalize_source(Path::new("no/such/./dir/../file.txt"));
        assert!(path.is_absolute());
        assert!(path.ends_with("no/such/file.txt"));
    }

    #[test]
    fn test_normalize_existing_file_matches_canonical() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = std::fs::canonicalize(file.path()).unwrap();
        assert_eq!(normalize_source(file.path()), expected);
    }
}
