//! Path utilities for keypool data storage.

use std::path::{Path, PathBuf};

/// Default results database filename.
pub const RESULTS_DB_FILENAME: &str = "results.db";

/// Get the data directory for keypool.
///
/// - Linux: `~/.local/share/keypool`
/// - macOS: `~/Library/Application Support/keypool`
/// - Windows: `%APPDATA%\keypool`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("keypool"))
        .unwrap_or_else(|| PathBuf::from(".keypool"))
}

/// Get the default path of the results database.
pub fn get_results_path() -> PathBuf {
    get_data_dir().join(RESULTS_DB_FILENAME)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// Shells leave `--db-path=~/x` alone, so the expansion has to happen here.
///
/// ```
/// use std::path::PathBuf;
/// use keypool::paths::expand_tilde;
///
/// let path = PathBuf::from("/tmp/results.db");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir_returns_valid_path() {
        let name = get_data_dir()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(name == "keypool" || name == ".keypool");
    }

    #[test]
    fn test_results_path_is_in_data_dir() {
        let path = get_results_path();
        assert!(path.starts_with(get_data_dir()));
        assert_eq!(path.file_name().unwrap(), RESULTS_DB_FILENAME);
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let expanded = expand_tilde("~/runs/results.db");
        assert!(!expanded.to_str().unwrap().starts_with('~'));
        assert!(expanded.ends_with("runs/results.db"));
    }

    #[test]
    fn test_expand_tilde_leaves_other_paths() {
        assert_eq!(expand_tilde("/tmp/a.db"), PathBuf::from("/tmp/a.db"));
        assert_eq!(expand_tilde("./a.db"), PathBuf::from("./a.db"));
        assert_eq!(expand_tilde("a~b.db"), PathBuf::from("a~b.db"));
    }
}
