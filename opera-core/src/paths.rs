// ABOUTME: XDG base directory paths for the opera config file, database and logs.
// ABOUTME: Falls back to the working directory when no home directory is available.

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "";
const ORGANIZATION: &str = "";
const APPLICATION: &str = "opera";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// e.g. ~/.local/share/opera/
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default SQLite file for the local directory store
pub fn database_file() -> PathBuf {
    data_dir().join("opera.db")
}

/// e.g. ~/.config/opera/config.toml
pub fn config_file() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}
