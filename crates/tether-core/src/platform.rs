//! Platform-specific paths.

use crate::config::DirectoryConfig;
use crate::{Result, TetherError};
use std::path::PathBuf;

/// Get the tether global configuration directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/tether` (XDG_CONFIG_HOME)
/// - **Windows**: `%APPDATA%\tether`
/// - **macOS**: `~/Library/Application Support/tether`
pub fn tether_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| TetherError::Config {
        message: "Could not determine platform config directory".to_string(),
    })?;
    Ok(config_dir.join(DirectoryConfig::APP_CONFIG_DIR_NAME))
}

/// Path of the shared service directory database.
pub fn directory_db_path() -> Result<PathBuf> {
    Ok(tether_config_dir()?.join(DirectoryConfig::DB_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_db_path_ends_with_db() {
        // No config dir on some CI sandboxes.
        if let Ok(path) = directory_db_path() {
            assert!(path.ends_with("tether/directory.db"));
        }
    }
}
