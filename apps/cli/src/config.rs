//! CLI configuration.
//!
//! Engine settings are stored as TOML next to the offset store:
//! - Linux: `~/.config/chunkup/config.toml`
//! - Windows: `%APPDATA%/chunkup/config.toml`

use std::path::{Path, PathBuf};

use anyhow::Context;
use chunkup_engine::EngineConfig;

/// Loads the configuration at `path`, writing defaults if it does not exist.
pub fn load(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: EngineConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    } else {
        let config = EngineConfig::default();
        save(&config, path)?;
        Ok(config)
    }
}

pub fn save(config: &EngineConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::debug!(path = %path.display(), "configuration saved");
    Ok(())
}

/// Returns the platform-specific configuration file path.
pub fn default_path() -> anyhow::Result<PathBuf> {
    chunkup_store::config_dir()
        .map(|d| d.join("chunkup").join("config.toml"))
        .context("no configuration directory available")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let config = load(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        let config = EngineConfig {
            chunk_size: 1024,
            max_retries: 7,
            store_path: Some(tmp.path().join("offsets.json")),
            ..EngineConfig::default()
        };
        save(&config, &path).unwrap();

        assert_eq!(load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "max_retries = 5\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.chunk_size, EngineConfig::default().chunk_size);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "chunk_size = \"big\"\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn default_path_is_under_chunkup() {
        if let Ok(path) = default_path() {
            assert!(path.ends_with("chunkup/config.toml"));
        }
    }
}
