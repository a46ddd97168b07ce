//! Configuration loader with multi-source merging.

use super::file_config::FileConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::PathBuf;

/// Environment variable prefix, e.g. `TECHSAGE_POOL__MAX_TOTAL=4`.
const ENV_PREFIX: &str = "TECHSAGE_";

/// Project-level config file names, first match wins.
const PROJECT_FILES: [&str; 2] = ["techsage.toml", ".techsage.toml"];

/// Configuration loader that handles file discovery and merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. `TECHSAGE_*` environment variables
    /// 2. Explicit config path (if provided)
    /// 3. Project root: `./techsage.toml` or `./.techsage.toml`
    /// 4. Global: `$XDG_CONFIG_HOME/techsage/config.toml`, falling back to
    ///    `~/.config/techsage/config.toml`
    /// 5. Default values
    pub fn load(config_path: Option<&PathBuf>) -> Result<FileConfig, Box<figment::Error>> {
        let mut figment = Figment::new().merge(Serialized::defaults(FileConfig::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            figment = figment.merge(Toml::file(&global_path));
        }

        if let Some(project_path) = Self::project_config_path() {
            figment = figment.merge(Toml::file(&project_path));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(Box::new)
    }

    /// Load only default configuration (for `--no-config`).
    pub fn load_defaults() -> FileConfig {
        FileConfig::default()
    }

    /// The global config file path, whether or not it exists.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("techsage").join("config.toml"))
    }

    /// The project-level config file, if one exists.
    pub fn project_config_path() -> Option<PathBuf> {
        PROJECT_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::load_defaults();
        assert!(config.technologies.is_empty());
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_global_config_path_names_the_app_dir() {
        let path = ConfigLoader::global_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().to_string_lossy().contains("techsage"));
    }

    #[test]
    fn test_explicit_path_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.toml");
        std::fs::write(
            &path,
            r#"
[pool]
max_total = 2

[technologies.react]
repo = "/srv/repos/react"
"#,
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.pool.max_total, 2);
        assert_eq!(config.technologies.len(), 1);
        // Everything else keeps its default
        assert_eq!(config.pool.base_port, 49152);
    }
}
