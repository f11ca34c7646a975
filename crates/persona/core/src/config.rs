//! Application configuration

use crate::error::{PersonaError, PersonaResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable selecting the persona to run.
pub const PERSONA_ENV: &str = "PERSONA";

/// Environment variable overriding the build directory.
pub const BUILD_DIR_ENV: &str = "PERSONA_BUILD_DIR";

const DEFAULT_BUILD_DIR: &str = ".persona";
const ENV_FILE_NAME: &str = ".env";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root name of every identity in the application
    pub app_name: String,

    /// Directory receiving build artifacts and persisted ledgers
    pub build_dir: PathBuf,

    /// Registry key of the persona to run; `None` runs everything in-process
    pub persona: Option<String>,

    /// Dotenv file with secret values; defaults to `<build_dir>/.env`
    pub env_file: Option<PathBuf>,

    /// Command-line words after the program name
    #[serde(skip)]
    pub args: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            persona: None,
            env_file: None,
            args: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Defaults plus environment overrides and process arguments.
    pub fn from_env(app_name: impl Into<String>) -> Self {
        let mut config = Self::new(app_name);
        config.apply_env();
        config.args = std::env::args().skip(1).collect();
        config
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path, app_name: impl Into<String>) -> PersonaResult<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| PersonaError::Config(e.to_string()))?
        } else {
            Self::new(app_name)
        };
        config.apply_env();
        config.args = std::env::args().skip(1).collect();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(persona) = non_empty_var(PERSONA_ENV) {
            self.persona = Some(persona);
        }
        if let Some(dir) = non_empty_var(BUILD_DIR_ENV) {
            self.build_dir = PathBuf::from(dir);
        }
    }

    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }

    pub fn with_persona(mut self, key: impl Into<String>) -> Self {
        self.persona = Some(key.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Resolved dotenv path.
    pub fn env_file_path(&self) -> PathBuf {
        self.env_file
            .clone()
            .unwrap_or_else(|| self.build_dir.join(ENV_FILE_NAME))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.build_dir, PathBuf::from(".persona"));
        assert!(config.persona.is_none());
        assert_eq!(config.env_file_path(), PathBuf::from(".persona/.env"));
    }

    #[test]
    fn test_load_missing_config() {
        let config =
            AppConfig::load(Path::new("/nonexistent/path/persona.toml"), "shop").unwrap();
        assert_eq!(config.app_name, "shop");
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.toml");
        std::fs::write(
            &path,
            "app_name = \"shop\"\nbuild_dir = \"out\"\nenv_file = \"secrets.env\"\n",
        )
        .unwrap();
        let config = AppConfig::load(&path, "ignored").unwrap();
        assert_eq!(config.app_name, "shop");
        assert_eq!(config.env_file_path(), PathBuf::from("secrets.env"));
    }
}
