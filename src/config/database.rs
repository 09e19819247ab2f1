use std::path::PathBuf;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Local libSQL database location.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let path = optional_env("DATABASE_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path);
        Ok(Self { path })
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data").join("agents.db")
}
