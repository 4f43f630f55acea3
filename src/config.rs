//! Engine configuration.
//!
//! Layers, lowest to highest priority:
//!
//! 1. built-in defaults (paths under the platform data directory)
//! 2. `config/migrator.toml`, when present
//! 3. `MIGRATOR__*` environment variables (a `.env` file is loaded first),
//!    e.g. `MIGRATOR__DATABASE_PATH=/tmp/jobs.db`

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

const APP_DIR_NAME: &str = "job-manager";
const CONFIG_FILE: &str = "config/migrator";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database to migrate.
    pub database_path: PathBuf,
    /// Directory holding `migrations.log`.
    pub log_dir: PathBuf,
    /// Directory of `NNN_description.sql` scripts. The built-in set is used
    /// when unset.
    pub migrations_dir: Option<PathBuf>,
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("job_manager.db"),
            log_dir: data_dir.join("logs"),
            migrations_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads defaults, the optional config file and the environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let file = Path::new(CONFIG_FILE).with_extension("toml");
        Self::load_from(file.exists().then_some(file.as_path()), "MIGRATOR")
    }

    /// Same layering with an explicit file and environment prefix.
    pub fn load_from(file: Option<&Path>, env_prefix: &str) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("database_path", path_str(&defaults.database_path))?
            .set_default("log_dir", path_str(&defaults.log_dir))?
            .set_default("log_level", defaults.log_level.as_str())?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(env_prefix).separator("__"));

        let loaded = builder.build().context("loading migrator configuration")?;
        let cfg: EngineConfig = loaded
            .try_deserialize()
            .context("parsing migrator configuration")?;
        tracing::debug!(config = ?cfg, "[Config] 配置已加载");
        Ok(cfg)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(crate::logging::LOG_FILE_NAME)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
