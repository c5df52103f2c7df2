use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub numbering: NumberingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Параметры нумератора документов
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NumberingConfig {
    /// Сколько раз `generate` пробует следующий номер при коллизиях
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Создавать ли настройки для неизвестного ключа при первом обращении
    #[serde(default = "default_auto_initialize")]
    pub auto_initialize: bool,
    /// Часовой пояс для границ дня/месяца/года (смещение от UTC в часах)
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            auto_initialize: default_auto_initialize(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_retry_ceiling() -> u32 {
    1000
}

fn default_auto_initialize() -> bool {
    true
}

fn default_utc_offset_hours() -> i32 {
    0
}

/// Default configuration embedded in the binary
const DEFAULT_CONFIG: &str = r#"
[database]
path = "target/db/app.db"

[server]
port = 3000

[numbering]
retry_ceiling = 1000
auto_initialize = true
utc_offset_hours = 0
"#;

/// Load configuration from config.toml file
///
/// Search order:
/// 1. Next to the executable (for production)
/// 2. Falls back to embedded default config
pub fn load_config() -> anyhow::Result<Config> {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let config_path = exe_dir.join("config.toml");

            if config_path.exists() {
                tracing::info!("Loading config from: {}", config_path.display());
                return parse_config(&std::fs::read_to_string(&config_path)?);
            } else {
                tracing::warn!("config.toml not found at: {}", config_path.display());
            }
        }
    }

    tracing::info!("Using default embedded configuration");
    parse_config(DEFAULT_CONFIG)
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(contents)?;
    if config.numbering.retry_ceiling == 0 {
        anyhow::bail!("numbering.retry_ceiling must be positive");
    }
    if !(-23..=23).contains(&config.numbering.utc_offset_hours) {
        anyhow::bail!(
            "numbering.utc_offset_hours must be within -23..=23, got {}",
            config.numbering.utc_offset_hours
        );
    }
    Ok(config)
}

/// Get the database file path from configuration
/// Resolves relative paths relative to the executable directory
pub fn get_database_path(config: &Config) -> anyhow::Result<PathBuf> {
    let db_path = Path::new(&config.database.path);

    if db_path.is_absolute() {
        return Ok(db_path.to_path_buf());
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            return Ok(exe_dir.join(db_path));
        }
    }

    Ok(PathBuf::from(&config.database.path))
}
