use std::fs;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const CONFIG_FILENAME: &str = "config.toml";
const ENV_PREFIX: &str = "RECUNLOCK_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub recunlock: String,
    pub r2d2: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const RECUNLOCK_LEVEL: &str = "info";
    const R2D2_LEVEL: &str = "error";

    /// Level string handed to flexi_logger
    pub fn log_spec(&self) -> String {
        format!("recunlock={}, r2d2={}", self.recunlock, self.r2d2)
    }

    fn ensure_valid(&mut self) {
        self.recunlock = Self::valid_level_or_default(&self.recunlock, "recunlock", Self::RECUNLOCK_LEVEL);
        self.r2d2 = Self::valid_level_or_default(&self.r2d2, "r2d2", Self::R2D2_LEVEL);
    }

    fn valid_level_or_default(level: &str, name: &str, default: &str) -> String {
        let normalized = level.trim().to_ascii_lowercase();
        if Self::LOG_LEVELS.contains(&normalized.as_str()) {
            normalized
        } else {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, level, default
            );
            default.to_owned()
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            recunlock: Self::RECUNLOCK_LEVEL.to_string(),
            r2d2: Self::R2D2_LEVEL.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: Option<String>,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    const DB_FILENAME: &str = "recunlock.db";
    const POOL_SIZE: u32 = 8;
    const BUSY_TIMEOUT_MS: u64 = 5000;

    /// Resolve the database file, falling back to the data directory
    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        match self.path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => data_dir.join(Self::DB_FILENAME),
        }
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!(
                "Config error: database pool_size must be at least 1 - using default of {}",
                Self::POOL_SIZE
            );
            self.pool_size = Self::POOL_SIZE;
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: None,
            pool_size: Self::POOL_SIZE,
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UnlockConfig {
    pub batch_size: usize,
    pub window_hours: i64,
    pub max_unlocks_per_window: u32,
}

impl UnlockConfig {
    const BATCH_SIZE: usize = 5;
    const WINDOW_HOURS: i64 = 24;
    const MAX_UNLOCKS_PER_WINDOW: u32 = 1;

    pub fn window_secs(&self) -> i64 {
        self.window_hours * 3600
    }

    fn ensure_valid(&mut self) {
        if self.batch_size == 0 {
            eprintln!(
                "Config error: unlock batch_size must be at least 1 - using default of {}",
                Self::BATCH_SIZE
            );
            self.batch_size = Self::BATCH_SIZE;
        }
        if self.window_hours < 0 {
            eprintln!(
                "Config error: unlock window_hours of {} is invalid - using default of {}",
                self.window_hours,
                Self::WINDOW_HOURS
            );
            self.window_hours = Self::WINDOW_HOURS;
        }
        if self.max_unlocks_per_window == 0 {
            eprintln!(
                "Config error: unlock max_unlocks_per_window must be at least 1 - using default of {}",
                Self::MAX_UNLOCKS_PER_WINDOW
            );
            self.max_unlocks_per_window = Self::MAX_UNLOCKS_PER_WINDOW;
        }
    }
}

impl Default for UnlockConfig {
    fn default() -> Self {
        UnlockConfig {
            batch_size: Self::BATCH_SIZE,
            window_hours: Self::WINDOW_HOURS,
            max_unlocks_per_window: Self::MAX_UNLOCKS_PER_WINDOW,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplacementConfig {
    pub interval_days: i64,
    pub stale_after_days: i64,
    pub target_active_count: i64,
    pub sweep_interval_secs: u64,
}

impl ReplacementConfig {
    const INTERVAL_DAYS: i64 = 5;
    const STALE_AFTER_DAYS: i64 = 5;
    const TARGET_ACTIVE_COUNT: i64 = 5;
    const SWEEP_INTERVAL_SECS: u64 = 3600;

    pub fn interval_secs(&self) -> i64 {
        self.interval_days * 86400
    }

    pub fn stale_after_secs(&self) -> i64 {
        self.stale_after_days * 86400
    }

    fn ensure_valid(&mut self) {
        if self.interval_days < 1 {
            eprintln!(
                "Config error: replacement interval_days of {} is invalid - using default of {}",
                self.interval_days,
                Self::INTERVAL_DAYS
            );
            self.interval_days = Self::INTERVAL_DAYS;
        }
        if self.stale_after_days < 0 {
            eprintln!(
                "Config error: replacement stale_after_days of {} is invalid - using default of {}",
                self.stale_after_days,
                Self::STALE_AFTER_DAYS
            );
            self.stale_after_days = Self::STALE_AFTER_DAYS;
        }
        if self.target_active_count < 1 {
            eprintln!(
                "Config error: replacement target_active_count of {} is invalid - using default of {}",
                self.target_active_count,
                Self::TARGET_ACTIVE_COUNT
            );
            self.target_active_count = Self::TARGET_ACTIVE_COUNT;
        }
        if self.sweep_interval_secs == 0 {
            self.sweep_interval_secs = Self::SWEEP_INTERVAL_SECS;
        }
    }
}

impl Default for ReplacementConfig {
    fn default() -> Self {
        ReplacementConfig {
            interval_days: Self::INTERVAL_DAYS,
            stale_after_days: Self::STALE_AFTER_DAYS,
            target_active_count: Self::TARGET_ACTIVE_COUNT,
            sweep_interval_secs: Self::SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LockingConfig {
    pub timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        LockingConfig { timeout_ms: 5000 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub unlock: UnlockConfig,
    pub replacement: ReplacementConfig,
    pub locking: LockingConfig,
}

impl Config {
    /// Loads the configuration from `config.toml` in the data directory, then
    /// applies `RECUNLOCK_` environment overrides (`__` separates sections).
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILENAME);
        let default_config = Config::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            match toml::to_string_pretty(&default_config) {
                Ok(toml_string) => {
                    if let Err(e) = fs::write(&config_path, toml_string) {
                        eprintln!(
                            "Failed to write default config to {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
                Err(_) => eprintln!("Failed to serialize default config."),
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.unlock.ensure_valid();
        self.replacement.ensure_valid();
    }
}
