use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "meghendra", "todolist-sync")
}

pub fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("TODOLIST_SYNC_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".todolist-sync")
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TODOLIST_SYNC_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".todolist-sync.toml")
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub google: GoogleConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub index_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backups: bool,
    pub timeout_seconds: u64,
    pub title_match_limit: usize,
    pub import_unmapped: bool,
    pub include_completed: bool,
    pub migrate_legacy: bool,
    pub interval_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            index_path: data_dir.join("index.json"),
            backup_dir: data_dir.join("backups"),
            backups: true,
            timeout_seconds: 20,
            title_match_limit: 25,
            import_unmapped: false,
            include_completed: false,
            migrate_legacy: true,
            interval_seconds: 300,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Google,
    Reminders,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub local_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: if cfg!(target_os = "macos") {
                StoreKind::Reminders
            } else {
                StoreKind::Local
            },
            local_path: default_data_dir().join("reminders.json"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_path: PathBuf,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_path: default_data_dir().join("google_token.json"),
        }
    }
}

/// One document synchronized against one list.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TargetConfig {
    pub file: PathBuf,
    pub list: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_unmapped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_completed: Option<bool>,
}

impl Config {
    /// Loads `path`, or the default location when `None`. A missing file yields
    /// defaults (written out when it is the default location); a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path.is_some();
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(config_path);

        let mut config = match fs::read_to_string(&config_path) {
            Ok(content) => Self::from_toml(&content, &config_path)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if explicit {
                    return Err(ConfigError::Read {
                        path: config_path,
                        source: err,
                    });
                }
                let config = Config::default();
                let _ = config.save_to_path(&config_path);
                config
            }
            Err(err) => {
                return Err(ConfigError::Read {
                    path: config_path,
                    source: err,
                });
            }
        };

        let base = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.normalize_paths(&base);
        Ok(config)
    }

    fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str::<Config>(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).unwrap_or_default();
        fs::write(path, content)
    }

    fn normalize_paths(&mut self, base: &Path) {
        let defaults = SyncConfig::default();
        if self.sync.index_path.as_os_str().is_empty() {
            self.sync.index_path = defaults.index_path;
        }
        if self.sync.backup_dir.as_os_str().is_empty() {
            self.sync.backup_dir = defaults.backup_dir;
        }
        if self.store.local_path.as_os_str().is_empty() {
            self.store.local_path = StoreConfig::default().local_path;
        }
        if self.google.token_path.as_os_str().is_empty() {
            self.google.token_path = GoogleConfig::default().token_path;
        }

        resolve(&mut self.sync.index_path, base);
        resolve(&mut self.sync.backup_dir, base);
        resolve(&mut self.store.local_path, base);
        resolve(&mut self.google.token_path, base);
        for target in &mut self.targets {
            resolve(&mut target.file, base);
        }
    }
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if let Some(rest) = path.to_str().and_then(|p| p.strip_prefix("~/"))
        && let Some(home) = directories::BaseDirs::new()
    {
        *path = home.home_dir().join(rest);
        return;
    }
    if path.is_relative() {
        *path = base.join(&*path);
    }
}
