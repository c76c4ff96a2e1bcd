//! Engine configuration.
//!
//! Every entry point takes an [`EngineConfig`] value; nothing in the core looks
//! at the environment or the home directory. The CLI builds one with
//! [`EngineConfig::for_home`] and then [`load`], which layers an optional
//! `config.toml` from the local directory and `CTXSYNC_*` environment
//! overrides on top.

use std::env;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::identity::write_private_atomic;

pub const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CTXSYNC_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Git working tree holding the encrypted state files and manifest.
    pub sync_dir: PathBuf,
    /// Never-synced directory for the identity, registry and config file.
    pub local_dir: PathBuf,
    pub remote_name: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
}

impl EngineConfig {
    pub fn new(sync_dir: impl Into<PathBuf>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            sync_dir: sync_dir.into(),
            local_dir: local_dir.into(),
            remote_name: "origin".into(),
            branch: "main".into(),
            author_name: "ctxsync".into(),
            author_email: "ctxsync@localhost".into(),
        }
    }

    pub fn for_home(home: &Path) -> Self {
        let root = home.join(".ctxsync");
        Self::new(root.join("sync"), root.join("local"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.local_dir.join(CONFIG_FILE)
    }
}

/// The subset of settings a user may put in `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
}

/// Apply `config.toml` and environment overrides to `base`.
pub fn load(base: EngineConfig) -> Result<EngineConfig> {
    let mut settings = read_settings(&base.config_path())?.unwrap_or_default();

    if let Ok(v) = env::var(format!("{ENV_PREFIX}SYNC_DIR")) {
        settings.sync_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = env::var(format!("{ENV_PREFIX}REMOTE_NAME")) {
        settings.remote_name = Some(v);
    }
    if let Ok(v) = env::var(format!("{ENV_PREFIX}BRANCH")) {
        settings.branch = Some(v);
    }
    if let Ok(v) = env::var(format!("{ENV_PREFIX}AUTHOR_NAME")) {
        settings.author_name = Some(v);
    }
    if let Ok(v) = env::var(format!("{ENV_PREFIX}AUTHOR_EMAIL")) {
        settings.author_email = Some(v);
    }

    Ok(apply(base, settings))
}

pub fn read_settings(path: &Path) -> Result<Option<FileSettings>> {
    if !path.exists() {
        return Ok(None);
    }

    let path_str = path
        .to_str()
        .ok_or_else(|| SyncError::Config(format!("invalid config path {}", path.display())))?;
    let settings = Config::builder()
        .add_source(File::new(path_str, FileFormat::Toml))
        .build()
        .and_then(|cfg| cfg.try_deserialize::<FileSettings>())
        .map_err(|err| SyncError::Config(format!("failed to load {}: {err}", path.display())))?;

    Ok(Some(settings))
}

pub fn write_settings(path: &Path, settings: &FileSettings) -> Result<()> {
    let text = toml::to_string_pretty(settings)
        .map_err(|err| SyncError::Config(format!("failed to serialize config: {err}")))?;
    write_private_atomic(path, text.as_bytes())
}

fn apply(mut base: EngineConfig, settings: FileSettings) -> EngineConfig {
    if let Some(sync_dir) = settings.sync_dir {
        base.sync_dir = sync_dir;
    }
    if let Some(remote_name) = settings.remote_name {
        base.remote_name = remote_name;
    }
    if let Some(branch) = settings.branch {
        base.branch = branch;
    }
    if let Some(author_name) = settings.author_name {
        base.author_name = author_name;
    }
    if let Some(author_email) = settings.author_email {
        base.author_email = author_email;
    }
    base
}
