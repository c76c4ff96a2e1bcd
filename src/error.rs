use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Insecure permissions on {} (mode {mode:o}); only the owner may read it. Fix with: chmod 600 {}", .path.display(), .path.display())]
    Permission { path: PathBuf, mode: u32 },

    #[error("Decryption failed for {target}: {reason}")]
    Decryption { target: String, reason: String },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Refusing to write {kind} state to plaintext file '{filename}': only the manifest may be stored unencrypted")]
    PolicyViolation { kind: String, filename: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Sync conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No remote configured. Add one with: ctxsync remote set <url>")]
    NoRemoteConfigured,

    #[error("Remote rejected the push for {0}. Run 'ctxsync pull' first, then push again")]
    PushRejected(String),

    #[error("Not initialized. Run 'ctxsync init' first")]
    NotInitialized,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Rejections raised while checking a remote URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Remote URL is empty. Use an SSH (git@host:user/repo.git) or HTTPS URL")]
    Empty,

    #[error("Insecure remote scheme '{scheme}://' in {url}. Use SSH (git@host:user/repo.git) or https:// instead")]
    InsecureScheme { scheme: String, url: String },

    #[error("Unsupported remote scheme '{scheme}://' in {url}. Only SSH, https:// and local paths are allowed")]
    UnsupportedScheme { scheme: String, url: String },

    #[error("Malformed remote URL '{0}'. Use git@host:user/repo.git, https://host/user/repo.git or an absolute path")]
    Malformed(String),
}

/// Failures of a single recipient or input operation; nothing is mutated when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid public key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("{0}")]
    DuplicateKey(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
