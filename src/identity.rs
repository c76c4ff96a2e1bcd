//! # Identity Store
//!
//! Owns this machine's private key. The key never leaves the local directory
//! and is never committed to the sync repository.
//!
//! ## Key Storage
//!
//! - **Path**: `<local_dir>/identity.key`
//! - **Format**: age keygen format (`# created`, `# public key`, secret line)
//! - **Permissions**: 0600, set at creation; any other mode makes
//!   [`IdentityStore::load`] refuse the file instead of silently fixing it
//!
//! ## Lifecycle
//!
//! - **Generate**: once, at setup
//! - **Import**: restore an existing key from another machine or a backup
//! - **Rotate**: replace the key; the caller re-encrypts all state for the new
//!   public key before committing the replacement
//!
//! Secret text read from disk stays in [`Zeroizing`] buffers, and the parsed
//! identity zeroes its scalar on drop.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use age::secrecy::ExposeSecret;
use chrono::Utc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::RecipientKey;
use crate::error::{Result, SyncError, ValidationError};

pub const IDENTITY_FILE: &str = "identity.key";

/// The private half of this machine's key pair.
pub struct LocalIdentity {
    inner: age::x25519::Identity,
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("public_key", &self.inner.to_public().to_string())
            .finish_non_exhaustive()
    }
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            inner: age::x25519::Identity::generate(),
        }
    }

    /// Parse the key from age keygen text. Comment and blank lines are skipped.
    pub fn from_key_text(text: &str) -> Result<Self> {
        let secret = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| {
                SyncError::from(ValidationError::InvalidInput(
                    "identity file contains no secret key".into(),
                ))
            })?;

        let inner = age::x25519::Identity::from_str(secret).map_err(|e| {
            SyncError::from(ValidationError::InvalidInput(format!(
                "identity file is not a valid age secret key: {e}"
            )))
        })?;

        Ok(Self { inner })
    }

    pub fn public_key(&self) -> RecipientKey {
        RecipientKey::from_validated(self.inner.to_public().to_string())
    }

    pub(crate) fn as_age_identity(&self) -> &dyn age::Identity {
        &self.inner
    }

    fn to_key_text(&self) -> Zeroizing<String> {
        let secret = self.inner.to_string();
        Zeroizing::new(format!(
            "# created: {}\n# public key: {}\n{}\n",
            Utc::now().to_rfc3339(),
            self.inner.to_public(),
            secret.expose_secret()
        ))
    }
}

/// Key storage and lifecycle for the local identity.
pub struct IdentityStore {
    local_dir: PathBuf,
}

impl IdentityStore {
    pub fn new(local_dir: impl AsRef<Path>) -> Self {
        Self {
            local_dir: local_dir.as_ref().to_path_buf(),
        }
    }

    pub fn key_path(&self) -> PathBuf {
        self.local_dir.join(IDENTITY_FILE)
    }

    pub fn exists(&self) -> bool {
        self.key_path().exists()
    }

    /// Generate and persist a new identity. Fails if one already exists.
    pub fn generate(&self) -> Result<LocalIdentity> {
        if self.exists() {
            return Err(SyncError::AlreadyInitialized(format!(
                "identity already exists at {}",
                self.key_path().display()
            )));
        }

        let identity = LocalIdentity::generate();
        self.save(&identity)?;
        info!(public_key = %identity.public_key(), "generated new identity");
        Ok(identity)
    }

    /// Persist an identity with owner-only permissions, replacing any existing key.
    pub fn save(&self, identity: &LocalIdentity) -> Result<()> {
        let text = identity.to_key_text();
        write_private_atomic(&self.key_path(), text.as_bytes())
    }

    /// Load the identity, refusing key files readable by anyone but the owner.
    pub fn load(&self) -> Result<LocalIdentity> {
        let key_path = self.key_path();
        if !key_path.exists() {
            return Err(SyncError::NotInitialized);
        }

        load_from(&key_path)
    }

    pub fn public_key(&self) -> Result<RecipientKey> {
        Ok(self.load()?.public_key())
    }

    pub fn pending_path(&self) -> PathBuf {
        self.local_dir.join(PENDING_IDENTITY_FILE)
    }

    /// The replacement key for an in-flight rotation, created on first call.
    ///
    /// Persisting it before any state is re-encrypted means an interrupted
    /// rotation can be resumed with the same key.
    pub fn stage_replacement(&self) -> Result<LocalIdentity> {
        let pending = self.pending_path();
        if pending.exists() {
            debug!("resuming staged identity rotation");
            return load_from(&pending);
        }

        let identity = LocalIdentity::generate();
        write_private_atomic(&pending, identity.to_key_text().as_bytes())?;
        Ok(identity)
    }

    /// The replacement key of an interrupted rotation, if one is staged.
    pub fn staged_replacement(&self) -> Result<Option<LocalIdentity>> {
        let pending = self.pending_path();
        if !pending.exists() {
            return Ok(None);
        }
        load_from(&pending).map(Some)
    }

    /// Make the staged replacement the active identity.
    pub fn commit_replacement(&self) -> Result<()> {
        let pending = self.pending_path();
        ensure_private(&pending)?;
        fs::rename(&pending, self.key_path())?;
        info!("identity rotation committed");
        Ok(())
    }
}

const PENDING_IDENTITY_FILE: &str = "identity.key.next";

/// Read an identity file from anywhere, such as a backup being imported.
///
/// The file must pass the same permission check as the local key.
pub fn load_from(path: impl AsRef<Path>) -> Result<LocalIdentity> {
    let path = path.as_ref();
    ensure_private(path)?;
    let text = Zeroizing::new(fs::read_to_string(path)?);
    debug!(path = %path.display(), "loaded identity file");
    LocalIdentity::from_key_text(&text)
}

/// Fail with [`SyncError::Permission`] unless `path` is exactly 0600.
///
/// Read-only 0400 is refused too.
#[cfg(unix)]
pub(crate) fn ensure_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(SyncError::Permission {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn ensure_private(path: &Path) -> Result<()> {
    fs::metadata(path)?;
    Ok(())
}

/// Write `bytes` to a sibling temp file created 0600, then rename over `path`.
pub(crate) fn write_private_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Config(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp_path = tmp_sibling(path);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path)?;
    // An existing temp file keeps its old mode, so tighten it explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_key_path() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());

        assert_eq!(store.key_path(), temp.path().join("identity.key"));
        assert!(!store.exists());
    }

    #[test]
    fn test_generate_and_load() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());

        let generated = store.generate().unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(generated.public_key(), loaded.public_key());
    }

    #[test]
    fn test_generate_twice_fails() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());

        store.generate().unwrap();
        assert!(matches!(
            store.generate().unwrap_err(),
            SyncError::AlreadyInitialized(_)
        ));
    }

    #[test]
    fn test_load_before_generate_fails() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());

        assert!(matches!(store.load().unwrap_err(), SyncError::NotInitialized));
    }

    #[test]
    fn test_key_file_format() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());
        let identity = store.generate().unwrap();

        let text = fs::read_to_string(store.key_path()).unwrap();
        assert!(text.contains("# created: "));
        assert!(text.contains(&format!("# public key: {}", identity.public_key())));
        assert!(text
            .lines()
            .any(|line| line.starts_with("AGE-SECRET-KEY-1")));
    }

    #[test]
    #[cfg(unix)]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());
        store.generate().unwrap();

        let mode = fs::metadata(store.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    #[cfg(unix)]
    fn test_load_rejects_broad_permissions() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());
        store.generate().unwrap();

        for mode in [0o644, 0o666, 0o755, 0o660, 0o640, 0o700, 0o400] {
            set_mode(&store.key_path(), mode);
            match store.load() {
                Err(SyncError::Permission { mode: found, .. }) => assert_eq!(found, mode),
                Err(other) => panic!("mode {mode:o}: expected permission error, got {other:?}"),
                Ok(_) => panic!("mode {mode:o}: load should have failed"),
            }
        }

        set_mode(&store.key_path(), 0o600);
        assert!(store.load().is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_permission_error_names_remediation() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());
        store.generate().unwrap();
        set_mode(&store.key_path(), 0o644);

        let message = store.load().unwrap_err().to_string();
        assert!(message.contains("chmod 600"));
        assert!(message.contains("identity.key"));
    }

    #[test]
    fn test_load_from_backup() {
        let source_dir = TempDir::new().unwrap();
        let source = IdentityStore::new(source_dir.path());
        let original = source.generate().unwrap();

        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());
        store.generate().unwrap();

        let restored = load_from(source.key_path()).unwrap();
        assert_eq!(restored.public_key(), original.public_key());
        store.save(&restored).unwrap();
        assert_eq!(store.load().unwrap().public_key(), original.public_key());
    }

    #[test]
    #[cfg(unix)]
    fn test_load_from_rejects_world_readable_source() {
        let source_dir = TempDir::new().unwrap();
        let source = IdentityStore::new(source_dir.path());
        source.generate().unwrap();
        set_mode(&source.key_path(), 0o644);

        assert!(matches!(
            load_from(source.key_path()).unwrap_err(),
            SyncError::Permission { .. }
        ));
    }

    #[test]
    fn test_load_from_invalid_key_file() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.key");
        write_private_atomic(&bogus, b"# just a comment\nnot a key\n").unwrap();

        assert!(load_from(&bogus).is_err());
    }

    #[test]
    fn test_staged_replacement_survives_restart() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());
        let original = store.generate().unwrap();

        let staged = store.stage_replacement().unwrap();
        let again = IdentityStore::new(temp.path()).stage_replacement().unwrap();
        assert_eq!(staged.public_key(), again.public_key());
        assert_ne!(staged.public_key(), original.public_key());

        // Until committed the active key is unchanged.
        assert_eq!(store.load().unwrap().public_key(), original.public_key());
        assert_eq!(
            store.staged_replacement().unwrap().map(|id| id.public_key()),
            Some(staged.public_key())
        );

        store.commit_replacement().unwrap();
        assert_eq!(store.load().unwrap().public_key(), staged.public_key());
        assert!(!store.pending_path().exists());
        assert!(store.staged_replacement().unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path());

        let first = store.generate().unwrap();
        let second = LocalIdentity::generate();
        store.save(&second).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.public_key(), second.public_key());
        assert_ne!(loaded.public_key(), first.public_key());
        assert!(!tmp_sibling(&store.key_path()).exists());
    }
}
