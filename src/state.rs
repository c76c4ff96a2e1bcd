//! # State Store
//!
//! Maps each logical state category to one armored ciphertext file in the sync
//! directory and keeps the plaintext [`Manifest`] in step with every write.
//!
//! ## Layout
//!
//! ```text
//! <sync_dir>/
//!   manifest.json      plaintext, timestamps only
//!   projects.age       ProjectsState
//!   env.age            EnvState
//!   docker.age         DockerState
//!   context.age        ContextState
//!   services.age       ServicesState
//!   dir-history.age    DirHistoryState
//! ```
//!
//! Only the manifest is ever written unencrypted. [`StateStore::write_to`] checks
//! the target name before anything touches disk and fails with
//! [`SyncError::PolicyViolation`] for any plaintext-looking target.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{self, RecipientKey};
use crate::error::{Result, SyncError, ValidationError};
use crate::identity::{tmp_sibling, LocalIdentity};
use crate::manifest::{Manifest, MANIFEST_FILE};

pub const ENCRYPTED_EXT: &str = ".age";

/// The closed set of synced state categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateKind {
    Projects,
    Env,
    Docker,
    Context,
    Services,
    DirHistory,
}

impl StateKind {
    pub const ALL: [StateKind; 6] = [
        StateKind::Projects,
        StateKind::Env,
        StateKind::Docker,
        StateKind::Context,
        StateKind::Services,
        StateKind::DirHistory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StateKind::Projects => "projects",
            StateKind::Env => "env",
            StateKind::Docker => "docker",
            StateKind::Context => "context",
            StateKind::Services => "services",
            StateKind::DirHistory => "dir-history",
        }
    }

    pub fn filename(self) -> String {
        format!("{}{ENCRYPTED_EXT}", self.name())
    }

    pub fn from_filename(filename: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.filename() == filename)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StateKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                ValidationError::InvalidInput(format!(
                    "unknown state type '{s}'; expected one of: {}",
                    Self::ALL.map(StateKind::name).join(", ")
                ))
                .into()
            })
    }
}

/// A record type stored under exactly one [`StateKind`].
pub trait StateRecord: Serialize + DeserializeOwned {
    const KIND: StateKind;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_remote: Option<String>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectsState {
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// Environment variables per project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvState {
    #[serde(default)]
    pub projects: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerContainer {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerProject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<String>,
    #[serde(default)]
    pub containers: Vec<DockerContainer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerState {
    #[serde(default)]
    pub projects: BTreeMap<String, DockerProject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextNote {
    pub task: String,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Task and mental-context notes per project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextState {
    #[serde(default)]
    pub notes: BTreeMap<String, ContextNote>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningService {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesState {
    #[serde(default)]
    pub services: Vec<RunningService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirVisit {
    pub path: String,
    pub visited_at: DateTime<Utc>,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirHistoryState {
    #[serde(default)]
    pub entries: Vec<DirVisit>,
}

impl StateRecord for ProjectsState {
    const KIND: StateKind = StateKind::Projects;
}

impl StateRecord for EnvState {
    const KIND: StateKind = StateKind::Env;
}

impl StateRecord for DockerState {
    const KIND: StateKind = StateKind::Docker;
}

impl StateRecord for ContextState {
    const KIND: StateKind = StateKind::Context;
}

impl StateRecord for ServicesState {
    const KIND: StateKind = StateKind::Services;
}

impl StateRecord for DirHistoryState {
    const KIND: StateKind = StateKind::DirHistory;
}

/// Any one state record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum StateData {
    Projects(ProjectsState),
    Env(EnvState),
    Docker(DockerState),
    Context(ContextState),
    Services(ServicesState),
    DirHistory(DirHistoryState),
}

impl StateData {
    pub fn kind(&self) -> StateKind {
        match self {
            StateData::Projects(_) => StateKind::Projects,
            StateData::Env(_) => StateKind::Env,
            StateData::Docker(_) => StateKind::Docker,
            StateData::Context(_) => StateKind::Context,
            StateData::Services(_) => StateKind::Services,
            StateData::DirHistory(_) => StateKind::DirHistory,
        }
    }
}

/// Encrypted state files plus the manifest inside one sync directory.
pub struct StateStore<'a> {
    sync_dir: PathBuf,
    identities: Vec<&'a LocalIdentity>,
}

impl<'a> StateStore<'a> {
    pub fn new(sync_dir: impl AsRef<Path>, identity: &'a LocalIdentity) -> Self {
        Self {
            sync_dir: sync_dir.as_ref().to_path_buf(),
            identities: vec![identity],
        }
    }

    /// Also try `identity` when decrypting. Used while a key rotation is in flight.
    pub fn also_decrypt_with(mut self, identity: &'a LocalIdentity) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }

    pub fn path_of(&self, kind: StateKind) -> PathBuf {
        self.sync_dir.join(kind.filename())
    }

    /// Decrypt the record for `T`; `None` when the file is missing or empty.
    pub fn read<T: StateRecord>(&self) -> Result<Option<T>> {
        let Some(plaintext) = self.read_plaintext(T::KIND)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub fn read_any(&self, kind: StateKind) -> Result<Option<StateData>> {
        Ok(match kind {
            StateKind::Projects => self.read::<ProjectsState>()?.map(StateData::Projects),
            StateKind::Env => self.read::<EnvState>()?.map(StateData::Env),
            StateKind::Docker => self.read::<DockerState>()?.map(StateData::Docker),
            StateKind::Context => self.read::<ContextState>()?.map(StateData::Context),
            StateKind::Services => self.read::<ServicesState>()?.map(StateData::Services),
            StateKind::DirHistory => self.read::<DirHistoryState>()?.map(StateData::DirHistory),
        })
    }

    pub fn write<T: StateRecord>(&self, value: &T, keys: &[RecipientKey]) -> Result<()> {
        self.write_to(T::KIND, &T::KIND.filename(), value, keys)
    }

    pub fn write_any(&self, data: &StateData, keys: &[RecipientKey]) -> Result<()> {
        match data {
            StateData::Projects(v) => self.write(v, keys),
            StateData::Env(v) => self.write(v, keys),
            StateData::Docker(v) => self.write(v, keys),
            StateData::Context(v) => self.write(v, keys),
            StateData::Services(v) => self.write(v, keys),
            StateData::DirHistory(v) => self.write(v, keys),
        }
    }

    /// Encrypt `value` into `filename` and record the write in the manifest.
    ///
    /// `filename` must be a bare name ending in [`ENCRYPTED_EXT`]; anything else
    /// is a [`SyncError::PolicyViolation`] and nothing is written.
    pub fn write_to<T: Serialize>(
        &self,
        kind: StateKind,
        filename: &str,
        value: &T,
        keys: &[RecipientKey],
    ) -> Result<()> {
        guard_encrypted_target(kind, filename)?;

        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let ciphertext = crypto::encrypt_for(keys, &plaintext)?;
        if !crypto::is_encrypted(&ciphertext) {
            return Err(SyncError::PolicyViolation {
                kind: kind.to_string(),
                filename: filename.to_string(),
            });
        }

        self.replace_file(filename, &ciphertext)?;
        debug!(file = filename, recipients = keys.len(), "wrote state file");
        Ok(())
    }

    /// Filenames of state files that exist and are not blank.
    pub fn list_existing(&self) -> Result<Vec<String>> {
        let mut existing = Vec::new();
        for kind in StateKind::ALL {
            if self.exists(kind)? {
                existing.push(kind.filename());
            }
        }
        Ok(existing)
    }

    /// Whether `kind` has a file with content. Whitespace-only files count as absent.
    pub fn exists(&self, kind: StateKind) -> Result<bool> {
        let path = self.path_of(kind);
        if !path.exists() {
            return Ok(false);
        }
        Ok(!is_blank(&fs::read(&path)?))
    }

    /// Delete a state file and its manifest entry. Returns whether anything was removed.
    pub fn remove(&self, kind: StateKind) -> Result<bool> {
        let path = self.path_of(kind);
        let existed = path.exists();
        if existed {
            fs::remove_file(&path)?;
        }

        if let Some(mut manifest) = Manifest::load(&self.sync_dir)? {
            if manifest.forget(&kind.filename()) {
                manifest.save(&self.sync_dir)?;
            }
        }

        if existed {
            info!(file = %kind.filename(), "removed state file");
        }
        Ok(existed)
    }

    /// Re-encrypt every existing state file for `keys`, returning the filenames.
    ///
    /// Each file is replaced atomically, so rerunning after a failure is safe as
    /// long as one of this store's identities is among the recipients.
    pub fn reencrypt_all(&self, keys: &[RecipientKey]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Err(ValidationError::InvalidInput(
                "at least one recipient is required to encrypt".into(),
            )
            .into());
        }

        let mut reencrypted = Vec::new();
        for kind in StateKind::ALL {
            let Some(plaintext) = self.read_plaintext(kind)? else {
                continue;
            };
            let filename = kind.filename();
            let ciphertext = crypto::encrypt_for(keys, &plaintext)?;
            self.replace_file(&filename, &ciphertext)?;
            debug!(file = %filename, "re-encrypted state file");
            reencrypted.push(filename);
        }

        info!(
            files = reencrypted.len(),
            recipients = keys.len(),
            "re-encrypted state"
        );
        Ok(reencrypted)
    }

    fn read_plaintext(&self, kind: StateKind) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let path = self.path_of(kind);
        if !path.exists() {
            return Ok(None);
        }

        let ciphertext = fs::read(&path)?;
        if is_blank(&ciphertext) {
            return Ok(None);
        }

        let plaintext =
            crypto::decrypt_with_any(&self.identities, &ciphertext, &kind.filename())?;
        Ok(Some(Zeroizing::new(plaintext)))
    }

    fn replace_file(&self, filename: &str, ciphertext: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.sync_dir)?;
        let path = self.sync_dir.join(filename);
        let tmp_path = tmp_sibling(&path);
        fs::write(&tmp_path, ciphertext)?;
        fs::rename(&tmp_path, &path)?;

        let mut manifest = Manifest::load(&self.sync_dir)?.unwrap_or_default();
        manifest.touch(filename);
        manifest.save(&self.sync_dir)
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn guard_encrypted_target(kind: StateKind, filename: &str) -> Result<()> {
    let stem_len = filename.len().saturating_sub(ENCRYPTED_EXT.len());
    if filename == MANIFEST_FILE || !filename.ends_with(ENCRYPTED_EXT) || stem_len == 0 {
        return Err(SyncError::PolicyViolation {
            kind: kind.to_string(),
            filename: filename.to_string(),
        });
    }

    if filename.contains(['/', '\\']) || filename.starts_with('.') {
        return Err(ValidationError::InvalidInput(format!(
            "state filename '{filename}' must be a bare file name"
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context_state(task: &str) -> ContextState {
        let mut state = ContextState::default();
        state.notes.insert(
            "api".into(),
            ContextNote {
                task: task.into(),
                notes: vec!["check the retry path".into()],
                blockers: Vec::new(),
                next_steps: vec!["write the migration".into()],
                updated_at: Utc::now(),
            },
        );
        state
    }

    #[test]
    fn test_filenames() {
        assert_eq!(StateKind::Projects.filename(), "projects.age");
        assert_eq!(StateKind::DirHistory.filename(), "dir-history.age");
        assert_eq!(
            StateKind::from_filename("services.age"),
            Some(StateKind::Services)
        );
        assert_eq!(StateKind::from_filename("manifest.json"), None);
        assert_eq!("env".parse::<StateKind>().unwrap(), StateKind::Env);
        assert!("secrets".parse::<StateKind>().is_err());
    }

    #[test]
    fn test_read_absent() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);

        assert!(store.read::<ContextState>().unwrap().is_none());

        fs::write(store.path_of(StateKind::Context), b"").unwrap();
        assert!(store.read::<ContextState>().unwrap().is_none());
        assert!(!store.exists(StateKind::Context).unwrap());
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);
        let state = context_state("ship the release");

        store.write(&state, &[identity.public_key()]).unwrap();

        let raw = fs::read(store.path_of(StateKind::Context)).unwrap();
        assert!(crypto::is_encrypted(&raw));
        assert!(!String::from_utf8_lossy(&raw).contains("ship the release"));

        assert_eq!(store.read::<ContextState>().unwrap(), Some(state));
        assert_eq!(store.list_existing().unwrap(), vec!["context.age"]);
    }

    #[test]
    fn test_write_updates_manifest() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);

        store
            .write(&ProjectsState::default(), &[identity.public_key()])
            .unwrap();
        let first = Manifest::load(temp.path()).unwrap().unwrap();
        let first_modified = first.files["projects.age"].last_modified;

        store
            .write(&EnvState::default(), &[identity.public_key()])
            .unwrap();
        let second = Manifest::load(temp.path()).unwrap().unwrap();

        assert_eq!(second.files.len(), 2);
        assert_eq!(second.files["projects.age"].last_modified, first_modified);
        assert!(second.last_sync >= first.last_sync);
        assert_eq!(second.last_sync, second.files["env.age"].last_modified);
    }

    #[test]
    fn test_plaintext_target_is_policy_violation() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);
        let keys = [identity.public_key()];

        for filename in ["env.json", "env", "env.txt", "manifest.json", ".age", "env.age.json"] {
            let err = store
                .write_to(StateKind::Env, filename, &EnvState::default(), &keys)
                .unwrap_err();
            assert!(
                matches!(err, SyncError::PolicyViolation { .. }),
                "{filename} should be refused, got {err:?}"
            );
            assert!(!temp.path().join(filename).exists());
        }

        assert!(Manifest::load(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_path_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);

        let err = store
            .write_to(
                StateKind::Env,
                "../escape.age",
                &EnvState::default(),
                &[identity.public_key()],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_wrong_identity_is_decryption_error() {
        let temp = TempDir::new().unwrap();
        let owner = LocalIdentity::generate();
        let stranger = LocalIdentity::generate();

        StateStore::new(temp.path(), &owner)
            .write(&context_state("x"), &[owner.public_key()])
            .unwrap();

        let err = StateStore::new(temp.path(), &stranger)
            .read::<ContextState>()
            .unwrap_err();
        match err {
            SyncError::Decryption { target, .. } => assert_eq!(target, "context.age"),
            other => panic!("expected decryption error, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_file_does_not_affect_others() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);
        let keys = [identity.public_key()];

        store.write(&context_state("keep"), &keys).unwrap();
        store.write(&ServicesState::default(), &keys).unwrap();
        fs::write(store.path_of(StateKind::Services), "garbage").unwrap();

        assert!(store.read::<ServicesState>().is_err());
        assert!(store.read::<ContextState>().unwrap().is_some());
    }

    #[test]
    fn test_read_any_and_write_any() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);

        let data = StateData::Services(ServicesState {
            services: vec![RunningService {
                name: "web".into(),
                command: "npm run dev".into(),
                cwd: Some("/work/web".into()),
                port: Some(3000),
                project: None,
            }],
        });
        store.write_any(&data, &[identity.public_key()]).unwrap();

        assert_eq!(data.kind(), StateKind::Services);
        assert_eq!(store.read_any(StateKind::Services).unwrap(), Some(data));
        assert_eq!(store.read_any(StateKind::Docker).unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);

        store
            .write(&DirHistoryState::default(), &[identity.public_key()])
            .unwrap();
        assert!(store.remove(StateKind::DirHistory).unwrap());
        assert!(!store.remove(StateKind::DirHistory).unwrap());

        let manifest = Manifest::load(temp.path()).unwrap().unwrap();
        assert!(manifest.files.is_empty());
        assert!(store.list_existing().unwrap().is_empty());
    }

    #[test]
    fn test_reencrypt_all_changes_recipients() {
        let temp = TempDir::new().unwrap();
        let owner = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &owner);

        let with_bob = [owner.public_key(), bob.public_key()];
        store.write(&context_state("shared"), &with_bob).unwrap();
        store.write(&EnvState::default(), &with_bob).unwrap();

        let bob_store = StateStore::new(temp.path(), &bob);
        assert!(bob_store.read::<ContextState>().unwrap().is_some());

        let files = store.reencrypt_all(&[owner.public_key()]).unwrap();
        assert_eq!(files, vec!["env.age", "context.age"]);

        assert!(bob_store.read::<ContextState>().is_err());
        assert!(bob_store.read::<EnvState>().is_err());
        assert!(store.read::<ContextState>().unwrap().is_some());

        // Running it again is harmless.
        assert_eq!(store.reencrypt_all(&[owner.public_key()]).unwrap().len(), 2);
    }

    #[test]
    fn test_blank_file_is_neither_listed_nor_reencrypted() {
        let temp = TempDir::new().unwrap();
        let identity = LocalIdentity::generate();
        let store = StateStore::new(temp.path(), &identity);

        store
            .write(&context_state("kept"), &[identity.public_key()])
            .unwrap();
        fs::write(store.path_of(StateKind::Env), b" \n\t\n").unwrap();

        assert!(!store.exists(StateKind::Env).unwrap());
        let existing = store.list_existing().unwrap();
        assert_eq!(existing, vec!["context.age"]);
        assert_eq!(
            store.reencrypt_all(&[identity.public_key()]).unwrap(),
            existing
        );
    }

    #[test]
    fn test_state_data_tagging() {
        let data = StateData::DirHistory(DirHistoryState::default());
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "dir-history");
        assert!(json["data"]["entries"].is_array());
    }
}
