//! The entry point the CLI talks to.
//!
//! A [`Workspace`] owns the loaded identity and knows where the registry and
//! sync repository live. Every recipient change goes through it so the state
//! files are re-encrypted for the new key set before the registry is saved.

use std::path::Path;

use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::crypto::RecipientKey;
use crate::error::Result;
use crate::identity::{self, IdentityStore, LocalIdentity};
use crate::recipients::{Recipient, RecipientRegistry, RegistryStore};
use crate::state::{StateData, StateKind, StateRecord, StateStore};
use crate::sync::{PullOptions, PullResult, PushOptions, PushResult, SyncEngine, SyncStatus};
use crate::transport::validate_remote_url;

/// Result of adding, removing or revoking a team member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub recipient: Recipient,
    pub reencrypted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub old_key: RecipientKey,
    pub new_key: RecipientKey,
    pub reencrypted: Vec<String>,
}

pub struct Workspace {
    config: EngineConfig,
    identity: LocalIdentity,
    // Replacement key of an unfinished rotation; some files may already be encrypted for it.
    staged: Option<LocalIdentity>,
    identities: IdentityStore,
    registry: RegistryStore,
}

impl Workspace {
    /// Set up this machine: identity (kept if present), sync repository and
    /// optional remote. Rerunning is safe.
    #[instrument(skip(config), fields(sync_dir = %config.sync_dir.display()))]
    pub fn init(config: &EngineConfig, remote: Option<&str>) -> Result<Self> {
        if let Some(url) = remote {
            validate_remote_url(url)?;
        }

        let identities = IdentityStore::new(&config.local_dir);
        let identity = if identities.exists() {
            identities.load()?
        } else {
            identities.generate()?
        };

        SyncEngine::new(config).init(remote)?;
        Self::assemble(config, identity, identities)
    }

    /// Load an initialized workspace.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let identities = IdentityStore::new(&config.local_dir);
        let identity = identities.load()?;
        Self::assemble(config, identity, identities)
    }

    /// Restore an identity from `source` and open the workspace with it.
    ///
    /// Existing state is re-encrypted for the imported key, which also becomes
    /// the registry owner. The local key file is replaced last, so a failed
    /// import can be rerun with the old key still in place.
    #[instrument(skip(config, source), fields(local_dir = %config.local_dir.display()))]
    pub fn import_identity(config: &EngineConfig, source: impl AsRef<Path>) -> Result<Self> {
        let identities = IdentityStore::new(&config.local_dir);
        let imported = identity::load_from(source)?;
        let previous = if identities.exists() {
            Some(identities.load()?)
        } else {
            None
        };

        let registry_store = RegistryStore::new(&config.local_dir);
        let registry = registry_store.load()?.map(|mut registry| {
            registry.set_owner(imported.public_key());
            registry
        });
        let keys = match &registry {
            Some(registry) => registry.all_keys(),
            None => vec![imported.public_key()],
        };

        let store = StateStore::new(&config.sync_dir, &imported);
        let store = match &previous {
            Some(previous) => store.also_decrypt_with(previous),
            None => store,
        };
        let reencrypted = store.reencrypt_all(&keys)?;

        if let Some(registry) = &registry {
            registry_store.save(registry)?;
        }
        identities.save(&imported)?;

        info!(
            public_key = %imported.public_key(),
            files = reencrypted.len(),
            "imported identity"
        );
        Self::assemble(config, imported, identities)
    }

    fn assemble(
        config: &EngineConfig,
        identity: LocalIdentity,
        identities: IdentityStore,
    ) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            identity,
            staged: identities.staged_replacement()?,
            identities,
            registry: RegistryStore::new(&config.local_dir),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn public_key(&self) -> RecipientKey {
        self.identity.public_key()
    }

    pub fn registry(&self) -> Result<RecipientRegistry> {
        self.registry.load_or_init(&self.identity.public_key())
    }

    /// Everyone current state is encrypted for.
    pub fn recipient_keys(&self) -> Result<Vec<RecipientKey>> {
        Ok(self.registry()?.all_keys())
    }

    pub fn store(&self) -> StateStore<'_> {
        let store = StateStore::new(&self.config.sync_dir, &self.identity);
        match &self.staged {
            Some(staged) => store.also_decrypt_with(staged),
            None => store,
        }
    }

    pub fn read<T: StateRecord>(&self) -> Result<Option<T>> {
        self.store().read::<T>()
    }

    pub fn write<T: StateRecord>(&self, value: &T) -> Result<()> {
        self.store().write(value, &self.recipient_keys()?)
    }

    pub fn read_any(&self, kind: StateKind) -> Result<Option<StateData>> {
        self.store().read_any(kind)
    }

    pub fn write_any(&self, data: &StateData) -> Result<()> {
        self.store().write_any(data, &self.recipient_keys()?)
    }

    pub fn remove_state(&self, kind: StateKind) -> Result<bool> {
        self.store().remove(kind)
    }

    pub fn add_member(&self, name: &str, public_key: &str) -> Result<MembershipChange> {
        let mut registry = self.registry()?;
        let recipient = registry.add(name, public_key)?;
        self.apply_membership(registry, recipient)
    }

    pub fn remove_member(&self, name: &str) -> Result<MembershipChange> {
        let mut registry = self.registry()?;
        let recipient = registry.remove_by_name(name)?;
        self.apply_membership(registry, recipient)
    }

    /// Remove whoever holds `public_key` and re-encrypt so it can no longer decrypt anything.
    pub fn revoke_member(&self, public_key: &str) -> Result<MembershipChange> {
        let mut registry = self.registry()?;
        let recipient = registry.remove_by_key(public_key)?;
        self.apply_membership(registry, recipient)
    }

    // Files first, registry last: an interrupted change can simply be repeated.
    fn apply_membership(
        &self,
        registry: RecipientRegistry,
        recipient: Recipient,
    ) -> Result<MembershipChange> {
        let reencrypted = self.store().reencrypt_all(&registry.all_keys())?;
        self.registry.save(&registry)?;

        info!(
            member = %recipient.name,
            files = reencrypted.len(),
            "team membership updated"
        );
        Ok(MembershipChange {
            recipient,
            reencrypted,
        })
    }

    /// Replace this machine's key and re-encrypt all state for it.
    ///
    /// The replacement is written to disk before any file changes and only
    /// becomes the active key at the end. Until then [`Workspace::open`] reads
    /// with both keys, and rerunning picks up the same replacement.
    #[instrument(skip(self))]
    pub fn rotate_identity(&mut self) -> Result<RotationReport> {
        let old_key = self.identity.public_key();
        let next = self.identities.stage_replacement()?;
        let new_key = next.public_key();

        let mut registry = self.registry()?;
        registry.set_owner(new_key.clone());

        let reencrypted = StateStore::new(&self.config.sync_dir, &self.identity)
            .also_decrypt_with(&next)
            .reencrypt_all(&registry.all_keys())?;

        self.registry.save(&registry)?;
        self.identities.commit_replacement()?;
        self.identity = next;
        self.staged = None;

        info!(files = reencrypted.len(), "identity rotated");
        Ok(RotationReport {
            old_key,
            new_key,
            reencrypted,
        })
    }

    pub fn sync(&self) -> SyncEngine {
        SyncEngine::new(&self.config)
    }

    pub fn set_remote(&self, url: &str) -> Result<()> {
        self.sync().set_remote(url)
    }

    pub fn push(&self, options: &PushOptions) -> Result<PushResult> {
        self.sync().push(options)
    }

    pub fn pull(&self, options: &mut PullOptions<'_>) -> Result<PullResult> {
        self.sync().pull(options)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.sync().status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncError, ValidationError};
    use crate::identity::IDENTITY_FILE;
    use crate::state::{ContextNote, ContextState, EnvState};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> EngineConfig {
        EngineConfig::new(temp.path().join("sync"), temp.path().join("local"))
    }

    fn note(task: &str) -> ContextState {
        let mut state = ContextState::default();
        state.notes.insert(
            "api".into(),
            ContextNote {
                task: task.into(),
                notes: Vec::new(),
                blockers: Vec::new(),
                next_steps: Vec::new(),
                updated_at: Utc::now(),
            },
        );
        state
    }

    #[test]
    fn test_init_then_open() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);

        let created = Workspace::init(&cfg, None).unwrap();
        let opened = Workspace::open(&cfg).unwrap();
        assert_eq!(created.public_key(), opened.public_key());

        // Rerunning keeps the existing key.
        let again = Workspace::init(&cfg, None).unwrap();
        assert_eq!(again.public_key(), created.public_key());
    }

    #[test]
    fn test_open_before_init() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            Workspace::open(&config(&temp)),
            Err(SyncError::NotInitialized)
        ));
    }

    #[test]
    fn test_init_with_insecure_remote_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);

        assert!(Workspace::init(&cfg, Some("http://example.com/ctx.git")).is_err());
        assert!(!cfg.local_dir.join(IDENTITY_FILE).exists());
        assert!(!cfg.sync_dir.exists());
    }

    #[test]
    fn test_team_scenario_revokes_access() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::init(&config(&temp), None).unwrap();
        let bob = LocalIdentity::generate();

        let state = note("shared");
        ws.write(&state).unwrap();
        let added = ws.add_member("Bob", bob.public_key().as_str()).unwrap();
        assert_eq!(added.reencrypted, vec!["context.age"]);

        let bob_view = StateStore::new(&ws.config().sync_dir, &bob);
        assert!(bob_view.read::<ContextState>().unwrap().is_some());

        let revoked = ws.revoke_member(bob.public_key().as_str()).unwrap();
        assert_eq!(revoked.recipient.name, "Bob");
        assert_eq!(revoked.reencrypted, vec!["context.age"]);

        assert!(matches!(
            bob_view.read::<ContextState>().unwrap_err(),
            SyncError::Decryption { .. }
        ));
        assert_eq!(ws.read::<ContextState>().unwrap(), Some(state));
        assert!(ws.registry().unwrap().members().is_empty());
    }

    #[test]
    fn test_failed_add_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::init(&config(&temp), None).unwrap();
        ws.write(&EnvState::default()).unwrap();
        let before = std::fs::read(ws.store().path_of(StateKind::Env)).unwrap();

        let own_key = ws.public_key();
        assert!(matches!(
            ws.add_member("me", own_key.as_str()).unwrap_err(),
            SyncError::Validation(ValidationError::DuplicateKey(_))
        ));
        assert!(matches!(
            ws.remove_member("nobody").unwrap_err(),
            SyncError::Validation(ValidationError::NotFound(_))
        ));

        assert_eq!(std::fs::read(ws.store().path_of(StateKind::Env)).unwrap(), before);
        assert!(!ws.registry.path().exists());
    }

    #[test]
    fn test_new_writes_include_members() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::init(&config(&temp), None).unwrap();
        let carol = LocalIdentity::generate();
        ws.add_member("Carol", carol.public_key().as_str()).unwrap();

        let mut env = EnvState::default();
        env.projects.insert(
            "api".into(),
            BTreeMap::from([("DATABASE_URL".to_string(), "postgres://db".to_string())]),
        );
        ws.write(&env).unwrap();

        let carol_view = StateStore::new(&ws.config().sync_dir, &carol);
        assert_eq!(carol_view.read::<EnvState>().unwrap(), Some(env));
    }

    #[test]
    fn test_rotate_identity() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let mut ws = Workspace::init(&cfg, None).unwrap();
        let state = note("before rotation");
        ws.write(&state).unwrap();
        let old_identity = IdentityStore::new(&cfg.local_dir).load().unwrap();

        let report = ws.rotate_identity().unwrap();
        assert_ne!(report.old_key, report.new_key);
        assert_eq!(report.reencrypted, vec!["context.age"]);
        assert_eq!(ws.public_key(), report.new_key);

        let reopened = Workspace::open(&cfg).unwrap();
        assert_eq!(reopened.public_key(), report.new_key);
        assert_eq!(reopened.read::<ContextState>().unwrap(), Some(state));
        assert_eq!(reopened.registry().unwrap().owner_public_key, report.new_key);

        let old_view = StateStore::new(&cfg.sync_dir, &old_identity);
        assert!(old_view.read::<ContextState>().is_err());
    }

    #[test]
    fn test_import_identity_takes_over_registry() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let ws = Workspace::init(&cfg, None).unwrap();
        let dave = LocalIdentity::generate();
        ws.add_member("Dave", dave.public_key().as_str()).unwrap();

        let backup_dir = TempDir::new().unwrap();
        let backup = IdentityStore::new(backup_dir.path());
        let imported_key = backup.generate().unwrap().public_key();

        let ws = Workspace::import_identity(&cfg, backup.key_path()).unwrap();
        assert_eq!(ws.public_key(), imported_key);

        let registry = ws.registry().unwrap();
        assert_eq!(registry.owner_public_key, imported_key);
        assert_eq!(registry.members().len(), 1);
    }

    #[test]
    fn test_import_keeps_existing_state_readable() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let ws = Workspace::init(&cfg, None).unwrap();
        let old_identity = IdentityStore::new(&cfg.local_dir).load().unwrap();
        let bob = LocalIdentity::generate();
        ws.add_member("Bob", bob.public_key().as_str()).unwrap();
        let state = note("before import");
        ws.write(&state).unwrap();

        let backup_dir = TempDir::new().unwrap();
        let backup = IdentityStore::new(backup_dir.path());
        let imported_key = backup.generate().unwrap().public_key();

        let ws = Workspace::import_identity(&cfg, backup.key_path()).unwrap();
        assert_eq!(ws.public_key(), imported_key);
        assert_eq!(ws.read::<ContextState>().unwrap(), Some(state.clone()));

        let reopened = Workspace::open(&cfg).unwrap();
        assert_eq!(reopened.read::<ContextState>().unwrap(), Some(state.clone()));

        // Members keep access; the replaced key does not.
        let bob_view = StateStore::new(&cfg.sync_dir, &bob);
        assert_eq!(bob_view.read::<ContextState>().unwrap(), Some(state));
        let old_view = StateStore::new(&cfg.sync_dir, &old_identity);
        assert!(old_view.read::<ContextState>().is_err());
    }

    #[test]
    fn test_interrupted_rotation_is_readable_and_resumes() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let ws = Workspace::init(&cfg, None).unwrap();
        let state = note("mid rotation");
        ws.write(&state).unwrap();

        // Stop after the files were re-encrypted for the staged key only.
        let identities = IdentityStore::new(&cfg.local_dir);
        let old_identity = identities.load().unwrap();
        let next = identities.stage_replacement().unwrap();
        StateStore::new(&cfg.sync_dir, &old_identity)
            .also_decrypt_with(&next)
            .reencrypt_all(&[next.public_key()])
            .unwrap();

        let mut ws = Workspace::open(&cfg).unwrap();
        assert_eq!(ws.public_key(), old_identity.public_key());
        assert_eq!(ws.read::<ContextState>().unwrap(), Some(state.clone()));

        // Writes in between are still picked up by the resumed rotation.
        let env = EnvState::default();
        ws.write(&env).unwrap();

        let report = ws.rotate_identity().unwrap();
        assert_eq!(report.new_key, next.public_key());
        assert_eq!(report.reencrypted, vec!["env.age", "context.age"]);
        assert!(!identities.pending_path().exists());

        let reopened = Workspace::open(&cfg).unwrap();
        assert_eq!(reopened.public_key(), next.public_key());
        assert_eq!(reopened.read::<ContextState>().unwrap(), Some(state));
        assert_eq!(reopened.read::<EnvState>().unwrap(), Some(env));
    }
}
