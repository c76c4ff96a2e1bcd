//! # Recipient Registry
//!
//! Tracks which public keys every state file is encrypted for: the owner (this
//! machine's identity, always present) plus named team members.
//!
//! The registry lives in the local directory next to the identity, 0600, and is
//! never synced. Each successful [`RecipientRegistry::add`] or removal must be
//! followed by a full re-encryption of the state files for the new
//! [`RecipientRegistry::all_keys`] set; [`crate::workspace::Workspace`] does this
//! for every mutation it exposes.
//!
//! Member names are unique. Adding a name that already exists replaces that
//! member's key (last write wins); adding a key already held by another member
//! is rejected.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::crypto::RecipientKey;
use crate::error::{Result, SyncError, ValidationError};
use crate::identity::{ensure_private, write_private_atomic};

pub const REGISTRY_FILE: &str = "recipients.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub name: String,
    pub public_key: RecipientKey,
    pub fingerprint: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientRegistry {
    pub owner_public_key: RecipientKey,
    #[serde(default)]
    pub members: Vec<Recipient>,
}

impl RecipientRegistry {
    pub fn init(owner_public_key: RecipientKey) -> Self {
        Self {
            owner_public_key,
            members: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, public_key: &str) -> Result<Recipient> {
        let name = name.trim();
        if name.is_empty() {
            return Err(
                ValidationError::InvalidInput("team member name must not be empty".into()).into(),
            );
        }

        let public_key = RecipientKey::parse(public_key)?;
        if public_key == self.owner_public_key {
            return Err(ValidationError::DuplicateKey(
                "That is your own public key. You are always a recipient and cannot add yourself as a team member".into(),
            )
            .into());
        }

        if let Some(holder) = self
            .members
            .iter()
            .find(|m| m.public_key == public_key && m.name != name)
        {
            return Err(ValidationError::DuplicateKey(format!(
                "Key {} is already registered to '{}'. Remove that member first",
                fingerprint(&public_key),
                holder.name
            ))
            .into());
        }

        let recipient = Recipient {
            name: name.to_string(),
            fingerprint: fingerprint(&public_key),
            public_key,
            added_at: Utc::now(),
        };

        match self.members.iter_mut().find(|m| m.name == name) {
            Some(existing) => *existing = recipient.clone(),
            None => self.members.push(recipient.clone()),
        }

        info!(name = %recipient.name, fingerprint = %recipient.fingerprint, "added recipient");
        Ok(recipient)
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<Recipient> {
        let position = self
            .members
            .iter()
            .position(|m| m.name == name.trim())
            .ok_or_else(|| {
                SyncError::from(ValidationError::NotFound(format!(
                    "No team member named '{}'. Run 'ctxsync team list' to see members",
                    name.trim()
                )))
            })?;

        let removed = self.members.remove(position);
        info!(name = %removed.name, "removed recipient");
        Ok(removed)
    }

    pub fn remove_by_key(&mut self, public_key: &str) -> Result<Recipient> {
        let public_key = RecipientKey::parse(public_key)?;
        let position = self
            .members
            .iter()
            .position(|m| m.public_key == public_key)
            .ok_or_else(|| {
                SyncError::from(ValidationError::NotFound(format!(
                    "No team member holds key {}",
                    fingerprint(&public_key)
                )))
            })?;

        let removed = self.members.remove(position);
        info!(name = %removed.name, "revoked recipient");
        Ok(removed)
    }

    /// Owner first, then members in insertion order.
    pub fn all_keys(&self) -> Vec<RecipientKey> {
        std::iter::once(self.owner_public_key.clone())
            .chain(self.members.iter().map(|m| m.public_key.clone()))
            .collect()
    }

    pub fn members(&self) -> &[Recipient] {
        &self.members
    }

    pub fn set_owner(&mut self, owner_public_key: RecipientKey) {
        self.members.retain(|m| m.public_key != owner_public_key);
        self.owner_public_key = owner_public_key;
    }
}

/// A short digest of a public key for comparing over another channel.
pub fn fingerprint(public_key: &RecipientKey) -> String {
    let digest = Sha256::digest(public_key.as_str().as_bytes());
    hex::encode(&digest[..8])
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Load and save the registry file.
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(local_dir: impl AsRef<Path>) -> Self {
        Self {
            path: local_dir.as_ref().join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<RecipientRegistry>> {
        if !self.path.exists() {
            return Ok(None);
        }

        ensure_private(&self.path)?;
        let bytes = fs::read(&self.path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Load the registry, creating it for `owner` on first use.
    pub fn load_or_init(&self, owner: &RecipientKey) -> Result<RecipientRegistry> {
        match self.load()? {
            Some(registry) => Ok(registry),
            None => Ok(RecipientRegistry::init(owner.clone())),
        }
    }

    pub fn save(&self, registry: &RecipientRegistry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(registry)?;
        write_private_atomic(&self.path, &bytes)
    }
}
