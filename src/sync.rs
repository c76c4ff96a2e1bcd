//! # Sync Protocol
//!
//! Moves the encrypted state files between machines through a git remote.
//!
//! ## Push
//!
//! ```text
//! Clean -> StagedForCommit -> Committed -> Pushed | LocalOnly
//! ```
//!
//! Push never pulls. A diverged remote rejects the push and the caller is
//! told to pull first.
//!
//! ## Pull
//!
//! ```text
//! Idle -> RemoteValidated -> Fetched -> FastForwarded
//!                                    -> ConflictDetected -> ConflictResolved
//! ```
//!
//! Ciphertext is opaque, so diverged histories are reconciled one whole file
//! at a time from the merge base. A file changed on only one side takes that
//! side's version; a file changed differently on both sides is a conflict and
//! keeps the local version unless the resolver picks [`Resolution::Theirs`].
//! The manifest is rebuilt from the winning side of each file.
//!
//! Both directions screen the configured remote URL with
//! [`validate_remote_url`] before any git work happens.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use git2::{Oid, Signature};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::git::SyncRepo;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::state::StateKind;
use crate::transport::validate_remote_url;

/// Which side of a conflicting file to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    Ours,
    Theirs,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Ours => f.write_str("kept local"),
            Resolution::Theirs => f.write_str("took remote"),
        }
    }
}

/// A state file changed differently on both sides since the merge base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFile {
    pub filename: String,
    pub kind: StateKind,
    pub local_deleted: bool,
    pub remote_deleted: bool,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_modified: Option<DateTime<Utc>>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushResult {
    pub committed: bool,
    pub pushed: bool,
    pub files_committed: usize,
    pub commit_id: Option<String>,
}

/// Per-file conflict decision.
pub type Resolver<'a> = Box<dyn FnMut(&ConflictFile) -> Resolution + 'a>;

#[derive(Default)]
pub struct PullOptions<'a> {
    /// Without a resolver every conflict keeps the local file.
    pub resolver: Option<Resolver<'a>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResult {
    pub up_to_date: bool,
    pub fast_forwarded: bool,
    pub merged: bool,
    pub conflicts: Vec<ConflictFile>,
    pub files_updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub initialized: bool,
    pub has_remote: bool,
    pub remote_url: Option<String>,
    pub branch: String,
    pub pending_changes: usize,
    pub ahead: usize,
    pub behind: usize,
}

pub struct SyncEngine {
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Create the sync repository, optionally with a remote. Safe to rerun.
    #[instrument(skip(self), fields(sync_dir = %self.config.sync_dir.display()))]
    pub fn init(&self, remote: Option<&str>) -> Result<()> {
        if let Some(url) = remote {
            validate_remote_url(url)?;
        }

        let repo = SyncRepo::init(&self.config.sync_dir, &self.config.branch)?;
        if let Some(url) = remote {
            repo.set_remote(&self.config.remote_name, url)?;
        }
        info!("sync repository ready");
        Ok(())
    }

    pub fn set_remote(&self, url: &str) -> Result<()> {
        validate_remote_url(url)?;
        let repo = SyncRepo::open(&self.config.sync_dir)?;
        repo.set_remote(&self.config.remote_name, url)?;
        info!(remote = %self.config.remote_name, "remote updated");
        Ok(())
    }

    pub fn remote_url(&self) -> Result<Option<String>> {
        SyncRepo::open(&self.config.sync_dir)?.remote_url(&self.config.remote_name)
    }

    /// Commit pending state changes and upload them if a remote is configured.
    #[instrument(skip(self, options), fields(remote = %self.config.remote_name))]
    pub fn push(&self, options: &PushOptions) -> Result<PushResult> {
        let repo = SyncRepo::open(&self.config.sync_dir)?;
        repo.ensure_clean_state()?;

        let remote_url = repo.remote_url(&self.config.remote_name)?;
        if let Some(url) = &remote_url {
            validate_remote_url(url)?;
        }

        let candidates = tracked_candidates();
        let pending = repo.changed_paths(&candidates)?;
        let mut result = PushResult::default();

        if !pending.is_empty() {
            let message = options
                .message
                .clone()
                .unwrap_or_else(|| default_message(&pending));
            if let Some(oid) = repo.commit_paths(&candidates, &message, &self.signature()?)? {
                result.committed = true;
                result.files_committed = pending.len();
                result.commit_id = Some(oid.to_string());
            }
        }

        if remote_url.is_none() {
            debug!("no remote configured; keeping commit local");
            return Ok(result);
        }
        if repo.head_commit()?.is_none() {
            debug!("nothing committed yet; skipping upload");
            return Ok(result);
        }

        repo.push(&self.config.remote_name, &self.config.branch)?;
        result.pushed = true;
        info!(
            committed = result.committed,
            files = result.files_committed,
            "push complete"
        );
        Ok(result)
    }

    /// Fetch the remote branch and integrate it without content merges.
    #[instrument(skip(self, options), fields(remote = %self.config.remote_name))]
    pub fn pull(&self, options: &mut PullOptions<'_>) -> Result<PullResult> {
        let repo = SyncRepo::open(&self.config.sync_dir)?;
        repo.ensure_clean_state()?;

        let url = repo
            .remote_url(&self.config.remote_name)?
            .ok_or(SyncError::NoRemoteConfigured)?;
        validate_remote_url(&url)?;

        // Local edits must be in history for the divergence check to see them.
        let candidates = tracked_candidates();
        if !repo.changed_paths(&candidates)?.is_empty() {
            repo.commit_paths(
                &candidates,
                "ctxsync: record local changes before pull",
                &self.signature()?,
            )?;
        }

        let Some(remote_tip) = repo.fetch(&self.config.remote_name, &self.config.branch)? else {
            debug!("remote branch does not exist yet");
            return Ok(PullResult {
                up_to_date: true,
                ..PullResult::default()
            });
        };

        let Some(local_tip) = repo.head_commit()?.map(|c| c.id()) else {
            let files_updated = count_state_files(&repo.file_changes(None, remote_tip)?);
            repo.fast_forward(&self.config.branch, remote_tip)?;
            info!(files = files_updated, "initial pull complete");
            return Ok(PullResult {
                fast_forwarded: true,
                files_updated,
                ..PullResult::default()
            });
        };

        if local_tip == remote_tip || repo.is_descendant_of(local_tip, remote_tip)? {
            debug!("already up to date");
            return Ok(PullResult {
                up_to_date: true,
                ..PullResult::default()
            });
        }

        if repo.is_descendant_of(remote_tip, local_tip)? {
            let files_updated = count_state_files(&repo.file_changes(Some(local_tip), remote_tip)?);
            repo.fast_forward(&self.config.branch, remote_tip)?;
            info!(files = files_updated, "fast-forwarded");
            return Ok(PullResult {
                fast_forwarded: true,
                files_updated,
                ..PullResult::default()
            });
        }

        self.merge_diverged(&repo, local_tip, remote_tip, options)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let mut status = SyncStatus {
            branch: self.config.branch.clone(),
            ..SyncStatus::default()
        };

        let repo = match SyncRepo::open(&self.config.sync_dir) {
            Ok(repo) => repo,
            Err(SyncError::NotInitialized) => return Ok(status),
            Err(e) => return Err(e),
        };
        status.initialized = true;

        status.remote_url = repo.remote_url(&self.config.remote_name)?;
        status.has_remote = status.remote_url.is_some();
        status.pending_changes = repo.changed_paths(&tracked_candidates())?.len();

        let local = repo.head_commit()?.map(|c| c.id());
        let upstream = repo.remote_tip(&self.config.remote_name, &self.config.branch)?;
        if let (Some(local), Some(upstream)) = (local, upstream) {
            let (ahead, behind) = repo.ahead_behind(local, upstream)?;
            status.ahead = ahead;
            status.behind = behind;
        }

        Ok(status)
    }

    fn merge_diverged(
        &self,
        repo: &SyncRepo,
        local_tip: Oid,
        remote_tip: Oid,
        options: &mut PullOptions<'_>,
    ) -> Result<PullResult> {
        let base = repo.merge_base(local_tip, remote_tip)?;
        let ours = repo.file_changes(base, local_tip)?;
        let theirs = repo.file_changes(base, remote_tip)?;

        let local_manifest = manifest_at(repo, local_tip)?;
        let remote_manifest = manifest_at(repo, remote_tip)?;
        let modified = |manifest: &Option<Manifest>, filename: &str| {
            manifest
                .as_ref()
                .and_then(|m| m.files.get(filename))
                .map(|entry| entry.last_modified)
        };

        let mut replacements: BTreeMap<String, Option<Oid>> = BTreeMap::new();
        let mut conflicts = Vec::new();

        for (filename, their_blob) in &theirs {
            let Some(kind) = StateKind::from_filename(filename) else {
                continue;
            };

            match ours.get(filename) {
                None => {
                    replacements.insert(filename.clone(), *their_blob);
                }
                Some(our_blob) if our_blob == their_blob => {}
                Some(our_blob) => {
                    let mut conflict = ConflictFile {
                        filename: filename.clone(),
                        kind,
                        local_deleted: our_blob.is_none(),
                        remote_deleted: their_blob.is_none(),
                        local_modified: modified(&local_manifest, filename),
                        remote_modified: modified(&remote_manifest, filename),
                        resolution: Resolution::Ours,
                    };
                    if let Some(resolver) = options.resolver.as_mut() {
                        conflict.resolution = resolver(&conflict);
                    }
                    if conflict.resolution == Resolution::Theirs {
                        replacements.insert(filename.clone(), *their_blob);
                    }
                    warn!(file = %filename, resolution = %conflict.resolution, "conflict resolved");
                    conflicts.push(conflict);
                }
            }
        }

        let files_updated = replacements.len();
        if let Some(manifest) =
            merged_manifest(local_manifest, remote_manifest.as_ref(), &replacements)
        {
            let mut bytes = serde_json::to_vec_pretty(&manifest)?;
            bytes.push(b'\n');
            replacements.insert(MANIFEST_FILE.to_string(), Some(repo.write_blob(&bytes)?));
        }

        let tree = repo.tree_with(local_tip, &replacements)?;
        let message = format!(
            "ctxsync: merge {}/{}",
            self.config.remote_name, self.config.branch
        );
        repo.commit_tree(tree, &[local_tip, remote_tip], &message, &self.signature()?)?;

        info!(
            files = files_updated,
            conflicts = conflicts.len(),
            "merged diverged histories"
        );
        Ok(PullResult {
            merged: true,
            conflicts,
            files_updated,
            ..PullResult::default()
        })
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(
            &self.config.author_name,
            &self.config.author_email,
        )?)
    }
}

/// Every path the protocol may stage: the state files plus the manifest.
pub fn tracked_candidates() -> Vec<String> {
    StateKind::ALL
        .into_iter()
        .map(StateKind::filename)
        .chain(std::iter::once(MANIFEST_FILE.to_string()))
        .collect()
}

fn default_message(changed: &[String]) -> String {
    format!("ctxsync: update {}", changed.join(", "))
}

fn count_state_files(changes: &BTreeMap<String, Option<Oid>>) -> usize {
    changes
        .keys()
        .filter(|name| StateKind::from_filename(name).is_some())
        .count()
}

fn manifest_at(repo: &SyncRepo, commit: Oid) -> Result<Option<Manifest>> {
    let Some(blob) = repo.blob_at(commit, MANIFEST_FILE)? else {
        return Ok(None);
    };
    let bytes = repo.read_blob(blob)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

// Local entries, overridden by the remote's for every file taken from the remote.
fn merged_manifest(
    local: Option<Manifest>,
    remote: Option<&Manifest>,
    taken_from_remote: &BTreeMap<String, Option<Oid>>,
) -> Option<Manifest> {
    let mut merged = match (local, remote) {
        (None, None) => return None,
        (Some(local), _) => local,
        (None, Some(remote)) => Manifest {
            files: BTreeMap::new(),
            ..remote.clone()
        },
    };

    for (filename, blob) in taken_from_remote {
        let entry = remote.and_then(|m| m.files.get(filename));
        match (blob, entry) {
            (Some(_), Some(entry)) => {
                merged.files.insert(filename.clone(), entry.clone());
            }
            (Some(_), None) => {}
            (None, _) => {
                merged.files.remove(filename);
            }
        }
    }

    if let Some(remote) = remote {
        merged.last_sync = merged.last_sync.max(remote.last_sync);
    }
    Some(merged)
}
