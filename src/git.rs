use std::collections::BTreeMap;
use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, CredentialType, ErrorCode, FetchOptions, Index, IndexEntry, IndexTime, Oid,
    PushOptions, RemoteCallbacks, Repository, RepositoryInitOptions, RepositoryState, Signature,
    Status, Tree,
};
use tracing::debug;

use crate::error::{Result, SyncError};

const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// The sync directory's git repository.
pub struct SyncRepo {
    repo: Repository,
}

impl SyncRepo {
    /// Create the repository at `path`, or open it if it already exists.
    pub fn init(path: impl AsRef<Path>, branch: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Ok(repo) = Repository::open(path) {
            return Ok(Self { repo });
        }

        std::fs::create_dir_all(path)?;
        let mut options = RepositoryInitOptions::new();
        options.initial_head(branch);
        let repo = Repository::init_opts(path, &options)?;
        debug!(path = %path.display(), branch, "initialized sync repository");
        Ok(Self { repo })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::open(path.as_ref()).map_err(|_| SyncError::NotInitialized)?;
        Ok(Self { repo })
    }

    pub fn workdir(&self) -> Result<&Path> {
        self.repo
            .workdir()
            .ok_or_else(|| SyncError::Config("sync repository has no working directory".into()))
    }

    pub fn remotes(&self) -> Result<Vec<String>> {
        Ok(self
            .repo
            .remotes()?
            .iter()
            .flatten()
            .map(str::to_string)
            .collect())
    }

    pub fn remote_url(&self, name: &str) -> Result<Option<String>> {
        match self.repo.find_remote(name) {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Add the remote, or point an existing one at `url`.
    pub fn set_remote(&self, name: &str, url: &str) -> Result<()> {
        if self.remote_url(name)?.is_some() {
            self.repo.remote_set_url(name, url)?;
        } else {
            self.repo.remote(name, url)?;
        }
        Ok(())
    }

    pub fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_commit(&self, oid: Oid) -> Result<Commit<'_>> {
        Ok(self.repo.find_commit(oid)?)
    }

    /// Which of `candidates` differ from HEAD (modified, new, or deleted).
    pub fn changed_paths(&self, candidates: &[String]) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for path in candidates {
            let status = match self.repo.status_file(Path::new(path)) {
                Ok(status) => status,
                Err(e) if e.code() == ErrorCode::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if status.is_empty() || status.contains(Status::IGNORED) {
                continue;
            }
            changed.push(path.clone());
        }
        Ok(changed)
    }

    /// Stage exactly `candidates` (adding present files, removing missing
    /// tracked ones) and commit. Returns `None` when the tree is unchanged.
    pub fn commit_paths(
        &self,
        candidates: &[String],
        message: &str,
        signature: &Signature<'_>,
    ) -> Result<Option<Oid>> {
        let workdir = self.workdir()?.to_path_buf();
        let mut index = self.repo.index()?;

        for path in candidates {
            let rel = Path::new(path);
            if workdir.join(rel).is_file() {
                index.add_path(rel)?;
            } else if index.get_path(rel, 0).is_some() {
                index.remove_path(rel)?;
            }
        }
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = self.head_commit()?;
        if let Some(parent) = &parent {
            if parent.tree_id() == tree_oid {
                return Ok(None);
            }
        } else if index.is_empty() {
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), signature, signature, message, &tree, &parents)?;
        debug!(commit = %oid, "committed state files");
        Ok(Some(oid))
    }

    pub fn push(&self, remote_name: &str, branch: &str) -> Result<()> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut rejection: Option<String> = None;

        {
            let mut callbacks = remote_callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejection = Some(format!("{refname} ({message})"));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(|e| map_push_err(e, branch))?;
        }

        match rejection {
            Some(reason) => Err(SyncError::PushRejected(reason)),
            None => Ok(()),
        }
    }

    /// Fetch all branches and return the remote tip of `branch`, if it exists.
    pub fn fetch(&self, remote_name: &str, branch: &str) -> Result<Option<Oid>> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let refspec = format!("+refs/heads/*:refs/remotes/{remote_name}/*");
        let mut options = FetchOptions::new();
        options.remote_callbacks(remote_callbacks());
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;

        self.remote_tip(remote_name, branch)
    }

    /// The last fetched tip of `branch`, without touching the network.
    pub fn remote_tip(&self, remote_name: &str, branch: &str) -> Result<Option<Oid>> {
        match self
            .repo
            .find_reference(&format!("refs/remotes/{remote_name}/{branch}"))
        {
            Ok(reference) => Ok(reference.target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn ahead_behind(&self, local: Oid, upstream: Oid) -> Result<(usize, usize)> {
        Ok(self.repo.graph_ahead_behind(local, upstream)?)
    }

    pub fn is_descendant_of(&self, commit: Oid, ancestor: Oid) -> Result<bool> {
        Ok(self.repo.graph_descendant_of(commit, ancestor)?)
    }

    pub fn merge_base(&self, one: Oid, two: Oid) -> Result<Option<Oid>> {
        match self.repo.merge_base(one, two) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Files that differ between `base` and `target`, mapped to their blob in
    /// `target` (`None` when deleted). A missing base means the empty tree.
    pub fn file_changes(
        &self,
        base: Option<Oid>,
        target: Oid,
    ) -> Result<BTreeMap<String, Option<Oid>>> {
        let base_tree = match base {
            Some(oid) => Some(self.repo.find_commit(oid)?.tree()?),
            None => None,
        };
        let target_tree = self.repo.find_commit(target)?.tree()?;
        let diff = self
            .repo
            .diff_tree_to_tree(base_tree.as_ref(), Some(&target_tree), None)?;

        let mut changes = BTreeMap::new();
        for delta in diff.deltas() {
            let file = if delta.status() == git2::Delta::Deleted {
                delta.old_file()
            } else {
                delta.new_file()
            };
            let Some(path) = file.path().and_then(Path::to_str) else {
                continue;
            };
            let blob = match delta.status() {
                git2::Delta::Deleted => None,
                _ => Some(delta.new_file().id()),
            };
            changes.insert(path.to_string(), blob);
        }
        Ok(changes)
    }

    pub fn read_blob(&self, oid: Oid) -> Result<Vec<u8>> {
        Ok(self.repo.find_blob(oid)?.content().to_vec())
    }

    pub fn write_blob(&self, bytes: &[u8]) -> Result<Oid> {
        Ok(self.repo.blob(bytes)?)
    }

    /// Refuse to sync while a merge, rebase or similar is half done.
    pub fn ensure_clean_state(&self) -> Result<()> {
        match self.repo.state() {
            RepositoryState::Clean => Ok(()),
            state => Err(SyncError::Conflict(format!(
                "sync repository is in {state:?} state; finish or abort it with git in {} first",
                self.workdir()?.display()
            ))),
        }
    }

    /// Blob id of `path` in `commit`, if present.
    pub fn blob_at(&self, commit: Oid, path: &str) -> Result<Option<Oid>> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) => Ok(Some(entry.id())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Build a tree from `base` with whole-file replacements applied.
    pub fn tree_with(&self, base: Oid, replacements: &BTreeMap<String, Option<Oid>>) -> Result<Oid> {
        let base_tree: Tree<'_> = self.repo.find_commit(base)?.tree()?;
        let mut index = Index::new()?;
        index.read_tree(&base_tree)?;

        for (path, blob) in replacements {
            match blob {
                Some(id) => {
                    let size = self.repo.find_blob(*id)?.size();
                    index.add(&blob_entry(path, *id, size))?;
                }
                None => {
                    if index.get_path(Path::new(path), 0).is_some() {
                        index.remove_path(Path::new(path))?;
                    }
                }
            }
        }

        Ok(index.write_tree_to(&self.repo)?)
    }

    /// Commit `tree` on top of HEAD with the given extra parents, then check it out.
    pub fn commit_tree(
        &self,
        tree: Oid,
        parents: &[Oid],
        message: &str,
        signature: &Signature<'_>,
    ) -> Result<Oid> {
        let tree = self.repo.find_tree(tree)?;
        let parents = parents
            .iter()
            .map(|oid| self.repo.find_commit(*oid))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();

        let oid = self
            .repo
            .commit(Some("HEAD"), signature, signature, message, &tree, &parent_refs)?;
        self.checkout_head()?;
        Ok(oid)
    }

    /// Move `branch` to `target` and check it out.
    pub fn fast_forward(&self, branch: &str, target: Oid) -> Result<()> {
        let refname = format!("refs/heads/{branch}");
        match self.repo.find_reference(&refname) {
            Ok(mut reference) => {
                reference.set_target(target, "ctxsync: fast-forward")?;
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                self.repo
                    .reference(&refname, target, true, "ctxsync: initial pull")?;
            }
            Err(e) => return Err(e.into()),
        }
        self.repo.set_head(&refname)?;
        self.checkout_head()
    }

    fn checkout_head(&self) -> Result<()> {
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }
}

fn blob_entry(path: &str, id: Oid, size: usize) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        file_size: u32::try_from(size).unwrap_or(u32::MAX),
        id,
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

fn remote_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut attempts = 0;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str(&format!(
                "authentication to {url} failed after {MAX_CREDENTIAL_ATTEMPTS} attempts"
            )));
        }

        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let config = git2::Config::open_default()?;
            return Cred::credential_helper(&config, url, username_from_url);
        }
        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }
        Err(git2::Error::from_str(&format!(
            "no supported credential type for {url}"
        )))
    });
    callbacks
}

fn map_push_err(err: git2::Error, branch: &str) -> SyncError {
    let message = err.message().to_ascii_lowercase();
    if err.code() == ErrorCode::NotFastForward
        || message.contains("fast-forward")
        || message.contains("fastforward")
    {
        SyncError::PushRejected(format!("refs/heads/{branch} ({})", err.message()))
    } else {
        SyncError::Git(err)
    }
}
