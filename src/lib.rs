//! # ctxsync
//!
//! Encrypted synchronization of a developer's working context (tracked
//! projects, environment variables, docker setups, task notes, running
//! services, directory history) across machines, using a git repository as an
//! opaque transport for ciphertext.
//!
//! ## Features
//!
//! - **Envelope Encryption**: every state file is an armored age file readable by each listed recipient
//! - **Team Sharing**: add or revoke recipients; all state is re-encrypted on every change
//! - **Plaintext Manifest Only**: the manifest holds timestamps and nothing else
//! - **Safe Sync**: push and pull over SSH, HTTPS or local paths; conflicts are resolved per whole file
//! - **Approval Gate**: commands restored from synced state never run without a human saying yes
//!
//! ## Quick Start
//!
//! ```bash
//! # First machine
//! ctxsync init --remote git@github.com:me/context.git
//! ctxsync context set "finish the retry logic" --project api
//! ctxsync push
//!
//! # Second machine: bring the key over, then pull
//! ctxsync key import ~/backup/identity.key
//! ctxsync init --remote git@github.com:me/context.git
//! ctxsync pull
//! ctxsync context show
//! ```
//!
//! ## How It Works
//!
//! ```text
//! ~/.ctxsync/
//!   local/                 never synced
//!     identity.key         age secret key, 0600
//!     recipients.json      team registry, 0600
//!     config.toml          optional settings
//!   sync/                  git working tree
//!     manifest.json        plaintext timestamps
//!     *.age                one armored ciphertext per state type
//! ```
//!
//! **Write:**
//! ```text
//! typed record → JSON → age (all recipients) → <type>.age → manifest entry
//! ```
//!
//! **Pull:**
//! ```text
//! validate URL → fetch → fast-forward | per-file ours/theirs → merge commit
//! ```
//!
//! ## Module Overview
//!
//! - [`identity`] - This machine's private key, permissions, rotation staging
//! - [`crypto`] - age envelope encryption and recipient keys
//! - [`recipients`] - Team registry and fingerprints
//! - [`manifest`] - The plaintext manifest
//! - [`state`] - Typed state records and the encrypted store
//! - [`transport`] - Remote URL screening
//! - [`git`] - git2 plumbing for the sync repository
//! - [`sync`] - Push, pull and status
//! - [`approval`] - Command approval gate
//! - [`workspace`] - The façade the CLI uses
//! - [`config`] - Engine configuration
//! - [`error`] - Error types
//!
//! ## Security Considerations
//!
//! **Protected against:**
//! - Reading state from the remote or its transport without a recipient key
//! - Revoked members reading anything written or re-encrypted after revocation
//! - Plaintext state being written by mistake
//! - Synced commands running without confirmation
//!
//! **Not protected against:**
//! - A revoked member's copies of files they already decrypted
//! - Compromise of the local machine or its identity file
//! - Traffic analysis of when and how much is synced

pub mod approval;
pub mod config;
pub mod crypto;
pub mod error;
pub mod git;
pub mod identity;
pub mod manifest;
pub mod recipients;
pub mod state;
pub mod sync;
pub mod transport;
pub mod workspace;

pub use config::EngineConfig;
pub use crypto::RecipientKey;
pub use error::{Result, SyncError, TransportError, ValidationError};
pub use identity::{IdentityStore, LocalIdentity};
pub use recipients::{Recipient, RecipientRegistry};
pub use state::{StateData, StateKind, StateRecord, StateStore};
pub use sync::{
    ConflictFile, PullOptions, PullResult, PushOptions, PushResult, Resolution, SyncEngine,
    SyncStatus,
};
pub use workspace::Workspace;
