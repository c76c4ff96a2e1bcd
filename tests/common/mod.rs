use std::path::Path;

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use ctxsync::{EngineConfig, Workspace};
use tempfile::TempDir;

/// A bare repository standing in for the shared remote.
#[allow(dead_code)]
pub fn bare_remote() -> TempDir {
    let temp = TempDir::new().expect("failed to create temp dir");
    git2::Repository::init_bare(temp.path()).expect("failed to init bare repo");
    temp
}

/// Engine config rooted in `home`, the way the CLI lays it out.
pub fn config_in(home: &Path) -> EngineConfig {
    let mut config = EngineConfig::for_home(home);
    config.author_name = "Test User".into();
    config.author_email = "test@example.com".into();
    config
}

/// One machine: its own home directory and an initialized workspace.
#[allow(dead_code)]
pub struct Machine {
    pub home: TempDir,
    pub config: EngineConfig,
    pub workspace: Workspace,
}

#[allow(dead_code)]
pub fn machine(remote: Option<&Path>) -> Machine {
    let home = TempDir::new().expect("failed to create temp dir");
    let config = config_in(home.path());
    let url = remote.map(|p| p.to_str().expect("non-utf8 temp path").to_string());
    let workspace = Workspace::init(&config, url.as_deref()).expect("failed to init workspace");
    Machine {
        home,
        config,
        workspace,
    }
}

/// A second machine sharing `first`'s identity, as after `ctxsync key import`.
#[allow(dead_code)]
pub fn machine_with_identity_of(first: &Machine, remote: &Path) -> Machine {
    let home = TempDir::new().expect("failed to create temp dir");
    let config = config_in(home.path());
    let key_path = config_in(first.home.path()).local_dir.join("identity.key");
    Workspace::import_identity(&config, &key_path).expect("failed to import identity");

    let url = remote.to_str().expect("non-utf8 temp path");
    let workspace = Workspace::init(&config, Some(url)).expect("failed to init workspace");
    Machine {
        home,
        config,
        workspace,
    }
}

/// The ctxsync binary with HOME pointed at `home`.
#[allow(dead_code)]
pub fn ctxsync_cmd(home: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("ctxsync");
    cmd.env("HOME", home)
        .env_remove("CTXSYNC_SYNC_DIR")
        .env_remove("CTXSYNC_BRANCH")
        .env_remove("CTXSYNC_REMOTE_NAME")
        .env("CTXSYNC_AUTHOR_NAME", "Test User")
        .env("CTXSYNC_AUTHOR_EMAIL", "test@example.com");
    cmd
}

/// Absolute path to the ctxsync test binary.
#[allow(dead_code)]
pub fn ctxsync_bin() -> &'static str {
    env!("CARGO_BIN_EXE_ctxsync")
}
