use std::path::Path;

use ctxsync::recipients::fingerprint;
use ctxsync::{EngineConfig, Result, Workspace};

pub fn show(config: &EngineConfig) -> Result<()> {
    let public_key = Workspace::open(config)?.public_key();
    println!("{public_key}");
    println!("Fingerprint: {}", fingerprint(&public_key));
    Ok(())
}

pub fn rotate(config: &EngineConfig) -> Result<()> {
    let mut workspace = Workspace::open(config)?;
    let report = workspace.rotate_identity()?;

    println!("Old key: {}", fingerprint(&report.old_key));
    println!("New key: {}", fingerprint(&report.new_key));
    println!("Re-encrypted {} file(s)", report.reencrypted.len());
    println!("\nNew public key: {}", report.new_key);
    println!("Send it to anyone who lists this machine as a team member, then run 'ctxsync push'.");
    Ok(())
}

pub fn import(config: &EngineConfig, path: &Path) -> Result<()> {
    let workspace = Workspace::import_identity(config, path)?;
    let public_key = workspace.public_key();
    println!("Imported identity from {}", path.display());
    println!("Public key:  {public_key}");
    println!("Fingerprint: {}", fingerprint(&public_key));
    Ok(())
}
