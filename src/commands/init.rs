use ctxsync::recipients::fingerprint;
use ctxsync::{EngineConfig, IdentityStore, Result, Workspace};

/// Create the identity and sync repository
pub fn init(config: &EngineConfig, remote: Option<&str>) -> Result<()> {
    println!("Initializing ctxsync...");

    let had_identity = IdentityStore::new(&config.local_dir).exists();
    let workspace = Workspace::init(config, remote)?;
    let public_key = workspace.public_key();

    if had_identity {
        println!("Using existing identity");
    } else {
        println!("Generated new identity");
    }
    println!("Public key:  {public_key}");
    println!("Fingerprint: {}", fingerprint(&public_key));
    println!("Sync directory: {}", config.sync_dir.display());

    match remote {
        Some(url) => println!("Remote: {url}"),
        None => println!("No remote yet. Add one with: ctxsync remote set <url>"),
    }

    println!("\nInitialization complete!");
    if !had_identity {
        let key_path = IdentityStore::new(&config.local_dir).key_path();
        println!("\nBack up {} somewhere safe.", key_path.display());
        println!("Without it the synced state cannot be decrypted.");
    }

    Ok(())
}
