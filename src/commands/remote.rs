use ctxsync::{EngineConfig, Result, SyncEngine};

pub fn set(config: &EngineConfig, url: &str) -> Result<()> {
    SyncEngine::new(config).set_remote(url)?;
    println!("Remote '{}' set to {url}", config.remote_name);
    Ok(())
}

pub fn show(config: &EngineConfig) -> Result<()> {
    match SyncEngine::new(config).remote_url()? {
        Some(url) => println!("{}: {url}", config.remote_name),
        None => println!("No remote configured. Add one with: ctxsync remote set <url>"),
    }
    Ok(())
}
