use ctxsync::{EngineConfig, Result, SyncEngine};

pub fn status(config: &EngineConfig) -> Result<()> {
    let status = SyncEngine::new(config).status()?;

    if !status.initialized {
        println!("Not initialized. Run 'ctxsync init' first");
        return Ok(());
    }

    println!("Branch: {}", status.branch);
    match &status.remote_url {
        Some(url) => println!("Remote: {url}"),
        None => println!("Remote: none"),
    }
    println!("Pending changes: {}", status.pending_changes);
    if status.has_remote {
        println!("Ahead: {}  Behind: {}", status.ahead, status.behind);
    }
    Ok(())
}
