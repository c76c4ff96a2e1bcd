use ctxsync::{EngineConfig, PushOptions, Result, Workspace};

/// Commit local state changes and upload them
pub fn push(config: &EngineConfig, message: Option<String>) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let result = workspace.push(&PushOptions { message })?;

    if result.committed {
        let id = result.commit_id.as_deref().unwrap_or_default();
        println!(
            "Committed {} file(s) ({})",
            result.files_committed,
            &id[..id.len().min(8)]
        );
    } else {
        println!("No local changes to commit");
    }

    if result.pushed {
        println!("Pushed to {}/{}", config.remote_name, config.branch);
    } else {
        println!("Not pushed: no remote configured or nothing committed yet");
    }
    Ok(())
}
