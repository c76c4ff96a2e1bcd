use ctxsync::{ConflictFile, EngineConfig, PullOptions, Resolution, Result, Workspace};

use super::prompt::ask;

/// Download remote state and merge it
pub fn pull(config: &EngineConfig, interactive: bool) -> Result<()> {
    let workspace = Workspace::open(config)?;

    let mut options = PullOptions::default();
    if interactive {
        options.resolver = Some(Box::new(ask_resolution));
    }
    let result = workspace.pull(&mut options)?;

    if result.up_to_date {
        println!("Already up to date");
    } else if result.fast_forwarded {
        println!("Fast-forwarded: {} file(s) updated", result.files_updated);
    } else if result.merged {
        println!(
            "Merged remote changes: {} file(s) updated, {} conflict(s)",
            result.files_updated,
            result.conflicts.len()
        );
        for conflict in &result.conflicts {
            println!("  {} - {}", conflict.filename, conflict.resolution);
        }
        if !result.conflicts.is_empty() {
            println!("\nRun 'ctxsync push' to publish the merge.");
        }
    }
    Ok(())
}

fn ask_resolution(conflict: &ConflictFile) -> Resolution {
    println!("\nConflict in {} ({} state)", conflict.filename, conflict.kind);
    println!("  local:  {}", describe(conflict.local_deleted, conflict.local_modified));
    println!("  remote: {}", describe(conflict.remote_deleted, conflict.remote_modified));

    loop {
        let answer = match ask("Keep [l]ocal or take [r]emote? [l]") {
            Ok(answer) => answer.to_ascii_lowercase(),
            Err(_) => return Resolution::Ours,
        };
        match answer.as_str() {
            "" | "l" | "local" => return Resolution::Ours,
            "r" | "remote" => return Resolution::Theirs,
            _ => println!("Please answer 'l' or 'r'"),
        }
    }
}

fn describe(deleted: bool, modified: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match (deleted, modified) {
        (true, _) => "deleted".to_string(),
        (false, Some(at)) => format!("modified {}", at.format("%Y-%m-%d %H:%M UTC")),
        (false, None) => "modified".to_string(),
    }
}
