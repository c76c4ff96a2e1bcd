use std::io::{self, IsTerminal};
use std::path::Path;
use std::process::{Command, Stdio};

use ctxsync::approval::{
    pending_from_docker, pending_from_services, present_for_approval, ApprovalOutcome,
    ApprovalPrompt, PromptAnswer,
};
use ctxsync::state::{DockerState, ServicesState};
use ctxsync::{EngineConfig, Result, Workspace};

use super::prompt::ask;

/// Restart recorded services and containers the user approves
pub fn restore(config: &EngineConfig, no_input: bool) -> Result<()> {
    let workspace = Workspace::open(config)?;

    let mut pending = Vec::new();
    if let Some(services) = workspace.read::<ServicesState>()? {
        pending.extend(pending_from_services(&services));
    }
    if let Some(docker) = workspace.read::<DockerState>()? {
        pending.extend(pending_from_docker(&docker));
    }

    if pending.is_empty() {
        println!("Nothing to restore");
        return Ok(());
    }

    let interactive = !no_input && io::stdin().is_terminal();
    if !interactive {
        println!("Not running interactively; {} command(s) left unstarted.", pending.len());
    }

    let outcome = present_for_approval(
        pending,
        interactive,
        Some(&mut ask_approval),
        Some(&mut ask_selection),
    );

    if outcome.skipped_all() {
        println!("Nothing started");
        return Ok(());
    }
    run_approved(&outcome);
    Ok(())
}

fn ask_approval(view: &ApprovalPrompt) -> PromptAnswer {
    println!("These commands come from synced state:\n");
    for (index, reviewed) in view.commands.iter().enumerate() {
        let marker = if reviewed.check.suspicious { "!" } else { " " };
        println!("{marker} {:>2}. {}", index + 1, reviewed.command);
        if let Some(reason) = &reviewed.check.reason {
            println!("       warning: {reason}");
        }
    }
    if view.suspicious_count() > 0 {
        println!("\nCommands marked '!' are left out of 'all' and must be selected by number.");
    }

    match ask("\nRun [a]ll unflagged, [s]elect, or [N]one?") {
        Ok(answer) => match answer.to_ascii_lowercase().as_str() {
            "a" | "all" => PromptAnswer::ApproveAll,
            "s" | "select" => PromptAnswer::Select,
            _ => PromptAnswer::SkipAll,
        },
        Err(_) => PromptAnswer::SkipAll,
    }
}

fn ask_selection(view: &ApprovalPrompt) -> Vec<usize> {
    let suggested: Vec<String> = view
        .preselected()
        .iter()
        .map(|index| (index + 1).to_string())
        .collect();
    println!("Suggested: {}", suggested.join(","));

    let Ok(answer) = ask("Numbers to run (comma separated, empty for none):") else {
        return Vec::new();
    };
    answer
        .split(',')
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .filter(|n| *n >= 1 && *n <= view.commands.len())
        .map(|n| n - 1)
        .collect()
}

/// Start every approved command in the background.
fn run_approved(outcome: &ApprovalOutcome) {
    for command in outcome.approved() {
        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(&command.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(cwd) = command.cwd.as_deref().filter(|cwd| Path::new(cwd).is_dir()) {
            process.current_dir(cwd);
        }

        match process.spawn() {
            Ok(child) => println!("Started {} (pid {})", command.label, child.id()),
            Err(e) => eprintln!("Failed to start {}: {e}", command.label),
        }
    }

    for command in outcome.rejected() {
        println!("Skipped {}", command.label);
    }
}
