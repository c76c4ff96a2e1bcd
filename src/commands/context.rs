use std::env;

use chrono::Utc;
use ctxsync::error::ValidationError;
use ctxsync::state::{ContextNote, ContextState};
use ctxsync::{EngineConfig, Result, Workspace};

pub struct NoteInput {
    pub project: Option<String>,
    pub task: String,
    pub notes: Vec<String>,
    pub blockers: Vec<String>,
    pub next_steps: Vec<String>,
}

pub fn set(config: &EngineConfig, input: NoteInput) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let project = match input.project {
        Some(project) => project,
        None => current_project()?,
    };

    let mut state = workspace.read::<ContextState>()?.unwrap_or_default();
    state.notes.insert(
        project.clone(),
        ContextNote {
            task: input.task,
            notes: input.notes,
            blockers: input.blockers,
            next_steps: input.next_steps,
            updated_at: Utc::now(),
        },
    );
    workspace.write(&state)?;

    println!("Saved context for '{project}'");
    Ok(())
}

pub fn show(config: &EngineConfig, project: Option<&str>) -> Result<()> {
    let state = Workspace::open(config)?
        .read::<ContextState>()?
        .unwrap_or_default();

    let mut shown = 0;
    for (name, note) in state
        .notes
        .iter()
        .filter(|(name, _)| project.map_or(true, |p| p == name.as_str()))
    {
        shown += 1;
        println!("{name}  (updated {})", note.updated_at.format("%Y-%m-%d %H:%M UTC"));
        println!("  task: {}", note.task);
        print_list("note", &note.notes);
        print_list("blocker", &note.blockers);
        print_list("next", &note.next_steps);
    }

    if shown == 0 {
        println!("No context recorded");
    }
    Ok(())
}

fn print_list(label: &str, items: &[String]) {
    for item in items {
        println!("  {label}: {item}");
    }
}

fn current_project() -> Result<String> {
    let cwd = env::current_dir()?;
    cwd.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ValidationError::InvalidInput(
                "cannot name a project after the current directory; pass --project".into(),
            )
            .into()
        })
}
