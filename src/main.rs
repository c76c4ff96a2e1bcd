mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ctxsync::EngineConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctxsync")]
#[command(version)]
#[command(about = "Encrypted sync of your development context across machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the identity and sync repository on this machine
    Init {
        /// Remote repository URL (SSH, https:// or a local path)
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// Manage the sync remote
    Remote {
        #[command(subcommand)]
        action: RemoteCommand,
    },

    /// Commit local state changes and upload them
    Push {
        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Download remote state and merge it
    Pull {
        /// Ask which side to keep for each conflicting file
        #[arg(short, long)]
        interactive: bool,
    },

    /// Show sync status
    Status,

    /// Manage who can decrypt the synced state
    Team {
        #[command(subcommand)]
        action: TeamCommand,
    },

    /// Manage this machine's identity
    Key {
        #[command(subcommand)]
        action: KeyCommand,
    },

    /// Task notes per project
    Context {
        #[command(subcommand)]
        action: ContextCommand,
    },

    /// Restart recorded services and containers, after confirmation
    Restore {
        /// Never prompt; nothing will be started
        #[arg(long)]
        no_input: bool,
    },
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// Set the remote URL
    Set { url: String },
    /// Print the remote URL
    Show,
}

#[derive(Subcommand)]
enum TeamCommand {
    /// Add a member by public key (age1... or ssh-ed25519/ssh-rsa)
    Add { name: String, public_key: String },
    /// List members and fingerprints
    List,
    /// Remove a member by name
    Remove { name: String },
    /// Remove whoever holds this public key
    Revoke { public_key: String },
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Print this machine's public key and fingerprint
    Show,
    /// Replace this machine's key and re-encrypt all state
    Rotate,
    /// Restore an identity file from another machine or a backup
    Import { path: PathBuf },
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Record what you are working on
    Set {
        /// Current task
        task: String,
        /// Project name (defaults to the current directory name)
        #[arg(short, long)]
        project: Option<String>,
        /// Free-form note (repeatable)
        #[arg(short, long = "note")]
        notes: Vec<String>,
        /// Blocker (repeatable)
        #[arg(short, long = "blocker")]
        blockers: Vec<String>,
        /// Next step (repeatable)
        #[arg(long = "next")]
        next_steps: Vec<String>,
    },
    /// Show recorded notes
    Show {
        #[arg(short, long)]
        project: Option<String>,
    },
}

fn main() {
    init_tracing();

    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CTXSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let home = dirs::home_dir().context("could not determine the home directory")?;
    let config = ctxsync::config::load(EngineConfig::for_home(&home))
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Init { remote } => commands::init(&config, remote.as_deref())?,
        Commands::Remote { action } => match action {
            RemoteCommand::Set { url } => commands::remote::set(&config, &url)?,
            RemoteCommand::Show => commands::remote::show(&config)?,
        },
        Commands::Push { message } => commands::push(&config, message)?,
        Commands::Pull { interactive } => commands::pull(&config, interactive)?,
        Commands::Status => commands::status(&config)?,
        Commands::Team { action } => match action {
            TeamCommand::Add { name, public_key } => {
                commands::team::add(&config, &name, &public_key)?
            }
            TeamCommand::List => commands::team::list(&config)?,
            TeamCommand::Remove { name } => commands::team::remove(&config, &name)?,
            TeamCommand::Revoke { public_key } => commands::team::revoke(&config, &public_key)?,
        },
        Commands::Key { action } => match action {
            KeyCommand::Show => commands::key::show(&config)?,
            KeyCommand::Rotate => commands::key::rotate(&config)?,
            KeyCommand::Import { path } => commands::key::import(&config, &path)?,
        },
        Commands::Context { action } => match action {
            ContextCommand::Set {
                task,
                project,
                notes,
                blockers,
                next_steps,
            } => commands::context::set(
                &config,
                commands::context::NoteInput {
                    project,
                    task,
                    notes,
                    blockers,
                    next_steps,
                },
            )?,
            ContextCommand::Show { project } => {
                commands::context::show(&config, project.as_deref())?
            }
        },
        Commands::Restore { no_input } => commands::restore(&config, no_input)?,
    }

    Ok(())
}
