//! Command approval gate.
//!
//! Restoring services or containers means running commands that came out of
//! synced state. Every such command passes through [`present_for_approval`],
//! and the only way to obtain an [`ApprovalOutcome`] with anything in
//! `approved` is an interactive prompt answered by a human.
//!
//! ```text
//! decrypted state -> PendingCommand -> validate -> prompt -> approved | rejected
//! ```
//!
//! The pattern checks in [`validate_command`] mark commands for extra
//! attention in the prompt. They are not the control; the prompt is.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::state::{DockerState, ServicesState};

/// Registries images may be pulled from without being flagged.
pub const TRUSTED_REGISTRIES: &[&str] = &[
    "docker.io",
    "registry-1.docker.io",
    "ghcr.io",
    "gcr.io",
    "quay.io",
    "registry.gitlab.com",
    "mcr.microsoft.com",
    "public.ecr.aws",
];

struct Detector {
    reason: &'static str,
    regex: Result<Regex, regex::Error>,
}

impl Detector {
    fn new(reason: &'static str, pattern: &str) -> Self {
        Self {
            reason,
            regex: Regex::new(pattern),
        }
    }

    // A detector that failed to compile flags everything.
    fn matches(&self, command: &str) -> bool {
        match &self.regex {
            Ok(regex) => regex.is_match(command),
            Err(_) => true,
        }
    }
}

/// Checked in order; the first match supplies the reason.
static DETECTORS: LazyLock<Vec<Detector>> = LazyLock::new(|| {
    vec![
        Detector::new(
            "downloads remote content and pipes it into a shell or interpreter",
            r"(?i)\b(?:curl|wget|fetch)\b[^;&]*\|\s*(?:sudo\s+)?(?:(?:ba|z|da|k|fi)?sh|python[0-9.]*|perl|ruby|php|node|deno|bun|lua|osascript|pwsh|powershell)\b|(?i)\b(?:(?:ba|z)?sh|python[0-9.]*|perl|ruby|node)\s+<\(\s*(?:curl|wget)\b",
        ),
        Detector::new(
            "recursive forced delete",
            r"(?i)\brm\s+(?:-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r|(?:-r|-f|--recursive|--force)\s+(?:-r|-f|--recursive|--force))",
        ),
        Detector::new(
            "reverse shell idiom",
            r"(?i)/dev/(?:tcp|udp)/|\b(?:nc|ncat|netcat)\b[^;&|]*\s-[ec]\b|\bbash\s+-i\b|\bsocat\b[^;&|]*\bexec:|\bmkfifo\b",
        ),
        Detector::new(
            "runs inline script code",
            r"(?i)\b(?:python[0-9.]*|perl|ruby|php|node|deno)\s+(?:-\w+\s+)*(?:-c|-e|-r|--eval)\b|\beval\s",
        ),
        Detector::new("uses command substitution", r"\$\(|`"),
        Detector::new(
            "escalates privileges",
            r"(?i)(?:^|[\s;&|(])(?:sudo|doas|pkexec|su)(?:\s|$)|\bchmod\s+(?:[ugoa]*\+s|[0-7]?[4-7][0-7]{3})\b",
        ),
        Detector::new(
            "installs a persistence mechanism",
            r"(?i)\bcrontab\b|/etc/cron|\bsystemctl\s+(?:--user\s+)?enable\b|\blaunchctl\s+(?:load|bootstrap)\b|LaunchAgents|>>?\s*\S*\.(?:bashrc|zshrc|bash_profile|profile)\b|authorized_keys|/etc/rc\.local",
        ),
        Detector::new(
            "writes to a system configuration path",
            r"(?i)(?:>>?|\btee\s+(?:-a\s+)?)\s*/(?:etc|boot|sys|usr/lib|lib/systemd)/|\b(?:cp|mv|ln|install)\s+[^;&|]*\s/etc/",
        ),
    ]
});

/// A command reconstructed from synced state, waiting for a decision. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command: String,
    pub label: String,
    pub cwd: Option<String>,
    pub port: Option<u16>,
    pub image: Option<String>,
}

impl PendingCommand {
    pub fn new(command: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            label: label.into(),
            cwd: None,
            port: None,
            image: None,
        }
    }
}

impl fmt::Display for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.command)?;
        if let Some(cwd) = &self.cwd {
            write!(f, " (in {cwd})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandCheck {
    pub suspicious: bool,
    pub reason: Option<String>,
}

impl CommandCheck {
    fn clean() -> Self {
        Self::default()
    }

    fn flagged(reason: impl Into<String>) -> Self {
        Self {
            suspicious: true,
            reason: Some(reason.into()),
        }
    }
}

/// Run `command` through the dangerous-pattern table.
pub fn validate_command(command: &str) -> CommandCheck {
    if command.trim().is_empty() {
        return CommandCheck::flagged("empty command");
    }

    DETECTORS
        .iter()
        .find(|detector| detector.matches(command))
        .map(|detector| CommandCheck::flagged(detector.reason))
        .unwrap_or_else(CommandCheck::clean)
}

/// Flag images whose registry prefix is not in [`TRUSTED_REGISTRIES`].
pub fn validate_docker_image(image: &str) -> CommandCheck {
    let image = image.trim();
    if image.is_empty() {
        return CommandCheck::flagged("empty image reference");
    }
    if image
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '$' | '`' | '<' | '>'))
    {
        return CommandCheck::flagged("image reference contains shell metacharacters");
    }

    match registry_of(image) {
        Some(registry) if !TRUSTED_REGISTRIES.contains(&registry.to_ascii_lowercase().as_str()) => {
            CommandCheck::flagged(format!("image from untrusted registry '{registry}'"))
        }
        _ => CommandCheck::clean(),
    }
}

// The first path component is a registry only if it looks like a host.
fn registry_of(image: &str) -> Option<&str> {
    let (first, _) = image.split_once('/')?;
    (first.contains('.') || first.contains(':') || first == "localhost").then_some(first)
}

/// A pending command together with its check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewedCommand {
    pub command: PendingCommand,
    pub check: CommandCheck,
}

impl ReviewedCommand {
    fn review(command: PendingCommand) -> Self {
        let mut check = validate_command(&command.command);
        if !check.suspicious {
            if let Some(image) = &command.image {
                check = validate_docker_image(image);
            }
        }
        Self { command, check }
    }
}

/// What the prompt shows the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPrompt {
    pub commands: Vec<ReviewedCommand>,
}

impl ApprovalPrompt {
    /// Indices offered as checked by default. Suspicious commands never are.
    pub fn preselected(&self) -> Vec<usize> {
        self.commands
            .iter()
            .enumerate()
            .filter(|(_, reviewed)| !reviewed.check.suspicious)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn suspicious_count(&self) -> usize {
        self.commands.iter().filter(|r| r.check.suspicious).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    /// Approve every command that was not flagged.
    ApproveAll,
    /// Pick commands one by one through the select callback.
    Select,
    SkipAll,
}

pub type PromptFn<'a> = &'a mut dyn FnMut(&ApprovalPrompt) -> PromptAnswer;
pub type SelectFn<'a> = &'a mut dyn FnMut(&ApprovalPrompt) -> Vec<usize>;

/// The decision for a batch of commands.
///
/// Only [`present_for_approval`] can build one, so anything executing
/// `approved()` went through the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    approved: Vec<PendingCommand>,
    rejected: Vec<PendingCommand>,
    skipped_all: bool,
}

impl ApprovalOutcome {
    pub fn approved(&self) -> &[PendingCommand] {
        &self.approved
    }

    pub fn rejected(&self) -> &[PendingCommand] {
        &self.rejected
    }

    pub fn skipped_all(&self) -> bool {
        self.skipped_all
    }

    fn reject_all(commands: Vec<ReviewedCommand>) -> Self {
        Self {
            approved: Vec::new(),
            skipped_all: !commands.is_empty(),
            rejected: commands.into_iter().map(|r| r.command).collect(),
        }
    }
}

/// Ask a human which commands may run.
///
/// Without `interactive`, or without a prompt, every command is rejected.
/// [`PromptAnswer::ApproveAll`] still leaves flagged commands out; those can
/// only be approved by selecting them explicitly.
pub fn present_for_approval(
    commands: Vec<PendingCommand>,
    interactive: bool,
    prompt: Option<PromptFn<'_>>,
    select: Option<SelectFn<'_>>,
) -> ApprovalOutcome {
    let reviewed: Vec<ReviewedCommand> = commands.into_iter().map(ReviewedCommand::review).collect();
    for r in reviewed.iter().filter(|r| r.check.suspicious) {
        warn!(
            label = %r.command.label,
            reason = r.check.reason.as_deref().unwrap_or_default(),
            "suspicious command"
        );
    }

    if reviewed.is_empty() {
        return ApprovalOutcome::reject_all(reviewed);
    }

    let Some(prompt) = prompt.filter(|_| interactive) else {
        debug!(count = reviewed.len(), "no interactive approval; rejecting all");
        return ApprovalOutcome::reject_all(reviewed);
    };

    let view = ApprovalPrompt { commands: reviewed };
    let chosen: Vec<usize> = match prompt(&view) {
        PromptAnswer::SkipAll => return ApprovalOutcome::reject_all(view.commands),
        PromptAnswer::ApproveAll => view.preselected(),
        PromptAnswer::Select => match select {
            Some(select) => select(&view),
            None => Vec::new(),
        },
    };

    let mut outcome = ApprovalOutcome {
        approved: Vec::new(),
        rejected: Vec::new(),
        skipped_all: false,
    };
    for (index, r) in view.commands.into_iter().enumerate() {
        if chosen.contains(&index) {
            outcome.approved.push(r.command);
        } else {
            outcome.rejected.push(r.command);
        }
    }
    outcome.skipped_all = outcome.approved.is_empty();
    outcome
}

/// One start command per recorded service.
pub fn pending_from_services(state: &ServicesState) -> Vec<PendingCommand> {
    state
        .services
        .iter()
        .map(|service| {
            let label = match &service.project {
                Some(project) => format!("{project}/{}", service.name),
                None => service.name.clone(),
            };
            PendingCommand {
                command: service.command.clone(),
                label,
                cwd: service.cwd.clone(),
                port: service.port,
                image: None,
            }
        })
        .collect()
}

/// `docker compose up` for compose projects, `docker run` for loose containers.
pub fn pending_from_docker(state: &DockerState) -> Vec<PendingCommand> {
    let mut pending = Vec::new();
    for (project, docker) in &state.projects {
        if let Some(compose_file) = &docker.compose_file {
            pending.push(PendingCommand {
                command: format!("docker compose -f {compose_file} up -d"),
                label: format!("{project} (compose)"),
                cwd: None,
                port: None,
                image: None,
            });
            continue;
        }

        for container in docker.containers.iter().filter(|c| c.running) {
            let mut command = format!("docker run -d --name {}", container.name);
            for port in &container.ports {
                command.push_str(&format!(" -p {port}"));
            }
            command.push(' ');
            command.push_str(&container.image);

            pending.push(PendingCommand {
                command,
                label: format!("{project}/{}", container.name),
                cwd: None,
                port: container
                    .ports
                    .first()
                    .and_then(|p| p.split(':').next())
                    .and_then(|p| p.parse().ok()),
                image: Some(container.image.clone()),
            });
        }
    }
    pending
}
