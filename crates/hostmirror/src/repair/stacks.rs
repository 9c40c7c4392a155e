use std::collections::HashSet;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::remote::{RemoteShell, sh_quote};
use crate::repair::{OnFailure, RepairEnv, RepairLogEntry, RepairStep, SequenceEnd, StepOutcome};

pub const DEFAULT_STACK_GLOBS: &[&str] = &[
    "/opt/*/docker-compose.yml",
    "/opt/*/docker-compose.yaml",
    "/opt/*/compose.yml",
    "/opt/*/compose.yaml",
    "/root/*/docker-compose.yml",
    "/srv/*/docker-compose.yml",
];

/// Globs are expanded by the remote shell, so only plain path characters and
/// wildcards are allowed.
pub fn validate_glob(glob: &str) -> Result<()> {
    let ok = glob.starts_with('/')
        && glob
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '*' | '?'));
    if ok {
        Ok(())
    } else {
        Err(Error::msg(format!(
            "repair.stack_globs entry '{glob}' must be an absolute path using only [A-Za-z0-9/._-*?]"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationStack {
    pub descriptor: String,
    pub dir: String,
}

impl ApplicationStack {
    pub fn from_descriptor(path: &str) -> Self {
        let dir = match path.rsplit_once('/') {
            Some(("", _)) => "/".to_string(),
            Some((d, _)) => d.to_string(),
            None => ".".to_string(),
        };
        Self {
            descriptor: path.to_string(),
            dir,
        }
    }
}

pub fn discover(shell: &dyn RemoteShell, globs: &[String]) -> Result<Vec<ApplicationStack>> {
    for g in globs {
        validate_glob(g)?;
    }
    if globs.is_empty() {
        return Ok(Vec::new());
    }
    let cmd = format!(
        "for f in {}; do [ -f \"$f\" ] && echo \"$f\"; done; true",
        globs.join(" ")
    );
    let out = shell.exec(&cmd)?;
    if !out.success() {
        return Err(Error::repair(format!(
            "stack discovery failed: {}",
            out.summary()
        )));
    }
    let mut seen = HashSet::new();
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('/'))
        .filter(|l| seen.insert(l.to_string()))
        .map(ApplicationStack::from_descriptor)
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComposeCommand {
    Standalone,
    Plugin,
}

impl ComposeCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ComposeCommand::Standalone => "docker-compose",
            ComposeCommand::Plugin => "docker compose",
        }
    }

    pub fn detect(shell: &dyn RemoteShell) -> Self {
        match shell.exec("command -v docker-compose >/dev/null 2>&1") {
            Ok(out) if out.success() => ComposeCommand::Standalone,
            _ => ComposeCommand::Plugin,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StackOutcome {
    pub stack: ApplicationStack,
    pub ok: bool,
    pub steps: Vec<StepOutcome>,
}

fn stack_steps(compose: ComposeCommand, stack: &ApplicationStack) -> Vec<RepairStep> {
    let base = format!(
        "cd {} && {} -f {}",
        sh_quote(&stack.dir),
        compose.as_str(),
        sh_quote(&stack.descriptor)
    );
    vec![
        RepairStep::new("up", format!("{base} up -d")).on_failure(OnFailure::Fallback),
        RepairStep::new("status", format!("{base} ps")),
    ]
}

pub fn bring_up_all(
    env: &mut RepairEnv<'_>,
    compose: ComposeCommand,
    stacks: &[ApplicationStack],
) -> Result<Vec<StackOutcome>> {
    let mut out = Vec::with_capacity(stacks.len());
    for stack in stacks {
        env.check_cancel()?;
        (env.notify)(&format!("stack {}", stack.descriptor));
        let report = env.run_steps(&stack_steps(compose, stack))?;
        let ok = report.end == SequenceEnd::Completed && report.steps.iter().all(|s| s.passed);
        env.record(RepairLogEntry::new(
            format!("stack {}: {}", stack.descriptor, if ok { "up" } else { "failed" }),
            report.steps.clone(),
        ));
        if !ok {
            tracing::warn!(stack = %stack.descriptor, "stack bring-up failed");
        }
        out.push(StackOutcome {
            stack: stack.clone(),
            ok,
            steps: report.steps,
        });
    }
    Ok(out)
}
