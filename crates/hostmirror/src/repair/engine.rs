use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::remote::sh_quote;
use crate::repair::{
    OnFailure, RepairEnv, RepairLogEntry, RepairStep, SequenceEnd, StepOutcome, SuccessCheck,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    NotAttempted,
    StartedAsIs,
    FirstAid,
    SecondAid,
    LastResort,
    Recovered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AsIs,
    FirstAid,
    SecondAid,
    LastResort,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::AsIs,
        Phase::FirstAid,
        Phase::SecondAid,
        Phase::LastResort,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::AsIs => "start as-is",
            Phase::FirstAid => "first-aid",
            Phase::SecondAid => "second-aid",
            Phase::LastResort => "last-resort",
        }
    }

    // State entered when the fix is applied; the as-is attempt applies none.
    fn entering_state(self) -> Option<EngineState> {
        match self {
            Phase::AsIs => None,
            Phase::FirstAid => Some(EngineState::FirstAid),
            Phase::SecondAid => Some(EngineState::SecondAid),
            Phase::LastResort => Some(EngineState::LastResort),
        }
    }
}

fn default_service() -> String {
    "docker".into()
}

fn default_dependency() -> Option<String> {
    Some("containerd".into())
}

fn default_stale_files() -> Vec<String> {
    vec!["/var/run/docker.pid".into(), "/var/run/docker.sock".into()]
}

fn default_corrupt_state_files() -> Vec<String> {
    vec!["/var/lib/docker/network/files/local-kv.db".into()]
}

fn default_daemon_config() -> Option<String> {
    Some("/etc/docker/daemon.json".into())
}

fn default_journal_lines() -> u32 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineProfile {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_dependency")]
    pub dependency: Option<String>,
    #[serde(default = "default_stale_files")]
    pub stale_files: Vec<String>,
    #[serde(default = "default_corrupt_state_files")]
    pub corrupt_state_files: Vec<String>,
    #[serde(default = "default_daemon_config")]
    pub daemon_config: Option<String>,
    #[serde(default = "default_journal_lines")]
    pub journal_lines: u32,
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self {
            service: default_service(),
            dependency: default_dependency(),
            stale_files: default_stale_files(),
            corrupt_state_files: default_corrupt_state_files(),
            daemon_config: default_daemon_config(),
            journal_lines: default_journal_lines(),
        }
    }
}

impl EngineProfile {
    fn svc(&self) -> String {
        sh_quote(&self.service)
    }

    fn start_step(&self) -> RepairStep {
        RepairStep::new(
            format!("start {}", self.service),
            format!("systemctl start {}", self.svc()),
        )
    }

    fn reset_failed_step(&self) -> RepairStep {
        RepairStep::new(
            format!("reset failed state of {}", self.service),
            format!("systemctl reset-failed {}", self.svc()),
        )
    }

    fn remove_files_step(name: &str, files: &[String]) -> Option<RepairStep> {
        if files.is_empty() {
            return None;
        }
        let quoted: Vec<String> = files.iter().map(|f| sh_quote(f)).collect();
        Some(RepairStep::new(name, format!("rm -f {}", quoted.join(" "))))
    }

    pub fn check_command(&self) -> String {
        format!("systemctl is-active --quiet {}", self.svc())
    }

    pub fn phase_steps(&self, phase: Phase) -> Vec<RepairStep> {
        let mut steps = Vec::new();
        match phase {
            Phase::AsIs => {
                steps.push(
                    RepairStep::new(
                        format!("check {} unit", self.service),
                        format!("systemctl cat {} >/dev/null", self.svc()),
                    )
                    .on_failure(OnFailure::Abort),
                );
                steps.push(self.start_step());
            }
            Phase::FirstAid => {
                steps.extend(Self::remove_files_step(
                    "clear stale runtime files",
                    &self.stale_files,
                ));
                if let Some(dep) = self.dependency.as_deref() {
                    steps.push(RepairStep::new(
                        format!("enable and start {dep}"),
                        format!("systemctl enable --now {}", sh_quote(dep)),
                    ));
                }
                steps.push(self.reset_failed_step());
                steps.push(self.start_step());
            }
            Phase::SecondAid => {
                steps.extend(Self::remove_files_step(
                    "remove corrupt engine state",
                    &self.corrupt_state_files,
                ));
                steps.push(self.reset_failed_step());
                steps.push(self.start_step());
            }
            Phase::LastResort => {
                if let Some(cfg) = self.daemon_config.as_deref() {
                    let src = sh_quote(cfg);
                    let dst = sh_quote(&disabled_path(cfg));
                    steps.push(
                        RepairStep::new(
                            "move custom daemon config aside",
                            format!("if [ -f {src} ]; then mv -f {src} {dst}; fi"),
                        )
                        .on_failure(OnFailure::Fallback),
                    );
                }
                steps.push(self.reset_failed_step());
                steps.push(self.start_step());
            }
        }
        steps
    }

    // Undo the last-resort move when it did not help. An existing config at
    // the original path is never overwritten.
    fn restore_config_step(&self) -> Option<RepairStep> {
        let cfg = self.daemon_config.as_deref()?;
        let src = sh_quote(cfg);
        let dst = sh_quote(&disabled_path(cfg));
        Some(RepairStep::new(
            "restore custom daemon config",
            format!("if [ -f {dst} ] && [ ! -e {src} ]; then mv -f {dst} {src}; fi"),
        ))
    }

    fn diagnostics_steps(&self) -> Vec<RepairStep> {
        vec![
            RepairStep::new(
                format!("status of {}", self.service),
                format!("systemctl status {} --no-pager", self.svc()),
            )
            .success(SuccessCheck::Always),
            RepairStep::new(
                format!("journal of {}", self.service),
                format!(
                    "journalctl -u {} -n {} --no-pager",
                    self.svc(),
                    self.journal_lines
                ),
            )
            .success(SuccessCheck::Always),
        ]
    }
}

fn disabled_path(cfg: &str) -> String {
    format!("{cfg}.hostmirror-disabled")
}

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub window: Duration,
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub service: String,
    pub final_state: EngineState,
    pub history: Vec<EngineState>,
    pub attempts: usize,
    pub diagnostics: Vec<StepOutcome>,
}

impl EngineReport {
    pub fn recovered(&self) -> bool {
        self.final_state == EngineState::Recovered
    }
}

pub struct EngineRepair<'p> {
    profile: &'p EngineProfile,
    wait: WaitPolicy,
    history: Vec<EngineState>,
}

impl<'p> EngineRepair<'p> {
    pub fn new(profile: &'p EngineProfile, wait: WaitPolicy) -> Self {
        Self {
            profile,
            wait,
            history: vec![EngineState::NotAttempted],
        }
    }

    pub fn state(&self) -> EngineState {
        self.history
            .last()
            .copied()
            .unwrap_or(EngineState::NotAttempted)
    }

    fn transition(&mut self, env: &RepairEnv<'_>, next: EngineState) {
        tracing::debug!(from = ?self.state(), to = ?next, service = %self.profile.service, "engine state");
        (env.notify)(&format!("engine state: {:?} -> {:?}", self.state(), next));
        self.history.push(next);
    }

    pub fn run(mut self, env: &mut RepairEnv<'_>) -> Result<EngineReport> {
        let mut attempts = 0usize;
        for phase in Phase::ALL {
            env.check_cancel()?;
            if let Some(state) = phase.entering_state() {
                self.transition(env, state);
            }
            attempts += 1;

            let report = env.run_steps(&self.profile.phase_steps(phase))?;
            let mut outcomes = report.steps;
            let active = match report.end {
                SequenceEnd::Completed => {
                    let (active, wait_outcome) = self.wait_active(env)?;
                    outcomes.push(wait_outcome);
                    active
                }
                SequenceEnd::Fallback | SequenceEnd::Aborted => false,
            };

            env.record(RepairLogEntry::new(
                format!(
                    "{}: {} (attempt {attempts})",
                    self.profile.service,
                    phase.as_str()
                ),
                outcomes,
            ));

            if active {
                if phase == Phase::AsIs {
                    self.transition(env, EngineState::StartedAsIs);
                }
                if phase == Phase::LastResort
                    && let Some(cfg) = self.profile.daemon_config.as_deref()
                {
                    (env.notify)(&format!(
                        "WARN: {} runs without its custom config; it was moved to {}",
                        self.profile.service,
                        disabled_path(cfg)
                    ));
                }
                self.transition(env, EngineState::Recovered);
                return Ok(self.finish(attempts, Vec::new()));
            }
            if report.end == SequenceEnd::Aborted {
                break;
            }
        }

        self.transition(env, EngineState::Failed);
        let mut steps = Vec::new();
        if self.history.contains(&EngineState::LastResort) {
            steps.extend(self.profile.restore_config_step());
        }
        steps.extend(self.profile.diagnostics_steps());
        let diagnostics = env.run_steps(&steps)?.steps;
        env.record(RepairLogEntry::new(
            format!("{}: diagnostics", self.profile.service),
            diagnostics.clone(),
        ));
        Ok(self.finish(attempts, diagnostics))
    }

    fn finish(self, attempts: usize, diagnostics: Vec<StepOutcome>) -> EngineReport {
        EngineReport {
            service: self.profile.service.clone(),
            final_state: self.state(),
            history: self.history,
            attempts,
            diagnostics,
        }
    }

    // Check, sleep, re-check until active or the window closes. Always checks
    // at least once.
    fn wait_active(&self, env: &RepairEnv<'_>) -> Result<(bool, StepOutcome)> {
        let check = RepairStep::new(
            format!("wait for {} to become active", self.profile.service),
            self.profile.check_command(),
        );
        let deadline = Instant::now() + self.wait.window;
        let mut polls = 0u32;
        loop {
            env.check_cancel()?;
            polls += 1;
            let outcome = match env.shell.exec(&check.command) {
                Ok(out) => StepOutcome::from_output(&check, &out),
                Err(e) => StepOutcome {
                    name: check.name.clone(),
                    command: check.command.clone(),
                    passed: false,
                    code: -1,
                    output: e.to_string(),
                },
            };
            let now = Instant::now();
            if outcome.passed || now >= deadline {
                let mut outcome = outcome;
                if outcome.output.is_empty() {
                    outcome.output = format!("{polls} check(s)");
                }
                return Ok((outcome.passed, outcome));
            }
            thread::sleep(self.wait.interval.min(deadline - now));
        }
    }
}
