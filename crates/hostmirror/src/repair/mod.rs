pub mod engine;
pub mod stacks;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::remote::{RemoteOutput, RemoteShell, sh_quote};

pub const DEFAULT_LOG_FILE: &str = "/var/log/hostmirror-repair.log";

const MAX_OUTPUT_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessCheck {
    ExitZero,
    StdoutContains(String),
    Always,
}

impl SuccessCheck {
    pub fn passed(&self, out: &RemoteOutput) -> bool {
        match self {
            SuccessCheck::ExitZero => out.success(),
            SuccessCheck::StdoutContains(needle) => out.success() && out.stdout.contains(needle),
            SuccessCheck::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailure {
    #[default]
    Continue,
    Fallback,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairStep {
    pub name: String,
    pub command: String,
    pub success: SuccessCheck,
    pub on_failure: OnFailure,
}

impl RepairStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            success: SuccessCheck::ExitZero,
            on_failure: OnFailure::Continue,
        }
    }

    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn success(mut self, check: SuccessCheck) -> Self {
        self.success = check;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub code: i32,
    pub output: String,
}

impl StepOutcome {
    pub fn from_output(step: &RepairStep, out: &RemoteOutput) -> Self {
        Self {
            name: step.name.clone(),
            command: step.command.clone(),
            passed: step.success.passed(out),
            code: out.code,
            output: tail_lines(&out.combined(), MAX_OUTPUT_LINES),
        }
    }

    fn not_run(step: &RepairStep, err: &Error) -> Self {
        Self {
            name: step.name.clone(),
            command: step.command.clone(),
            passed: false,
            code: -1,
            output: format!("could not run: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEnd {
    Completed,
    Fallback,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub steps: Vec<StepOutcome>,
    pub end: SequenceEnd,
}

pub struct RepairEnv<'a> {
    pub shell: &'a dyn RemoteShell,
    pub log: &'a mut RepairLog,
    pub cancel: &'a AtomicBool,
    pub notify: &'a dyn Fn(&str),
}

impl RepairEnv<'_> {
    pub fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    pub fn run_steps(&self, steps: &[RepairStep]) -> Result<SequenceReport> {
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            self.check_cancel()?;
            let outcome = match self.shell.exec(&step.command) {
                Ok(out) => StepOutcome::from_output(step, &out),
                Err(e) => StepOutcome::not_run(step, &e),
            };
            let passed = outcome.passed;
            (self.notify)(&format!(
                "{} {} (exit {})",
                if passed { "ok:" } else { "failed:" },
                step.name,
                outcome.code
            ));
            outcomes.push(outcome);
            if passed {
                continue;
            }
            match step.on_failure {
                OnFailure::Continue => {}
                OnFailure::Fallback => {
                    return Ok(SequenceReport {
                        steps: outcomes,
                        end: SequenceEnd::Fallback,
                    });
                }
                OnFailure::Abort => {
                    return Ok(SequenceReport {
                        steps: outcomes,
                        end: SequenceEnd::Aborted,
                    });
                }
            }
        }
        Ok(SequenceReport {
            steps: outcomes,
            end: SequenceEnd::Completed,
        })
    }

    pub fn record(&mut self, entry: RepairLogEntry) {
        let notify = self.notify;
        self.log.append(self.shell, entry, notify);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairLogEntry {
    pub timestamp: String,
    pub title: String,
    pub steps: Vec<StepOutcome>,
}

impl RepairLogEntry {
    pub fn new(title: impl Into<String>, steps: Vec<StepOutcome>) -> Self {
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            title: title.into(),
            steps,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("=== {} {} ===\n", self.timestamp, self.title);
        for s in &self.steps {
            out.push_str(&format!(
                "[{}] {} (exit {})\n  $ {}\n",
                if s.passed { "ok" } else { "FAILED" },
                s.name,
                s.code,
                s.command
            ));
            for line in s.output.lines() {
                out.push_str("  | ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct RepairLog {
    path: String,
    entries: Vec<RepairLogEntry>,
    write_failures: usize,
}

impl RepairLog {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            write_failures: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entries(&self) -> &[RepairLogEntry] {
        &self.entries
    }

    pub fn write_failures(&self) -> usize {
        self.write_failures
    }

    // A log that cannot be written is reported, never fatal.
    pub fn append(&mut self, shell: &dyn RemoteShell, entry: RepairLogEntry, notify: &dyn Fn(&str)) {
        let cmd = format!(
            "printf '%s\\n' {} >> {}",
            sh_quote(&entry.render()),
            sh_quote(&self.path)
        );
        let failure = match shell.exec(&cmd) {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.summary()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            self.write_failures += 1;
            tracing::warn!(path = %self.path, %reason, "repair log append failed");
            notify(&format!("WARN: could not append to {}: {reason}", self.path));
        }
        self.entries.push(entry);
    }
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max {
        return text.to_string();
    }
    let skipped = lines.len() - max;
    format!("... ({skipped} lines omitted)\n{}", lines[skipped..].join("\n"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    type Responder = Box<dyn Fn(&str) -> Option<RemoteOutput> + Send + Sync>;

    // First matching rule answers; anything else succeeds silently.
    #[derive(Default)]
    pub struct ScriptedShell {
        rules: Vec<(String, Responder)>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedShell {
        pub fn on(mut self, needle: &str, out: RemoteOutput) -> Self {
            self.rules
                .push((needle.to_string(), Box::new(move |_: &str| Some(out.clone()))));
            self
        }

        pub fn on_fn(
            mut self,
            needle: &str,
            f: impl Fn(&str) -> Option<RemoteOutput> + Send + Sync + 'static,
        ) -> Self {
            self.rules.push((needle.to_string(), Box::new(f)));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn ran(&self, needle: &str) -> bool {
            self.calls().iter().any(|c| c.contains(needle))
        }
    }

    impl RemoteShell for ScriptedShell {
        fn exec(&self, command: &str) -> Result<RemoteOutput> {
            if let Ok(mut c) = self.calls.lock() {
                c.push(command.to_string());
            }
            for (needle, f) in &self.rules {
                if command.contains(needle.as_str())
                    && let Some(out) = f(command)
                {
                    return Ok(out);
                }
            }
            Ok(RemoteOutput::default())
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }
}
