use std::time::Duration;

use hostmirror_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util::{self, default_true};
use crate::repair::engine::{EngineProfile, EngineRepair, Phase, WaitPolicy};
use crate::repair::stacks::{self, ComposeCommand, DEFAULT_STACK_GLOBS};
use crate::repair::{
    DEFAULT_LOG_FILE, OnFailure, RepairEnv, RepairLog, RepairLogEntry, RepairStep, SequenceEnd,
    SuccessCheck,
};

fn default_wait_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_log_file() -> String {
    DEFAULT_LOG_FILE.into()
}

fn default_stack_globs() -> Vec<String> {
    DEFAULT_STACK_GLOBS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostStepConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub expect_stdout: Option<String>,
    #[serde(default)]
    pub ignore_status: bool,
}

impl PostStepConfig {
    fn to_step(&self) -> Result<RepairStep> {
        if self.name.trim().is_empty() || self.command.trim().is_empty() {
            return Err(Error::msg(
                "repair.post entries need a non-empty name and command",
            ));
        }
        let success = if self.ignore_status {
            SuccessCheck::Always
        } else if let Some(needle) = self.expect_stdout.as_ref() {
            SuccessCheck::StdoutContains(needle.clone())
        } else {
            SuccessCheck::ExitZero
        };
        Ok(RepairStep::new(self.name.trim(), self.command.clone())
            .success(success)
            .on_failure(self.on_failure))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub engine: EngineProfile,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_stack_globs")]
    pub stack_globs: Vec<String>,
    pub fail_on_engine_failure: bool,
    pub post: Vec<PostStepConfig>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            engine: EngineProfile::default(),
            wait_secs: default_wait_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            log_file: default_log_file(),
            stack_globs: default_stack_globs(),
            fail_on_engine_failure: false,
            post: Vec::new(),
        }
    }
}

impl RepairConfig {
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            window: Duration::from_secs(self.wait_secs),
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }

    pub fn post_steps(&self) -> Result<Vec<RepairStep>> {
        self.post.iter().map(PostStepConfig::to_step).collect()
    }

    pub fn validate(&self) -> Result<()> {
        for g in &self.stack_globs {
            stacks::validate_glob(g)?;
        }
        if !self.log_file.starts_with('/') {
            return Err(Error::msg("repair.log_file must be an absolute path"));
        }
        self.post_steps().map(|_| ())
    }
}

fn load_cfg(doc: &ConfigDoc) -> Result<RepairConfig> {
    Ok(doc.deserialize_path("repair")?.unwrap_or_default())
}

pub fn log_file(doc: &ConfigDoc) -> Result<Option<String>> {
    let cfg = load_cfg(doc)?;
    Ok(cfg.enabled.then_some(cfg.log_file))
}

// Each task owns one top-level key of repair.json.
fn update_report(
    doc: &ConfigDoc,
    ctx: &ExecCtx,
    key: &str,
    value: serde_json::Value,
) -> Result<()> {
    let path = util::module_dir(doc, ctx, "repair")?.join("repair.json");
    let mut report = std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = report.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
    util::write_json_pretty(&path, &report)
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(|e| Error::msg(format!("json encode error: {e}")))
}

fn log_dry_run(ctx: &ExecCtx, title: &str, steps: &[RepairStep]) {
    for step in steps {
        ctx.log(&format!("DRY-RUN: {title}: {} => {}", step.name, step.command));
    }
}

// Runs `f` with a repair environment bound to the context's remote shell.
fn with_env<T>(
    ctx: &ExecCtx,
    cfg: &RepairConfig,
    f: impl FnOnce(&mut RepairEnv<'_>) -> Result<T>,
) -> Result<(T, RepairLog)> {
    let shell = ctx.remote_shell()?;
    let mut log = RepairLog::new(cfg.log_file.clone());
    let cancel = ctx.cancel.clone();
    let relay_ctx = ctx.clone();
    let notify = move |m: &str| util::relay(&relay_ctx, m);
    let out = {
        let mut env = RepairEnv {
            shell: shell.as_ref(),
            log: &mut log,
            cancel: &cancel,
            notify: &notify,
        };
        f(&mut env)?
    };
    Ok((out, log))
}

#[Task(
    id = "repair.engine",
    module = "repair",
    phase = "engine",
    provides = ["repair:engine"],
    after = ["gate:passed", "transfer:done?"],
    default_label = "Recover container engine",
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for EngineTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl EngineTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = load_cfg(doc)?;
        if ctx.dry_run {
            for phase in Phase::ALL {
                log_dry_run(ctx, phase.as_str(), &cfg.engine.phase_steps(phase));
            }
            return Ok(());
        }

        let (report, log) = with_env(ctx, &cfg, |env| {
            EngineRepair::new(&cfg.engine, cfg.wait_policy()).run(env)
        })?;
        let history: Vec<String> = report.history.iter().map(|s| format!("{s:?}")).collect();
        ctx.log(&format!(
            "{}: {} after {} attempt(s)",
            report.service,
            history.join(" -> "),
            report.attempts
        ));
        update_report(doc, ctx, "engine", to_json(&report)?)?;

        let recovered = report.recovered();
        let service = report.service.clone();
        ctx.set_engine_report(report);
        if !recovered {
            ctx.warn(&format!(
                "{service} could not be recovered; application stacks will not be started (see {} on the destination)",
                log.path()
            ));
            if cfg.fail_on_engine_failure {
                return Err(Error::repair(format!("{service} ended in the failed state")));
            }
        }
        Ok(())
    }
}

#[Task(
    id = "repair.stacks",
    module = "repair",
    phase = "stacks",
    provides = ["repair:stacks"],
    after = ["repair:engine?", "gate:passed", "transfer:done?"],
    default_label = "Start application stacks",
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StacksTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for StacksTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl StacksTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = load_cfg(doc)?;
        if let Some(report) = ctx.engine_report()
            && !report.recovered()
        {
            ctx.log(&format!("skip: {} is not running", report.service));
            return Ok(());
        }
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: would start compose stacks matching {}",
                cfg.stack_globs.join(" ")
            ));
            return Ok(());
        }

        let (outcomes, _log) = with_env(ctx, &cfg, |env| {
            let found = stacks::discover(env.shell, &cfg.stack_globs)?;
            if found.is_empty() {
                (env.notify)("no compose stacks found");
                return Ok(Vec::new());
            }
            let compose = ComposeCommand::detect(env.shell);
            (env.notify)(&format!(
                "{} stack(s) found, using {}",
                found.len(),
                compose.as_str()
            ));
            stacks::bring_up_all(env, compose, &found)
        })?;

        for o in outcomes.iter().filter(|o| !o.ok) {
            ctx.warn(&format!("stack {} did not come up", o.stack.descriptor));
        }
        update_report(doc, ctx, "stacks", to_json(&outcomes)?)
    }
}

#[Task(
    id = "repair.post",
    module = "repair",
    phase = "post",
    provides = ["repair:post"],
    after = ["repair:stacks?", "repair:engine?", "gate:passed", "transfer:done?"],
    default_label = "Run post steps",
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for PostTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl PostTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = load_cfg(doc)?;
        let steps = cfg.post_steps()?;
        if steps.is_empty() {
            ctx.log("no post steps configured");
            return Ok(());
        }
        if ctx.dry_run {
            log_dry_run(ctx, "post", &steps);
            return Ok(());
        }

        let (report, _log) = with_env(ctx, &cfg, |env| {
            let report = env.run_steps(&steps)?;
            env.record(RepairLogEntry::new("post steps", report.steps.clone()));
            Ok(report)
        })?;
        for s in report.steps.iter().filter(|s| !s.passed) {
            ctx.warn(&format!("post step '{}' failed (exit {})", s.name, s.code));
        }
        if report.end != SequenceEnd::Completed {
            ctx.warn(&format!(
                "post steps stopped early after '{}'",
                report.steps.last().map(|s| s.name.as_str()).unwrap_or("")
            ));
        }
        update_report(doc, ctx, "post", to_json(&report.steps)?)
    }
}

#[Module(
    id = "repair",
    config = RepairConfig,
    config_path = "repair",
    tasks = [EngineTask, StacksTask, PostTask],
    always = true,
    validate = true
)]
pub struct RepairModule;
