use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::log_sanitize::{command_line, redact, sanitize_log_line};
use crate::planner::{GATE_BARRIER_ID, Plan};
use crate::policy::ExcludePolicy;
use crate::remote::{RemoteShell, SshTransport};
use crate::repair::engine::EngineReport;
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    // Running child process groups, killed on cancel.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
    // Set by destination.resolve; the transfer needs the concrete ssh transport,
    // repair only needs something that runs remote commands.
    transport: Mutex<Option<Arc<SshTransport>>>,
    remote: Mutex<Option<Arc<dyn RemoteShell>>>,
    exclude_policy: Mutex<Option<Arc<ExcludePolicy>>>,
    engine_report: Mutex<Option<EngineReport>>,
    secrets: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskWarning {
        id: String,
        message: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    total_task_ms: u128,
    failed_tasks: Vec<String>,
    warnings: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
    error_logged_tasks: BTreeSet<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let mut summary_print = None::<(bool, Option<String>, String)>;
        let mut written_error_log = None::<(String, PathBuf)>;
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started = s.tasks_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                    append_task_log_line(&mut s.task_logs, &id, &line);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskWarning { id, message } => {
                if let Ok(mut s) = self.state.lock() {
                    append_task_log_line(&mut s.task_logs, &id, &format!("WARN: {message}"));
                    s.warnings.push(format!("{id}: {message}"));
                }
                println!("WARN: [{id}] {message}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let err_text = error.unwrap_or_default();
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok = s.tasks_ok.saturating_add(1);
                        s.task_logs.remove(&id);
                    } else {
                        s.tasks_failed = s.tasks_failed.saturating_add(1);
                        s.failed_tasks.push(id.clone());
                        let err = (!err_text.is_empty()).then_some(err_text.as_str());
                        match write_stdout_task_error_log(&mut s, &id, err, elapsed_ms) {
                            Ok(path) => written_error_log = Some((id.clone(), path)),
                            Err(e) => {
                                println!("WARN: failed to write task error log for {id}: {e}")
                            }
                        }
                    }
                    s.total_task_ms = s.total_task_ms.saturating_add(elapsed_ms);
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                }
                if let Some((task_id, path)) = written_error_log.take() {
                    println!("ERROR_LOG: {task_id} => {}", path.display());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    let mut summary = String::new();
                    summary.push_str("SUMMARY:\n");
                    summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                    summary.push_str(&format!(
                        "  tasks: started={} ok={} failed={}\n",
                        s.tasks_started, s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!("  logs: {}\n", s.log_lines));
                    summary.push_str(&format!(
                        "  elapsed: {}\n",
                        format_elapsed_hms(wall.as_secs())
                    ));
                    summary.push_str(&format!(
                        "  summed_task_time: {}\n",
                        format_elapsed_hms((s.total_task_ms / 1000) as u64)
                    ));
                    if !s.warnings.is_empty() {
                        summary.push_str("  warnings:\n");
                        for w in &s.warnings {
                            summary.push_str(&format!("    {w}\n"));
                        }
                    }
                    if !s.failed_tasks.is_empty() {
                        let mut failed = s.failed_tasks.clone();
                        failed.sort();
                        failed.dedup();
                        summary.push_str(&format!("  failed_tasks: {}\n", failed.join(", ")));
                    }
                    if !s.error_log_paths.is_empty() {
                        summary.push_str("  error_logs:\n");
                        for p in &s.error_log_paths {
                            summary.push_str(&format!("    {}\n", p.display()));
                        }
                    }
                    summary_print = Some((ok, error.clone(), summary));
                    *s = StdoutSinkState::default();
                }
                if ok {
                    println!("DONE: ok");
                } else {
                    println!("DONE: failed {}", error.unwrap_or_default());
                }
            }
        }
        if let Some((ok, error, summary)) = summary_print {
            print!("{summary}");
            if !ok && let Some(e) = error {
                println!("  error: {e}");
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Make workspace paths available to tasks. Cleaning is only applied by core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }

        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        if !ws.enabled {
            return crate::workspace::load_paths(&WorkspaceConfig::default());
        }

        ws.clean = CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn set_transport(&self, transport: Arc<SshTransport>) {
        self.add_secrets(transport.secrets());
        if let Ok(mut g) = self.shared.remote.lock()
            && g.is_none()
        {
            *g = Some(transport.clone() as Arc<dyn RemoteShell>);
        }
        if let Ok(mut g) = self.shared.transport.lock() {
            *g = Some(transport);
        }
    }

    pub fn transport(&self) -> Result<Arc<SshTransport>> {
        self.shared
            .transport
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| Error::msg("destination transport has not been resolved"))
    }

    // The signal watcher holds a clone of this context; a converted key is wiped here.
    pub fn release_transport(&self) {
        if let Ok(mut g) = self.shared.remote.lock() {
            g.take();
        }
        if let Ok(mut g) = self.shared.transport.lock() {
            g.take();
        }
    }

    pub fn set_remote_shell(&self, shell: Arc<dyn RemoteShell>) {
        if let Ok(mut g) = self.shared.remote.lock() {
            *g = Some(shell);
        }
    }

    pub fn remote_shell(&self) -> Result<Arc<dyn RemoteShell>> {
        self.shared
            .remote
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| Error::msg("destination transport has not been resolved"))
    }

    pub fn set_exclude_policy(&self, policy: ExcludePolicy) {
        if let Ok(mut g) = self.shared.exclude_policy.lock() {
            *g = Some(Arc::new(policy));
        }
    }

    pub fn exclude_policy(&self) -> Option<Arc<ExcludePolicy>> {
        self.shared
            .exclude_policy
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    pub fn set_engine_report(&self, report: EngineReport) {
        if let Ok(mut g) = self.shared.engine_report.lock() {
            *g = Some(report);
        }
    }

    pub fn engine_report(&self) -> Option<EngineReport> {
        self.shared
            .engine_report
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    pub fn add_secrets(&self, secrets: Vec<String>) {
        if let Ok(mut g) = self.shared.secrets.lock() {
            for s in secrets {
                if !s.is_empty() && !g.contains(&s) {
                    g.push(s);
                }
            }
        }
    }

    fn scrub(&self, msg: &str) -> String {
        match self.shared.secrets.lock() {
            Ok(g) if !g.is_empty() => redact(msg, &g),
            _ => msg.to_string(),
        }
    }

    fn register_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.insert(pgid, self.task_id());
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    pub fn kill_running_children(&self, force: bool) {
        let pgids: Vec<u32> = self
            .shared
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, force);
        }
    }

    fn task_id(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskLog {
            id: self.task_id(),
            line: self.scrub(msg),
        });
    }

    pub fn warn(&self, msg: &str) {
        let message = self.scrub(msg);
        tracing::warn!(task = %self.task_id(), "{message}");
        self.sink.emit(ExecEvent::TaskWarning {
            id: self.task_id(),
            message,
        });
    }

    pub fn run_cmd(&self, mut cmd: Command) -> Result<ExitStatus> {
        if self.cancelled() {
            return Err(Error::cancelled());
        }
        tracing::debug!(cmd = %self.scrub(&command_line(&cmd)), "spawn");

        // On unix: put the child into its own process group so we can kill the whole subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            // A child in its own process group that reads the controlling TTY gets SIGTTIN.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                let program = cmd.get_program().to_string_lossy().into_owned();
                Error::msg(format!("failed to start '{program}': {e}"))
            })?;
        let pgid = child.id();
        self.register_child_pgroup(pgid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = stdout {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut interrupted = false;
        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
            if self.cancelled() {
                kill_pgroup(pgid, false);
                interrupted = true;
                break;
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        self.unregister_child_pgroup(pgid);
        if interrupted || self.cancelled() {
            return Err(Error::cancelled());
        }
        Ok(status)
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run tasks in dependency order, stopping at the first failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    let mut execs = Vec::with_capacity(ordered.len());
    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        execs.push((task, exec));
    }

    for (task, exec) in execs {
        if ctx.cancelled() {
            let e = Error::cancelled();
            ctx.sink.emit(ExecEvent::ExecutorDone {
                ok: false,
                error: Some(e.to_string()),
            });
            return Err(e);
        }
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(ctx.scrub(&e.to_string())),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(ctx.scrub(&e.to_string())),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    // Keep this list explicit (compiled-in modules).
    reg.add("core.init", core_init)?;
    reg.add(GATE_BARRIER_ID, core_barrier_gate)?;
    crate::modules::destination::DestinationModule::register_tasks(&mut reg)?;
    crate::modules::exclude::ExcludeModule::register_tasks(&mut reg)?;
    crate::modules::transfer::TransferModule::register_tasks(&mut reg)?;
    crate::modules::repair::RepairModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    if !ws.enabled {
        return Ok(());
    }

    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
    ctx.log(&format!(
        "workspace.clean = {}",
        match ws.clean {
            CleanMode::None => "none",
            CleanMode::Out => "out",
        }
    ));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.set_workspace_paths(paths.clone());
    ctx.log(&format!(
        "workspace.out_dir(abs) = {}",
        paths.out_dir.display()
    ));
    for (name, path) in &paths.named_dirs {
        ctx.log(&format!("workspace.paths.{} = {}", name, path.display()));
    }
    Ok(())
}

fn core_barrier_gate(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    // Pure ordering barrier; the gate tasks did the checking.
    ctx.log("destination gate passed");
    Ok(())
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            // rsync redraws progress with '\r'; treat it as a line break.
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

fn append_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_stdout_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: Option<&str>,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let file_name = format!("{}.log", sanitize_filename_component(task_id));
    if state.error_logged_tasks.contains(task_id)
        && let Some(existing) = state
            .error_log_paths
            .iter()
            .find(|p| p.file_name().and_then(|s| s.to_str()) == Some(file_name.as_str()))
    {
        return Ok(existing.clone());
    }

    let dir = ensure_stdout_error_logs_dir(state)?;
    let path = dir.join(file_name);

    let mut body = String::new();
    body.push_str(&format!("task: {task_id}\n"));
    body.push_str("status: failed\n");
    body.push_str(&format!("elapsed_ms: {elapsed_ms}\n"));
    if let Some(e) = error.filter(|e| !e.trim().is_empty()) {
        body.push_str(&format!("error: {e}\n"));
    }
    body.push('\n');
    body.push_str("logs:\n");
    if let Some(lines) = state.task_logs.get(task_id) {
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;

    state.error_logged_tasks.insert(task_id.to_string());
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn ensure_stdout_error_logs_dir(state: &mut StdoutSinkState) -> Result<PathBuf> {
    if let Some(existing) = state.error_logs_dir.as_ref() {
        return Ok(existing.clone());
    }

    let root = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("build")
        .join("error-logs");
    let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    fs::create_dir_all(&dir).map_err(|e| {
        Error::msg(format!(
            "failed to create error logs dir {}: {e}",
            dir.display()
        ))
    })?;
    state.error_logs_dir = Some(dir.clone());
    Ok(dir)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
