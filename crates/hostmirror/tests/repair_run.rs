use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use hostmirror::config::ConfigDoc;
use hostmirror::executor::{ChannelSink, ExecCtx, ExecEvent};
use hostmirror::modules::repair::{EngineTask, PostTask, StacksTask};
use hostmirror::remote::{RemoteOutput, RemoteShell};
use hostmirror::repair::engine::EngineState;

/// A destination whose engine only comes up after stale runtime files are removed.
#[derive(Default)]
struct FakeDestination {
    engine_fixable: bool,
    fixed: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeDestination {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn ran(&self, needle: &str) -> bool {
        self.calls().iter().any(|c| c.contains(needle))
    }
}

impl RemoteShell for FakeDestination {
    fn exec(&self, command: &str) -> hostmirror::Result<RemoteOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        if command.starts_with("printf ") {
            return Ok(RemoteOutput::default());
        }
        if command.starts_with("rm -f") && self.engine_fixable {
            self.fixed.store(true, Ordering::SeqCst);
        }
        if command.contains("is-active") {
            let code = if self.fixed.load(Ordering::SeqCst) { 0 } else { 3 };
            return Ok(RemoteOutput::new(code, "", ""));
        }
        if command.starts_with("for f in") {
            return Ok(RemoteOutput::new(
                0,
                "/opt/panel/docker-compose.yml\n/srv/node/docker-compose.yml\n",
                "",
            ));
        }
        if command.starts_with("command -v docker-compose") {
            return Ok(RemoteOutput::new(1, "", ""));
        }
        Ok(RemoteOutput::default())
    }

    fn describe(&self) -> String {
        "fake-destination".into()
    }
}

fn doc(root: &std::path::Path, repair: &str) -> ConfigDoc {
    let raw = format!(
        r#"
[workspace]
root_dir = "{}"

[destination]
host = "203.0.113.10"

[repair]
wait_secs = 0
poll_interval_secs = 1
{repair}
"#,
        root.display()
    );
    ConfigDoc {
        path: PathBuf::from("panel.toml"),
        value: toml::from_str(&raw).unwrap(),
    }
}

fn ctx_with(shell: Arc<FakeDestination>) -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    let ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
    ctx.set_remote_shell(shell);
    (ctx, rx)
}

#[test]
fn first_aid_recovery_then_discovered_stacks_start() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = Arc::new(FakeDestination {
        engine_fixable: true,
        ..Default::default()
    });
    let (mut ctx, _rx) = ctx_with(shell.clone());
    let doc = doc(tmp.path(), "");

    ctx.set_task(EngineTask::ID);
    EngineTask::exec(&doc, &mut ctx).unwrap();
    let report = ctx.engine_report().unwrap();
    assert_eq!(
        report.history,
        vec![
            EngineState::NotAttempted,
            EngineState::FirstAid,
            EngineState::Recovered
        ]
    );
    // One audit entry per attempt.
    let appends = shell
        .calls()
        .iter()
        .filter(|c| c.starts_with("printf "))
        .count();
    assert_eq!(appends, 2);

    ctx.set_task(StacksTask::ID);
    StacksTask::exec(&doc, &mut ctx).unwrap();
    let ups: Vec<String> = shell
        .calls()
        .into_iter()
        .filter(|c| c.ends_with(" up -d"))
        .collect();
    assert_eq!(
        ups,
        vec![
            "cd '/opt/panel' && docker compose -f '/opt/panel/docker-compose.yml' up -d",
            "cd '/srv/node' && docker compose -f '/srv/node/docker-compose.yml' up -d",
        ]
    );

    let report = tmp
        .path()
        .join("out/panel/hostmirror/modules/repair/repair.json");
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(json["engine"]["final_state"], "recovered");
    assert_eq!(json["stacks"].as_array().map(Vec::len), Some(2));
}

#[test]
fn failed_engine_skips_stacks_and_can_fail_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = Arc::new(FakeDestination::default());
    let (mut ctx, rx) = ctx_with(shell.clone());
    let doc = doc(tmp.path(), "fail_on_engine_failure = true");

    ctx.set_task(EngineTask::ID);
    let err = EngineTask::exec(&doc, &mut ctx).unwrap_err();
    assert_eq!(err.kind(), hostmirror::ErrorKind::Repair);
    assert_eq!(
        ctx.engine_report().unwrap().final_state,
        EngineState::Failed
    );
    assert!(shell.ran("journalctl -u 'docker'"));

    ctx.set_task(StacksTask::ID);
    StacksTask::exec(&doc, &mut ctx).unwrap();
    assert!(!shell.ran("for f in"));
    assert!(!shell.ran(" up -d"));

    drop(ctx);
    let warned = rx.iter().any(|ev| {
        matches!(ev, ExecEvent::TaskWarning { ref message, .. } if message.contains("could not be recovered"))
    });
    assert!(warned);
}

#[test]
fn post_steps_run_in_order_and_failures_are_warnings() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = Arc::new(FakeDestination::default());
    let (mut ctx, rx) = ctx_with(shell.clone());
    let doc = doc(
        tmp.path(),
        r#"
[[repair.post]]
name = "panel health"
command = "curl -s localhost:8000/health"
expect_stdout = "ok"

[[repair.post]]
name = "restart nginx"
command = "systemctl restart nginx"
"#,
    );

    ctx.set_task(PostTask::ID);
    PostTask::exec(&doc, &mut ctx).unwrap();
    let calls = shell.calls();
    let health = calls.iter().position(|c| c.starts_with("curl")).unwrap();
    let nginx = calls
        .iter()
        .position(|c| c == "systemctl restart nginx")
        .unwrap();
    assert!(health < nginx);

    drop(ctx);
    let warnings: Vec<String> = rx
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskWarning { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec!["post step 'panel health' failed (exit 0)".to_string()]);
}
