#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use hostmirror::ErrorKind;
use hostmirror::config::ConfigDoc;
use hostmirror::executor::{ChannelSink, ExecCtx, ExecEvent};
use hostmirror::repair::engine::EngineState;

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(path).expect("meta").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        fs::create_dir_all(root.join("bin")).expect("bin");
        fs::create_dir_all(root.join("src/opt/app")).expect("src");
        fs::write(root.join("src/opt/app/docker-compose.yml"), "services: {}\n").expect("compose");

        // sshpass -e <program> <args...>
        write_script(&root.join("bin/sshpass"), "shift\nexec \"$@\"");
        // The remote command is the last argument.
        write_script(
            &root.join("bin/ssh"),
            &format!(
                "for a; do last=\"$a\"; done\nprintf '%s\\n' \"$last\" >> '{}'\nexit 0",
                root.join("ssh-calls.txt").display()
            ),
        );
        let fx = Self { _tmp: tmp, root };
        fx.rsync_exits_with(0);
        fx
    }

    fn rsync_exits_with(&self, code: i32) {
        write_script(
            &self.root.join("bin/rsync"),
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\necho 'Number of files: 2'\nexit {code}",
                self.root.join("rsync-args.txt").display()
            ),
        );
    }

    fn ssh_calls(&self) -> Vec<String> {
        fs::read_to_string(self.root.join("ssh-calls.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn doc(&self, extra: &str) -> ConfigDoc {
        let bin = self.root.join("bin");
        let raw = format!(
            r#"
[workspace]
root_dir = "{root}"
out_dir = "out"

[destination]
host = "203.0.113.10"
password = "correct-horse"
ssh_program = "{bin}/ssh"
sshpass_program = "{bin}/sshpass"
keygen_program = "true"
known_hosts_file = "known_hosts"

[transfer]
recipe = "custom"
paths = ["/opt/app", "/opt/missing"]
source_root = "{root}/src"
rsync_program = "{bin}/rsync"
{extra}
"#,
            root = self.root.display(),
            bin = bin.display(),
        );
        ConfigDoc {
            path: PathBuf::from("panel.toml"),
            value: toml::from_str(&raw).unwrap(),
        }
    }
}

fn run(doc: &ConfigDoc, dry_run: bool) -> (hostmirror::Result<()>, ExecCtx, Vec<ExecEvent>) {
    let plan = hostmirror::modules::plan_for(doc).unwrap();
    let reg = hostmirror::executor::builtin_registry().unwrap();
    let (tx, rx) = mpsc::channel();
    let mut ctx = ExecCtx::new(dry_run, Arc::new(ChannelSink::new(tx)));
    let res = hostmirror::executor::execute_plan(doc, &plan, &reg, &mut ctx);
    let events = rx.try_iter().collect();
    (res, ctx, events)
}

fn started(events: &[ExecEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskStarted { id } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

fn warnings(events: &[ExecEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskWarning { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn unreachable_destination_stops_before_the_exclude_policy() {
    let fx = Fixture::new();
    let doc = fx.doc("");
    let mut value = doc.value.clone();
    let dest = value
        .get_mut("destination")
        .and_then(toml::Value::as_table_mut)
        .unwrap();
    dest.insert("password".into(), "x".into());
    dest.insert("ssh_program".into(), "false".into());
    let doc = ConfigDoc {
        path: doc.path,
        value,
    };

    let (res, ctx, events) = run(&doc, false);
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);
    assert_eq!(err.kind().exit_code(), 4);

    let ids = started(&events);
    assert_eq!(ids.last().map(String::as_str), Some("destination.probe"));
    assert!(!ids.iter().any(|id| id == "exclude.build"));
    assert!(ctx.exclude_policy().is_none());
    assert!(!fx.root.join("rsync-args.txt").exists());
}

#[test]
fn missing_credential_fails_before_any_probe() {
    let fx = Fixture::new();
    let doc = fx.doc("");
    let mut value = doc.value.clone();
    value
        .get_mut("destination")
        .and_then(toml::Value::as_table_mut)
        .unwrap()
        .remove("password");
    let doc = ConfigDoc {
        path: doc.path,
        value,
    };

    let (res, _ctx, events) = run(&doc, false);
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Credential);
    assert!(!started(&events).iter().any(|id| id == "destination.probe"));
}

#[test]
fn dry_run_lists_the_transfer_and_only_describes_repair() {
    let fx = Fixture::new();
    let doc = fx.doc(
        r#"
[exclude]
exclude_firewall = false
exclude_engine_state = false

[[repair.post]]
name = "restart nginx"
command = "systemctl restart nginx"
"#,
    );

    let (res, ctx, events) = run(&doc, true);
    res.unwrap();

    let args = fs::read_to_string(fx.root.join("rsync-args.txt")).expect("rsync ran");
    let args: Vec<&str> = args.lines().collect();
    assert!(args.contains(&"--dry-run"));
    assert!(args.contains(&"--relative"));
    assert!(args.contains(&"--delete"));
    assert!(args.contains(&"--exclude=/proc/*"));
    assert!(args.contains(&"--exclude=/etc/ssh/ssh_host_*"));
    assert!(!args.iter().any(|a| a.starts_with("--exclude=/etc/ufw")));
    assert_eq!(args.last(), Some(&"root@203.0.113.10:/"));
    let src = format!("{}/src/./opt/app", fx.root.display());
    assert!(args.contains(&src.as_str()), "{args:?}");

    let policy = ctx.exclude_policy().expect("policy");
    assert!(policy.warnings().iter().any(|w| w.message().contains("firewall")));
    assert!(warnings(&events).iter().any(|w| w.contains("lock you out")));
    assert!(warnings(&events).iter().any(|w| w.contains("trusted on first use")));

    let report = fx
        .root
        .join("out/panel/hostmirror/modules/exclude/exclude.json");
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(report).expect("exclude.json")).unwrap();
    assert_eq!(json["fingerprint"], policy.fingerprint());

    let logs: Vec<&str> = events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskLog { line, .. } => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert!(logs.iter().any(|l| l.contains("skip /opt/missing")));
    assert!(logs.iter().any(|l| l.starts_with("DRY-RUN: start as-is")));
    assert!(logs.iter().any(|l| l.contains("DRY-RUN: post: restart nginx")));
    assert!(!logs.iter().any(|l| l.contains("correct-horse")));
    assert!(ctx.engine_report().is_none());
}

#[test]
fn failed_transfer_aborts_before_any_repair() {
    let fx = Fixture::new();
    fx.rsync_exits_with(12);
    let doc = fx.doc("");

    let (res, ctx, events) = run(&doc, false);
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert_eq!(err.kind().exit_code(), 5);

    let ids = started(&events);
    assert_eq!(ids.last().map(String::as_str), Some("transfer.rsync"));
    assert!(!ids.iter().any(|id| id.starts_with("repair.")));
    assert!(ctx.engine_report().is_none());
    assert!(!fx.ssh_calls().iter().any(|c| c.contains("systemctl")));
}

#[test]
fn full_run_copies_then_repairs() {
    let fx = Fixture::new();
    let doc = fx.doc(
        r#"
[[repair.post]]
name = "restart nginx"
command = "systemctl restart nginx"
"#,
    );

    let (res, ctx, events) = run(&doc, false);
    res.unwrap();

    assert_eq!(
        started(&events),
        vec![
            "core.init",
            "destination.resolve",
            "destination.probe",
            "core.barrier.gate",
            "exclude.build",
            "transfer.rsync",
            "repair.engine",
            "repair.stacks",
            "repair.post",
        ]
    );

    let args = fs::read_to_string(fx.root.join("rsync-args.txt")).expect("rsync ran");
    assert!(!args.lines().any(|a| a == "--dry-run"));

    let report = ctx.engine_report().expect("engine report");
    assert_eq!(
        report.history,
        vec![
            EngineState::NotAttempted,
            EngineState::StartedAsIs,
            EngineState::Recovered
        ]
    );

    let calls = fx.ssh_calls();
    assert_eq!(calls.first().map(String::as_str), Some("true"));
    let start = calls
        .iter()
        .position(|c| c == "systemctl start 'docker'")
        .expect("engine started");
    let post = calls
        .iter()
        .position(|c| c == "systemctl restart nginx")
        .expect("post step ran");
    assert!(start < post);
    assert!(calls.iter().any(|c| c.contains(">> '/var/log/hostmirror-repair.log'")));

    let json: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(
            fx.root
                .join("out/panel/hostmirror/modules/repair/repair.json"),
        )
        .expect("repair.json"),
    )
    .unwrap();
    assert_eq!(json["engine"]["final_state"], "recovered");
    assert_eq!(json["post"][0]["passed"], true);
}
