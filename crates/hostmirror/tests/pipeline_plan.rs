use std::path::PathBuf;

use hostmirror::config::ConfigDoc;
use hostmirror::planner::{GATE_BARRIER_ID, Plan};

fn doc(src: &str) -> ConfigDoc {
    let value: toml::Value = toml::from_str(src).unwrap();
    ConfigDoc {
        path: PathBuf::from("panel.toml"),
        value,
    }
}

fn plan_for(src: &str) -> hostmirror::Result<Plan> {
    hostmirror::modules::plan_for(&doc(src))
}

fn order(plan: &Plan) -> Vec<String> {
    plan.ordered()
        .unwrap()
        .into_iter()
        .map(|t| t.id.clone())
        .collect()
}

fn pos(ids: &[String], id: &str) -> usize {
    ids.iter()
        .position(|t| t == id)
        .unwrap_or_else(|| panic!("{id} not planned: {ids:?}"))
}

const MINIMAL: &str = r#"
[destination]
host = "203.0.113.10"
password_env = "HOSTMIRROR_PASSWORD"
"#;

#[test]
fn minimal_definition_plans_the_whole_pipeline_in_order() {
    let plan = plan_for(MINIMAL).unwrap();
    let ids = order(&plan);
    assert_eq!(
        ids,
        vec![
            "core.init",
            "destination.resolve",
            "destination.probe",
            GATE_BARRIER_ID,
            "exclude.build",
            "transfer.rsync",
            "repair.engine",
            "repair.stacks",
            "repair.post",
        ]
    );
}

#[test]
fn gate_barrier_depends_on_every_gate_task() {
    let plan = plan_for(MINIMAL).unwrap();
    let barrier = plan.get(GATE_BARRIER_ID).unwrap();
    assert_eq!(
        barrier.after,
        vec!["destination.probe".to_string(), "destination.resolve".to_string()]
    );
}

#[test]
fn disabling_transfer_keeps_repair_after_the_gate() {
    let plan = plan_for(&format!("{MINIMAL}\n[transfer]\nenabled = false\n")).unwrap();
    let ids = order(&plan);
    assert!(!ids.iter().any(|t| t == "transfer.rsync"));
    assert!(pos(&ids, GATE_BARRIER_ID) < pos(&ids, "repair.engine"));
}

#[test]
fn disabling_the_engine_step_keeps_stacks_planned() {
    let plan = plan_for(&format!(
        "{MINIMAL}\n[repair.steps.engine]\nenabled = false\n"
    ))
    .unwrap();
    let ids = order(&plan);
    assert!(!ids.iter().any(|t| t == "repair.engine"));
    assert!(pos(&ids, "transfer.rsync") < pos(&ids, "repair.stacks"));
}

#[test]
fn gate_steps_cannot_be_disabled() {
    let err = plan_for(&format!(
        "{MINIMAL}\n[destination.steps.probe]\nenabled = false\n"
    ))
    .unwrap_err();
    assert!(err.to_string().contains("destination.steps.probe"), "{err}");
}

#[test]
fn destination_cannot_be_disabled() {
    let err = plan_for("[destination]\nenabled = false\n").unwrap_err();
    assert!(err.to_string().contains("required module"), "{err}");
}

#[test]
fn unknown_top_level_tables_are_rejected() {
    let err = plan_for(&format!("{MINIMAL}\n[stage]\nenabled = true\n")).unwrap_err();
    assert_eq!(err.kind(), hostmirror::ErrorKind::Config);
    assert!(err.to_string().contains("'stage'"), "{err}");
}

#[test]
fn labels_can_be_overridden() {
    let plan = plan_for(&format!(
        "{MINIMAL}\n[transfer.steps.rsync]\nlabel = \"Copy panel\"\n"
    ))
    .unwrap();
    assert_eq!(plan.get("transfer.rsync").unwrap().label, "Copy panel");
}

#[test]
fn dot_output_names_every_task() {
    let plan = plan_for(MINIMAL).unwrap();
    let dot = plan.to_dot().unwrap();
    for t in plan.tasks() {
        assert!(dot.contains(&format!("\"{}\"", t.id)), "{dot}");
    }
}

#[test]
fn bad_stack_glob_fails_while_planning() {
    let err = plan_for(&format!(
        "{MINIMAL}\n[repair]\nstack_globs = [\"/opt/my app/*.yml\"]\n"
    ))
    .unwrap_err();
    assert_eq!(err.kind(), hostmirror::ErrorKind::Config);
    assert_eq!(err.kind().exit_code(), 2);
    assert!(err.to_string().contains("repair.stack_globs"), "{err}");
}

#[test]
fn empty_post_command_fails_while_planning() {
    let err = plan_for(&format!(
        "{MINIMAL}\n[[repair.post]]\nname = \"restart nginx\"\ncommand = \"\"\n"
    ))
    .unwrap_err();
    assert_eq!(err.kind(), hostmirror::ErrorKind::Config);
    assert!(err.to_string().contains("repair.post"), "{err}");
}

#[test]
fn disabled_repair_skips_its_checks() {
    let plan = plan_for(&format!(
        "{MINIMAL}\n[repair]\nenabled = false\nstack_globs = [\"relative/*.yml\"]\n"
    ))
    .unwrap();
    assert!(plan.get("repair.engine").is_none());
    assert!(plan.get("repair.stacks").is_none());
}
