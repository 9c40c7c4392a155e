use std::path::Path;

use hostmirror_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util::default_true;
use crate::transfer::{
    Endpoint, ModeFlags, Recipe, TransferOutcome, TransferSpec, classify_exit, exit_reason,
    recipe_sources,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub recipe: Recipe,
    pub paths: Vec<String>,
    pub source_root: String,
    pub dest_root: String,
    #[serde(default = "default_true")]
    pub delete_extraneous: bool,
    pub whole_file: bool,
    #[serde(default = "default_true")]
    pub numeric_ids: bool,
    pub allow_partial: bool,
    pub rsync_program: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let flags = ModeFlags::default();
        Self {
            enabled: true,
            recipe: Recipe::Full,
            paths: Vec::new(),
            source_root: "/".into(),
            dest_root: "/".into(),
            delete_extraneous: flags.delete_extraneous,
            whole_file: flags.whole_file,
            numeric_ids: flags.numeric_ids,
            allow_partial: false,
            rsync_program: "rsync".into(),
        }
    }
}

impl TransferConfig {
    pub fn flags(&self) -> ModeFlags {
        ModeFlags {
            delete_extraneous: self.delete_extraneous,
            whole_file: self.whole_file,
            numeric_ids: self.numeric_ids,
        }
    }
}

#[Task(
    id = "transfer.rsync",
    module = "transfer",
    phase = "transfer",
    provides = ["transfer:done"],
    after = ["gate:passed", "exclude:policy"],
    default_label = "Copy filesystem",
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RsyncTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for RsyncTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl RsyncTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: TransferConfig = doc.deserialize_path("transfer")?.unwrap_or_default();
        let transport = ctx.transport()?;
        let policy = ctx
            .exclude_policy()
            .ok_or_else(|| Error::msg("exclude policy has not been built"))?;

        let (sources, missing) =
            recipe_sources(cfg.recipe, &cfg.paths, Path::new(&cfg.source_root))?;
        for m in &missing {
            ctx.log(&format!("skip {m}: not present on the source"));
        }

        let spec = TransferSpec::new(
            Endpoint::Local { paths: sources },
            Endpoint::Remote {
                dest: transport.destination().clone(),
                path: cfg.dest_root.clone(),
            },
            policy.patterns().map(str::to_string).collect(),
            cfg.flags(),
            transport.rsync_remote_shell(),
        )?
        .relative(cfg.recipe != Recipe::Full);

        ctx.log(&format!(
            "recipe {} with {} exclude patterns (policy {})",
            cfg.recipe.as_str(),
            policy.rules().len(),
            policy.fingerprint()
        ));
        let mut cmd = transport.local_command(&cfg.rsync_program);
        cmd.args(spec.rsync_args(ctx.dry_run));
        let status = ctx.run_cmd(cmd)?;

        match classify_exit(status.code(), cfg.allow_partial)? {
            TransferOutcome::Complete => ctx.log("transfer complete"),
            TransferOutcome::Partial { code } => ctx.warn(&format!(
                "transfer finished with rsync status {code} ({}); some files were not copied",
                exit_reason(code)
            )),
        }
        Ok(())
    }
}

#[Module(
    id = "transfer",
    config = TransferConfig,
    config_path = "transfer",
    tasks = [RsyncTask],
    always = true
)]
pub struct TransferModule;
