use hostmirror_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::util::{self, default_true};
use crate::policy::{ExcludePolicy, ExcludePolicyBuilder, IdentityPolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExcludeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub exclude_firewall: bool,
    pub exclude_engine_state: bool,
    pub exclude_cache_noise: bool,
    pub boot_compatible: bool,
    pub identity_policy: IdentityPolicy,
    pub extra: Vec<String>,
}

impl Default for ExcludeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_firewall: true,
            exclude_engine_state: false,
            exclude_cache_noise: true,
            boot_compatible: false,
            identity_policy: IdentityPolicy::PreserveDestination,
            extra: Vec::new(),
        }
    }
}

impl ExcludeConfig {
    pub fn builder(&self) -> ExcludePolicyBuilder {
        let mut b = ExcludePolicyBuilder::new()
            .exclude_firewall(self.exclude_firewall)
            .exclude_engine_state(self.exclude_engine_state)
            .exclude_cache_noise(self.exclude_cache_noise)
            .boot_compatible(self.boot_compatible)
            .identity_policy(self.identity_policy);
        for p in &self.extra {
            b = b.extra_pattern(p.clone());
        }
        b
    }
}

pub fn policy_for(doc: &ConfigDoc) -> Result<ExcludePolicy> {
    let cfg: ExcludeConfig = doc.deserialize_path("exclude")?.unwrap_or_default();
    let mut builder = cfg.builder();
    if let Some(log_file) = crate::modules::repair::log_file(doc)? {
        builder = builder.extra_pattern(log_file);
    }
    builder.build()
}

#[Task(
    id = "exclude.build",
    module = "exclude",
    phase = "policy",
    provides = ["exclude:policy"],
    after = ["gate:passed"],
    default_label = "Build exclude policy",
    core = true,
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for BuildTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl BuildTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let policy = policy_for(doc)?;
        for w in policy.warnings() {
            ctx.warn(w.message());
        }
        let cats: Vec<&str> = policy.categories().iter().map(|c| c.as_str()).collect();
        ctx.log(&format!(
            "{} exclude patterns ({}), fingerprint {}",
            policy.rules().len(),
            cats.join(", "),
            policy.fingerprint()
        ));

        let out = util::module_dir(doc, ctx, "exclude")?.join("exclude.json");
        util::write_json_pretty(&out, &policy.to_json())?;
        ctx.log(&format!("wrote {}", out.display()));

        ctx.set_exclude_policy(policy);
        Ok(())
    }
}

#[Module(
    id = "exclude",
    config = ExcludeConfig,
    config_path = "exclude",
    tasks = [BuildTask],
    always = true,
    required = true
)]
pub struct ExcludeModule;
