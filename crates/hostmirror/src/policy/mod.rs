pub mod rules;

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExcludeCategory {
    Runtime,
    Boot,
    NetworkIdentity,
    HostSshIdentity,
    UserAuth,
    Firewall,
    ContainerEngine,
    CacheNoise,
    Custom,
}

impl ExcludeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ExcludeCategory::Runtime => "runtime",
            ExcludeCategory::Boot => "boot",
            ExcludeCategory::NetworkIdentity => "network-identity",
            ExcludeCategory::HostSshIdentity => "host-ssh-identity",
            ExcludeCategory::UserAuth => "user-auth",
            ExcludeCategory::Firewall => "firewall",
            ExcludeCategory::ContainerEngine => "container-engine",
            ExcludeCategory::CacheNoise => "cache-noise",
            ExcludeCategory::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludeRule {
    pub pattern: String,
    pub category: ExcludeCategory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityPolicy {
    #[default]
    PreserveDestination,
    CloneSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyWarning {
    FirewallLockout,
    BootCopied,
    IdentityCloned,
}

impl PolicyWarning {
    pub fn message(self) -> &'static str {
        match self {
            PolicyWarning::FirewallLockout => {
                "firewall state will be copied: source rules (SSH port, IP allow-lists) may lock you out of the destination"
            }
            PolicyWarning::BootCopied => {
                "boot and kernel files will be copied: the destination may not boot if its hardware or disk layout differs"
            }
            PolicyWarning::IdentityCloned => {
                "SSH host keys and user accounts will be copied from the source: the destination's current credentials will stop working"
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExcludePolicyBuilder {
    exclude_firewall: bool,
    exclude_engine_state: bool,
    exclude_cache_noise: bool,
    boot_compatible: bool,
    identity: IdentityPolicy,
    extra: Vec<String>,
}

impl Default for ExcludePolicyBuilder {
    fn default() -> Self {
        Self {
            exclude_firewall: true,
            exclude_engine_state: false,
            exclude_cache_noise: true,
            boot_compatible: false,
            identity: IdentityPolicy::PreserveDestination,
            extra: Vec::new(),
        }
    }
}

impl ExcludePolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_firewall(mut self, on: bool) -> Self {
        self.exclude_firewall = on;
        self
    }

    pub fn exclude_engine_state(mut self, on: bool) -> Self {
        self.exclude_engine_state = on;
        self
    }

    pub fn exclude_cache_noise(mut self, on: bool) -> Self {
        self.exclude_cache_noise = on;
        self
    }

    pub fn boot_compatible(mut self, on: bool) -> Self {
        self.boot_compatible = on;
        self
    }

    pub fn identity_policy(mut self, policy: IdentityPolicy) -> Self {
        self.identity = policy;
        self
    }

    pub fn extra_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra.push(pattern.into());
        self
    }

    pub fn build(self) -> Result<ExcludePolicy> {
        let mut acc = RuleAccumulator::default();
        let mut warnings = Vec::new();

        acc.extend(rules::RUNTIME, ExcludeCategory::Runtime);
        if self.exclude_engine_state {
            acc.extend(rules::ENGINE_STATE, ExcludeCategory::ContainerEngine);
            acc.extend(rules::ENGINE_RUNTIME, ExcludeCategory::ContainerEngine);
        } else {
            acc.extend(rules::ENGINE_RUNTIME, ExcludeCategory::Runtime);
        }

        if self.boot_compatible {
            warnings.push(PolicyWarning::BootCopied);
        } else {
            acc.extend(rules::BOOT, ExcludeCategory::Boot);
        }

        acc.extend(rules::NETWORK_IDENTITY, ExcludeCategory::NetworkIdentity);

        match self.identity {
            IdentityPolicy::PreserveDestination => {
                acc.extend(rules::HOST_SSH_IDENTITY, ExcludeCategory::HostSshIdentity);
                acc.extend(rules::USER_AUTH, ExcludeCategory::UserAuth);
            }
            IdentityPolicy::CloneSource => warnings.push(PolicyWarning::IdentityCloned),
        }

        if self.exclude_firewall {
            acc.extend(rules::FIREWALL, ExcludeCategory::Firewall);
        } else {
            warnings.push(PolicyWarning::FirewallLockout);
        }

        if self.exclude_cache_noise {
            acc.extend(rules::CACHE_NOISE, ExcludeCategory::CacheNoise);
        }

        for raw in &self.extra {
            let pattern = validate_extra(raw)?;
            acc.push(pattern, ExcludeCategory::Custom);
        }

        Ok(ExcludePolicy {
            rules: acc.rules,
            warnings,
            identity: self.identity,
        })
    }
}

#[derive(Default)]
struct RuleAccumulator {
    seen: HashSet<String>,
    rules: Vec<ExcludeRule>,
}

impl RuleAccumulator {
    fn extend(&mut self, patterns: &[&str], category: ExcludeCategory) {
        for p in patterns {
            self.push(p, category);
        }
    }

    // First category to claim a pattern keeps it.
    fn push(&mut self, pattern: &str, category: ExcludeCategory) {
        if self.seen.insert(pattern.to_string()) {
            self.rules.push(ExcludeRule {
                pattern: pattern.to_string(),
                category,
            });
        }
    }
}

fn validate_extra(raw: &str) -> Result<&str> {
    let p = raw.trim();
    if p.is_empty() {
        return Err(Error::msg("exclude.extra contains an empty pattern"));
    }
    if !p.starts_with('/') {
        return Err(Error::msg(format!(
            "exclude.extra pattern '{p}' must be absolute (start with '/')"
        )));
    }
    if p.contains(['\n', '\r']) {
        return Err(Error::msg(format!(
            "exclude.extra pattern '{}' contains a newline",
            p.escape_debug()
        )));
    }
    Ok(p)
}

#[derive(Debug, Clone)]
pub struct ExcludePolicy {
    rules: Vec<ExcludeRule>,
    warnings: Vec<PolicyWarning>,
    identity: IdentityPolicy,
}

impl ExcludePolicy {
    pub fn rules(&self) -> &[ExcludeRule] {
        &self.rules
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.pattern.as_str())
    }

    pub fn warnings(&self) -> &[PolicyWarning] {
        &self.warnings
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        self.identity
    }

    pub fn categories(&self) -> BTreeSet<ExcludeCategory> {
        self.rules.iter().map(|r| r.category).collect()
    }

    pub fn has_category(&self, category: ExcludeCategory) -> bool {
        self.rules.iter().any(|r| r.category == category)
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.rules.iter().any(|r| r.pattern == pattern)
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for p in self.patterns() {
            hasher.update(p.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "fingerprint": self.fingerprint(),
            "identity_policy": self.identity,
            "rules": self.rules,
            "warnings": self
                .warnings
                .iter()
                .map(|w| serde_json::json!({ "kind": w, "message": w.message() }))
                .collect::<Vec<_>>(),
        })
    }
}
