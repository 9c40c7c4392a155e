use std::sync::Arc;
use std::time::Duration;

use hostmirror_macros::{Module, Task};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util::default_true;
use crate::remote::credential::{CredentialInput, KeyFormat, resolve_credential};
use crate::remote::{Destination, SshOptions, SshTransport};
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".into()
}

fn default_connect_timeout() -> u64 {
    10
}

/// `[destination]`. No Debug: it can hold the password.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub key_file: Option<String>,
    pub key_file_env: Option<String>,
    pub key_format: KeyFormat,
    pub converter: String,
    #[serde(default = "default_true")]
    pub trust_new_host_key: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    pub known_hosts_file: Option<String>,
    pub ssh_program: Option<String>,
    pub sshpass_program: Option<String>,
    pub keygen_program: Option<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::new(),
            port: default_port(),
            user: default_user(),
            password: None,
            password_env: None,
            key_file: None,
            key_file_env: None,
            key_format: KeyFormat::Auto,
            converter: "puttygen".into(),
            trust_new_host_key: true,
            connect_timeout_secs: default_connect_timeout(),
            known_hosts_file: None,
            ssh_program: None,
            sshpass_program: None,
            keygen_program: None,
        }
    }
}

fn env_value(var: Option<&str>, field: &str) -> Option<String> {
    let var = var.map(str::trim).filter(|v| !v.is_empty())?;
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => {
            tracing::warn!(%var, "destination.{field} names an unset environment variable");
            None
        }
    }
}

impl DestinationConfig {
    pub fn destination(&self) -> Result<Destination> {
        Destination::new(&self.host, self.port, &self.user)
    }

    pub fn credential_input(&self, ws: &WorkspacePaths) -> Result<CredentialInput> {
        let password = self
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| env_value(self.password_env.as_deref(), "password_env"));
        let key_file = self
            .key_file
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| env_value(self.key_file_env.as_deref(), "key_file_env"));
        Ok(CredentialInput {
            password: password.map(Zeroizing::new),
            key_file: key_file
                .map(|k| ws.resolve_config_path(&k))
                .transpose()?,
            key_format: self.key_format,
            converter: self.converter.clone(),
        })
    }

    pub fn ssh_options(&self, ws: &WorkspacePaths) -> Result<SshOptions> {
        let mut opts = SshOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            trust_new_host_key: self.trust_new_host_key,
            known_hosts_file: self
                .known_hosts_file
                .as_deref()
                .map(|p| ws.resolve_config_path(p))
                .transpose()?,
            ..SshOptions::default()
        };
        if let Some(p) = self.ssh_program.as_ref() {
            opts.ssh_program = p.clone();
        }
        if let Some(p) = self.sshpass_program.as_ref() {
            opts.sshpass_program = p.clone();
        }
        if let Some(p) = self.keygen_program.as_ref() {
            opts.keygen_program = p.clone();
        }
        Ok(opts)
    }
}

pub fn resolve_transport(doc: &ConfigDoc) -> Result<SshTransport> {
    let cfg: DestinationConfig = doc.deserialize_path("destination")?.unwrap_or_default();
    let dest = cfg.destination()?;
    let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let ws = crate::workspace::load_paths(&ws_cfg)?;
    let opts = cfg.ssh_options(&ws)?;
    let credential = resolve_credential(&cfg.credential_input(&ws)?)?;
    Ok(SshTransport::new(dest, credential, opts))
}

#[Task(
    id = "destination.resolve",
    module = "destination",
    phase = "resolve",
    provides = ["gate:resolved"],
    after = ["core.init"],
    default_label = "Resolve destination credential",
    core = true,
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolveTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ResolveTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ResolveTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let transport = resolve_transport(doc)?;
        ctx.add_secrets(transport.secrets());
        let dest = transport.destination();
        ctx.log(&format!(
            "destination {} port {} using {}",
            dest.target(),
            dest.port,
            transport.credential().describe()
        ));

        if transport.options().trust_new_host_key {
            ctx.warn(&format!(
                "host key for {} is trusted on first use: the stored key is forgotten and whatever key the host presents is accepted (set destination.trust_new_host_key = false to refuse)",
                dest.known_hosts_name()
            ));
            if ctx.dry_run {
                ctx.log("DRY-RUN: known_hosts left unchanged");
            } else {
                match transport.forget_host_key() {
                    Ok(out) if out.success() => {
                        ctx.log(&format!("forgot stored host key for {}", dest.known_hosts_name()))
                    }
                    Ok(out) => ctx.log(&format!("ssh-keygen -R: {}", out.summary())),
                    Err(e) => ctx.warn(&format!("could not update known_hosts: {e}")),
                }
            }
        }

        ctx.set_transport(Arc::new(transport));
        Ok(())
    }
}

#[Task(
    id = "destination.probe",
    module = "destination",
    phase = "probe",
    provides = ["gate:reachable"],
    after = ["destination.resolve"],
    default_label = "Probe destination",
    core = true,
    dry_run_safe = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ProbeTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ProbeTask {
    pub fn run(_cfg: &Self, _doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let shell = ctx.remote_shell()?;
        let target = shell.describe();
        let out = shell
            .exec("true")
            .map_err(|e| Error::unreachable(format!("{target} is unreachable: {e}")))?;
        if !out.success() {
            return Err(Error::unreachable(format!(
                "{target} is unreachable: {}",
                out.summary()
            )));
        }
        ctx.log(&format!("{target} answered a non-interactive probe"));
        Ok(())
    }
}

#[Module(
    id = "destination",
    config = DestinationConfig,
    config_path = "destination",
    tasks = [ResolveTask, ProbeTask],
    required = true
)]
pub struct DestinationModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc::from_value("clone.toml", toml::from_str(src).expect("toml"))
    }

    #[test]
    fn literal_password_wins_over_env() {
        let d = doc(
            r#"
[destination]
host = "203.0.113.10"
password = "x"
password_env = "HOSTMIRROR_TEST_UNUSED_PASSWORD"
"#,
        );
        let cfg: DestinationConfig = d
            .deserialize_path("destination")
            .expect("parse")
            .expect("table");
        let ws = crate::workspace::load_paths(&WorkspaceConfig::default()).expect("ws");
        let input = cfg.credential_input(&ws).expect("input");
        assert_eq!(input.password.as_deref().map(String::as_str), Some("x"));
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.user, "root");
    }

    #[test]
    fn missing_credential_is_a_credential_error() {
        let d = doc("[destination]\nhost = \"203.0.113.10\"\n");
        let err = resolve_transport(&d).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Credential);
    }

    #[test]
    fn invalid_host_is_a_config_error() {
        let d = doc("[destination]\nhost = \"a b; rm\"\npassword = \"x\"\n");
        let err = resolve_transport(&d).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn program_overrides_reach_ssh_options() {
        let d = doc(
            r#"
[destination]
host = "h"
password = "x"
ssh_program = "/usr/bin/ssh"
connect_timeout_secs = 3
trust_new_host_key = false
"#,
        );
        let t = resolve_transport(&d).expect("transport");
        assert_eq!(t.options().ssh_program, "/usr/bin/ssh");
        assert_eq!(t.options().connect_timeout, Duration::from_secs(3));
        assert!(!t.options().trust_new_host_key);
        assert_eq!(t.options().sshpass_program, "sshpass");
    }
}
