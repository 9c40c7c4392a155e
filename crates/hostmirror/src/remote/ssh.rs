use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::log_sanitize::command_line;
use crate::remote::credential::{Credential, Destination};
use crate::remote::{RemoteOutput, RemoteShell, sh_quote};

const SSHPASS_ENV: &str = "SSHPASS";

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_program: String,
    pub sshpass_program: String,
    pub keygen_program: String,
    pub connect_timeout: Duration,
    pub server_alive_interval: Duration,
    pub trust_new_host_key: bool,
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".into(),
            sshpass_program: "sshpass".into(),
            keygen_program: "ssh-keygen".into(),
            connect_timeout: Duration::from_secs(10),
            server_alive_interval: Duration::from_secs(15),
            trust_new_host_key: true,
            known_hosts_file: None,
        }
    }
}

#[derive(Debug)]
pub struct SshTransport {
    dest: Destination,
    credential: Credential,
    opts: SshOptions,
}

impl SshTransport {
    pub fn new(dest: Destination, credential: Credential, opts: SshOptions) -> Self {
        Self {
            dest,
            credential,
            opts,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.dest
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn options(&self) -> &SshOptions {
        &self.opts
    }

    pub fn secrets(&self) -> Vec<String> {
        self.credential
            .password()
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }

    pub fn ssh_args(&self) -> Vec<String> {
        let mut opts = vec![
            format!("ConnectTimeout={}", self.opts.connect_timeout.as_secs().max(1)),
            format!(
                "ServerAliveInterval={}",
                self.opts.server_alive_interval.as_secs().max(1)
            ),
            "ServerAliveCountMax=3".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        opts.push(if self.opts.trust_new_host_key {
            "StrictHostKeyChecking=accept-new".into()
        } else {
            "StrictHostKeyChecking=yes".into()
        });
        if let Some(kh) = self.opts.known_hosts_file.as_ref() {
            opts.push(format!("UserKnownHostsFile={}", kh.display()));
        }

        let key = self.credential.key_path();
        if key.is_some() {
            opts.push("IdentitiesOnly=yes".into());
            opts.push("BatchMode=yes".into());
        } else {
            opts.push("PreferredAuthentications=password,keyboard-interactive".into());
            opts.push("PubkeyAuthentication=no".into());
            opts.push("NumberOfPasswordPrompts=1".into());
        }

        let mut args = vec!["-p".to_string(), self.dest.port.to_string()];
        for kv in opts {
            args.push("-o".into());
            args.push(kv);
        }
        if let Some(key) = key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args
    }

    // The password travels in SSHPASS, never in argv.
    pub fn local_command(&self, program: &str) -> Command {
        match self.credential.password() {
            Some(pw) => {
                let mut cmd = Command::new(&self.opts.sshpass_program);
                cmd.env(SSHPASS_ENV, pw).arg("-e").arg(program);
                cmd
            }
            None => Command::new(program),
        }
    }

    pub fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = self.local_command(&self.opts.ssh_program);
        cmd.args(self.ssh_args())
            .arg(self.dest.target())
            .arg(remote_command)
            .stdin(Stdio::null());
        cmd
    }

    pub fn rsync_remote_shell(&self) -> String {
        let mut parts = vec![self.opts.ssh_program.clone()];
        for arg in self.ssh_args() {
            if arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
                parts.push(sh_quote(&arg));
            } else {
                parts.push(arg);
            }
        }
        parts.join(" ")
    }

    /// Forget the stored host key. The caller must announce the trust-on-first-use.
    pub fn forget_host_key(&self) -> Result<RemoteOutput> {
        let mut cmd = Command::new(&self.opts.keygen_program);
        cmd.arg("-R").arg(self.dest.known_hosts_name());
        if let Some(kh) = self.opts.known_hosts_file.as_ref() {
            cmd.arg("-f").arg(kh);
        }
        cmd.stdin(Stdio::null());
        tracing::debug!(cmd = %command_line(&cmd), "forgetting host key");
        let out = cmd.output().map_err(|e| {
            Error::msg(format!(
                "failed to run '{}': {e}",
                self.opts.keygen_program
            ))
        })?;
        Ok(out.into())
    }
}

impl RemoteShell for SshTransport {
    fn exec(&self, command: &str) -> Result<RemoteOutput> {
        let mut cmd = self.ssh_command(command);
        tracing::debug!(target_host = %self.dest.target(), command, "remote exec");
        let out = cmd.output().map_err(|e| {
            let program = match self.credential.password() {
                Some(_) => &self.opts.sshpass_program,
                None => &self.opts.ssh_program,
            };
            Error::msg(format!("failed to run '{program}': {e}"))
        })?;
        Ok(out.into())
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.dest.target(), self.dest.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn dest() -> Destination {
        Destination::new("198.51.100.4", 2200, "root").expect("dest")
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn password_transport_wraps_with_sshpass_and_hides_password() {
        let t = SshTransport::new(
            dest(),
            Credential::Password(Zeroizing::new("s3cret".into())),
            SshOptions::default(),
        );
        let cmd = t.ssh_command("true");
        assert_eq!(cmd.get_program(), "sshpass");
        let args = args_of(&cmd);
        assert_eq!(&args[..2], &["-e".to_string(), "ssh".to_string()]);
        assert!(args.iter().all(|a| !a.contains("s3cret")));
        assert!(args.contains(&"NumberOfPasswordPrompts=1".to_string()));
        assert!(args.contains(&"root@198.51.100.4".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("true"));
        assert_eq!(t.secrets(), vec!["s3cret".to_string()]);
    }

    #[test]
    fn key_transport_is_batch_mode() {
        let t = SshTransport::new(
            dest(),
            Credential::Key(PathBuf::from("/keys/id ed25519")),
            SshOptions {
                trust_new_host_key: false,
                ..SshOptions::default()
            },
        );
        let cmd = t.ssh_command("true");
        assert_eq!(cmd.get_program(), "ssh");
        let args = args_of(&cmd);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(t.secrets().is_empty());

        let shell = t.rsync_remote_shell();
        assert!(shell.starts_with("ssh -p 2200 "), "{shell}");
        assert!(shell.contains("-i '/keys/id ed25519'"), "{shell}");
    }

    #[test]
    fn forget_host_key_targets_bracketed_name_for_custom_port() {
        let t = SshTransport::new(
            dest(),
            Credential::Key(PathBuf::from("/k")),
            SshOptions {
                keygen_program: "echo".into(),
                ..SshOptions::default()
            },
        );
        let out = t.forget_host_key().expect("echo runs");
        assert_eq!(out.stdout.trim(), "-R [198.51.100.4]:2200");
    }
}
