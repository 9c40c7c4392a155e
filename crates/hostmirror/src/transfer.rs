use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::remote::Destination;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recipe {
    #[default]
    Full,
    Marzban,
    MarzbanNode,
    DockerApps,
    Custom,
}

impl Recipe {
    pub fn as_str(self) -> &'static str {
        match self {
            Recipe::Full => "full",
            Recipe::Marzban => "marzban",
            Recipe::MarzbanNode => "marzban-node",
            Recipe::DockerApps => "docker-apps",
            Recipe::Custom => "custom",
        }
    }

    pub fn paths(self) -> &'static [&'static str] {
        match self {
            Recipe::Full => &["/"],
            Recipe::Marzban => &[
                "/opt/marzban",
                "/var/lib/marzban",
                "/usr/local/bin/marzban",
            ],
            Recipe::MarzbanNode => &[
                "/opt/marzban-node",
                "/var/lib/marzban-node",
                "/usr/local/bin/marzban-node",
            ],
            Recipe::DockerApps => &["/opt", "/srv", "/etc/docker"],
            Recipe::Custom => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeFlags {
    pub delete_extraneous: bool,
    pub whole_file: bool,
    pub numeric_ids: bool,
}

impl Default for ModeFlags {
    fn default() -> Self {
        Self {
            delete_extraneous: true,
            whole_file: false,
            numeric_ids: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local { paths: Vec<PathBuf> },
    Remote { dest: Destination, path: String },
}

impl Endpoint {
    fn is_remote(&self) -> bool {
        matches!(self, Endpoint::Remote { .. })
    }

    fn render(&self) -> Vec<String> {
        match self {
            Endpoint::Local { paths } => paths.iter().map(|p| p.display().to_string()).collect(),
            Endpoint::Remote { dest, path } => vec![dest.rsync_target(path)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferSpec {
    source: Endpoint,
    dest: Endpoint,
    excludes: Vec<String>,
    flags: ModeFlags,
    remote_shell: String,
    relative: bool,
}

impl TransferSpec {
    pub fn new(
        source: Endpoint,
        dest: Endpoint,
        excludes: Vec<String>,
        flags: ModeFlags,
        remote_shell: impl Into<String>,
    ) -> Result<Self> {
        match (source.is_remote(), dest.is_remote()) {
            (false, false) => {
                return Err(Error::transfer(
                    "source and destination are both local; one side must be remote",
                ));
            }
            (true, true) => {
                return Err(Error::transfer(
                    "source and destination are both remote; rsync needs one local side",
                ));
            }
            _ => {}
        }
        if let Endpoint::Local { paths } = &source
            && paths.is_empty()
        {
            return Err(Error::transfer("no source paths to copy"));
        }
        Ok(Self {
            source,
            dest,
            excludes,
            flags,
            remote_shell: remote_shell.into(),
            relative: false,
        })
    }

    pub fn relative(mut self, on: bool) -> Self {
        self.relative = on;
        self
    }

    pub fn source(&self) -> &Endpoint {
        &self.source
    }

    pub fn dest(&self) -> &Endpoint {
        &self.dest
    }

    pub fn flags(&self) -> ModeFlags {
        self.flags
    }

    pub fn rsync_args(&self, dry_run: bool) -> Vec<String> {
        let mut args: Vec<String> = vec!["-aAXH".into(), "--stats".into()];
        if self.flags.numeric_ids {
            args.push("--numeric-ids".into());
        }
        if self.flags.whole_file {
            args.push("--whole-file".into());
        }
        if self.flags.delete_extraneous {
            args.push("--delete".into());
        }
        if self.relative {
            args.push("--relative".into());
        }
        if dry_run {
            args.push("--dry-run".into());
        }
        args.push("-e".into());
        args.push(self.remote_shell.clone());
        for pattern in &self.excludes {
            args.push(format!("--exclude={pattern}"));
        }
        args.extend(self.source.render());
        args.extend(self.dest.render());
        args
    }
}

// Paths are joined below `source_root` with rsync's `/./` marker so `--relative`
// keeps only the part after it. Missing paths come back separately.
pub fn recipe_sources(
    recipe: Recipe,
    custom: &[String],
    source_root: &Path,
) -> Result<(Vec<PathBuf>, Vec<String>)> {
    let listed: Vec<String> = match recipe {
        Recipe::Custom => {
            if custom.is_empty() {
                return Err(Error::msg(
                    "transfer.recipe = \"custom\" requires transfer.paths",
                ));
            }
            for p in custom {
                if !p.trim().starts_with('/') {
                    return Err(Error::msg(format!(
                        "transfer.paths entry '{p}' must be absolute"
                    )));
                }
            }
            custom.iter().map(|p| p.trim().to_string()).collect()
        }
        other => other.paths().iter().map(|p| p.to_string()).collect(),
    };

    if recipe == Recipe::Full {
        // Trailing slash: copy the contents of the root, not the directory.
        let root = format!("{}/", source_root.display().to_string().trim_end_matches('/'));
        return Ok((vec![PathBuf::from(root)], Vec::new()));
    }

    let mut present = Vec::new();
    let mut missing = Vec::new();
    for p in listed {
        let rel = p.trim_start_matches('/');
        if source_root.join(rel).exists() {
            let root = source_root.display().to_string();
            present.push(PathBuf::from(format!(
                "{}/./{}",
                root.trim_end_matches('/'),
                rel
            )));
        } else {
            missing.push(p);
        }
    }
    if present.is_empty() {
        return Err(Error::transfer(format!(
            "none of the {} paths exist under {} (missing: {})",
            recipe.as_str(),
            source_root.display(),
            missing.join(", ")
        )));
    }
    Ok((present, missing))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete,
    Partial { code: i32 },
}

// 24: files vanished mid-copy (normal on a live host). 23: accepted only with allow_partial.
pub fn classify_exit(code: Option<i32>, allow_partial: bool) -> Result<TransferOutcome> {
    match code {
        Some(0) => Ok(TransferOutcome::Complete),
        Some(24) => Ok(TransferOutcome::Partial { code: 24 }),
        Some(23) if allow_partial => Ok(TransferOutcome::Partial { code: 23 }),
        Some(c) => Err(Error::transfer(format!(
            "rsync exited with status {c} ({})",
            exit_reason(c)
        ))),
        None => Err(Error::transfer("rsync was terminated by a signal")),
    }
}

pub fn exit_reason(code: i32) -> &'static str {
    match code {
        1 => "syntax or usage error",
        2 => "protocol incompatibility",
        3 => "errors selecting input/output files",
        5 => "error starting client-server protocol",
        10 => "error in socket I/O",
        11 => "error in file I/O",
        12 => "error in rsync protocol data stream",
        20 => "received SIGUSR1 or SIGINT",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        30 => "timeout in data send/receive",
        35 => "timeout waiting for daemon connection",
        255 => "ssh connection failed",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn dest() -> Destination {
        Destination::new("203.0.113.10", 22, "root").expect("dest")
    }

    fn remote(path: &str) -> Endpoint {
        Endpoint::Remote {
            dest: dest(),
            path: path.into(),
        }
    }

    #[test]
    fn exactly_one_side_must_be_remote() {
        let local = || Endpoint::Local {
            paths: vec![PathBuf::from("/")],
        };
        let err = TransferSpec::new(local(), local(), vec![], ModeFlags::default(), "ssh")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(
            TransferSpec::new(remote("/"), remote("/"), vec![], ModeFlags::default(), "ssh")
                .is_err()
        );
        assert!(
            TransferSpec::new(local(), remote("/"), vec![], ModeFlags::default(), "ssh").is_ok()
        );
        assert!(
            TransferSpec::new(
                remote("/srv"),
                Endpoint::Local {
                    paths: vec![PathBuf::from("/backup")]
                },
                vec![],
                ModeFlags::default(),
                "ssh"
            )
            .is_ok()
        );
    }

    #[test]
    fn rsync_args_follow_flags_and_put_endpoints_last() {
        let spec = TransferSpec::new(
            Endpoint::Local {
                paths: vec![PathBuf::from("/./opt/marzban")],
            },
            remote("/"),
            vec!["/proc/*".into(), "/etc/hostname".into()],
            ModeFlags {
                delete_extraneous: false,
                whole_file: true,
                numeric_ids: true,
            },
            "ssh -p 22 -o BatchMode=yes",
        )
        .expect("valid transfer")
        .relative(true);

        let args = spec.rsync_args(false);
        assert_eq!(args[0], "-aAXH");
        assert!(args.contains(&"--whole-file".to_string()));
        assert!(args.contains(&"--numeric-ids".to_string()));
        assert!(args.contains(&"--relative".to_string()));
        assert!(!args.contains(&"--delete".to_string()));
        assert!(!args.contains(&"--dry-run".to_string()));
        let e = args.iter().position(|a| a == "-e").expect("-e");
        assert_eq!(args[e + 1], "ssh -p 22 -o BatchMode=yes");
        assert!(args.contains(&"--exclude=/etc/hostname".to_string()));
        assert_eq!(
            &args[args.len() - 2..],
            &["/./opt/marzban".to_string(), "root@203.0.113.10:/".to_string()]
        );

        assert!(spec.rsync_args(true).contains(&"--dry-run".to_string()));
    }

    #[test]
    fn recipe_sources_skip_missing_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("opt/marzban")).expect("mkdir");

        let (present, missing) =
            recipe_sources(Recipe::Marzban, &[], tmp.path()).expect("sources");
        assert_eq!(
            present,
            vec![PathBuf::from(format!("{}/./opt/marzban", tmp.path().display()))]
        );
        assert_eq!(missing, vec!["/var/lib/marzban", "/usr/local/bin/marzban"]);

        let err = recipe_sources(Recipe::MarzbanNode, &[], tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
    }

    #[test]
    fn full_recipe_copies_root_contents() {
        let (present, missing) =
            recipe_sources(Recipe::Full, &[], Path::new("/")).expect("sources");
        assert_eq!(present, vec![PathBuf::from("/")]);
        assert!(missing.is_empty());
    }

    #[test]
    fn custom_recipe_needs_absolute_paths() {
        let root = Path::new("/");
        assert!(recipe_sources(Recipe::Custom, &[], root).is_err());
        assert!(recipe_sources(Recipe::Custom, &["etc".into()], root).is_err());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(classify_exit(Some(0), false).unwrap(), TransferOutcome::Complete);
        assert_eq!(
            classify_exit(Some(24), false).unwrap(),
            TransferOutcome::Partial { code: 24 }
        );
        assert!(classify_exit(Some(23), false).is_err());
        assert_eq!(
            classify_exit(Some(23), true).unwrap(),
            TransferOutcome::Partial { code: 23 }
        );
        let err = classify_exit(Some(255), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.to_string().contains("ssh connection failed"));
        assert!(classify_exit(None, true).is_err());
    }
}
