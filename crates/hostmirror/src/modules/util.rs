use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub fn hostmirror_run_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(ws.out_dir.join(doc.name()).join("hostmirror"))
}

pub fn module_dir(doc: &ConfigDoc, ctx: &ExecCtx, module_id: &str) -> Result<PathBuf> {
    // Nested folders read nicer than dotted ids.
    let mut out = hostmirror_run_dir(doc, ctx)?.join("modules");
    for seg in module_id.split('.').filter(|s| !s.is_empty()) {
        out = out.join(seg);
    }
    Ok(out)
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn relay(ctx: &ExecCtx, msg: &str) {
    match msg.strip_prefix("WARN: ") {
        Some(rest) => ctx.warn(rest),
        None => ctx.log(msg),
    }
}

pub(crate) fn default_true() -> bool {
    true
}
