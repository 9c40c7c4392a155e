use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hostmirror::Result;
use hostmirror::config::ConfigDoc;
use hostmirror::executor::ExecCtx;
use tracing_subscriber::EnvFilter;

const SECRET_KEYS: &[&str] = &["password"];

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a clone definition and print the computed task plan
    Plan {
        /// Path to a clone definition TOML
        definition: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the fully-resolved definition (after imports/extends), secrets masked
    Resolve {
        /// Path to a clone definition TOML
        definition: PathBuf,
    },
    /// Print the exclude policy a run would use, without touching the network
    Excludes {
        /// Path to a clone definition TOML
        definition: PathBuf,
        /// Print the JSON report instead of one pattern per line
        #[arg(long)]
        json: bool,
    },
    /// Probe the destination, copy, and repair
    Run {
        /// Path to a clone definition TOML
        definition: PathBuf,
        /// Probe and let rsync list changes, but do not modify the destination
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let res = match args.cmd {
        Command::Plan { definition, dot } => cmd_plan(&definition, dot),
        Command::Resolve { definition } => cmd_resolve(&definition),
        Command::Excludes { definition, json } => cmd_excludes(&definition, json),
        Command::Run {
            definition,
            dry_run,
        } => cmd_run(&definition, dry_run),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error ({}): {e}", e.kind().as_str());
            ExitCode::from(e.kind().exit_code())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HOSTMIRROR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn cmd_plan(path: &PathBuf, dot: bool) -> Result<()> {
    let doc = hostmirror::config::load(path.as_path())?;
    let plan = hostmirror::modules::plan_for(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<12} {:<9}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn mask_secrets(v: &mut toml::Value) {
    match v {
        toml::Value::Table(t) => {
            for (k, child) in t.iter_mut() {
                if SECRET_KEYS.contains(&k.as_str()) && child.is_str() {
                    *child = toml::Value::String("********".into());
                } else {
                    mask_secrets(child);
                }
            }
        }
        toml::Value::Array(a) => a.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}

fn cmd_resolve(path: &PathBuf) -> Result<()> {
    let doc = hostmirror::config::load(path.as_path())?;
    let mut value = doc.value.clone();
    mask_secrets(&mut value);
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&value).unwrap_or_else(|_| format!("{value:?}"));
    print!("{s}");
    Ok(())
}

fn cmd_excludes(path: &PathBuf, json: bool) -> Result<()> {
    let doc = hostmirror::config::load(path.as_path())?;
    let policy = hostmirror::modules::exclude::policy_for(&doc)?;
    for w in policy.warnings() {
        eprintln!("WARN: {}", w.message());
    }
    if json {
        let s = serde_json::to_string_pretty(&policy.to_json())
            .map_err(|e| hostmirror::Error::msg(format!("json encode error: {e}")))?;
        println!("{s}");
        return Ok(());
    }
    for rule in policy.rules() {
        println!("{:<18} {}", rule.category.as_str(), rule.pattern);
    }
    Ok(())
}

// First SIGINT/SIGTERM requests cancellation; a second one exits at once.
fn install_signal_handlers(ctx: &ExecCtx) -> Result<()> {
    for sig in signal_hook::consts::TERM_SIGNALS {
        signal_hook::flag::register_conditional_shutdown(*sig, 130, Arc::clone(&ctx.cancel))?;
        signal_hook::flag::register(*sig, Arc::clone(&ctx.cancel))?;
    }

    // Children run in their own process groups and miss the terminal's signal.
    let watcher = ctx.clone();
    std::thread::spawn(move || {
        while !watcher.cancel.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
        watcher.kill_running_children(false);
    });
    Ok(())
}

fn cmd_run(path: &PathBuf, dry_run: bool) -> Result<()> {
    let doc: ConfigDoc = hostmirror::config::load(path.as_path())?;
    let plan = hostmirror::modules::plan_for(&doc)?;

    let reg = hostmirror::executor::builtin_registry()?;
    let sink = Arc::new(hostmirror::executor::StdoutSink::default());
    let mut ctx = ExecCtx::new(dry_run, sink);
    install_signal_handlers(&ctx)?;

    let res = hostmirror::executor::execute_plan(&doc, &plan, &reg, &mut ctx);
    ctx.release_transport();
    res
}
