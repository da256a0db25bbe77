//! The cache daemon entrypoint.
//!
//! `kiln-cached <dir> [<low_bytes> <max_bytes>]` serves the job cache at
//! `dir`; watermarks omitted on the command line fall back to `kiln.toml`.
//! The hidden `--evict` mode is how the daemon re-invokes this binary as
//! its eviction worker, reading commands on stdin.

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{Context, Result};
use clap::Parser;
use core_cache::{eviction_loop, DaemonCache, LruEvictionPolicy};
use core_config::{load_from, ConfigContext};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "kiln-cached", version, about = "Kiln job-cache daemon")]
struct Args {
    /// Cache root directory.
    pub dir: PathBuf,
    /// Evict down to this many bytes when the cache overflows.
    pub low_bytes: Option<u64>,
    /// Start evicting above this many bytes.
    pub max_bytes: Option<u64>,
    /// Run as the eviction worker (internal; the daemon spawns this).
    #[arg(long, hide = true)]
    pub evict: bool,
}

fn configure_logging(dir: &Path) -> Option<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(dir, ".log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .with_ansi(false)
        .try_init()
    {
        Ok(_) => Some(guard),
        Err(_err) => {
            // Global subscriber already installed; drop the guard so the
            // writer shuts down.
            None
        }
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "daemon.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

/// Resolve watermarks: explicit arguments win, then `kiln.toml`.
fn watermarks(args: &Args) -> Result<(u64, u64)> {
    match (args.low_bytes, args.max_bytes) {
        (Some(low), Some(max)) => Ok((low, max)),
        (None, None) => {
            let mut cfg = load_from(None)?;
            cfg.apply_context(ConfigContext::detect());
            Ok((cfg.file.cache.low_bytes, cfg.file.cache.max_bytes))
        }
        _ => anyhow::bail!("give both watermarks or neither"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    std::fs::create_dir_all(&args.dir)
        .with_context(|| format!("creating cache root {}", args.dir.display()))?;
    let _log_guard = configure_logging(&args.dir);
    install_panic_hook();
    let (low, max) = watermarks(&args)?;

    if args.evict {
        info!(target: "daemon", dir = %args.dir.display(), low, max, "eviction worker starting");
        let policy = Box::new(LruEvictionPolicy::new(max, low));
        eviction_loop(&args.dir, policy, std::io::stdin().lock())
            .map_err(|e| anyhow::anyhow!("eviction worker failed: {e}"))?;
        return Ok(());
    }

    info!(target: "daemon", dir = %args.dir.display(), low, max, "daemon starting");
    let mut daemon = match DaemonCache::new(&args.dir, max, low, true) {
        Ok(d) => d,
        Err(e) => {
            // Losing the lock race is a clean exit: someone else serves.
            info!(target: "daemon", error = %e, "not serving");
            return Ok(());
        }
    };
    if let Err(e) = daemon.run() {
        error!(target: "daemon", error = %e, "daemon failed");
        return Err(anyhow::anyhow!("daemon failed: {e}"));
    }
    Ok(())
}
