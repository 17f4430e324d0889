//! `bsk run` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bscript_kernel::WasmLoader;
use clap::Args;
use tracing_subscriber::EnvFilter;

use crate::opts::KernelOpts;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Compiled backend module (env: BSK_BACKEND)
    #[arg(long, env = "BSK_BACKEND")]
    pub backend: Option<PathBuf>,

    /// Directory served to `file:///data/...` outputs (env: BRANE_DATA_DIR)
    #[arg(long, env = "BRANE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// On-disk cache for compiled backend code (env: BSK_MODULE_CACHE)
    #[arg(long, env = "BSK_MODULE_CACHE")]
    pub module_cache: Option<PathBuf>,

    /// Executions kept for `bsk history`
    #[arg(long)]
    pub history_limit: Option<usize>,
}

pub async fn cmd_run(opts: &KernelOpts, args: &RunArgs) -> Result<()> {
    setup_logging();

    let mut config = opts.host_config()?;
    if let Some(path) = &args.backend {
        config.kernel = config.kernel.with_backend_path(path.clone());
    }
    if let Some(dir) = &args.data_dir {
        config.kernel = config.kernel.with_data_dir(dir.clone());
    }
    if let Some(dir) = &args.module_cache {
        config.kernel.module_cache_dir = Some(dir.clone());
    }
    if let Some(limit) = args.history_limit {
        config.kernel.history_limit = limit;
    }

    let loader = WasmLoader::new(config.kernel.module_cache_dir.clone())
        .context("initialize wasm runtime")?;
    let backend = config.kernel.backend_path.clone();
    let report = bscript_host::serve(config, Box::new(loader))
        .await
        .with_context(|| format!("start kernel with backend {}", backend.display()))?;
    tracing::info!(
        freed = report.freed,
        failed = report.failed,
        "kernel exited"
    );
    Ok(())
}

/// Set up tracing subscriber for daemon logging (`RUST_LOG` filters, default `info`).
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
