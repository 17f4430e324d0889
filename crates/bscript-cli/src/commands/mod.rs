//! CLI command handlers.

pub mod control;
pub mod exec;
pub mod query;
pub mod run;

use anyhow::{Context, Result};
use bscript_host::ControlClient;

use crate::opts::KernelOpts;

/// Connect to the running kernel daemon.
pub async fn control_client(opts: &KernelOpts) -> Result<ControlClient> {
    let socket = opts.control_socket()?;
    if !socket.exists() {
        anyhow::bail!(
            "no kernel running at {} (start one with `bsk run`)",
            socket.display()
        );
    }
    ControlClient::connect(&socket)
        .await
        .with_context(|| format!("connect to control socket {}", socket.display()))
}
