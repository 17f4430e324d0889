//! Global CLI options and control socket resolution.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bscript_host::{ConnectionInfo, HostConfig};
use clap::Args;

/// Global options for CLI commands.
///
/// These options apply to all commands and can be set via env vars.
#[derive(Args, Debug, Clone)]
pub struct KernelOpts {
    /// Control socket of the kernel daemon (env: BSK_CONTROL_SOCKET)
    #[arg(short = 's', long, global = true, env = "BSK_CONTROL_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Connection file written by the front-end (env: BSK_CONNECTION_FILE)
    #[arg(short = 'f', long, global = true, env = "BSK_CONNECTION_FILE")]
    pub connection_file: Option<PathBuf>,

    /// JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,
}

impl KernelOpts {
    /// Host configuration from the environment, then the connection file, then `--socket`.
    pub fn host_config(&self) -> Result<HostConfig> {
        let mut config = HostConfig::from_env();
        if let Some(path) = &self.connection_file {
            let info = ConnectionInfo::load(path)
                .with_context(|| format!("read connection file {}", path.display()))?;
            config = config.with_connection(&info);
        }
        if let Some(socket) = &self.socket {
            config.control_socket = socket.clone();
        }
        Ok(config)
    }

    pub fn control_socket(&self) -> Result<PathBuf> {
        Ok(self.host_config()?.control_socket)
    }
}
