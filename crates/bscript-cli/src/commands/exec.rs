//! `bsk exec` command.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bscript_kernel::ExecutionReply;
use clap::Args;
use serde_json::json;

use crate::opts::KernelOpts;
use crate::output::{print_outputs, print_success};

use super::control_client;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Code to run; `-` or no value reads stdin
    pub code: Option<String>,

    /// Read the code from a file
    #[arg(long, conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Session to run in (default: a fresh one per invocation)
    #[arg(long)]
    pub session: Option<String>,

    /// Execution counter echoed in the reply
    #[arg(long)]
    pub counter: Option<u64>,

    /// Run without publishing results
    #[arg(long)]
    pub silent: bool,

    /// Do not record the code in history
    #[arg(long)]
    pub no_history: bool,
}

pub async fn cmd_exec(opts: &KernelOpts, args: &ExecArgs) -> Result<()> {
    let code = read_code(args)?;
    let mut client = control_client(opts).await?;

    let mut payload = json!({
        "code": code,
        "silent": args.silent,
        "store_history": !args.no_history,
    });
    if let Some(session) = &args.session {
        payload["session"] = json!(session);
    }
    if let Some(counter) = args.counter {
        payload["execution_counter"] = json!(counter);
    }

    let result = client.call("execute", payload).await?;
    if opts.json || opts.pretty {
        return print_success(opts, result);
    }
    let reply: ExecutionReply =
        serde_json::from_value(result).context("decode execution reply")?;
    match reply {
        ExecutionReply::Success { outputs, .. } => print_outputs(&outputs),
        ExecutionReply::Error {
            ename,
            evalue,
            traceback,
            ..
        } => {
            for line in &traceback {
                eprintln!("{line}");
            }
            anyhow::bail!("{ename}: {evalue}")
        }
    }
}

fn read_code(args: &ExecArgs) -> Result<String> {
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()));
    }
    match args.code.as_deref() {
        Some(code) if code != "-" => Ok(code.to_string()),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("read code from stdin")?;
            Ok(code)
        }
    }
}
