//! `bsk interrupt` and `bsk shutdown`.

use anyhow::Result;
use serde_json::json;

use crate::opts::KernelOpts;
use crate::output::print_success;

use super::control_client;

pub async fn cmd_interrupt(opts: &KernelOpts) -> Result<()> {
    let mut client = control_client(opts).await?;
    let result = client.call("interrupt", json!({})).await?;
    if opts.json || opts.pretty {
        return print_success(opts, result);
    }
    if result["delivered"].as_bool() == Some(true) {
        println!("interrupt delivered");
    } else {
        println!("backend does not support interrupts");
    }
    Ok(())
}

pub async fn cmd_shutdown(opts: &KernelOpts) -> Result<()> {
    let mut client = control_client(opts).await?;
    let report = client.call("shutdown", json!({})).await?;
    if opts.json || opts.pretty {
        return print_success(opts, report);
    }
    println!(
        "kernel shut down ({} sessions freed, {} failed)",
        report["freed"], report["failed"]
    );
    Ok(())
}
