//! Read-only queries: `complete`, `inspect`, `is-complete`, `info`, `history`.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::opts::KernelOpts;
use crate::output::print_success;

use super::control_client;

#[derive(Args, Debug)]
pub struct CompleteArgs {
    pub code: String,

    /// Cursor position in characters (default: end of code)
    #[arg(long)]
    pub cursor: Option<usize>,

    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    pub code: String,

    /// Cursor position in characters (default: end of code)
    #[arg(long)]
    pub cursor: Option<usize>,

    #[arg(long)]
    pub session: Option<String>,

    /// Detail level (0 or 1)
    #[arg(long, default_value_t = 0)]
    pub detail: u8,
}

#[derive(Args, Debug)]
pub struct IsCompleteArgs {
    pub code: String,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Only entries from this session
    #[arg(long)]
    pub session: Option<String>,

    /// Number of entries
    #[arg(short = 'n', long, default_value_t = 10)]
    pub last: usize,
}

pub async fn cmd_complete(opts: &KernelOpts, args: &CompleteArgs) -> Result<()> {
    let mut client = control_client(opts).await?;
    let result = client
        .call(
            "complete",
            json!({ "code": args.code, "cursor_pos": args.cursor, "session": args.session }),
        )
        .await?;
    if opts.json || opts.pretty {
        return print_success(opts, result);
    }
    if let Some(matches) = result["matches"].as_array() {
        for m in matches.iter().filter_map(|m| m.as_str()) {
            println!("{m}");
        }
    }
    Ok(())
}

pub async fn cmd_inspect(opts: &KernelOpts, args: &InspectArgs) -> Result<()> {
    let mut client = control_client(opts).await?;
    let result = client
        .call(
            "inspect",
            json!({
                "code": args.code,
                "cursor_pos": args.cursor,
                "session": args.session,
                "detail_level": args.detail,
            }),
        )
        .await?;
    if opts.json || opts.pretty {
        return print_success(opts, result);
    }
    match result["data"]["text/plain"].as_str() {
        Some(text) => println!("{text}"),
        None => println!("no information"),
    }
    Ok(())
}

pub async fn cmd_is_complete(opts: &KernelOpts, args: &IsCompleteArgs) -> Result<()> {
    let mut client = control_client(opts).await?;
    let result = client
        .call("is-complete", json!({ "code": args.code }))
        .await?;
    if opts.json || opts.pretty {
        return print_success(opts, result);
    }
    print_success(opts, result["status"].clone())
}

pub async fn cmd_info(opts: &KernelOpts) -> Result<()> {
    let mut client = control_client(opts).await?;
    let info = client.call("kernel-info", json!({})).await?;
    if opts.json || opts.pretty {
        return print_success(opts, info);
    }
    match info["banner"].as_str() {
        Some(banner) => println!("{banner}"),
        None => print_success(opts, info)?,
    }
    Ok(())
}

pub async fn cmd_history(opts: &KernelOpts, args: &HistoryArgs) -> Result<()> {
    let mut client = control_client(opts).await?;
    let entries = client
        .call(
            "history",
            json!({ "session": args.session, "last_n": args.last }),
        )
        .await?;
    if opts.json || opts.pretty {
        return print_success(opts, entries);
    }
    for entry in entries.as_array().into_iter().flatten() {
        println!(
            "[{}:{}] {}",
            entry["session"].as_str().unwrap_or_default(),
            entry["execution_counter"],
            entry["code"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}
