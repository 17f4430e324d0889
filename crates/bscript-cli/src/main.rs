mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::exec::ExecArgs;
use commands::query::{CompleteArgs, HistoryArgs, InspectArgs, IsCompleteArgs};
use commands::run::RunArgs;
use opts::KernelOpts;

#[derive(Parser, Debug)]
#[command(name = "bsk", version, about = "BraneScript kernel")]
struct Cli {
    #[command(flatten)]
    opts: KernelOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the kernel daemon and serve the control socket
    Run(RunArgs),

    /// Execute a snippet in a running kernel
    Exec(ExecArgs),

    /// Complete the token under the cursor
    Complete(CompleteArgs),

    /// Show documentation for the token under the cursor
    Inspect(InspectArgs),

    /// Check whether a snippet is ready to run
    IsComplete(IsCompleteArgs),

    /// Show kernel and language information
    Info,

    /// Show recently executed snippets
    History(HistoryArgs),

    /// Interrupt the running execution
    Interrupt,

    /// Shut down a running kernel
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    match &cli.command {
        Command::Run(args) => commands::run::cmd_run(opts, args).await,
        Command::Exec(args) => commands::exec::cmd_exec(opts, args).await,
        Command::Complete(args) => commands::query::cmd_complete(opts, args).await,
        Command::Inspect(args) => commands::query::cmd_inspect(opts, args).await,
        Command::IsComplete(args) => commands::query::cmd_is_complete(opts, args).await,
        Command::Info => commands::query::cmd_info(opts).await,
        Command::History(args) => commands::query::cmd_history(opts, args).await,
        Command::Interrupt => commands::control::cmd_interrupt(opts).await,
        Command::Shutdown => commands::control::cmd_shutdown(opts).await,
    }
}
