//! Output helpers for human and JSON modes.

use std::io::Write;

use anyhow::Result;
use bscript_kernel::{Output, StreamName};
use serde_json::Value;

use crate::opts::KernelOpts;

pub fn print_success(opts: &KernelOpts, data: Value) -> Result<()> {
    if opts.pretty {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else if opts.json {
        println!("{}", serde_json::to_string(&data)?);
    } else {
        print_value(data)?;
    }
    Ok(())
}

fn print_value(value: Value) -> Result<()> {
    match value {
        Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

/// Writes execution outputs the way a terminal front-end would show them.
pub fn print_outputs(outputs: &[Output]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    for output in outputs {
        match output {
            Output::Stream {
                name: StreamName::Stdout,
                text,
            } => write!(stdout, "{text}")?,
            Output::Stream {
                name: StreamName::Stderr,
                text,
            } => write!(stderr, "{text}")?,
            Output::Value { text } => writeln!(stdout, "{text}")?,
            Output::Display { data } => match data.get("text/plain") {
                Some(text) => writeln!(stdout, "{text}")?,
                None => {
                    let mimes: Vec<&str> = data.keys().map(String::as_str).collect();
                    writeln!(stdout, "<display: {}>", mimes.join(", "))?;
                }
            },
        }
    }
    stdout.flush()?;
    Ok(())
}
