use std::path::PathBuf;

use clap::Parser;

use crate::wrapper::{WrapOptions, run_wrapped};

#[derive(Parser)]
pub struct WrapOpts {
    /// File receiving the stdout of the command
    #[arg(long)]
    pub stdout: PathBuf,

    /// File receiving the stderr of the command and status markers
    #[arg(long)]
    pub stderr: PathBuf,

    /// Format of the recorded start and finish times
    #[arg(long, default_value = "%d/%m/%Y %H:%M:%S")]
    pub strftime: String,

    /// Command to execute
    #[arg(trailing_var_arg(true), allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Returns the exit code of the wrapped command.
pub async fn command_wrap(opts: WrapOpts) -> anyhow::Result<i32> {
    let WrapOpts {
        stdout,
        stderr,
        strftime,
        command,
    } = opts;
    let options = WrapOptions {
        stdout,
        stderr,
        strftime,
        command,
    };
    Ok(run_wrapped(&options).await?)
}
