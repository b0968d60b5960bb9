use std::path::Path;
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::scheduler::SchedulerResult;

pub fn create_command(arguments: Vec<&str>, workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

pub fn check_command_output(output: Output) -> SchedulerResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs a scheduler CLI program and returns its trimmed standard output.
pub async fn run_command(
    manager: &str,
    arguments: Vec<&str>,
    workdir: &Path,
) -> SchedulerResult<String> {
    let program = arguments[0].to_string();
    log::debug!("Running {manager} command `{}`", arguments.join(" "));

    let mut command = create_command(arguments, workdir);
    let output = command
        .output()
        .await
        .with_context(|| format!("{program} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;

    log::trace!(
        "{manager} {program} output\nStdout\n{}Stderr\n{}",
        output.stdout.to_str_lossy(),
        output.stderr.to_str_lossy()
    );

    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", program, e))?;
    Ok(stdout.trim().to_string())
}

pub fn path_arg(path: &Path) -> SchedulerResult<String> {
    path.to_str()
        .map(|path| path.to_string())
        .ok_or_else(|| anyhow::anyhow!("Path {} is not valid UTF-8", path.display()))
}

/// Scheduler memory requests are expressed in whole megabytes.
pub fn gb_to_mb(gb: f64) -> u64 {
    (gb * 1024.0).ceil() as u64
}
