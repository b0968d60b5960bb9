//! Job wrapper executed on compute nodes (`pipeq wrap`).
//!
//! Runs a job command with its output redirected into the job logs and reports its lifecycle
//! and resource usage as markers in the job stderr log.
use std::fs::File;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::resource::{Usage, UsageWho, getrusage};
use nix::sys::time::TimeVal;
use serde_json::Value;

use crate::common::utils::time::{format_local_now, now_unix};
use crate::marker::{JsonMap, MarkerAction, append_marker, write_marker};
use crate::model::ExecutionStatus;
use crate::scheduler::JOB_ID_VARIABLES;

/// Exit code reported when the command cannot be started.
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

#[derive(Debug, Clone)]
pub struct WrapOptions {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub strftime: String,
    pub command: Vec<String>,
}

/// Child resource usage, as reported by `getrusage(RUSAGE_CHILDREN)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    pub user_seconds: f64,
    pub system_seconds: f64,
    pub max_rss_kbytes: i64,
    pub page_faults_major: i64,
    pub page_faults_minor: i64,
    pub io_inputs: i64,
    pub io_outputs: i64,
    pub context_switches_voluntary: i64,
    pub context_switches_involuntary: i64,
    pub signals_received: i64,
}

impl From<Usage> for ResourceUsage {
    fn from(usage: Usage) -> Self {
        Self {
            user_seconds: timeval_seconds(usage.user_time()),
            system_seconds: timeval_seconds(usage.system_time()),
            // Linux reports kilobytes
            max_rss_kbytes: usage.max_rss(),
            page_faults_major: usage.major_page_faults(),
            page_faults_minor: usage.minor_page_faults(),
            io_inputs: usage.block_reads(),
            io_outputs: usage.block_writes(),
            context_switches_voluntary: usage.voluntary_context_switches(),
            context_switches_involuntary: usage.involuntary_context_switches(),
            signals_received: usage.signals(),
        }
    }
}

fn timeval_seconds(time: TimeVal) -> f64 {
    time.tv_sec() as f64 + time.tv_usec() as f64 / 1_000_000.0
}

/// Runs the wrapped command and returns the exit code the wrapper should exit with.
pub async fn run_wrapped(options: &WrapOptions) -> crate::Result<i32> {
    let Some((program, args)) = options.command.split_first() else {
        return crate::common::error::error("No command to wrap".to_string());
    };

    {
        let mut stderr = File::create(&options.stderr)?;
        write_marker(&mut stderr, MarkerAction::Status, &ExecutionStatus::Running)?;
        write_marker(&mut stderr, MarkerAction::Stats, &start_stats(&options.strftime))?;
        let environ: crate::Map<String, String> = std::env::vars().collect();
        write_marker(&mut stderr, MarkerAction::Environ, &environ)?;
    }

    let stdout = File::create(&options.stdout)?;
    let stderr = File::options().append(true).open(&options.stderr)?;

    let started = Instant::now();
    let spawned = tokio::process::Command::new(program)
        .args(args)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn();
    let exit_code = match spawned {
        Ok(mut child) => exit_code(child.wait().await?),
        Err(error) => {
            log::error!("Cannot start {program}: {error}");
            let mut stderr = File::options().append(true).open(&options.stderr)?;
            writeln!(stderr, "{}: cannot start {program}: {error}", crate::TOOL_NAME)?;
            SPAWN_FAILURE_EXIT_CODE
        }
    };
    let elapsed = started.elapsed();

    let usage = match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => ResourceUsage::from(usage),
        Err(error) => {
            log::warn!("Cannot read resource usage: {error}");
            ResourceUsage::default()
        }
    };

    finish(&options.stderr, &options.strftime, exit_code, elapsed, &usage)?;
    Ok(exit_code)
}

fn finish(
    stderr: &Path,
    strftime: &str,
    exit_code: i32,
    elapsed: Duration,
    usage: &ResourceUsage,
) -> crate::Result<()> {
    append_marker(
        stderr,
        MarkerAction::Stats,
        &resource_stats(exit_code, elapsed, usage),
    )?;
    let status = if exit_code == 0 {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Error
    };
    append_marker(stderr, MarkerAction::Status, &status)?;

    let mut finished = JsonMap::new();
    finished.insert(
        "time_finished".to_string(),
        Value::String(format_local_now(strftime)),
    );
    append_marker(stderr, MarkerAction::Stats, &finished)
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

pub fn start_stats(strftime: &str) -> JsonMap {
    let mut stats = JsonMap::new();
    stats.insert(
        "time_started".to_string(),
        Value::String(format_local_now(strftime)),
    );
    stats.insert("time_started_unix".to_string(), Value::from(now_unix()));
    stats.insert(
        "hostname".to_string(),
        Value::String(gethostname::gethostname().to_string_lossy().into_owned()),
    );
    let job_id = JOB_ID_VARIABLES
        .iter()
        .find_map(|name| std::env::var(name).ok());
    stats.insert(
        "scheduler_job_id".to_string(),
        job_id.map(Value::String).unwrap_or(Value::Null),
    );
    stats.insert(
        "cuda_visible_devices".to_string(),
        std::env::var("CUDA_VISIBLE_DEVICES")
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    stats
}

pub fn resource_stats(exit_code: i32, elapsed: Duration, usage: &ResourceUsage) -> JsonMap {
    let wall_clock = elapsed.as_secs_f64();
    let cpu_percentage = if wall_clock > 0.0 {
        ((usage.user_seconds + usage.system_seconds) / wall_clock * 100.0).round()
    } else {
        0.0
    };

    let mut stats = JsonMap::new();
    stats.insert("exit_code".to_string(), Value::from(exit_code));
    stats.insert("time_user_seconds".to_string(), Value::from(usage.user_seconds));
    stats.insert(
        "time_system_seconds".to_string(),
        Value::from(usage.system_seconds),
    );
    stats.insert("time_wall_clock_seconds".to_string(), Value::from(wall_clock));
    stats.insert("max_rss_kbytes".to_string(), Value::from(usage.max_rss_kbytes));
    stats.insert(
        "page_faults_major".to_string(),
        Value::from(usage.page_faults_major),
    );
    stats.insert(
        "page_faults_minor".to_string(),
        Value::from(usage.page_faults_minor),
    );
    stats.insert("io_inputs".to_string(), Value::from(usage.io_inputs));
    stats.insert("io_outputs".to_string(), Value::from(usage.io_outputs));
    stats.insert(
        "context_switches_voluntary".to_string(),
        Value::from(usage.context_switches_voluntary),
    );
    stats.insert(
        "context_switches_involuntary".to_string(),
        Value::from(usage.context_switches_involuntary),
    );
    stats.insert(
        "signals_received".to_string(),
        Value::from(usage.signals_received),
    );
    stats.insert("cpu_percentage".to_string(), Value::from(cpu_percentage));
    stats
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::marker::decode;
    use crate::model::ExecutionStatus;
    use crate::wrapper::{ResourceUsage, WrapOptions, resource_stats, run_wrapped};

    fn options(dir: &std::path::Path, command: &[&str]) -> WrapOptions {
        WrapOptions {
            stdout: dir.join("stdout.txt"),
            stderr: dir.join("stderr.txt"),
            strftime: "%H:%M".to_string(),
            command: command.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    #[test]
    fn test_resource_stats() {
        let usage = ResourceUsage {
            user_seconds: 1.5,
            system_seconds: 0.5,
            max_rss_kbytes: 1024,
            ..Default::default()
        };
        let stats = resource_stats(0, Duration::from_secs(4), &usage);
        assert_eq!(stats["exit_code"], json!(0));
        assert_eq!(stats["cpu_percentage"], json!(50.0));
        assert_eq!(stats["time_wall_clock_seconds"], json!(4.0));
        assert_eq!(stats["max_rss_kbytes"], json!(1024));

        let stats = resource_stats(1, Duration::ZERO, &usage);
        assert_eq!(stats["cpu_percentage"], json!(0.0));
    }

    #[tokio::test]
    async fn test_wrap_success() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let options = options(tmp.path(), &["sh", "-c", "echo hello; echo diagnostics >&2"]);
        std::fs::write(&options.stderr, "stale content\n").unwrap();

        let code = run_wrapped(&options).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(std::fs::read_to_string(&options.stdout).unwrap(), "hello\n");

        let stderr = std::fs::read_to_string(&options.stderr).unwrap();
        assert!(!stderr.contains("stale content"));
        assert!(stderr.contains("diagnostics\n"));
        let record = decode(&stderr);
        assert_eq!(record.status, Some(ExecutionStatus::Success));
        assert_eq!(record.stats["exit_code"], json!(0));
        assert!(record.stats.contains_key("time_started_unix"));
        assert!(record.stats.contains_key("time_finished"));
        assert!(record.stats.contains_key("hostname"));
        assert!(record.environ.is_some());
    }

    #[tokio::test]
    async fn test_wrap_failure() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let options = options(tmp.path(), &["sh", "-c", "exit 3"]);
        let code = run_wrapped(&options).await.unwrap();
        assert_eq!(code, 3);

        let record = decode(&std::fs::read_to_string(&options.stderr).unwrap());
        assert_eq!(record.status, Some(ExecutionStatus::Error));
        assert_eq!(record.stats["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn test_wrap_signal() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let options = options(tmp.path(), &["sh", "-c", "kill -9 $$"]);
        assert_eq!(run_wrapped(&options).await.unwrap(), 137);
    }

    #[tokio::test]
    async fn test_wrap_missing_program() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let options = options(tmp.path(), &["/nonexistent/program"]);
        assert_eq!(run_wrapped(&options).await.unwrap(), 127);

        let stderr = std::fs::read_to_string(&options.stderr).unwrap();
        assert!(stderr.contains("cannot start /nonexistent/program"));
        assert_eq!(decode(&stderr).status, Some(ExecutionStatus::Error));
    }

    #[tokio::test]
    async fn test_wrap_without_command() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        assert!(run_wrapped(&options(tmp.path(), &[])).await.is_err());
    }
}
