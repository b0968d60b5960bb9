use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::client::commands::experiment::{CleanOpts, GenOpts, RunOpts, StopOpts};
use crate::client::commands::view::{InfoOpts, LogOpts, ViewOpts};
use crate::client::commands::wrap::WrapOpts;
use crate::client::output::outputs::Outputs;
use crate::common::config::{Config, RCFILE_ENV};
use crate::scheduler::ManagerType;

#[derive(clap::ValueEnum, Clone)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path of the configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = RCFILE_ENV,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub rcfile: Option<PathBuf>,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Sets output formatting
    #[arg(
        long,
        env = "PIPEQ_OUTPUT_MODE",
        default_value_t = Outputs::CLI,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub output_mode: Outputs,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "PIPEQ_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

/// Command line overrides of configuration values.
///
/// List values are appended to the configured lists, `-v` entries are merged into the
/// configured environment.
#[derive(Parser, Default, Debug)]
pub struct ConfigOverrides {
    /// Directory where run directories are created
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub root: Option<PathBuf>,

    /// Directory where the HTML report is written, can be repeated
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub html_root: Vec<PathBuf>,

    /// Public URL of the first HTML root
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub html_root_alias: Option<String>,

    /// Batch scheduler used for submission
    #[arg(long, value_enum, global = true, help_heading("CONFIG OVERRIDES"))]
    pub manager: Option<ManagerType>,

    /// Default queue of stages
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub queue: Option<String>,

    /// Default memory request of stages in gigabytes
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub mem_lo_gb: Option<f64>,

    /// Default memory limit of stages in gigabytes
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub mem_hi_gb: Option<f64>,

    /// Maximum number of active units of a stage
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub parallel_jobs: Option<u32>,

    /// Number of jobs submitted together as a single unit
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub batch_size: Option<u32>,

    /// File sourced before each job, can be repeated
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub source: Vec<String>,

    /// Directory prepended to PATH of each job, can be repeated
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub path: Vec<String>,

    /// Directory prepended to LD_LIBRARY_PATH of each job, can be repeated
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub ld_library_path: Vec<String>,

    /// Environment variable of each job in the form KEY=VALUE, can be repeated
    #[arg(short = 'v', value_parser = parse_key_value, global = true, help_heading("CONFIG OVERRIDES"))]
    pub env: Vec<(String, String)>,

    /// Maximum number of characters of job stdout shown in reports
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub max_stdout_size: Option<usize>,

    /// Delay between two scheduler polls, e.g. `2s` or `1m`
    #[arg(long, value_parser = humantime::parse_duration, global = true, help_heading("CONFIG OVERRIDES"))]
    pub sleep_between_queue_checks: Option<Duration>,

    /// Format of timestamps written into logs and reports
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub strftime: Option<String>,

    /// Shell command executed when the experiment fails
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub notification_command_on_error: Option<String>,

    /// Shell command executed when the experiment succeeds
    #[arg(long, global = true, help_heading("CONFIG OVERRIDES"))]
    pub notification_command_on_success: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut Config) {
        let ConfigOverrides {
            root,
            html_root,
            html_root_alias,
            manager,
            queue,
            mem_lo_gb,
            mem_hi_gb,
            parallel_jobs,
            batch_size,
            source,
            path,
            ld_library_path,
            env,
            max_stdout_size,
            sleep_between_queue_checks,
            strftime,
            notification_command_on_error,
            notification_command_on_success,
        } = self;

        if let Some(root) = root {
            config.root = root;
        }
        config.html_root.extend(html_root);
        if html_root_alias.is_some() {
            config.html_root_alias = html_root_alias;
        }
        if let Some(manager) = manager {
            config.manager = manager;
        }
        if queue.is_some() {
            config.queue = queue;
        }
        if let Some(mem_lo_gb) = mem_lo_gb {
            config.mem_lo_gb = mem_lo_gb;
        }
        if let Some(mem_hi_gb) = mem_hi_gb {
            config.mem_hi_gb = mem_hi_gb;
        }
        if let Some(parallel_jobs) = parallel_jobs {
            config.parallel_jobs = parallel_jobs;
        }
        if let Some(batch_size) = batch_size {
            config.batch_size = batch_size;
        }
        config.source.extend(source);
        config.path.extend(path);
        config.ld_library_path.extend(ld_library_path);
        config.env.extend(env);
        if let Some(max_stdout_size) = max_stdout_size {
            config.max_stdout_size = max_stdout_size;
        }
        if let Some(sleep) = sleep_between_queue_checks {
            config.sleep_between_queue_checks = sleep;
        }
        if let Some(strftime) = strftime {
            config.strftime = strftime;
        }
        if notification_command_on_error.is_some() {
            config.notification_command_on_error = notification_command_on_error;
        }
        if notification_command_on_success.is_some() {
            config.notification_command_on_success = notification_command_on_success;
        }
    }
}

fn parse_key_value(value: &str) -> anyhow::Result<(String, String)> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Expected KEY=VALUE, got `{value}`"),
    }
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::PIPEQ_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(flatten)]
    pub overrides: ConfigOverrides,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Generate job and unit scripts without submitting anything
    Gen(GenOpts),
    /// Generate, submit and monitor an experiment until it finishes
    Run(RunOpts),
    /// Delete all scheduler units of an experiment
    Stop(StopOpts),
    /// Remove the run directory of an experiment
    Clean(CleanOpts),
    /// Render the HTML report of an experiment
    Html(ViewOpts),
    /// Display the status of stages and jobs
    Status(ViewOpts),
    /// Print logs of the experiment, a stage or a job
    Log(LogOpts),
    /// Display the environment and the script of a job
    Info(InfoOpts),
    /// Run a job command and record its status and resource usage
    #[command(hide(true))]
    Wrap(WrapOpts),
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use clap::Parser;

    use crate::common::cli::{RootOptions, SubCommand, parse_key_value};
    use crate::common::config::Config;
    use crate::scheduler::ManagerType;

    fn parse(args: &[&str]) -> RootOptions {
        RootOptions::try_parse_from(std::iter::once("pipeq").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_key_value() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("A").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_overrides() {
        let opts = parse(&[
            "run",
            "pipeline.toml",
            "--path",
            "/opt/bin",
            "-v",
            "LANG=C",
            "--manager",
            "slurm",
            "--parallel-jobs",
            "8",
            "--sleep-between-queue-checks",
            "1m",
            "--html-root",
            "/www",
        ]);
        assert!(matches!(opts.subcmd, SubCommand::Run(_)));

        let mut config = Config {
            path: vec!["/usr/local/bin".to_string()],
            html_root: vec![PathBuf::from("/html")],
            ..Default::default()
        };
        config.env.insert("LANG".to_string(), "en_US".to_string());
        config.env.insert("TERM".to_string(), "xterm".to_string());
        opts.overrides.apply(&mut config);

        assert_eq!(config.path, vec!["/usr/local/bin", "/opt/bin"]);
        assert_eq!(config.env["LANG"], "C");
        assert_eq!(config.env["TERM"], "xterm");
        assert_eq!(config.manager, ManagerType::Slurm);
        assert_eq!(config.parallel_jobs, 8);
        assert_eq!(config.sleep_between_queue_checks, Duration::from_secs(60));
        assert_eq!(
            config.html_root,
            vec![PathBuf::from("/html"), PathBuf::from("/www")]
        );
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_wrap_command() {
        let opts = parse(&[
            "wrap",
            "--stdout",
            "out.txt",
            "--stderr",
            "err.txt",
            "--",
            "bash",
            "-e",
            "job.sh",
        ]);
        match opts.subcmd {
            SubCommand::Wrap(opts) => {
                assert_eq!(opts.command, vec!["bash", "-e", "job.sh"]);
                assert_eq!(opts.stdout, PathBuf::from("out.txt"));
            }
            _ => panic!("Unexpected command"),
        }
    }
}
