use std::io::IsTerminal;

use clap::{CommandFactory, FromArgMatches};
use cli_table::ColorChoice;

use pipeq::client::commands::experiment::{command_clean, command_gen, command_run, command_stop};
use pipeq::client::commands::view::{command_html, command_info, command_log, command_status};
use pipeq::client::commands::wrap::command_wrap;
use pipeq::client::globalsettings::GlobalSettings;
use pipeq::client::output::cli::CliOutput;
use pipeq::client::output::json::JsonOutput;
use pipeq::client::output::outputs::{Output, Outputs};
use pipeq::common::cli::{ColorPolicy, CommonOpts, ConfigOverrides, RootOptions, SubCommand};
use pipeq::common::config::{Config, default_rcfile};
use pipeq::common::setup::setup_logging;
use pipeq::common::utils::fs::absolute_path;

fn make_printer(opts: &CommonOpts) -> Box<dyn Output> {
    let color_policy = match opts.colors {
        ColorPolicy::Always => ColorChoice::AlwaysAnsi,
        ColorPolicy::Auto => {
            if std::io::stdout().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
        ColorPolicy::Never => ColorChoice::Never,
    };

    match opts.output_mode {
        Outputs::CLI => {
            // Set colored public for CLI
            match color_policy {
                ColorChoice::Always | ColorChoice::AlwaysAnsi => {
                    colored::control::set_override(true)
                }
                ColorChoice::Never => colored::control::set_override(false),
                _ => {}
            }

            Box::new(CliOutput::new(color_policy))
        }
        Outputs::JSON => Box::<JsonOutput>::default(),
    }
}

fn load_config(opts: &CommonOpts, overrides: ConfigOverrides) -> anyhow::Result<Config> {
    let rcfile = absolute_path(opts.rcfile.clone().unwrap_or_else(default_rcfile));
    let mut config = Config::load(&rcfile)?;
    overrides.apply(&mut config);
    config.root = absolute_path(config.root);
    config.html_root = config.html_root.into_iter().map(absolute_path).collect();
    log::debug!("Using configuration {config:?}");
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> pipeq::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    // The wrapper runs on compute nodes and must not depend on the configuration
    let subcmd = match top_opts.subcmd {
        SubCommand::Wrap(opts) => {
            let code = match command_wrap(opts).await {
                Ok(code) => code,
                Err(error) => {
                    eprintln!("{error:?}");
                    1
                }
            };
            std::process::exit(code);
        }
        subcmd => subcmd,
    };

    let printer = make_printer(&top_opts.common);
    let config = match load_config(&top_opts.common, top_opts.overrides) {
        Ok(config) => config,
        Err(error) => {
            printer.print_error(error);
            std::process::exit(1);
        }
    };
    let gsettings = GlobalSettings::new(config, printer);

    let result = match subcmd {
        SubCommand::Gen(opts) => command_gen(&gsettings, opts).await,
        SubCommand::Run(opts) => command_run(&gsettings, opts).await,
        SubCommand::Stop(opts) => command_stop(&gsettings, opts).await,
        SubCommand::Clean(opts) => command_clean(&gsettings, opts),
        SubCommand::Html(opts) => command_html(&gsettings, opts),
        SubCommand::Status(opts) => command_status(&gsettings, opts),
        SubCommand::Log(opts) => command_log(&gsettings, opts),
        SubCommand::Info(opts) => command_info(&gsettings, opts),
        SubCommand::Wrap(_) => unreachable!("the wrapper is handled before loading the configuration"),
    };

    if let Err(e) = result {
        gsettings.printer().print_error(e);
        std::process::exit(1);
    }

    Ok(())
}
