use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::common::timeutils::ArgDuration;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Human readable tables.
    Table,
    /// JSON documents.
    Json,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        long,
        env = "FLEETQ_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::FLEETQ_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Run the controller loop
    Run(RunOpts),
    /// Check access to the queue and the instance template without launching anything
    DryRun(DryRunOpts),
    /// Display the status of a running controller
    Status(StatusOpts),
}

#[derive(Parser)]
pub struct RunOpts {
    /// Path to the controller configuration (TOML)
    #[arg(long, env = "FLEETQ_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Overrides `scaling.max_fleet_size` from the configuration
    #[arg(long)]
    pub max_fleet_size: Option<u32>,

    /// Overrides `queue.poll_interval_ms` from the configuration
    ///
    /// Example: `--poll-interval 500ms`
    #[arg(long)]
    pub poll_interval: Option<ArgDuration>,

    /// Address of the HTTP status endpoint
    ///
    /// The endpoint is disabled if no address is set.
    #[arg(long, env = "FLEETQ_STATUS_ADDR")]
    pub status_addr: Option<SocketAddr>,

    /// Adopt instances of a previous run before the first cycle
    #[arg(long)]
    pub reconcile: bool,

    /// Release addresses and terminate all workers when the controller stops
    #[arg(long)]
    pub drain_on_exit: bool,
}

#[derive(Parser)]
pub struct DryRunOpts {
    /// Path to the controller configuration (TOML)
    #[arg(long, env = "FLEETQ_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,
}

#[derive(Parser)]
pub struct StatusOpts {
    /// Address of the status endpoint of the controller
    #[arg(long, env = "FLEETQ_STATUS_ADDR", default_value = "127.0.0.1:9090")]
    pub addr: SocketAddr,

    /// Sets output formatting
    #[arg(long, default_value_t = OutputMode::Table, value_enum)]
    pub output: OutputMode,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::{CommandFactory, Parser};

    use super::{OutputMode, RootOptions, SubCommand};

    #[test]
    fn verify_cli() {
        RootOptions::command().debug_assert();
    }

    #[test]
    fn parse_run_overrides() {
        let opts = RootOptions::try_parse_from([
            "fleetq",
            "run",
            "--config",
            "fleetq.toml",
            "--max-fleet-size",
            "5",
            "--poll-interval",
            "250ms",
            "--status-addr",
            "0.0.0.0:9090",
        ])
        .unwrap();
        let SubCommand::Run(run) = opts.subcmd else {
            panic!("Expected run command");
        };
        assert_eq!(run.max_fleet_size, Some(5));
        assert_eq!(
            run.poll_interval.map(|d| d.unpack()),
            Some(Duration::from_millis(250))
        );
        assert_eq!(run.status_addr.unwrap().port(), 9090);
        assert!(!run.reconcile);
    }

    #[test]
    fn parse_status_json() {
        let opts =
            RootOptions::try_parse_from(["fleetq", "status", "--output", "json"]).unwrap();
        let SubCommand::Status(status) = opts.subcmd else {
            panic!("Expected status command");
        };
        assert_eq!(status.output, OutputMode::Json);
        assert_eq!(status.addr.port(), 9090);
    }
}
