pub mod commands;

use crate::config::AttachMode;
use crate::metrics::MetricKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "proctrace")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Records per-metric time series of a process, across restarts", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Trace a process until interrupted")]
    Run(RunArgs),
    #[command(about = "Run the packet probe pre-flight checks")]
    Check,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    #[arg(short, long, help = "PID of the target process", conflicts_with = "name")]
    pub pid: Option<u32>,

    #[arg(
        short = 'e',
        long,
        help = "Substring of the target's command line; the newest match wins"
    )]
    pub name: Option<String>,

    #[arg(short, long, help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Directory the sinks are written to")]
    pub output_dir: Option<PathBuf>,

    #[arg(short = 'i', long, help = "Sampling interval in milliseconds")]
    pub interval_ms: Option<u64>,

    #[arg(short, long = "metric", help = "Metric to sample, repeatable (default: all)")]
    pub metrics: Vec<MetricKind>,

    #[arg(long, help = "Attach the packet probe to this interface")]
    pub interface: Option<String>,

    #[arg(long, help = "Hook packets with tc classifiers or a raw socket filter (tc, socket)")]
    pub attach: Option<AttachMode>,

    #[arg(long, help = "Only record packets with this source port")]
    pub src_port: Option<u16>,

    #[arg(long, help = "Only record packets with this destination port")]
    pub dst_port: Option<u16>,

    #[arg(long, help = "Path to the compiled packet probe object")]
    pub probe_object: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "proctrace", "run", "-e", "redis", "-m", "memory", "-m", "TXQ", "--interface", "eth0",
            "--dst-port", "6379",
        ])
        .unwrap();

        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.name.as_deref(), Some("redis"));
        assert_eq!(
            args.metrics,
            vec![MetricKind::VirtualMemory, MetricKind::TxQueue]
        );
        assert_eq!(args.interface.as_deref(), Some("eth0"));
        assert_eq!(args.dst_port, Some(6379));
    }

    #[test]
    fn test_parse_attach_mode() {
        let cli = Cli::try_parse_from([
            "proctrace", "run", "-p", "1", "--interface", "eth0", "--attach", "socket",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.attach, Some(AttachMode::Socket));

        assert!(Cli::try_parse_from(["proctrace", "run", "-p", "1", "--attach", "xdp"]).is_err());
    }

    #[test]
    fn test_pid_and_name_conflict() {
        assert!(Cli::try_parse_from(["proctrace", "run", "-p", "1", "-e", "x"]).is_err());
    }

    #[test]
    fn test_unknown_metric_rejected() {
        assert!(Cli::try_parse_from(["proctrace", "run", "-p", "1", "-m", "cpu"]).is_err());
    }
}
