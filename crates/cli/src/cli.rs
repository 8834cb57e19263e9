//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// mibridge - lab-streaming bridge for the motor-imagery kart experiment
#[derive(Parser, Debug)]
#[command(
    name = "mibridge",
    author,
    version,
    about = "Lab-streaming bridge for a motor-imagery BCI kart experiment",
    long_about = "Binds a classifier signal stream and a stimulus marker stream,\n\
                  turns them into a steering value for the game and republishes\n\
                  session markers on an outlet of its own."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "MIBRIDGE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "MIBRIDGE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bridge tick loop
    Run(RunArgs),

    /// List streams on the network
    Resolve(ResolveArgs),

    /// Publish synthetic signal and marker streams
    Simulate(SimulateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "bridge.toml",
        env = "MIBRIDGE_CONFIG"
    )]
    pub config: PathBuf,

    /// Tick period in milliseconds
    #[arg(long, default_value = "16", env = "MIBRIDGE_TICK_MS")]
    pub tick_ms: u64,

    /// Stop after this many seconds (0 = run until interrupted)
    #[arg(long, default_value = "0", env = "MIBRIDGE_DURATION")]
    pub duration: u64,

    /// Prometheus metrics port (0 = disabled)
    #[arg(long, default_value = "0", env = "MIBRIDGE_METRICS_PORT")]
    pub metrics_port: u16,

    /// Override the signal stream query
    #[arg(long)]
    pub signal_query: Option<String>,

    /// Override the marker stream query
    #[arg(long)]
    pub marker_query: Option<String>,

    /// Enable calibration checkpoints regardless of the file
    #[arg(long)]
    pub calibration: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ResolveArgs {
    /// Configuration providing network settings (defaults when omitted)
    #[arg(short, long, env = "MIBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds to wait for answers
    #[arg(long, default_value = "1.0")]
    pub wait: f64,

    /// Only list streams matching this predicate
    #[arg(long)]
    pub predicate: Option<String>,

    /// Keep watching and print streams as they appear and disappear
    #[arg(long)]
    pub watch: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Configuration whose stream queries the simulated streams must satisfy
    #[arg(
        short,
        long,
        default_value = "bridge.toml",
        env = "MIBRIDGE_CONFIG"
    )]
    pub config: PathBuf,

    /// Signal sample rate in Hz
    #[arg(long, default_value = "128")]
    pub rate: f64,

    /// Marker codes sent in order, one per interval
    #[arg(long, value_delimiter = ',', default_value = "1,10,0,11,99")]
    pub script: Vec<i32>,

    /// Seconds between two scripted markers
    #[arg(long, default_value = "2.0")]
    pub interval: f64,

    /// Replay the script until interrupted
    #[arg(long = "loop")]
    pub repeat: bool,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "bridge.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "bridge.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["mibridge", "run"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tick_ms, 16);
                assert_eq!(args.duration, 0);
                assert_eq!(args.config, PathBuf::from("bridge.toml"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_simulate_script_parsing() {
        let cli =
            Cli::try_parse_from(["mibridge", "simulate", "--script", "1,10,11,99", "--rate", "64"])
                .unwrap();
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.script, vec![1, 10, 11, 99]);
                assert_eq!(args.rate, 64.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["mibridge", "-q", "-v", "info"]).is_err());
    }

    #[test]
    fn test_global_log_format() {
        let cli = Cli::try_parse_from(["mibridge", "resolve", "--log-format", "json", "--watch"])
            .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(cli.command, Commands::Resolve(ResolveArgs { watch: true, .. })));
    }
}
