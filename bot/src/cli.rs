use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tax-bot",
    version,
    about = "Evaluates tax obligations from a source feed and notifies each one exactly once"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "config",
        help = "Directory holding default.toml and local.toml"
    )]
    pub config_dir: PathBuf,
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as a daemon on the configured trigger schedule (SIGHUP triggers a run)
    Run,
    /// Perform a single run and exit with its status
    Once,
    /// Report run history and obligations awaiting an operator
    Stats {
        #[arg(long, help = "Number of recent runs to read (defaults to observability.stats_window)")]
        limit: Option<usize>,
    },
    /// Release a failed obligation so the next run attempts it again
    Retry { fingerprint: String },
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry() {
        let cli = Cli::try_parse_from(["tax-bot", "retry", "abc123"]).unwrap();
        assert!(matches!(cli.command, Commands::Retry { fingerprint } if fingerprint == "abc123"));
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["tax-bot", "stats", "--limit", "5", "--json", "--config-dir", "/etc/tax-bot"])
                .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/tax-bot"));
        assert!(matches!(cli.command, Commands::Stats { limit: Some(5) }));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["tax-bot", "publish"]).is_err());
    }
}
