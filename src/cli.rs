use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rightsizer")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continuously right-size container resources with in-place pod resizing")]
#[command(
    long_about = "A cluster agent that observes live container usage, computes right-sized \
CPU and memory envelopes under declarative policies, and applies them to running pods \
through the in-place resize protocol - no restarts, no disruption."
)]
pub struct Cli {
    /// Path to the declarative configuration file (YAML)
    #[arg(short, long, value_name = "FILE", env = "RIGHTSIZER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Compute and log decisions but never patch anything
    #[arg(long)]
    pub dry_run: bool,

    /// Exit non-zero when capability probing fails instead of degrading
    #[arg(long)]
    pub strict: bool,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Install the logger at the level the verbosity flags resolve to.
    ///
    /// An operator's default chatter is its sweep summaries, so plain
    /// `rightsizer` runs at info; `RUST_LOG` still wins for per-module
    /// filtering.
    pub fn init_logging(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.log_level());
        builder.parse_default_env();
        builder.init();
    }

    /// The base level implied by `--quiet` / `-v` counts.
    fn log_level(&self) -> log::LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => log::LevelFilter::Error,
            (false, 0) => log::LevelFilter::Info,
            (false, 1) => log::LevelFilter::Debug,
            (false, _) => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_minimal_invocation() {
        let cli = Cli::parse_from(["rightsizer"]);
        assert!(cli.config.is_none());
        assert!(!cli.dry_run);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["rightsizer", "--dry-run", "--strict", "-vv", "-c", "/etc/rightsizer.yaml"]);
        assert!(cli.dry_run);
        assert!(cli.strict);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/etc/rightsizer.yaml"));
    }

    #[test]
    fn test_verbosity_ladder() {
        assert_eq!(
            Cli::parse_from(["rightsizer"]).log_level(),
            log::LevelFilter::Info
        );
        assert_eq!(
            Cli::parse_from(["rightsizer", "-v"]).log_level(),
            log::LevelFilter::Debug
        );
        assert_eq!(
            Cli::parse_from(["rightsizer", "-vvv"]).log_level(),
            log::LevelFilter::Trace
        );
        // --quiet wins over any -v count
        assert_eq!(
            Cli::parse_from(["rightsizer", "-q", "-vv"]).log_level(),
            log::LevelFilter::Error
        );
    }
}
