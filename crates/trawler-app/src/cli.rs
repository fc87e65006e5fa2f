//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Private-tracker RSS automation.
#[derive(Debug, Parser)]
#[command(name = "trawler", version, about = "Private-tracker RSS automation")]
pub(crate) struct Cli {
    /// Work directory holding the database and bootstrap document
    /// (default: `~/.pt-tools`).
    #[arg(long, global = true, env = "TRAWLER_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run the ingest engine.
    Run {
        /// One pass over every subscription, or the persistent scheduler.
        #[arg(long, value_enum, default_value_t = Mode::Persistent)]
        mode: Mode,
    },
    /// Configuration management.
    Config {
        /// Configuration action.
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print per-site user statistics.
    Stats,
    /// Database maintenance.
    Db {
        /// Maintenance action.
        #[command(subcommand)]
        action: DbAction,
    },
}

/// Engine execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Mode {
    /// One tick per enabled subscription, then exit.
    Single,
    /// Ticker jobs until interrupted.
    Persistent,
}

/// `config` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum ConfigAction {
    /// Write the default bootstrap document into the work directory.
    Init,
}

/// `db` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum DbAction {
    /// Reinterpret legacy offsetless promotion deadlines in the
    /// tracker-local zone.
    FixTimezone {
        /// Report the affected rows without rewriting them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a consistent snapshot of the database.
    Backup {
        /// Destination file (default: timestamped sibling of the live
        /// database).
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_modes_and_defaults() {
        let cli = Cli::try_parse_from(["trawler", "run"]).expect("parse");
        match cli.command {
            Command::Run { mode } => assert_eq!(mode, Mode::Persistent),
            _ => panic!("expected run command"),
        }

        let cli = Cli::try_parse_from(["trawler", "run", "--mode", "single"]).expect("parse");
        match cli.command {
            Command::Run { mode } => assert_eq!(mode, Mode::Single),
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parses_db_maintenance_flags() {
        let cli =
            Cli::try_parse_from(["trawler", "db", "fix-timezone", "--dry-run"]).expect("parse");
        match cli.command {
            Command::Db {
                action: DbAction::FixTimezone { dry_run },
            } => assert!(dry_run),
            _ => panic!("expected db fix-timezone"),
        }

        let cli = Cli::try_parse_from(["trawler", "--work-dir", "/tmp/w", "db", "backup"])
            .expect("parse");
        assert_eq!(cli.work_dir, Some(PathBuf::from("/tmp/w")));
    }
}
