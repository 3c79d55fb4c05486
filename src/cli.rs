//! Command-line interface definitions using clap.

use crate::error::Result;
use crate::logging::{LogFormat, LogRotation};
use crate::paths;
use crate::pool::Job;
use crate::worker::keyspace::{DEFAULT_CHARSET, Keyspace};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Coordinate a pool of workers searching a keyspace for a digest preimage.
#[derive(Parser, Debug)]
#[command(name = "keypool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the results database.
    #[arg(long, global = true, env = "KEYPOOL_DB_PATH", default_value_os_t = paths::get_results_path())]
    pub db_path: PathBuf,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log format: pretty, compact or json.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Rotation for --log-file: hourly, daily or never.
    #[arg(long, global = true, requires = "log_file")]
    pub log_rotation: Option<LogRotation>,

    /// Log span close events with their timings.
    #[arg(long, global = true)]
    pub log_spans: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordinator and hand out keyspace chunks to workers.
    Serve(ServeArgs),

    /// Connect to a coordinator and search assigned chunks.
    Work(WorkArgs),

    /// Print the SHA-256 digest of a value, for use as a search target.
    Digest(DigestArgs),

    /// Print the candidate a keyspace index maps to.
    Candidate(CandidateArgs),

    /// List values recorded by previous runs.
    Results(ResultsArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "KEYPOOL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "KEYPOOL_PORT", default_value_t = 7373)]
    pub port: u16,

    /// Hex-encoded digest to search for.
    #[arg(short, long, env = "KEYPOOL_TARGET")]
    pub target: HexDigest,

    /// Size of the keyspace; indices 0..work-size are searched.
    #[arg(
        short = 'n',
        long,
        env = "KEYPOOL_WORK_SIZE",
        required_unless_present = "max_len",
        conflicts_with = "max_len"
    )]
    pub work_size: Option<u64>,

    /// Search every candidate up to this length instead of a fixed size.
    #[arg(long)]
    pub max_len: Option<u32>,

    /// Characters candidates are built from (with --max-len).
    #[arg(long, env = "KEYPOOL_CHARSET", default_value = DEFAULT_CHARSET)]
    pub charset: String,

    /// Indices per chunk handed to a worker.
    #[arg(short, long, env = "KEYPOOL_CHUNK_SIZE", default_value_t = 100_000)]
    pub chunk_size: u64,

    /// Indices a worker searches between checkpoints.
    #[arg(long, env = "KEYPOOL_CHECKPOINT_INTERVAL", default_value_t = 10_000)]
    pub checkpoint_interval: u64,

    /// Seconds of silence before a worker's chunk is reclaimed.
    #[arg(long, env = "KEYPOOL_TIMEOUT", default_value_t = 30)]
    pub timeout: u64,

    /// Maximum number of connected workers.
    #[arg(long, env = "KEYPOOL_MAX_WORKERS", default_value_t = 64)]
    pub max_workers: usize,

    /// Label stored with found values (defaults to the target digest).
    #[arg(long, env = "KEYPOOL_LABEL")]
    pub label: Option<String>,

    /// Do not record found values.
    #[arg(long)]
    pub no_db: bool,
}

impl ServeArgs {
    /// The job these arguments describe. Not yet validated.
    pub fn job(&self) -> Result<Job> {
        let work_size = match (self.work_size, self.max_len) {
            (Some(n), _) => n,
            (None, Some(len)) => Keyspace::new(&self.charset)?.size_up_to(len),
            (None, None) => 0,
        };
        Ok(Job {
            work_size,
            chunk_size: self.chunk_size,
            checkpoint_interval: self.checkpoint_interval,
            timeout: Duration::from_secs(self.timeout),
            target: self.target.0.clone(),
            label: self
                .label
                .clone()
                .unwrap_or_else(|| format!("sha256:{}", hex::encode(&self.target.0))),
            max_workers: self.max_workers,
        })
    }
}

/// Arguments for the work command.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Coordinator host.
    #[arg(long, env = "KEYPOOL_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Coordinator port.
    #[arg(short, long, env = "KEYPOOL_PORT", default_value_t = 7373)]
    pub port: u16,

    /// Characters candidates are built from.
    #[arg(long, env = "KEYPOOL_CHARSET", default_value = DEFAULT_CHARSET)]
    pub charset: String,
}

/// Arguments for the digest command.
#[derive(Parser, Debug)]
pub struct DigestArgs {
    /// Value to hash.
    pub value: String,
}

/// Arguments for the candidate command.
#[derive(Parser, Debug)]
pub struct CandidateArgs {
    /// Keyspace index.
    pub index: u64,

    /// Characters candidates are built from.
    #[arg(long, env = "KEYPOOL_CHARSET", default_value = DEFAULT_CHARSET)]
    pub charset: String,
}

/// Arguments for the results command.
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Limit number of results (0 for unlimited).
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,

    /// Print JSON instead of plain lines.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "keypool",
            &mut std::io::stdout(),
        );
    }
}

/// A digest given on the command line in hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexDigest(pub Vec<u8>);

impl FromStr for HexDigest {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("invalid hex digest: {}", e))?;
        if bytes.is_empty() {
            return Err("digest must not be empty".to_string());
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_flags() {
        let args = Cli::try_parse_from([
            "keypool",
            "--log-file",
            "/tmp/keypool.log",
            "--log-rotation",
            "hourly",
            "--log-spans",
            "digest",
            "x",
        ])
        .unwrap();
        assert_eq!(args.log_rotation, Some(LogRotation::Hourly));
        assert!(args.log_spans);

        // Rotation only makes sense with a log file.
        assert!(Cli::try_parse_from(["keypool", "--log-rotation", "never", "digest", "x"]).is_err());
    }

    #[test]
    fn test_serve_defaults() {
        let args =
            Cli::try_parse_from(["keypool", "serve", "--target", TARGET, "-n", "1000"]).unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.port, 7373);
                assert_eq!(serve.host, "0.0.0.0");
                assert_eq!(serve.target.0.len(), 32);
                let job = serve.job().unwrap();
                assert_eq!(job.work_size, 1000);
                assert_eq!(job.timeout, Duration::from_secs(30));
                assert_eq!(job.label, format!("sha256:{}", TARGET));
                assert!(job.validate().is_ok());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_options() {
        let args = Cli::try_parse_from([
            "keypool",
            "serve",
            "--target",
            "abcd",
            "--work-size",
            "100",
            "--chunk-size",
            "25",
            "--timeout",
            "5",
            "--label",
            "demo",
            "--no-db",
        ])
        .unwrap();
        match args.command {
            Commands::Serve(serve) => {
                assert!(serve.no_db);
                let job = serve.job().unwrap();
                assert_eq!(job.chunk_size, 25);
                assert_eq!(job.target, vec![0xab, 0xcd]);
                assert_eq!(job.label, "demo");
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_max_len_sizes_keyspace() {
        let args = Cli::try_parse_from([
            "keypool", "serve", "--target", "abcd", "--max-len", "3", "--charset", "ab",
        ])
        .unwrap();
        match args.command {
            Commands::Serve(serve) => assert_eq!(serve.job().unwrap().work_size, 2 + 4 + 8),
            _ => panic!("Expected Serve command"),
        }

        assert!(Cli::try_parse_from(["keypool", "serve", "--target", "abcd"]).is_err());
        assert!(
            Cli::try_parse_from([
                "keypool", "serve", "--target", "abcd", "-n", "5", "--max-len", "2"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_serve_rejects_bad_target() {
        assert!(Cli::try_parse_from(["keypool", "serve", "--target", "xyz", "-n", "10"]).is_err());
        assert!(Cli::try_parse_from(["keypool", "serve", "--target", "", "-n", "10"]).is_err());
    }

    #[test]
    fn test_work_command() {
        let args = Cli::try_parse_from(["keypool", "work", "--port", "9000"]).unwrap();
        match args.command {
            Commands::Work(work) => {
                assert_eq!(work.host, "127.0.0.1");
                assert_eq!(work.port, 9000);
                assert_eq!(work.charset, DEFAULT_CHARSET);
            }
            _ => panic!("Expected Work command"),
        }
    }

    #[test]
    fn test_candidate_and_digest_commands() {
        let args = Cli::try_parse_from(["keypool", "candidate", "27", "--charset", "ab"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Candidate(CandidateArgs { index: 27, .. })
        ));

        let args = Cli::try_parse_from(["keypool", "digest", "hello"]).unwrap();
        assert!(matches!(args.command, Commands::Digest(_)));
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from([
            "keypool",
            "results",
            "-vv",
            "--no-color",
            "--log-format",
            "json",
            "--db-path",
            "/tmp/r.db",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.no_color);
        assert_eq!(args.log_format, Some(LogFormat::Json));
        assert_eq!(args.db_path, PathBuf::from("/tmp/r.db"));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["keypool", "-v", "-q", "results"]).is_err());
    }
}
