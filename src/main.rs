//! keypool - distributed keyspace search coordinator

mod bootstrap;
mod cli;
mod db;
mod error;
mod fsm;
mod logging;
mod paths;
mod pool;
mod theme;
mod worker;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands};
use logging::LogConfig;
use theme::Themed;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Work(args) => cmd_work(args),
        Commands::Digest(args) => cmd_digest(args),
        Commands::Candidate(args) => cmd_candidate(args),
        Commands::Results(args) => cmd_results(&cli, args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Command-line flags win over environment variables, which win over the
/// per-command preset.
fn init_logging(cli: &Cli) {
    let preset = match cli.command {
        Commands::Work(_) => LogConfig::for_worker(),
        Commands::Serve(_) => LogConfig::for_coordinator(),
        _ => LogConfig::for_coordinator().with_level(tracing::Level::WARN),
    };
    let mut config = preset
        .with_verbosity(cli.verbose, cli.quiet)
        .with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(paths::expand_tilde(path));
    }
    if let Some(rotation) = cli.log_rotation {
        config = config.with_rotation(rotation);
    }
    if cli.log_spans {
        config = config.with_span_events(true);
    }
    logging::init(config);
}

fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<()> {
    let config = bootstrap::ServeConfig {
        host: args.host.clone(),
        port: args.port,
        job: args.job()?,
        db_path: (!args.no_db).then(|| cli.db_path.clone()),
    };

    let report = bootstrap::serve(config);
    tracing::debug!(
        states = ?report.outcome.visited,
        addr = ?report.local_addr,
        reason = ?report.summary.as_ref().and_then(|s| s.reason),
        "Serve finished"
    );
    if report.exit_code() != 0 {
        // The bootstrap error state has already printed the diagnostic.
        std::process::exit(report.exit_code());
    }
    Ok(())
}

fn cmd_work(args: &cli::WorkArgs) -> Result<()> {
    let keyspace = worker::Keyspace::new(&args.charset)?;
    let addr = if args.host.contains(':') {
        format!("[{}]:{}", args.host, args.port)
    } else {
        format!("{}:{}", args.host, args.port)
    };

    let report = worker::run(&addr, &keyspace)
        .with_context(|| format!("worker session with {} failed", addr))?;

    println!(
        "Searched {} chunk(s), {} candidate(s)",
        report.chunks_searched, report.candidates_tested
    );
    if let Some(value) = &report.found {
        println!("Found: {}", value.success());
    }
    Ok(())
}

fn cmd_digest(args: &cli::DigestArgs) -> Result<()> {
    println!("{}", hex::encode(worker::digest(args.value.as_bytes())));
    Ok(())
}

fn cmd_candidate(args: &cli::CandidateArgs) -> Result<()> {
    let keyspace = worker::Keyspace::new(&args.charset)?;
    println!("{}", keyspace.candidate(args.index));
    Ok(())
}

fn cmd_results(cli: &Cli, args: &cli::ResultsArgs) -> Result<()> {
    let path = paths::expand_tilde(&cli.db_path);
    if !path.exists() {
        bail!("no results database at {}", path.display());
    }
    let db = db::Database::open(&path)?;
    let results = db.recent_results(args.limit)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results recorded.");
        return Ok(());
    }
    for result in &results {
        let value = result
            .value_text()
            .map(|text| format!("{:?}", text))
            .unwrap_or_else(|| format!("0x{}", result.value_hex));
        println!(
            "{}  {}  {} ({})  {}",
            result.recorded_at.format("%Y-%m-%d %H:%M:%S").muted(),
            result.label.label(),
            result.hostname,
            result.ip_address,
            value.success()
        );
    }
    Ok(())
}
