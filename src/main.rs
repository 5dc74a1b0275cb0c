//! Main entry point for the virtfs CLI app

use std::io::{self, Write};

use tracing_subscriber::EnvFilter;
use virtfs::cli::{self, Commands};
use virtfs::{extract, Collector, Extractor, Stager};

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::run();
    init_logging(args.verbose);
    let config = cli::resolve_config(args.config.clone())?;
    config.validate()?;

    match args.command {
        Commands::StageFile { path } => {
            Stager::new(&config).stage_file(&path)?;
        }
        Commands::StageDir { path } => {
            Stager::new(&config).stage_directory(&path)?;
        }
        Commands::Collect { root, output, no_compress, timestamp } => {
            let config = match timestamp {
                Some(ts) => config.with_timestamp(ts),
                None => config,
            };
            Collector::new(config).collect(&output, &root, !no_compress)?;
        }
        Commands::StageArtifact { archive, output, no_compress } => {
            Extractor::new(&config).stage_artifact(&archive, &output, !no_compress)?;
        }
        Commands::List { archive, no_compress } => {
            let members = extract::list_members(&archive, !no_compress)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            writeln!(out, "Artifact ({} members):", members.len())?;
            for m in members {
                let target = match (&m.linkname, m.device) {
                    (Some(link), _) => format!(" -> {}", link.display()),
                    (None, Some(dev)) => format!(" [{},{}]", dev.major, dev.minor),
                    (None, None) => String::new(),
                };
                writeln!(
                    out,
                    "{:<12} {:04o} {}/{} {:>10} {}{}",
                    m.member_type.name(),
                    m.mode,
                    m.uid,
                    m.gid,
                    m.size,
                    m.name.display(),
                    target
                )?;
            }
        }
    }

    Ok(())
}
