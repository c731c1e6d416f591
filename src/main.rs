use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vaxmap::harness::{HarnessOptions, run_harness};
use vaxmap::pipeline::{RunOptions, extract_configured, run_configured, validate_config};

#[derive(Parser, Debug)]
#[command(
    name = "vaxmap",
    about = "Extract vaccination practices from the KVHH table and geocode them"
)]
struct Cli {
    #[arg(long, default_value = "configs/vaxmap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run {
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },
    Extract,
    Validate,
    Harness,
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { out, no_cache } => {
            let output = run_configured(&RunOptions {
                config_path: cli.config,
                use_cache: !no_cache,
            })?;

            let report = &output.report;
            info!(
                source = %report.source_key,
                rows = report.rows_extracted,
                extraction_cache_hit = report.extraction_cache_hit,
                requests = report.geocode_requests,
                cache_hits = report.geocode_cache_hits,
                failed = report.failed_lookups,
                resolved = report.resolved,
                unresolved = report.unresolved,
                "run summary"
            );

            let json = serde_json::to_string_pretty(&output.page)?;
            match out {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("failed to create output directory {}", parent.display())
                        })?;
                    }
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write output {}", path.display()))?;
                    info!(out = %path.display(), "page data written");
                }
                None => println!("{json}"),
            }
        }
        Commands::Extract => {
            let records = extract_configured(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Validate => {
            println!("{}", validate_config(&cli.config)?);
        }
        Commands::Harness => {
            let report = run_harness(&HarnessOptions {
                config_path: cli.config,
            })?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}
