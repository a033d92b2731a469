use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use earmark::db::DbError;
use earmark::decode::DecodeError;
use earmark::dsp::ExtractError;
use earmark::matcher::{MatchParams, MatchStatus, TrackMatch};

// Exit codes for embedding scripts: 2 (usage) is clap's own.
const EXIT_MATCH: u8 = 0;
const EXIT_NO_MATCH: u8 = 1;
const EXIT_CORRUPT_INPUT: u8 = 3;
const EXIT_DATABASE: u8 = 4;

#[derive(Parser)]
#[command(name = "earmark", version, about = "Acoustic fingerprint indexer and recognizer")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index reference tracks (files or directories)
    Ingest {
        /// Files or directories to ingest (defaults to config file music_dirs)
        paths: Vec<String>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Recognize a short snippet against the index
    Recognize {
        /// Audio snippet to identify
        snippet: PathBuf,

        /// Number of ranked candidates to return (default from config, else 3)
        #[arg(long)]
        topk: Option<usize>,

        /// Minimum histogram support for a candidate (default from config, else 5)
        #[arg(long)]
        min_support: Option<u32>,

        /// Wall-clock budget in milliseconds, 0 = unlimited
        /// (best-effort results when exceeded)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show index statistics
    Stats,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(classify_error(&e))
        }
    }
}

/// Map an error chain to the exit-code contract: corrupt/undecodable input
/// is 3, anything database-shaped is 4, the rest fall back to no-match.
/// Wrapper enums expose their causes through `source`, so walking the chain
/// sees through `MatchError` and `IngestError`.
fn classify_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if cause.is::<DecodeError>() || cause.is::<ExtractError>() {
            return EXIT_CORRUPT_INPUT;
        }
        if cause.is::<DbError>() {
            return EXIT_DATABASE;
        }
    }
    EXIT_NO_MATCH
}

fn run(cli: Cli) -> Result<u8> {
    // Load config file (optional, defaults if missing)
    let config = earmark::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(earmark::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = earmark::db::Database::open(&db_path).context("Failed to open database")?;

    match cli.command {
        Commands::Ingest { paths, jobs } => {
            // Resolve ingest paths: CLI args > config music_dirs
            let ingest_paths = if !paths.is_empty() {
                paths
            } else if !config.music_dirs.is_empty() {
                config
                    .music_dirs
                    .iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect()
            } else {
                anyhow::bail!(
                    "No paths to ingest. Pass paths as arguments or set music_dirs in config."
                );
            };

            let files = earmark::ingest::collect_audio_files(&ingest_paths);
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };

            let result = earmark::ingest::ingest_tracks(&db, &files, workers, None)
                .context("Ingest failed")?;
            println!(
                "Ingest complete: {} ingested, {} skipped, {} failed",
                result.ingested, result.skipped, result.failed
            );
            db.close().context("Failed to close database")?;
            Ok(EXIT_MATCH)
        }

        Commands::Recognize {
            snippet,
            topk,
            min_support,
            timeout_ms,
        } => {
            let pcm = earmark::decode::load_audio(&snippet)
                .with_context(|| format!("Failed to decode {}", snippet.display()))?;

            // CLI flags override the config file's [matcher] defaults.
            let params = MatchParams {
                topk: topk.unwrap_or(config.matcher.topk),
                min_support: min_support.unwrap_or(config.matcher.min_support),
                deadline: match timeout_ms.unwrap_or(config.matcher.timeout_ms) {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                },
            };
            let recognition = earmark::matcher::recognize(&db, &pcm, &params, None)
                .context("Recognition failed")?;

            match recognition.status {
                MatchStatus::Empty => {
                    println!("No match.");
                    Ok(EXIT_NO_MATCH)
                }
                status => {
                    if status == MatchStatus::Partial {
                        println!("(deadline exceeded, results are best-effort)");
                    }
                    if recognition.results.is_empty() {
                        println!("No match.");
                        return Ok(EXIT_NO_MATCH);
                    }
                    print_match_table(&recognition.results);
                    Ok(EXIT_MATCH)
                }
            }
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Index Statistics");
            println!("================");
            println!("Tracks:          {}", stats.track_count);
            println!("Postings:        {}", stats.posting_count);
            println!("Distinct hashes: {}", stats.distinct_hashes);
            Ok(EXIT_MATCH)
        }
    }
}

/// Print ranked matches with the alignment offset.
fn print_match_table(results: &[TrackMatch]) {
    println!(
        "{:<4} {:<30} {:<20} {:>7} {:>10}",
        "#", "Title", "Artist", "Score", "Offset"
    );
    println!("{}", "-".repeat(75));

    for (rank, m) in results.iter().enumerate() {
        let title: String = if m.title.len() > 30 {
            format!("{}...", &m.title[..27])
        } else {
            m.title.clone()
        };
        println!(
            "{:<4} {:<30} {:<20} {:>7} {:>9.2}s",
            rank + 1,
            title,
            m.artist,
            m.score,
            m.offset_seconds,
        );
    }
}
