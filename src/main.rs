//! # Code Harness CLI (`chx`)
//!
//! A thin command-line front end over [`IndexingCoordinator`]. Results go
//! to stdout as plain text; logs and progress go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! chx --root ./my-project <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chx init` | Create both stores and run schema migrations |
//! | `chx index <dir>` | Index every supported file under a directory |
//! | `chx reconcile <dir>` | Re-index changed files and drop deleted ones |
//! | `chx search "<query>"` | Search components, tasks, notes and rules |
//! | `chx stats` | Show counts per entity kind |
//! | `chx embed` | Backfill missing or stale embeddings |
//! | `chx patterns` | Detect design patterns and report graph metrics |
//! | `chx clear` | Drop the code graph, keeping tasks, notes and rules |
//!
//! Set `RUST_LOG=code_harness=info` to see lifecycle logs.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use code_harness::config::{load_config, Config};
use code_harness::coordinator::IndexingCoordinator;
use code_harness::progress::ProgressMode;
use code_harness::registry::CoordinatorRegistry;
use code_harness::search::{parse_types, SearchRequest};
use code_harness::stats::print_stats;

/// Code Harness: a local-first code graph indexer with semantic search.
///
/// Configuration is read from `--config` when given, otherwise from
/// `<root>/.code-harness/config.toml` when present, otherwise defaults.
#[derive(Parser)]
#[command(name = "chx", version, about = "Code Harness: a local-first code graph indexer")]
struct Cli {
    /// Project root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Path to a configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the code and metadata stores. Safe to run repeatedly.
    Init,

    /// Index every supported file under a directory.
    Index {
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Bring the index in line with the filesystem under a directory.
    Reconcile {
        #[arg(default_value = ".")]
        dir: PathBuf,

        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Search indexed entities.
    Search {
        query: String,

        /// Restrict to entity types (`component`, `task`, `note`, `rule`).
        #[arg(long = "type")]
        types: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show index statistics.
    Stats,

    /// Embed every entity whose vector is missing or stale.
    Embed {
        /// Re-embed everything regardless of stored content hashes.
        #[arg(long)]
        force: bool,
    },

    /// Detect design patterns in the component graph.
    Patterns,

    /// Remove all components, relationships and file records.
    Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(p: ProgressArg) -> Self {
        match p {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn resolve_config(root: &Path, explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let default_path = root.join(".code-harness").join("config.toml");
    if default_path.is_file() {
        load_config(&default_path)
    } else {
        Ok(Config::for_project(root))
    }
}

fn progress_mode(arg: Option<ProgressArg>) -> ProgressMode {
    arg.map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = std::fs::canonicalize(&cli.root)?;
    let config = resolve_config(&root, cli.config.as_deref())?;

    let registry = Arc::new(CoordinatorRegistry::new());
    let coordinator = IndexingCoordinator::initialize(&root, config, Arc::clone(&registry)).await?;

    let mut failed = false;
    match cli.command {
        Commands::Init => {
            println!("Stores initialized at {}", coordinator.storage().dir().display());
        }
        Commands::Index { dir, progress } => {
            let reporter = progress_mode(progress).reporter();
            let summary = coordinator.index_directory(&dir, reporter.as_ref()).await?;
            println!(
                "Indexed {} files: {} components, {} relationships, {} errors",
                summary.files_processed,
                summary.components_written,
                summary.relationships_written,
                summary.errors.len()
            );
            for e in &summary.errors {
                println!("  {} [{}] {}", e.path, e.kind.as_str(), e.message);
            }
            failed = !summary.success;
        }
        Commands::Reconcile { dir, progress } => {
            let reporter = progress_mode(progress).reporter();
            let report = coordinator
                .reconcile_filesystem_changes(&dir, reporter.as_ref())
                .await?;
            println!(
                "Reconciled: {} added, {} updated, {} removed, {} unchanged, {} errors",
                report.added.len(),
                report.updated.len(),
                report.removed.len(),
                report.unchanged,
                report.errors.len()
            );
            for e in &report.errors {
                println!("  {} [{}] {}", e.path, e.kind.as_str(), e.message);
            }
            failed = !report.success();
        }
        Commands::Search {
            query,
            types,
            limit,
        } => {
            let mut request = SearchRequest::new(query).with_types(parse_types(&types)?);
            if let Some(limit) = limit {
                request = request.with_limit(limit);
            }
            let response = coordinator.search(&request).await?;
            if response.hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in response.hits.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} {} ({})",
                    i + 1,
                    hit.score,
                    hit.kind.as_str(),
                    hit.title,
                    hit.id
                );
                if !hit.snippet.is_empty() {
                    println!("    {}", hit.snippet);
                }
                if !hit.related.is_empty() {
                    println!("    related: {}", hit.related.join(", "));
                }
            }
            if !response.semantic && !response.direct {
                eprintln!("note: lexical ranking only (no query embedding available)");
            }
        }
        Commands::Stats => {
            let stats = coordinator.get_stats().await?;
            print_stats(&stats);
        }
        Commands::Embed { force } => {
            let report = coordinator.generate_all_embeddings(force).await?;
            println!(
                "Embeddings: {} considered, {} up to date, {} embedded, {} failed",
                report.considered, report.skipped, report.processed, report.failed
            );
            failed = report.failed > 0;
        }
        Commands::Patterns => {
            let report = coordinator.analyze_patterns().await?;
            for m in &report.matches {
                println!(
                    "{:<10} {:.2}  {} ({})",
                    m.pattern.as_str(),
                    m.confidence,
                    m.name,
                    m.evidence.join("; ")
                );
            }
            let g = &report.metrics;
            println!();
            println!(
                "Graph: {} components, {} relationships, {} cycles, max depth {}, avg branching {:.2}",
                g.components, g.relationships, g.cycles, g.max_depth, g.avg_branching
            );
        }
        Commands::Clear => {
            coordinator.clear_index().await?;
            println!("Code index cleared.");
        }
    }

    coordinator.close().await?;
    registry.close_all().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
