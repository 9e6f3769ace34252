#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing_subscriber::filter::EnvFilter;

use catalog_ranker::catalog::{CatalogStore, CategoryLock, SqliteCatalogStore, StoreError};
use catalog_ranker::category::{Category, CategoryRegistry};
use catalog_ranker::config::RankerConfig;
use catalog_ranker::gateway::TracingUsageSink;
use catalog_ranker::ranking::{progress_channel, Phase, ProgressStream, Ranker};

#[derive(Parser)]
#[command(
    name = "catalog-ranker",
    version,
    about = "LLM-judged per-category course ranks"
)]
struct Cli {
    /// SQLite catalog (defaults to $RANKER_DB_PATH or .catalog_ranker.sqlite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// OpenRouter model id (defaults to $RANKER_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,
    /// Hold an exclusive per-category file lock while writing ranks
    #[arg(long, global = true)]
    lock: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List categories and their rank columns
    Categories,
    /// Upsert courses from a JSON array
    Import {
        #[arg(long)]
        input: PathBuf,
    },
    /// Bulk rerank one category, or all of them
    Rerank {
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        category: Option<Category>,
        #[arg(long)]
        all: bool,
    },
    /// First dense ranking for a newly introduced category
    Init {
        #[arg(long)]
        category: Category,
    },
    /// Rank every unranked course in a category
    FillMissing {
        #[arg(long)]
        category: Category,
    },
    /// Rank one course in every category and store the ranks
    RankItem {
        #[arg(long)]
        id: String,
    },
    /// Print a category's current ordering
    Show {
        #[arg(long)]
        category: Category,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CategoryRow {
    name: &'static str,
    key: &'static str,
    rank_column: String,
    context_description: &'static str,
}

#[derive(Serialize)]
struct ShowRow {
    rank: u32,
    id: String,
    title: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render progress events to stderr until the stream ends.
fn render_progress(mut stream: ProgressStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let label = match event.phase {
                Phase::SelectingCandidates => "selecting candidates",
                Phase::Prompting => "prompting",
                Phase::AwaitingOracle => "awaiting oracle",
                Phase::Validating => "validating",
                Phase::Persisting => "persisting",
                Phase::Completed => "completed",
                Phase::Failed => "failed",
            };
            if event.total > 0 {
                eprintln!(
                    "[{}] {label} {}/{}",
                    event.category, event.processed, event.total
                );
            } else {
                eprintln!("[{}] {label}", event.category);
            }
        }
    })
}

fn take_locks(
    store: &SqliteCatalogStore,
    categories: &[Category],
    enabled: bool,
) -> Result<Vec<CategoryLock>, StoreError> {
    if !enabled {
        return Ok(Vec::new());
    }
    categories
        .iter()
        .map(|&category| store.lock_category(category))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = RankerConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }

    if let Commands::Categories = cli.command {
        let rows: Vec<CategoryRow> = CategoryRegistry::global()
            .entries()
            .iter()
            .map(|e| CategoryRow {
                name: e.category.name(),
                key: e.category.key(),
                rank_column: e.rank_column.to_string(),
                context_description: e.context_description,
            })
            .collect();
        print_json(&rows)?;
        return Ok(());
    }

    let store = Arc::new(SqliteCatalogStore::new(&config.db_path)?);

    let build_ranker = || -> Result<(Ranker, JoinHandle<()>), Box<dyn std::error::Error>> {
        let oracle = config.build_oracle(Arc::new(TracingUsageSink))?;
        let (reporter, stream) = progress_channel();
        let ranker = Ranker::new(store.clone(), oracle, config.ranker_options())
            .with_progress(reporter);
        Ok((ranker, render_progress(stream)))
    };

    match cli.command {
        Commands::Categories => {}
        Commands::Import { input } => {
            let imported = store.import_json(&input).await?;
            print_json(&serde_json::json!({ "imported": imported }))?;
        }
        Commands::Rerank { category, all } => {
            let categories: Vec<Category> = match (category, all) {
                (Some(category), false) => vec![category],
                _ => Category::ALL.to_vec(),
            };
            let _locks = take_locks(&store, &categories, cli.lock)?;
            let (ranker, progress) = build_ranker()?;
            let outcomes = match categories.as_slice() {
                [category] => vec![ranker.rerank_category(*category).await?],
                _ => ranker.rerank_all().await,
            };
            drop(ranker);
            let _ = progress.await;
            print_json(&outcomes)?;
        }
        Commands::Init { category } => {
            let _locks = take_locks(&store, &[category], cli.lock)?;
            let (ranker, progress) = build_ranker()?;
            let outcome = ranker.initialize_category(category).await?;
            drop(ranker);
            let _ = progress.await;
            print_json(&outcome)?;
        }
        Commands::FillMissing { category } => {
            let _locks = take_locks(&store, &[category], cli.lock)?;
            let (ranker, progress) = build_ranker()?;
            let outcome = ranker.fill_missing_ranks(category).await?;
            drop(ranker);
            let _ = progress.await;
            print_json(&outcome)?;
        }
        Commands::RankItem { id } => {
            let _locks = take_locks(&store, &Category::ALL, cli.lock)?;
            let (ranker, progress) = build_ranker()?;
            let scores = ranker.score_new_item(&id).await?;
            drop(ranker);
            let _ = progress.await;
            print_json(&scores)?;
        }
        Commands::Show { category, limit } => {
            let ranked = store
                .select_ranked(category.rank_column(), None, limit)
                .await?;
            let rows: Vec<ShowRow> = ranked
                .into_iter()
                .map(|r| ShowRow {
                    rank: r.rank,
                    id: r.item.id,
                    title: r.item.title,
                })
                .collect();
            print_json(&rows)?;
        }
    }

    Ok(())
}
