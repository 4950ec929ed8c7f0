//! Translation memory search from the command line.
//!
//! Usage:
//!   cargo run --bin tm-search -- castle gate
//!   cargo run --bin tm-search -- --lang fr --scope target --limit 10 château
//!
//! Options:
//! - --lang <id>      restrict to one target language
//! - --scope <s>      source, target or both (default both)
//! - --limit <n>      maximum results (default 50)
//!
//! Reads DATABASE_PATH like the main binary.

use anyhow::{bail, Context, Result};
use game_translation_core::config::Config;
use game_translation_core::db::Database;
use game_translation_core::tm::{SearchScope, TranslationMemoryIndex};
use tracing::info;

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug)]
struct SearchArgs {
    text: String,
    language: Option<String>,
    scope: SearchScope,
    limit: usize,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<SearchArgs> {
    let mut words = Vec::new();
    let mut language = None;
    let mut scope = SearchScope::Both;
    let mut limit = DEFAULT_LIMIT;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--lang" => language = Some(args.next().context("--lang needs a value")?),
            "--scope" => {
                scope = match args.next().context("--scope needs a value")?.as_str() {
                    "source" => SearchScope::Source,
                    "target" => SearchScope::Target,
                    "both" => SearchScope::Both,
                    other => bail!("Unknown scope: {}. Expected source, target or both", other),
                }
            }
            "--limit" => {
                limit = args
                    .next()
                    .context("--limit needs a value")?
                    .parse()
                    .context("--limit must be a number")?
            }
            _ => words.push(arg),
        }
    }

    if words.is_empty() {
        bail!("Usage: tm-search [--lang <id>] [--scope source|target|both] [--limit <n>] <text>");
    }

    Ok(SearchArgs {
        text: words.join(" "),
        language,
        scope,
        limit,
    })
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("game_translation_core=warn".parse()?),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = Config::from_env().context("Invalid configuration")?;
    let db = Database::new(&config.database_path)
        .with_context(|| format!("Failed to open database at {}", config.database_path))?;

    let tm = TranslationMemoryIndex::new(db);
    let results = tm
        .search_fts5(&args.text, args.scope, args.language.as_deref(), args.limit)
        .context("Search failed")?;
    info!("{} results for {:?}", results.len(), args.text);

    if results.is_empty() {
        println!("No matches for \"{}\"", args.text);
        return Ok(());
    }

    for entry in results {
        println!(
            "[{}] {} => {} (used {}x)",
            entry.target_language_id, entry.source_text, entry.translated_text, entry.usage_count
        );
    }
    Ok(())
}
