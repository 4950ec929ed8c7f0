//! Startup maintenance runner.
//!
//! Opens (or creates) the translation database, runs the startup repairs and
//! prints translation memory statistics. The desktop application runs the same
//! maintenance before it accepts batch requests.
//!
//! Usage:
//!   cargo run                   # Maintain the database at DATABASE_PATH
//!   cargo run -- --json         # Print the report as JSON

use anyhow::{Context, Result};
use game_translation_core::config::Config;
use game_translation_core::db::Database;
use game_translation_core::maintenance::run_startup_maintenance;
use game_translation_core::tm::TranslationMemoryIndex;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored when absent)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("game_translation_core=info".parse()?),
        )
        .init();

    let as_json = std::env::args().any(|arg| arg == "--json");

    let config = Config::from_env().context("Invalid configuration")?;
    info!("Opening translation database at {}", config.database_path);
    let db = Database::new(&config.database_path)
        .with_context(|| format!("Failed to open database at {}", config.database_path))?;

    let report = run_startup_maintenance(&db).context("Startup maintenance failed")?;
    let stats = TranslationMemoryIndex::new(db)
        .statistics(None)
        .context("Failed to read translation memory statistics")?;

    if as_json {
        let output = serde_json::json!({ "maintenance": report, "translation_memory": stats });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Translation memory: {} entries, {} total uses", stats.total_entries, stats.total_usage);
    for (language, count) in &stats.entries_by_language {
        println!("  {:<8} {}", language, count);
    }
    if report.hashes_skipped > 0 {
        println!("{} legacy entries could not be migrated", report.hashes_skipped);
    }

    info!("✓ Database ready");
    Ok(())
}
