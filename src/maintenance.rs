//! Startup maintenance.
//!
//! Legacy hash migration and the full-text rebuild are best effort: a failure is
//! logged and startup continues. Missing consistency triggers would silently
//! corrupt progress and search data, so a failed repair is returned.

use crate::db::Database;
use crate::error::Result;
use crate::hashing::source_hash;
use crate::persistence::BulkPersistenceEngine;
use crate::tm::TranslationMemoryIndex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Entries rehashed per transaction
pub const MIGRATION_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub hashes_migrated: usize,
    /// Legacy entries left alone because their canonical hash is already taken
    pub hashes_skipped: usize,
    pub fts_entries_reindexed: Option<usize>,
    pub triggers_repaired: Vec<&'static str>,
}

pub fn run_startup_maintenance(db: &Database) -> Result<MaintenanceReport> {
    let tm = TranslationMemoryIndex::new(db.clone());
    let mut report = MaintenanceReport::default();

    match migrate_legacy_hashes(&tm, MIGRATION_PAGE_SIZE) {
        Ok((migrated, skipped)) => {
            report.hashes_migrated = migrated;
            report.hashes_skipped = skipped;
        }
        Err(e) => warn!("Legacy hash migration failed, continuing: {}", e),
    }

    match tm.fts_is_consistent() {
        Ok(true) => debug!("Translation memory index is consistent"),
        Ok(false) => match tm.rebuild_fts_index() {
            Ok(indexed) => {
                info!("Rebuilt translation memory index ({} entries)", indexed);
                report.fts_entries_reindexed = Some(indexed);
            }
            Err(e) => warn!("Translation memory index rebuild failed, continuing: {}", e),
        },
        Err(e) => warn!("Could not check translation memory index: {}", e),
    }

    report.triggers_repaired = BulkPersistenceEngine::new(db.clone()).repair_triggers()?;

    info!(
        "✓ Startup maintenance done: {} hashes migrated, {} triggers repaired",
        report.hashes_migrated,
        report.triggers_repaired.len()
    );
    Ok(report)
}

/// Rewrite legacy hashes to the canonical digest, `page_size` entries at a time.
///
/// Returns `(migrated, skipped)`.
pub fn migrate_legacy_hashes(
    tm: &TranslationMemoryIndex,
    page_size: usize,
) -> Result<(usize, usize)> {
    let total = tm.count_legacy_hashes()?;
    if total == 0 {
        return Ok((0, 0));
    }
    info!("Migrating {} legacy translation memory hashes", total);

    let page_size = page_size.max(1);
    let mut migrated = 0;
    let mut skipped = 0;
    loop {
        // migrated rows drop out of the legacy set; only skipped rows shift the page
        let entries = tm.get_entries_with_legacy_hashes(page_size, skipped)?;
        if entries.is_empty() {
            break;
        }
        let updates: Vec<(String, String)> = entries
            .iter()
            .map(|entry| (entry.id.clone(), source_hash(&entry.source_text)))
            .collect();
        let updated = tm.update_hashes_batch(&updates)?;
        migrated += updated;
        skipped += entries.len() - updated;
        debug!("Migrated {}/{} legacy hashes", migrated, total);
    }

    if skipped > 0 {
        warn!(
            "{} legacy entries duplicate an existing entry and were left unchanged",
            skipped
        );
    }
    Ok((migrated, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::create_test_db;
    use crate::hashing::CANONICAL_HASH_LEN;
    use crate::tm::TmUpsert;
    use chrono::Utc;
    use rusqlite::params;

    fn insert_legacy(db: &Database, id: &str, hash: &str, source: &str) {
        db.with_connection(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO translation_memory
                     (id, source_hash, target_language_id, source_text, translated_text,
                      usage_count, created_at, last_used_at, updated_at)
                 VALUES (?1, ?2, 'fr', ?3, ?4, 1, ?5, ?5, ?5)",
                params![id, hash, source, format!("fr: {}", source), now],
            )?;
            Ok(())
        })
        .expect("insert legacy entry");
    }

    // ==================== Hash Migration Tests ====================

    #[test]
    fn test_migration_pages_through_all_legacy_entries() {
        let (db, _temp_dir) = create_test_db();
        for i in 0..7 {
            insert_legacy(&db, &format!("tm{}", i), &format!("{:08x}", i), &format!("Line {}", i));
        }
        let tm = TranslationMemoryIndex::new(db.clone());

        let (migrated, skipped) = migrate_legacy_hashes(&tm, 3).expect("migrate");
        assert_eq!((migrated, skipped), (7, 0));
        assert_eq!(tm.count_legacy_hashes().unwrap(), 0);

        let entry = tm.find_exact("Line 4", "fr").unwrap().expect("found by canonical hash");
        assert_eq!(entry.source_hash.len(), CANONICAL_HASH_LEN);
        assert_eq!(entry.source_hash, source_hash("Line 4"));
    }

    #[test]
    fn test_colliding_entries_are_skipped_not_looped() {
        let (db, _temp_dir) = create_test_db();
        let tm = TranslationMemoryIndex::new(db.clone());
        tm.upsert_batch(&[TmUpsert::new("Line 1", "Ligne 1", "fr")]).unwrap();
        insert_legacy(&db, "old1", "abc", "Line 1");
        insert_legacy(&db, "old2", "def", "Line 2");

        let (migrated, skipped) = migrate_legacy_hashes(&tm, 1).expect("migrate");
        assert_eq!((migrated, skipped), (1, 1));
        assert_eq!(tm.count_legacy_hashes().unwrap(), 1);

        // the canonical entry is untouched
        let entry = tm.find_exact("Line 1", "fr").unwrap().unwrap();
        assert_eq!(entry.translated_text, "Ligne 1");
    }

    #[test]
    fn test_nothing_to_migrate() {
        let (db, _temp_dir) = create_test_db();
        let tm = TranslationMemoryIndex::new(db);
        assert_eq!(migrate_legacy_hashes(&tm, 10).unwrap(), (0, 0));
    }

    // ==================== Startup Tests ====================

    #[test]
    fn test_startup_maintenance_on_healthy_database() {
        let (db, _temp_dir) = create_test_db();
        let report = run_startup_maintenance(&db).expect("maintenance");
        assert_eq!(report, MaintenanceReport::default());
    }

    #[test]
    fn test_startup_maintenance_repairs_everything() {
        let (db, _temp_dir) = create_test_db();
        insert_legacy(&db, "old1", "abc", "Line 1");
        db.with_connection(|conn| {
            conn.execute_batch(
                "DELETE FROM translation_memory_fts;
                 DROP TRIGGER trg_versions_progress_insert;",
            )?;
            Ok(())
        })
        .unwrap();

        let report = run_startup_maintenance(&db).expect("maintenance");
        assert_eq!(report.hashes_migrated, 1);
        assert_eq!(report.fts_entries_reindexed, Some(1));
        assert_eq!(report.triggers_repaired, vec!["trg_versions_progress_insert"]);
        assert!(db.missing_triggers().unwrap().is_empty());

        let tm = TranslationMemoryIndex::new(db.clone());
        assert!(tm.fts_is_consistent().unwrap());
    }
}
