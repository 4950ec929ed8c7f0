//! Translation memory: previously produced translations keyed by source hash
//! and target language.
//!
//! Exact reuse is a hash lookup. Fuzzy reuse first narrows the corpus with a
//! BM25-ranked FTS5 query over the most selective tokens, then scores only that
//! candidate set with the edit-distance scorer, since scoring every entry is far
//! too slow on a real corpus.

mod query;

pub use query::{build_candidate_query, build_search_query, SearchScope};

use crate::db::{placeholders, Database};
use crate::error::{Result, TranslationError};
use crate::hashing::{source_hash, CANONICAL_HASH_LEN};
use crate::similarity::similarity;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Maximum number of matches returned by `find_matches`
pub const MAX_MATCHES: usize = 10;

/// Pairs per lookup statement in `upsert_batch`, keeping bound parameters bounded
const LOOKUP_CHUNK_SIZE: usize = 250;

const ENTRY_COLUMNS: &str = "id, source_hash, target_language_id, source_text, translated_text, \
     usage_count, created_at, last_used_at, updated_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationMemoryEntry {
    pub id: String,
    pub source_hash: String,
    pub target_language_id: String,
    pub source_text: String,
    pub translated_text: String,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Translation to record in the memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmUpsert {
    pub source_text: String,
    pub translated_text: String,
    pub target_language_id: String,
}

impl TmUpsert {
    pub fn new(
        source_text: impl Into<String>,
        translated_text: impl Into<String>,
        target_language_id: impl Into<String>,
    ) -> Self {
        Self {
            source_text: source_text.into(),
            translated_text: translated_text.into(),
            target_language_id: target_language_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmMatch {
    pub entry: TranslationMemoryEntry,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    pub min_confidence: f64,
    pub max_candidates: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            max_candidates: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmStatistics {
    pub total_entries: usize,
    pub total_usage: i64,
    pub entries_by_language: BTreeMap<String, usize>,
}

/// Translation memory backed by the shared database handle.
#[derive(Debug, Clone)]
pub struct TranslationMemoryIndex {
    db: Database,
}

impl TranslationMemoryIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ==================== Retrieval ====================

    /// Exact reuse: the entry whose source hash matches `source_text`, if any
    pub fn find_exact(
        &self,
        source_text: &str,
        target_language_id: &str,
    ) -> Result<Option<TranslationMemoryEntry>> {
        let hash = source_hash(source_text);
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM translation_memory
                         WHERE source_hash = ?1 AND target_language_id = ?2",
                        ENTRY_COLUMNS
                    ),
                    params![hash, target_language_id],
                    row_to_entry,
                )
                .optional()?)
        })
    }

    /// Up to ten entries similar to `source_text`, best first.
    ///
    /// Ordered by similarity, then by usage count. Entries below
    /// `options.min_confidence` are never returned.
    pub fn find_matches(
        &self,
        source_text: &str,
        target_language_id: &str,
        options: MatchOptions,
    ) -> Result<Vec<TmMatch>> {
        let hash = source_hash(source_text);
        let candidate_query = build_candidate_query(source_text);

        let candidates = self.db.with_connection(|conn| {
            let mut ids: Vec<String> = Vec::new();
            if let Some(query) = &candidate_query {
                ids = ranked_candidate_ids(conn, query, target_language_id, options.max_candidates)?;
            }

            let mut sql = format!(
                "SELECT {} FROM translation_memory
                 WHERE target_language_id = ? AND (source_hash = ?",
                ENTRY_COLUMNS
            );
            if !ids.is_empty() {
                sql.push_str(&format!(" OR id IN ({})", placeholders(ids.len())));
            }
            sql.push(')');

            let mut values: Vec<&str> = vec![target_language_id, hash.as_str()];
            values.extend(ids.iter().map(String::as_str));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), row_to_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let candidate_count = candidates.len();
        let mut matches: Vec<TmMatch> = candidates
            .into_iter()
            .map(|entry| {
                let score = similarity(source_text, &entry.source_text, true);
                TmMatch {
                    entry,
                    similarity: score,
                }
            })
            .filter(|m| m.similarity >= options.min_confidence)
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.entry.usage_count.cmp(&a.entry.usage_count))
        });
        matches.truncate(MAX_MATCHES);

        debug!(
            "TM lookup scored {} candidates, {} above {:.2}",
            candidate_count,
            matches.len(),
            options.min_confidence
        );

        Ok(matches)
    }

    /// Ranked full-text search for the TM browser.
    ///
    /// Returns an empty list when `search_text` has no usable tokens.
    pub fn search_fts5(
        &self,
        search_text: &str,
        scope: SearchScope,
        target_language_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TranslationMemoryEntry>> {
        let Some(query) = build_search_query(search_text, scope) else {
            return Ok(Vec::new());
        };

        let columns: Vec<String> = ENTRY_COLUMNS
            .split(", ")
            .map(|c| format!("tm.{}", c))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM translation_memory_fts
             JOIN translation_memory tm ON tm.id = translation_memory_fts.entry_id
             WHERE translation_memory_fts MATCH ?1",
            columns.join(", ")
        );
        if target_language_id.is_some() {
            sql.push_str(" AND translation_memory_fts.target_language_id = ?3");
        }
        sql.push_str(" ORDER BY bm25(translation_memory_fts) LIMIT ?2");

        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let entries = match target_language_id {
                Some(lang) => stmt
                    .query_map(params![query, limit as i64, lang], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map(params![query, limit as i64], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(entries)
        })
    }

    // ==================== Writes ====================

    /// Insert new entries or bump existing ones, in one transaction.
    ///
    /// An existing `(source_hash, target_language_id)` row gets its usage count
    /// incremented and its text and timestamps refreshed. Duplicates inside one
    /// call are applied one after another, so each bumps the count.
    pub fn upsert_batch(&self, entries: &[TmUpsert]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let keyed: Vec<(String, &TmUpsert)> = entries
            .iter()
            .map(|e| (source_hash(&e.source_text), e))
            .collect();
        let now = Utc::now();

        self.db.with_transaction(|tx| {
            let mut existing: HashMap<(String, String), String> = HashMap::new();
            for chunk in keyed.chunks(LOOKUP_CHUNK_SIZE) {
                let tuples = vec!["(?, ?)"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT id, source_hash, target_language_id FROM translation_memory
                     WHERE (source_hash, target_language_id) IN (VALUES {})",
                    tuples
                );
                let values: Vec<&str> = chunk
                    .iter()
                    .flat_map(|(hash, e)| [hash.as_str(), e.target_language_id.as_str()])
                    .collect();
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), |row| {
                    Ok((row.get::<_, String>(0)?, row.get(1)?, row.get(2)?))
                })?;
                for row in rows {
                    let (id, hash, lang) = row?;
                    existing.insert((hash, lang), id);
                }
            }

            let mut update = tx.prepare(
                "UPDATE translation_memory SET
                     source_text = ?2,
                     translated_text = ?3,
                     usage_count = usage_count + 1,
                     last_used_at = ?4,
                     updated_at = ?4
                 WHERE id = ?1",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO translation_memory
                     (id, source_hash, target_language_id, source_text, translated_text,
                      usage_count, created_at, last_used_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6, ?6)",
            )?;

            let mut applied = 0;
            for (hash, entry) in &keyed {
                let key = (hash.clone(), entry.target_language_id.clone());
                match existing.get(&key) {
                    Some(id) => {
                        update.execute(params![id, entry.source_text, entry.translated_text, now])?;
                    }
                    None => {
                        let id = ulid::Ulid::new().to_string();
                        insert.execute(params![
                            id,
                            hash,
                            entry.target_language_id,
                            entry.source_text,
                            entry.translated_text,
                            now
                        ])?;
                        existing.insert(key, id);
                    }
                }
                applied += 1;
            }

            debug!("Upserted {} translation memory entries", applied);
            Ok(applied)
        })
    }

    /// Record reuse of entries found by fuzzy matching
    pub fn increment_usage(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE translation_memory SET usage_count = usage_count + 1, last_used_at = ?2
                 WHERE id = ?1",
            )?;
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute(params![id, now])?;
            }
            Ok(changed)
        })
    }

    // ==================== Legacy Hash Migration ====================

    /// Entries whose hash is shorter than the canonical digest, oldest first
    pub fn get_entries_with_legacy_hashes(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TranslationMemoryEntry>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM translation_memory
                 WHERE length(source_hash) < ?1
                 ORDER BY created_at, id
                 LIMIT ?2 OFFSET ?3",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(
                    params![CANONICAL_HASH_LEN as i64, limit as i64, offset as i64],
                    row_to_entry,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    pub fn count_legacy_hashes(&self) -> Result<usize> {
        self.db.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM translation_memory WHERE length(source_hash) < ?1",
                params![CANONICAL_HASH_LEN as i64],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Rewrite one entry's hash. Returns false if the entry does not exist.
    pub fn update_hash(&self, id: &str, new_hash: &str) -> Result<bool> {
        let changed = self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE translation_memory SET source_hash = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, new_hash, Utc::now()],
            )
            .map_err(|e| TranslationError::database(format!("failed to update hash of {}", id), e))
        })?;
        Ok(changed > 0)
    }

    /// Rewrite many hashes in one transaction.
    ///
    /// An update that would collide with an entry already holding the new hash
    /// for the same language is skipped; the return value counts applied updates.
    pub fn update_hashes_batch(&self, updates: &[(String, String)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE OR IGNORE translation_memory SET source_hash = ?2, updated_at = ?3
                 WHERE id = ?1",
            )?;
            let mut changed = 0;
            for (id, new_hash) in updates {
                changed += stmt.execute(params![id, new_hash, now])?;
            }
            Ok(changed)
        })
    }

    // ==================== Maintenance ====================

    pub fn statistics(&self, target_language_id: Option<&str>) -> Result<TmStatistics> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT target_language_id, COUNT(*), COALESCE(SUM(usage_count), 0)
                 FROM translation_memory
                 WHERE ?1 IS NULL OR target_language_id = ?1
                 GROUP BY target_language_id",
            )?;
            let rows = stmt.query_map(params![target_language_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut stats = TmStatistics::default();
            for row in rows {
                let (lang, count, usage) = row?;
                stats.total_entries += count as usize;
                stats.total_usage += usage;
                stats.entries_by_language.insert(lang, count as usize);
            }
            Ok(stats)
        })
    }

    /// Whether the full-text index holds exactly one row per entry
    pub fn fts_is_consistent(&self) -> Result<bool> {
        self.db.with_connection(|conn| {
            let (entries, indexed): (i64, i64) = conn.query_row(
                "SELECT (SELECT COUNT(*) FROM translation_memory),
                        (SELECT COUNT(*) FROM translation_memory_fts)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(entries == indexed)
        })
    }

    /// Rebuild the full-text index from the entries table
    pub fn rebuild_fts_index(&self) -> Result<usize> {
        self.db.with_transaction(|tx| {
            tx.execute("DELETE FROM translation_memory_fts", [])?;
            let indexed = tx.execute(
                "INSERT INTO translation_memory_fts
                     (source_text, translated_text, entry_id, target_language_id)
                 SELECT source_text, translated_text, id, target_language_id
                 FROM translation_memory",
                [],
            )?;
            Ok(indexed)
        })
    }
}

fn ranked_candidate_ids(
    conn: &Connection,
    query: &str,
    target_language_id: &str,
    max_candidates: usize,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT entry_id FROM translation_memory_fts
         WHERE translation_memory_fts MATCH ?1 AND target_language_id = ?2
         ORDER BY bm25(translation_memory_fts)
         LIMIT ?3",
    )?;
    let ids = stmt
        .query_map(
            params![query, target_language_id, max_candidates as i64],
            |row| row.get(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<TranslationMemoryEntry> {
    Ok(TranslationMemoryEntry {
        id: row.get(0)?,
        source_hash: row.get(1)?,
        target_language_id: row.get(2)?,
        source_text: row.get(3)?,
        translated_text: row.get(4)?,
        usage_count: row.get(5)?,
        created_at: row.get(6)?,
        last_used_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
