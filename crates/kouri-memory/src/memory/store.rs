//! Memory Store Implementation
//!
//! SQLite-backed persistence for turns, summaries, index vectors and core
//! memory. The store is the source of truth; the in-memory index cache is
//! rebuilt from it.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::types::*;
use crate::db::Db;
use crate::utils::{estimate_tokens, from_millis, now_utc};
use crate::{MemoryError, Result};

const TURN_SELECT: &str = "SELECT t.id, t.conversation_id, t.role, t.content, t.attachment_json, \
     t.token_count, t.created_at FROM memory_turns t";

const SUMMARY_SELECT: &str = "SELECT s.id, s.conversation_id, s.start_turn_id, s.end_turn_id, \
     s.turn_count, s.content, s.token_count, s.created_at FROM memory_summaries s";

const INDEX_SELECT: &str = "SELECT i.source_kind, i.source_id, i.conversation_id, i.vector, i.norm, \
     i.model, i.content_hash, i.recency, i.created_at FROM memory_index i";

/// Matches index rows whose source is gone or already folded into a summary
const ORPHAN_PREDICATE: &str = "(
    (i.source_kind = 'turn' AND NOT EXISTS (
        SELECT 1 FROM memory_turns t
        JOIN memory_conversations c ON c.id = t.conversation_id
        WHERE t.id = i.source_id AND t.id > COALESCE(c.summarized_through, 0)))
    OR (i.source_kind = 'summary' AND NOT EXISTS (
        SELECT 1 FROM memory_summaries s WHERE s.id = i.source_id))
)";

/// Memory store for persisting conversational memory to SQLite
#[derive(Clone)]
pub struct MemoryStore {
    db: Db,
}

impl MemoryStore {
    /// Create a new memory store
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Turns
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a turn; durable once this returns
    ///
    /// Fails with `ConversationHalted` if the conversation is awaiting repair.
    pub async fn append(&self, input: &NewTurn) -> Result<Turn> {
        // Stored with millisecond precision; keep the returned value identical
        let now = from_millis(now_utc().timestamp_millis());
        let token_count = estimate_tokens(&input.text);
        let attachment_json = input
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        ensure_conversation(&tx, &input.conversation_id, now.timestamp_millis())?;

        let (halted, reason): (bool, Option<String>) = tx.query_row(
            "SELECT halted, halt_reason FROM memory_conversations WHERE id = ?1",
            params![&input.conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if halted {
            return Err(MemoryError::halted(
                &input.conversation_id,
                reason.unwrap_or_default(),
            ));
        }

        tx.execute(
            "INSERT INTO memory_turns (conversation_id, role, content, attachment_json, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &input.conversation_id,
                input.role.as_str(),
                &input.text,
                &attachment_json,
                token_count as i64,
                now.timestamp_millis(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE memory_conversations SET updated_at = ?2 WHERE id = ?1",
            params![&input.conversation_id, now.timestamp_millis()],
        )?;
        tx.commit()?;

        Ok(Turn {
            id,
            conversation_id: input.conversation_id.clone(),
            role: input.role,
            text: input.text.clone(),
            attachment: input.attachment.clone(),
            token_count,
            created_at: now,
        })
    }

    /// Get a turn by ID
    pub async fn get(&self, turn_id: TurnId) -> Result<Option<Turn>> {
        let conn = self.db.lock().await;
        let result = conn.query_row(
            &format!("{TURN_SELECT} WHERE t.id = ?1"),
            params![turn_id],
            row_to_turn,
        );

        match result {
            Ok(turn) => Ok(Some(turn)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Turns of a conversation with ids in `start..=end`, oldest first
    pub async fn list_range(
        &self,
        conversation_id: &str,
        start: TurnId,
        end: TurnId,
    ) -> Result<Vec<Turn>> {
        let conn = self.db.lock().await;
        query_turns(
            &conn,
            &format!(
                "{TURN_SELECT} WHERE t.conversation_id = ?1 AND t.id BETWEEN ?2 AND ?3 ORDER BY t.id"
            ),
            params![conversation_id, start, end],
        )
    }

    /// Unsummarized turns, oldest first
    pub async fn active_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let conn = self.db.lock().await;
        query_turns(
            &conn,
            &format!(
                "{TURN_SELECT} JOIN memory_conversations c ON c.id = t.conversation_id
                 WHERE t.conversation_id = ?1 AND t.id > COALESCE(c.summarized_through, 0)
                 ORDER BY t.id"
            ),
            params![conversation_id],
        )
    }

    /// The newest `limit` turns regardless of summarization, oldest first
    pub async fn recent_turns(&self, conversation_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let conn = self.db.lock().await;
        let mut turns = query_turns(
            &conn,
            &format!("{TURN_SELECT} WHERE t.conversation_id = ?1 ORDER BY t.id DESC LIMIT ?2"),
            params![conversation_id, limit as i64],
        )?;
        turns.reverse();
        Ok(turns)
    }

    /// Count turns recorded after `after` (exclusive)
    pub async fn count_turns_after(&self, conversation_id: &str, after: TurnId) -> Result<usize> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_turns WHERE conversation_id = ?1 AND id > ?2",
            params![conversation_id, after],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Size of the active window as (turns, estimated tokens)
    pub async fn active_window_size(&self, conversation_id: &str) -> Result<(usize, usize)> {
        let conn = self.db.lock().await;
        let (count, tokens): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(t.token_count), 0) FROM memory_turns t
             JOIN memory_conversations c ON c.id = t.conversation_id
             WHERE t.conversation_id = ?1 AND t.id > COALESCE(c.summarized_through, 0)",
            params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as usize, tokens as usize))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the bookkeeping row and active window of a conversation
    pub async fn conversation_state(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        let conn = self.db.lock().await;
        load_state(&conn, conversation_id)
    }

    /// Refuse further writes to a conversation until it is repaired
    pub async fn halt(&self, conversation_id: &str, reason: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE memory_conversations SET halted = 1, halt_reason = ?2, updated_at = ?3 WHERE id = ?1",
            params![conversation_id, reason, now_utc().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Lift a halt
    pub async fn clear_halt(&self, conversation_id: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE memory_conversations SET halted = 0, halt_reason = NULL, updated_at = ?2 WHERE id = ?1",
            params![conversation_id, now_utc().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Delete a conversation with its turns, summaries, index rows and core memory
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<DeletedConversation> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let index_entries = tx.execute(
            "DELETE FROM memory_index WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let summaries = tx.execute(
            "DELETE FROM memory_summaries WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let turns = tx.execute(
            "DELETE FROM memory_turns WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM memory_core WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM memory_conversations WHERE id = ?1",
            params![conversation_id],
        )?;
        tx.commit()?;

        Ok(DeletedConversation {
            turns,
            summaries,
            index_entries,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Summaries
    // ─────────────────────────────────────────────────────────────────────────

    /// Summaries of a conversation ordered by covered range
    pub async fn summaries(&self, conversation_id: &str) -> Result<Vec<Summary>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SUMMARY_SELECT} WHERE s.conversation_id = ?1 ORDER BY s.start_turn_id"
        ))?;
        let summaries = stmt
            .query_map(params![conversation_id], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    /// Get a summary by ID
    pub async fn get_summary(&self, summary_id: SummaryId) -> Result<Option<Summary>> {
        let conn = self.db.lock().await;
        let summary = conn
            .query_row(
                &format!("{SUMMARY_SELECT} WHERE s.id = ?1"),
                params![summary_id],
                row_to_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// Atomically replace a block of turns with its summary
    ///
    /// In one transaction: inserts the summary, advances the active window past
    /// the block and deletes the index rows of the covered turns. A block that
    /// is already covered is a no-op and a block whose start was covered by a
    /// later commit is stale. A block that leaves a gap after the summarized
    /// range or is not a run of stored turns is an invariant violation.
    pub async fn commit_summary(&self, block: &TurnBlock, text: &str) -> Result<SummaryCommit> {
        let (start, end) = match (block.start_id(), block.end_id()) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(MemoryError::validation("cannot summarize an empty block")),
        };
        let conversation_id = block.conversation_id.as_str();

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let state = tx
            .query_row(
                "SELECT summarized_through, halted, halt_reason FROM memory_conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((summarized_through, halted, reason)) = state else {
            return Err(MemoryError::not_found("Conversation", conversation_id));
        };
        if halted {
            return Err(MemoryError::halted(conversation_id, reason.unwrap_or_default()));
        }

        let through = summarized_through.unwrap_or(0);
        if through >= end {
            return Ok(SummaryCommit::AlreadySummarized);
        }
        if through >= start {
            return Ok(SummaryCommit::Stale);
        }

        let first_active: Option<i64> = tx.query_row(
            "SELECT MIN(id) FROM memory_turns WHERE conversation_id = ?1 AND id > ?2",
            params![conversation_id, through],
            |row| row.get(0),
        )?;
        if first_active != Some(start) {
            return Err(MemoryError::invariant(
                conversation_id,
                format!("block starts at {start} but first active turn is {first_active:?}"),
            ));
        }

        let stored: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM memory_turns WHERE conversation_id = ?1 AND id BETWEEN ?2 AND ?3 ORDER BY id",
            )?;
            stmt.query_map(params![conversation_id, start, end], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let expected: Vec<i64> = block.turns.iter().map(|t| t.id).collect();
        if stored != expected {
            return Err(MemoryError::invariant(
                conversation_id,
                format!("block {start}..={end} is not a contiguous run of stored turns"),
            ));
        }

        let now = from_millis(now_utc().timestamp_millis());
        let token_count = estimate_tokens(text);
        tx.execute(
            "INSERT INTO memory_summaries (conversation_id, start_turn_id, end_turn_id, turn_count, content, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id,
                start,
                end,
                block.len() as i64,
                text,
                token_count as i64,
                now.timestamp_millis(),
            ],
        )?;
        let summary_id = tx.last_insert_rowid();

        let removed: Vec<SourceRef> = {
            let mut stmt = tx.prepare(
                "SELECT source_id FROM memory_index
                 WHERE source_kind = 'turn' AND conversation_id = ?1 AND source_id BETWEEN ?2 AND ?3",
            )?;
            stmt.query_map(params![conversation_id, start, end], |row| {
                row.get::<_, i64>(0).map(SourceRef::turn)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM memory_index
             WHERE source_kind = 'turn' AND conversation_id = ?1 AND source_id BETWEEN ?2 AND ?3",
            params![conversation_id, start, end],
        )?;

        tx.execute(
            "UPDATE memory_conversations
             SET summarized_through = ?2, last_compression_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![conversation_id, end, now.timestamp_millis()],
        )?;
        tx.commit()?;

        Ok(SummaryCommit::Committed {
            summary: Summary {
                id: summary_id,
                conversation_id: conversation_id.to_string(),
                start_turn_id: start,
                end_turn_id: end,
                turn_count: block.len(),
                text: text.to_string(),
                token_count,
                created_at: now,
            },
            removed,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Index vectors
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist an index entry if its source is still live and not yet indexed
    ///
    /// Returns false when the source was summarized, deleted or already indexed.
    pub async fn save_index_entry(&self, entry: &IndexEntry) -> Result<bool> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        if !source_is_live(&tx, entry.source)? {
            return Ok(false);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO memory_index
             (source_kind, source_id, conversation_id, model, dimensions, vector, norm, content_hash, recency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.source.kind.as_str(),
                entry.source.id,
                &entry.conversation_id,
                &entry.model,
                entry.vector.len() as i64,
                encode_vector(&entry.vector),
                entry.norm as f64,
                &entry.content_hash,
                entry.recency,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    /// Delete one index row
    pub async fn delete_index_entry(&self, source: SourceRef) -> Result<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM memory_index WHERE source_kind = ?1 AND source_id = ?2",
            params![source.kind.as_str(), source.id],
        )?;
        Ok(deleted > 0)
    }

    /// Load every persisted index entry
    pub async fn load_index_entries(&self) -> Result<Vec<IndexEntry>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!("{INDEX_SELECT} ORDER BY i.recency"))?;
        let entries = stmt
            .query_map([], row_to_index_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Delete index rows whose source is gone or summarized
    pub async fn purge_orphan_index_entries(&self) -> Result<Vec<SourceRef>> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let orphans = select_orphans(&tx, None)?;
        tx.execute(&format!("DELETE FROM memory_index AS i WHERE {ORPHAN_PREDICATE}"), [])?;
        tx.commit()?;
        Ok(orphans)
    }

    /// Live sources that have no index row yet, oldest first
    pub async fn unindexed_sources(&self, conversation_id: Option<&str>) -> Result<Vec<IndexSource>> {
        self.select_live_sources(conversation_id, true).await
    }

    /// Every live turn and summary, oldest first
    pub async fn live_sources(&self, conversation_id: Option<&str>) -> Result<Vec<IndexSource>> {
        self.select_live_sources(conversation_id, false).await
    }

    async fn select_live_sources(
        &self,
        conversation_id: Option<&str>,
        unindexed_only: bool,
    ) -> Result<Vec<IndexSource>> {
        let conn = self.db.lock().await;

        let mut turn_sql = format!(
            "{TURN_SELECT} JOIN memory_conversations c ON c.id = t.conversation_id
             WHERE t.id > COALESCE(c.summarized_through, 0)"
        );
        let mut summary_sql = format!("{SUMMARY_SELECT} WHERE 1 = 1");
        if unindexed_only {
            turn_sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM memory_index i WHERE i.source_kind = 'turn' AND i.source_id = t.id)",
            );
            summary_sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM memory_index i WHERE i.source_kind = 'summary' AND i.source_id = s.id)",
            );
        }
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(id) = conversation_id {
            turn_sql.push_str(" AND t.conversation_id = ?1");
            summary_sql.push_str(" AND s.conversation_id = ?1");
            params_vec.push(Box::new(id.to_string()));
        }
        turn_sql.push_str(" ORDER BY t.id");
        summary_sql.push_str(" ORDER BY s.id");
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let mut sources: Vec<IndexSource> = query_turns(&conn, &turn_sql, params_refs.as_slice())?
            .iter()
            .map(IndexSource::from_turn)
            .collect();

        let mut stmt = conn.prepare(&summary_sql)?;
        let summaries = stmt
            .query_map(params_refs.as_slice(), row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        sources.extend(summaries.iter().map(IndexSource::from_summary));
        Ok(sources)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Core memory
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the core memory of a conversation
    pub async fn core_memory(&self, conversation_id: &str) -> Result<Option<CoreMemory>> {
        let conn = self.db.lock().await;
        let core = conn
            .query_row(
                "SELECT conversation_id, content, updated_through, updated_at FROM memory_core WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok(CoreMemory {
                        conversation_id: row.get(0)?,
                        text: row.get(1)?,
                        updated_through: row.get(2)?,
                        updated_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()?;
        Ok(core)
    }

    /// Replace the core memory; returns None if the conversation no longer exists
    pub async fn save_core_memory(
        &self,
        conversation_id: &str,
        text: &str,
        updated_through: TurnId,
    ) -> Result<Option<CoreMemory>> {
        let now = from_millis(now_utc().timestamp_millis());
        let conn = self.db.lock().await;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM memory_conversations WHERE id = ?1)",
            params![conversation_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(None);
        }

        conn.execute(
            "INSERT INTO memory_core (conversation_id, content, updated_through, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                content = excluded.content,
                updated_through = excluded.updated_through,
                updated_at = excluded.updated_at",
            params![conversation_id, text, updated_through, now.timestamp_millis()],
        )?;

        Ok(Some(CoreMemory {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            updated_through,
            updated_at: now,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Count records, optionally restricted to one conversation
    pub async fn stats(&self, conversation_id: Option<&str>) -> Result<MemoryStats> {
        let conn = self.db.lock().await;

        let (filter, bound): (&str, Vec<&dyn rusqlite::ToSql>) = match &conversation_id {
            Some(id) => (" WHERE conversation_id = ?1", vec![id as &dyn rusqlite::ToSql]),
            None => ("", Vec::new()),
        };
        let count = |sql: &str| -> rusqlite::Result<usize> {
            conn.query_row(sql, bound.as_slice(), |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        };

        let conversation_filter = if conversation_id.is_some() { " WHERE id = ?1" } else { "" };
        let halted_filter = if conversation_id.is_some() {
            " WHERE id = ?1 AND halted = 1"
        } else {
            " WHERE halted = 1"
        };
        let active_filter = if conversation_id.is_some() { " AND t.conversation_id = ?1" } else { "" };

        Ok(MemoryStats {
            conversations: count(&format!("SELECT COUNT(*) FROM memory_conversations{conversation_filter}"))?,
            turns: count(&format!("SELECT COUNT(*) FROM memory_turns{filter}"))?,
            active_turns: count(&format!(
                "SELECT COUNT(*) FROM memory_turns t
                 JOIN memory_conversations c ON c.id = t.conversation_id
                 WHERE t.id > COALESCE(c.summarized_through, 0){active_filter}"
            ))?,
            summaries: count(&format!("SELECT COUNT(*) FROM memory_summaries{filter}"))?,
            index_entries: count(&format!("SELECT COUNT(*) FROM memory_index{filter}"))?,
            core_memories: count(&format!("SELECT COUNT(*) FROM memory_core{filter}"))?,
            halted_conversations: count(&format!("SELECT COUNT(*) FROM memory_conversations{halted_filter}"))?,
            pending_index_jobs: 0,
        })
    }

    /// Check coverage, overlap and index consistency of one conversation
    pub async fn verify(&self, conversation_id: &str) -> Result<InvariantReport> {
        let conn = self.db.lock().await;
        let state = load_state(&conn, conversation_id)?
            .ok_or_else(|| MemoryError::not_found("Conversation", conversation_id))?;
        let through = state.summarized_through.unwrap_or(0);

        let turn_ids: Vec<i64> = {
            let mut stmt =
                conn.prepare("SELECT id FROM memory_turns WHERE conversation_id = ?1 ORDER BY id")?;
            stmt.query_map(params![conversation_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let ranges: Vec<(i64, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT start_turn_id, end_turn_id FROM memory_summaries
                 WHERE conversation_id = ?1 ORDER BY start_turn_id",
            )?;
            stmt.query_map(params![conversation_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut report = InvariantReport {
            conversation_id: conversation_id.to_string(),
            total_turns: turn_ids.len(),
            active_turns: state.active_turn_window.len(),
            summaries: ranges.len(),
            halted: state.halted,
            halt_reason: state.halt_reason.clone(),
            ..Default::default()
        };

        for &id in &turn_ids {
            let covering = ranges
                .iter()
                .filter(|(start, end)| (*start..=*end).contains(&id))
                .count();
            if covering == 0 && id <= through {
                report.uncovered_turns.push(id);
            }
            if covering > 1 {
                report.overlapping_turns.push(id);
            }
            if covering > 0 && id > through {
                report.summarized_active_turns.push(id);
            }
        }

        report.orphan_index_entries = select_orphans(&conn, Some(conversation_id))?;
        Ok(report)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping and shared queries
// ─────────────────────────────────────────────────────────────────────────────

fn ensure_conversation(tx: &Transaction<'_>, conversation_id: &str, now_ms: i64) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO memory_conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![conversation_id, now_ms],
    )?;
    Ok(())
}

fn load_state(conn: &Connection, conversation_id: &str) -> Result<Option<ConversationState>> {
    let row = conn
        .query_row(
            "SELECT summarized_through, last_compression_at, halted, halt_reason
             FROM memory_conversations WHERE id = ?1",
            params![conversation_id],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((summarized_through, last_compression_at, halted, halt_reason)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, token_count FROM memory_turns WHERE conversation_id = ?1 AND id > ?2 ORDER BY id",
    )?;
    let window = stmt
        .query_map(params![conversation_id, summarized_through.unwrap_or(0)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(ConversationState {
        conversation_id: conversation_id.to_string(),
        summarized_through,
        active_tokens: window.iter().map(|(_, tokens)| *tokens as usize).sum(),
        active_turn_window: window.into_iter().map(|(id, _)| id).collect(),
        last_compression_at: last_compression_at.map(from_millis),
        halted,
        halt_reason,
    }))
}

fn source_is_live(conn: &Connection, source: SourceRef) -> rusqlite::Result<bool> {
    let sql = match source.kind {
        SourceKind::Turn => {
            "SELECT EXISTS(SELECT 1 FROM memory_turns t
             JOIN memory_conversations c ON c.id = t.conversation_id
             WHERE t.id = ?1 AND t.id > COALESCE(c.summarized_through, 0))"
        }
        SourceKind::Summary => "SELECT EXISTS(SELECT 1 FROM memory_summaries WHERE id = ?1)",
    };
    conn.query_row(sql, params![source.id], |row| row.get(0))
}

fn select_orphans(conn: &Connection, conversation_id: Option<&str>) -> rusqlite::Result<Vec<SourceRef>> {
    let mut sql = format!(
        "SELECT i.source_kind, i.source_id FROM memory_index i WHERE {ORPHAN_PREDICATE}"
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(id) = conversation_id {
        sql.push_str(" AND i.conversation_id = ?1");
        params_vec.push(Box::new(id.to_string()));
    }
    sql.push_str(" ORDER BY i.source_kind, i.source_id");
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let orphans = stmt
        .query_map(params_refs.as_slice(), |row| {
            let kind: String = row.get(0)?;
            let kind = SourceKind::parse(&kind)
                .ok_or_else(|| invalid_column(0, format!("invalid source kind: {kind}")))?;
            Ok(SourceRef {
                kind,
                id: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(orphans)
}

fn query_turns<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Turn>> {
    let mut stmt = conn.prepare(sql)?;
    let turns = stmt
        .query_map(params, row_to_turn)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(turns)
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, message.into())
}

fn row_to_turn(row: &Row) -> rusqlite::Result<Turn> {
    let role: String = row.get(2)?;
    let role = role
        .parse::<Role>()
        .map_err(|e| invalid_column(2, e.to_string()))?;
    let attachment = row
        .get::<_, Option<String>>(4)?
        .map(|json| serde_json::from_str::<Attachment>(&json))
        .transpose()
        .map_err(|e| invalid_column(4, e.to_string()))?;

    Ok(Turn {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        text: row.get(3)?,
        attachment,
        token_count: row.get::<_, i64>(5)? as usize,
        created_at: from_millis(row.get(6)?),
    })
}

fn row_to_summary(row: &Row) -> rusqlite::Result<Summary> {
    Ok(Summary {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        start_turn_id: row.get(2)?,
        end_turn_id: row.get(3)?,
        turn_count: row.get::<_, i64>(4)? as usize,
        text: row.get(5)?,
        token_count: row.get::<_, i64>(6)? as usize,
        created_at: from_millis(row.get(7)?),
    })
}

fn row_to_index_entry(row: &Row) -> rusqlite::Result<IndexEntry> {
    let kind: String = row.get(0)?;
    let kind = SourceKind::parse(&kind)
        .ok_or_else(|| invalid_column(0, format!("invalid source kind: {kind}")))?;
    let blob: Vec<u8> = row.get(3)?;

    Ok(IndexEntry {
        source: SourceRef {
            kind,
            id: row.get(1)?,
        },
        conversation_id: row.get(2)?,
        vector: decode_vector(&blob),
        norm: row.get::<_, f64>(4)? as f32,
        model: row.get(5)?,
        content_hash: row.get(6)?,
        recency: row.get(7)?,
        created_at: from_millis(row.get(8)?),
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
