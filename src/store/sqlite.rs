//! SQLite-backed [`ChunkStore`] and [`JobStore`].
//!
//! Every queue transition is exactly one statement, so mutual exclusion
//! between concurrent claimers comes from SQLite's single-writer lock and
//! not from anything held in this process. List columns are JSON text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::ClaimOrder;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{ChatMessage, Chunk, Job, JobState, Session};

use super::{ChunkStore, JobStore};

const CLAIM_NEWEST: &str = r#"
    UPDATE session
       SET state = 'processing-question', modified = ?
     WHERE rowid = (SELECT rowid FROM session
                     WHERE state = 'question-queued'
                     ORDER BY modified DESC, rowid DESC
                     LIMIT 1)
       AND state = 'question-queued'
    RETURNING uuid, conversation_llm, conversation, source
"#;

const CLAIM_OLDEST: &str = r#"
    UPDATE session
       SET state = 'processing-question', modified = ?
     WHERE rowid = (SELECT rowid FROM session
                     WHERE state = 'question-queued'
                     ORDER BY modified ASC, rowid ASC
                     LIMIT 1)
       AND state = 'question-queued'
    RETURNING uuid, conversation_llm, conversation, source
"#;

/// Sessions whose lists fit a job lose only the trailing question; the rest
/// are cleared.
const RELEASE_STUCK: &str = r#"
    UPDATE session
       SET state = 'wait-for-question',
           conversation = CASE WHEN (json_array_length(conversation_llm) = 0
                                     AND json_array_length(conversation) = 1)
                                 OR (json_array_length(conversation_llm) > 0
                                     AND json_array_length(conversation_llm) = json_array_length(conversation))
                               THEN json_remove(conversation, '$[#-1]')
                               ELSE '[]' END,
           conversation_llm = CASE WHEN (json_array_length(conversation_llm) = 0
                                         AND json_array_length(conversation) = 1)
                                     OR (json_array_length(conversation_llm) > 0
                                         AND json_array_length(conversation_llm) = json_array_length(conversation))
                                   THEN conversation_llm
                                   ELSE '[]' END,
           source = CASE WHEN (json_array_length(conversation_llm) = 0
                               AND json_array_length(conversation) = 1)
                           OR (json_array_length(conversation_llm) > 0
                               AND json_array_length(conversation_llm) = json_array_length(conversation))
                         THEN source
                         ELSE '[]' END,
           modified = ?
     WHERE state = 'processing-question' AND modified < ?
    RETURNING uuid
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode_list<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Vec<T>> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("session.{} is not a JSON list", column))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("uuid")?,
        conversation_llm: decode_list(row, "conversation_llm")?,
        conversation: decode_list(row, "conversation")?,
        source: decode_list(row, "source")?,
    })
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn has_document(&self, tag: &str, file_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM chunks WHERE tag = ? AND file_name = ?)",
        )
        .bind(tag)
        .bind(file_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (tag, file_name, start_pos, end_pos, body, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.tag)
            .bind(&chunk.file_name)
            .bind(chunk.start_pos as i64)
            .bind(chunk.end_pos as i64)
            .bind(&chunk.body)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT tag, file_name, start_pos, end_pos, body, embedding FROM chunks ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.try_get("embedding")?;
                Ok(Chunk {
                    tag: row.try_get("tag")?,
                    file_name: row.try_get("file_name")?,
                    start_pos: row.try_get::<i64, _>("start_pos")? as usize,
                    end_pos: row.try_get::<i64, _>("end_pos")? as usize,
                    body: row.try_get("body")?,
                    embedding: blob_to_vec(&blob),
                })
            })
            .collect()
    }

    async fn document_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM (SELECT DISTINCT tag, file_name FROM chunks)")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_session(&self, id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session (uuid, conversation_llm, conversation, source, state, created, modified)
            VALUES (?, '[]', '[]', '[]', 'wait-for-question', ?, ?)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT uuid, conversation_llm, conversation, source, state, created, modified
              FROM session WHERE uuid = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = row_to_job(&row)?;
        let state: String = row.try_get("state")?;
        Ok(Some(Session {
            id: job.id,
            state: state.parse()?,
            conversation: job.conversation,
            conversation_llm: job.conversation_llm,
            source: job.source,
            created_at: row.try_get("created")?,
            modified_at: row.try_get("modified")?,
        }))
    }

    async fn enqueue(&self, id: &str, question: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session
               SET conversation = json_insert(conversation, '$[#]', ?),
                   state = 'question-queued',
                   modified = ?
             WHERE uuid = ? AND state = 'wait-for-question'
            "#,
        )
        .bind(question)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim(&self, order: ClaimOrder, now: i64) -> Result<Option<Job>> {
        let sql = match order {
            ClaimOrder::Newest => CLAIM_NEWEST,
            ClaimOrder::Oldest => CLAIM_OLDEST,
        };
        let row = sqlx::query(sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session
               SET state = 'wait-for-question',
                   modified = ?,
                   conversation_llm = ?,
                   conversation = ?,
                   source = ?
             WHERE uuid = ?
            "#,
        )
        .bind(now)
        .bind(serde_json::to_string(conversation_llm)?)
        .bind(serde_json::to_string(conversation)?)
        .bind(serde_json::to_string(source)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn state_counts(&self) -> Result<Vec<(JobState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS cnt FROM session GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts: Vec<(JobState, i64)> = JobState::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let state: JobState = row.try_get::<String, _>("state")?.parse()?;
            let cnt: i64 = row.try_get("cnt")?;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == state) {
                entry.1 = cnt;
            }
        }
        Ok(counts)
    }

    async fn latest_modified_by_state(&self) -> Result<Vec<(JobState, Option<i64>)>> {
        let rows = sqlx::query("SELECT state, MAX(modified) AS latest FROM session GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut latest: Vec<(JobState, Option<i64>)> =
            JobState::ALL.iter().map(|s| (*s, None)).collect();
        for row in rows {
            let state: JobState = row.try_get::<String, _>("state")?.parse()?;
            let ts: Option<i64> = row.try_get("latest")?;
            if let Some(entry) = latest.iter_mut().find(|(s, _)| *s == state) {
                entry.1 = ts;
            }
        }
        Ok(latest)
    }

    async fn release_stuck(&self, cutoff: i64, now: i64) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(RELEASE_STUCK)
            .bind(now)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn record_heartbeat(&self, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO heartbeat (id, modified) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET modified = excluded.modified
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_heartbeat(&self) -> Result<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT modified FROM heartbeat WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(ts)
    }
}
