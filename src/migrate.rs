use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag TEXT NOT NULL,
            file_name TEXT NOT NULL,
            start_pos INTEGER NOT NULL,
            end_pos INTEGER NOT NULL,
            body TEXT NOT NULL,
            embedding BLOB NOT NULL,
            CHECK (start_pos >= 0 AND start_pos < end_pos)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create session table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session (
            uuid TEXT PRIMARY KEY,
            conversation_llm TEXT NOT NULL DEFAULT '[]',
            conversation TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL DEFAULT '[]',
            state TEXT NOT NULL DEFAULT 'wait-for-question'
                CHECK (state IN ('wait-for-question', 'question-queued', 'processing-question')),
            created INTEGER NOT NULL,
            modified INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row heartbeat table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS heartbeat (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            modified INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tag_file ON chunks(tag, file_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_session_state_modified ON session(state, modified)")
        .execute(pool)
        .await?;

    Ok(())
}
