use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::models::{AskLogEntry, LogQuery, LogResponse};

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

/// Audit trail of ask interactions in Postgres.
pub struct Logger {
    pool: PgPool,
}

impl Logger {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn log_ask(&self, entry: &AskLogEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ask_logs
            (id, timestamp, username, question, rag_context, sources, answer, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.timestamp)
        .bind(&entry.username)
        .bind(&entry.question)
        .bind(&entry.rag_context)
        .bind(&entry.sources)
        .bind(&entry.answer)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn query_logs(&self, query: &LogQuery) -> Result<LogResponse, sqlx::Error> {
        let (limit, offset) = page(query);

        // a NULL filter matches every row
        let logs = sqlx::query_as::<_, AskLogEntry>(
            r#"
            SELECT id, timestamp, username, question, rag_context, sources, answer, error
            FROM ask_logs
            WHERE ($1::TEXT IS NULL OR username = $1)
            ORDER BY timestamp DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&query.username)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ask_logs WHERE ($1::TEXT IS NULL OR username = $1)",
        )
        .bind(&query.username)
        .fetch_one(&self.pool)
        .await?;

        Ok(LogResponse {
            logs,
            total: total.0,
        })
    }

    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ask_logs (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                username TEXT NOT NULL,
                question TEXT NOT NULL,
                rag_context TEXT,
                sources JSONB NOT NULL,
                answer TEXT NOT NULL,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ask_logs_timestamp ON ask_logs(timestamp DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ask_logs_username ON ask_logs(username)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn page(query: &LogQuery) -> (i64, i64) {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0).max(0);
    (limit, offset)
}
