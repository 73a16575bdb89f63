//! Document status store.
//!
//! One row per source document in the `doc_status` table. The ingestion
//! pipeline moves a record through `pending → processing → processed` (or
//! `failed`), and the skip check reads the processed set back.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::models::{DocStatus, DocStatusRecord};

const SELECT_COLUMNS: &str = "SELECT id, file_path, status, content_summary, content_length, \
     chunks_count, error, created_at, updated_at FROM doc_status";

/// Insert a record or reset an existing one to the given status.
///
/// `created_at` is preserved on update; `error` is cleared.
pub async fn upsert(
    pool: &SqlitePool,
    id: &str,
    file_path: &str,
    status: DocStatus,
    content_summary: &str,
    content_length: i64,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO doc_status (id, file_path, status, content_summary, content_length, chunks_count, error, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            file_path = excluded.file_path,
            status = excluded.status,
            content_summary = excluded.content_summary,
            content_length = excluded.content_length,
            error = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id)
    .bind(file_path)
    .bind(status.as_str())
    .bind(content_summary)
    .bind(content_length)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move a record to `status`. `chunks_count` is only overwritten when given.
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: DocStatus,
    error: Option<&str>,
    chunks_count: Option<i64>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE doc_status
        SET status = ?, error = ?, chunks_count = COALESCE(?, chunks_count), updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(error)
    .bind(chunks_count)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Update the summary fields once the content is known.
pub async fn set_content(
    pool: &SqlitePool,
    id: &str,
    content_summary: &str,
    content_length: i64,
) -> Result<()> {
    sqlx::query("UPDATE doc_status SET content_summary = ?, content_length = ? WHERE id = ?")
        .bind(content_summary)
        .bind(content_length)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<DocStatusRecord>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// All records in a given state, keyed by document id.
pub async fn get_docs_by_status(
    pool: &SqlitePool,
    status: DocStatus,
) -> Result<HashMap<String, DocStatusRecord>> {
    let rows = sqlx::query(&format!("{} WHERE status = ?", SELECT_COLUMNS))
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in &rows {
        let record = record_from_row(row)?;
        out.insert(record.id.clone(), record);
    }
    Ok(out)
}

/// Every record, most recently updated first.
pub async fn all(pool: &SqlitePool) -> Result<Vec<DocStatusRecord>> {
    let rows = sqlx::query(&format!("{} ORDER BY updated_at DESC, id ASC", SELECT_COLUMNS))
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

fn record_from_row(row: &SqliteRow) -> Result<DocStatusRecord> {
    let status: String = row.get("status");
    let status = status.parse::<DocStatus>().map_err(anyhow::Error::msg)?;
    Ok(DocStatusRecord {
        id: row.get("id"),
        file_path: row.get("file_path"),
        status,
        content_summary: row.get("content_summary"),
        content_length: row.get("content_length"),
        chunks_count: row.get("chunks_count"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
