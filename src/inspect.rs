//! `dq status` and `dq show`: what the store knows about each document.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::doc_status;
use crate::models::{DocStatus, DocStatusRecord, Modality};

/// A status record plus its chunks, as printed by `dq show`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub record: DocStatusRecord,
    pub embedded_chunks: i64,
    pub chunks: Vec<ChunkView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub index: i64,
    pub modality: Modality,
    pub text: String,
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<DocumentView> {
    let Some(record) = doc_status::get(pool, id).await? else {
        bail!("document not found: {}", id);
    };

    let rows = sqlx::query(
        "SELECT chunk_index, modality, text FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    let chunks = rows
        .iter()
        .map(|row| {
            let modality: String = row.get("modality");
            ChunkView {
                index: row.get("chunk_index"),
                modality: Modality::from_db(&modality),
                text: row.get("text"),
            }
        })
        .collect();

    let embedded_chunks: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
            .bind(id)
            .fetch_one(pool)
            .await?;

    Ok(DocumentView {
        record,
        embedded_chunks,
        chunks,
    })
}

pub async fn run_show(pool: &SqlitePool, id: &str) -> Result<()> {
    let doc = get_document(pool, id).await?;
    let r = &doc.record;

    println!("--- Document ---");
    println!("id:           {}", r.id);
    println!("file_path:    {}", r.file_path);
    println!("status:       {}", r.status);
    if let Some(ref error) = r.error {
        println!("error:        {}", error);
    }
    println!("length:       {} chars", r.content_length);
    println!("embedded:     {} / {}", doc.embedded_chunks, doc.chunks.len());
    println!("created_at:   {}", format_ts_iso(r.created_at));
    println!("updated_at:   {}", format_ts_iso(r.updated_at));
    println!("summary:      {}", r.content_summary.replace('\n', " "));
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {} {}]", chunk.index, chunk.modality.as_str());
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

/// Records filtered by state, most recently updated first.
pub async fn list_documents(
    pool: &SqlitePool,
    state: Option<DocStatus>,
) -> Result<Vec<DocStatusRecord>> {
    let all = doc_status::all(pool).await?;
    Ok(match state {
        Some(s) => all.into_iter().filter(|r| r.status == s).collect(),
        None => all,
    })
}

pub async fn run_status(pool: &SqlitePool, state: Option<DocStatus>, json: bool) -> Result<()> {
    let records = list_documents(pool, state).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    println!(
        "{:<12} {:>7} {:<17} {}",
        "STATUS", "CHUNKS", "UPDATED", "FILE"
    );
    println!("{}", "-".repeat(76));
    for r in &records {
        println!(
            "{:<12} {:>7} {:<17} {}",
            r.status.as_str(),
            r.chunks_count,
            format_ts_short(r.updated_at),
            r.file_path
        );
        println!("  id: {}", r.id);
        if let Some(ref error) = r.error {
            println!("  error: {}", error);
        }
    }
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_ts_short(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{process_document_complete, IngestOptions};
    use crate::rag::testing::open_temp;

    #[tokio::test]
    async fn show_returns_record_and_ordered_chunks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("t.txt");
        std::fs::write(&file, "Prose first.\n\na | b\n1 | 2").unwrap();
        let report = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap();

        let doc = get_document(rag.pool(), &report.document_id).await.unwrap();
        assert_eq!(doc.record.status, DocStatus::Processed);
        assert_eq!(doc.embedded_chunks, 0);
        let kinds: Vec<Modality> = doc.chunks.iter().map(|c| c.modality).collect();
        assert_eq!(kinds, vec![Modality::Text, Modality::Table]);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["status"], "processed");
        assert_eq!(json["chunks"][1]["modality"], "table");
    }

    #[tokio::test]
    async fn unknown_document_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let err = get_document(rag.pool(), "doc-missing").await.unwrap_err();
        assert!(err.to_string().contains("document not found"));
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        doc_status::upsert(rag.pool(), "a", "/x/a.pdf", DocStatus::Processed, "", 0)
            .await
            .unwrap();
        doc_status::upsert(rag.pool(), "b", "/x/b.pdf", DocStatus::Failed, "", 0)
            .await
            .unwrap();

        assert_eq!(list_documents(rag.pool(), None).await.unwrap().len(), 2);
        let failed = list_documents(rag.pool(), Some(DocStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "b");
    }
}
