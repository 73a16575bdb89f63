//! Document processing pipeline.
//!
//! Takes one file through read → parse → describe → chunk → embed → store,
//! tracking its state in the status store. The document id is derived from
//! the file's bytes, so re-ingesting unchanged content reuses the same record.
//!
//! Any failure after the status record exists marks it `failed` with the
//! error text before the error is returned.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunk::{chunk_segments, Segment};
use crate::config::is_valid_device;
use crate::doc_status;
use crate::embedding;
use crate::ensure::{self, resolve_path, EnsureOptions, IngestDecision};
use crate::llm::CompletionRequest;
use crate::models::{Chunk, DocStatus, Modality};
use crate::parser::{self, ContentBlock, DocFormat, ParseMethod, ParsedDocument};
use crate::progress::{IngestEvent, Stopwatch};
use crate::rag::Rag;

/// Characters of content kept as the status record's summary.
const SUMMARY_CHARS: usize = 100;

const TABLE_SYSTEM_PROMPT: &str = "You describe tables extracted from documents. \
State what the table compares, its key values and any notable trend in at most five sentences. \
Do not invent values that are not in the table.";

const EQUATION_SYSTEM_PROMPT: &str = "You explain equations extracted from documents. \
Say what the equation expresses and what each symbol most likely denotes in at most five sentences.";

/// Per-call overrides of the `[parser]` settings.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub method: Option<ParseMethod>,
    pub device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub file_path: PathBuf,
    pub blocks: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub content_list: PathBuf,
    pub device: String,
}

/// Content-derived document id: `doc-<sha256 of bytes>`.
pub fn document_id_for(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("doc-{:x}", hasher.finalize())
}

/// Run the whole pipeline for one file.
pub async fn process_document_complete(
    rag: &Rag,
    file_path: &Path,
    opts: &IngestOptions,
) -> Result<IngestReport> {
    let sw = Stopwatch::start();
    let resolved = resolve_path(file_path);
    let label = display_name(&resolved);

    let bytes = std::fs::read(&resolved)
        .with_context(|| format!("Failed to read document: {}", resolved.display()))?;
    let document_id = document_id_for(&bytes);

    doc_status::upsert(
        rag.pool(),
        &document_id,
        &resolved.to_string_lossy(),
        DocStatus::Processing,
        "",
        0,
    )
    .await?;

    match run_pipeline(rag, &resolved, &bytes, &document_id, opts).await {
        Ok(report) => {
            doc_status::set_status(
                rag.pool(),
                &document_id,
                DocStatus::Processed,
                None,
                Some(report.chunks as i64),
            )
            .await?;
            rag.progress().report(&IngestEvent::Done {
                file: label,
                chunks: report.chunks,
                elapsed_ms: sw.elapsed_ms(),
            });
            Ok(report)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            if let Err(status_err) = doc_status::set_status(
                rag.pool(),
                &document_id,
                DocStatus::Failed,
                Some(&message),
                None,
            )
            .await
            {
                eprintln!(
                    "Warning: could not record failure of {}: {:#}",
                    label, status_err
                );
            }
            rag.progress().report(&IngestEvent::Failed {
                file: label,
                error: message,
            });
            Err(e)
        }
    }
}

async fn run_pipeline(
    rag: &Rag,
    path: &Path,
    bytes: &[u8],
    document_id: &str,
    opts: &IngestOptions,
) -> Result<IngestReport> {
    let config = rag.config();
    let label = display_name(path);

    let method = opts.method.unwrap_or(config.parser.method);
    let device = opts
        .device
        .clone()
        .unwrap_or_else(|| config.parser.device.clone());
    if !is_valid_device(&device) {
        bail!("invalid device '{}': use cpu, mps, cuda or cuda:<n>", device);
    }

    rag.progress().report(&IngestEvent::Parsing {
        file: label.clone(),
    });
    let format = DocFormat::from_path(path)
        .ok_or_else(|| parser::ParseError::UnsupportedFormat(path.display().to_string()))?;
    let parsed = parser::parse_bytes(bytes, format, method)?;
    rag.progress().report(&IngestEvent::Parsed {
        file: label.clone(),
        blocks: parsed.blocks.len(),
    });

    let full_text = parsed.full_text();
    let summary: String = full_text.chars().take(SUMMARY_CHARS).collect();
    doc_status::set_content(
        rag.pool(),
        document_id,
        &summary,
        full_text.chars().count() as i64,
    )
    .await?;

    let content_list = parser::write_content_list(&parsed, path, &config.parser.output_dir)?;

    let segments = describe_blocks(rag, &label, &parsed).await;
    let chunks = chunk_segments(
        document_id,
        &segments,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
    );
    replace_chunks(rag.pool(), document_id, &chunks).await?;
    rag.progress().report(&IngestEvent::Chunked {
        file: label.clone(),
        chunks: chunks.len(),
    });

    let embedded = if config.embedding.is_enabled() {
        embed_chunks(rag, &label, &chunks).await?
    } else {
        0
    };

    Ok(IngestReport {
        document_id: document_id.to_string(),
        file_path: path.to_path_buf(),
        blocks: parsed.blocks.len(),
        chunks: chunks.len(),
        embedded,
        content_list,
        device,
    })
}

/// Turn parsed blocks into chunker segments, asking the model to describe
/// tables and equations when that is switched on. A failed description falls
/// back to the raw block text.
async fn describe_blocks(rag: &Rag, label: &str, doc: &ParsedDocument) -> Vec<Segment> {
    let multimodal = &rag.config().multimodal;
    let wants_description = |block: &ContentBlock| {
        rag.has_model()
            && match block {
                ContentBlock::Table { .. } => multimodal.enable_table_processing,
                ContentBlock::Equation { .. } => multimodal.enable_equation_processing,
                ContentBlock::Text { .. } => false,
            }
    };
    let total = doc.blocks.iter().filter(|b| wants_description(*b)).count() as u64;

    let mut segments = Vec::with_capacity(doc.blocks.len());
    let mut n = 0u64;
    for block in &doc.blocks {
        let (modality, raw, system_prompt) = match block {
            ContentBlock::Text { text } => {
                segments.push(Segment::new(Modality::Text, text.as_str()));
                continue;
            }
            ContentBlock::Table {
                table_body,
                table_caption,
            } => {
                let raw = match table_caption {
                    Some(caption) => format!("{}\n{}", caption, table_body),
                    None => table_body.clone(),
                };
                (Modality::Table, raw, TABLE_SYSTEM_PROMPT)
            }
            ContentBlock::Equation { text } => {
                (Modality::Equation, text.clone(), EQUATION_SYSTEM_PROMPT)
            }
        };

        if !wants_description(block) {
            segments.push(Segment::new(modality, raw));
            continue;
        }

        n += 1;
        rag.progress().report(&IngestEvent::Describing {
            file: label.to_string(),
            n,
            total,
        });
        let request = CompletionRequest::new(raw.clone()).with_system(system_prompt);
        match rag.model().complete(&request).await {
            Ok(description) => segments.push(Segment::new(
                modality,
                format!("{}\n\nDescription: {}", raw, description.trim()),
            )),
            Err(e) => {
                eprintln!(
                    "Warning: could not describe {} in {}: {:#}",
                    modality.as_str(),
                    label,
                    e
                );
                segments.push(Segment::new(modality, raw));
            }
        }
    }
    segments
}

/// Swap a document's chunks, FTS rows and vectors in one transaction.
async fn replace_chunks(pool: &SqlitePool, document_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, modality, text, hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(chunk.modality.as_str())
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn embed_chunks(rag: &Rag, label: &str, chunks: &[Chunk]) -> Result<usize> {
    let config = &rag.config().embedding;
    let provider = rag.embedder();
    let total = chunks.len() as u64;
    let mut embedded = 0usize;

    for batch in chunks.chunks(config.batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedding::embed_texts(provider, config, &texts).await?;
        for (chunk, vec) in batch.iter().zip(vectors.iter()) {
            upsert_embedding(
                rag.pool(),
                chunk,
                provider.model_name(),
                provider.dims(),
                &embedding::vec_to_blob(vec),
            )
            .await?;
            embedded += 1;
        }
        rag.progress().report(&IngestEvent::Embedding {
            file: label.to_string(),
            n: embedded as u64,
            total,
        });
    }

    Ok(embedded)
}

async fn upsert_embedding(
    pool: &SqlitePool,
    chunk: &Chunk,
    model: &str,
    dims: usize,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            created_at = excluded.created_at,
            hash = excluded.hash
        "#,
    )
    .bind(&chunk.id)
    .bind(model)
    .bind(dims as i64)
    .bind(now)
    .bind(&chunk.hash)
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            embedding = excluded.embedding
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(blob)
    .execute(pool)
    .await?;

    Ok(())
}

/// Outcome of a folder ingest, in path order.
#[derive(Debug, Clone, Default)]
pub struct FolderReport {
    pub ingested: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Ensure every file under `dir` matching `[parser] include_globs`.
///
/// Files are visited in path order. The first ingestion error stops the walk.
pub async fn process_folder_complete(
    rag: &Rag,
    dir: &Path,
    opts: &EnsureOptions,
) -> Result<FolderReport> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let include_set = build_globset(&rag.config().parser.include_globs)?;
    let files = matching_files(dir, &include_set)?;

    let mut report = FolderReport::default();
    for path in files {
        match ensure::ensure_document(rag, &path, opts).await? {
            IngestDecision::Skip { .. } => report.skipped.push(path),
            IngestDecision::Proceed => report.ingested.push(path),
        }
    }
    Ok(report)
}

fn matching_files(dir: &Path, include_set: &GlobSet) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        if include_set.is_match(relative) {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CompletionModel;
    use crate::rag::testing::{open_temp, open_temp_with};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct DescribingModel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CompletionModel for DescribingModel {
        fn model_for(&self, _request: &CompletionRequest) -> String {
            "stub".to_string()
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt.contains("E = mc^2") {
                anyhow::bail!("model unavailable");
            }
            Ok("a small comparison".to_string())
        }
    }

    async fn chunk_texts(rag: &Rag, document_id: &str) -> Vec<(String, String)> {
        sqlx::query_as(
            "SELECT modality, text FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(rag.pool())
        .await
        .unwrap()
    }

    #[test]
    fn document_id_is_content_hash() {
        let a = document_id_for(b"hello");
        assert!(a.starts_with("doc-"));
        assert_eq!(a.len(), 4 + 64);
        assert_eq!(a, document_id_for(b"hello"));
        assert_ne!(a, document_id_for(b"hello!"));
    }

    #[tokio::test]
    async fn text_file_is_processed_and_indexed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("notes.txt");
        std::fs::write(&file, "Retrieval augmented generation.\n\nSecond paragraph here.").unwrap();

        let report = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(report.embedded, 0);
        assert_eq!(report.device, "cpu");
        assert!(report.content_list.ends_with("notes/notes_content_list.json"));
        assert!(report.content_list.exists());

        let record = doc_status::get(rag.pool(), &report.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DocStatus::Processed);
        assert_eq!(record.chunks_count, 1);
        assert!(record.content_summary.starts_with("Retrieval augmented"));
        assert_eq!(record.file_path, resolve_path(&file).to_string_lossy());

        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'paragraph'")
            .fetch_one(rag.pool())
            .await
            .unwrap();
        assert_eq!(fts, 1);
    }

    #[tokio::test]
    async fn reingest_replaces_chunks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("notes.md");
        std::fs::write(&file, "Only paragraph.").unwrap();

        let first = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap();
        let second = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(first.document_id, second.document_id);

        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(rag.pool())
            .await
            .unwrap();
        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(rag.pool())
            .await
            .unwrap();
        assert_eq!(chunks, 1);
        assert_eq!(fts, 1);
    }

    #[tokio::test]
    async fn unsupported_format_marks_failed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("slides.key");
        std::fs::write(&file, b"not a document").unwrap();

        let err = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported document format"));

        let record = doc_status::get(rag.pool(), &document_id_for(b"not a document"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DocStatus::Failed);
        assert!(record
            .error
            .unwrap()
            .contains("unsupported document format"));
    }

    #[tokio::test]
    async fn invalid_device_override_marks_failed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "text").unwrap();

        let opts = IngestOptions {
            device: Some("tpu".to_string()),
            ..Default::default()
        };
        assert!(process_document_complete(&rag, &file, &opts).await.is_err());
        let failed = doc_status::get_docs_by_status(rag.pool(), DocStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_creates_no_record() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let missing = tmp.path().join("absent.pdf");
        assert!(process_document_complete(&rag, &missing, &IngestOptions::default())
            .await
            .is_err());
        assert!(doc_status::all(rag.pool()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tables_get_descriptions_and_failures_fall_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await.with_model(Box::<DescribingModel>::default());
        let file = tmp.path().join("results.txt");
        std::fs::write(
            &file,
            "Intro text.\n\nmodel | score\nA | 0.91\nB | 0.87\n\nE = mc^2",
        )
        .unwrap();

        let report = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap();
        let rows = chunk_texts(&rag, &report.document_id).await;
        let table = rows.iter().find(|(m, _)| m == "table").unwrap();
        assert!(table.1.contains("A | 0.91"));
        assert!(table.1.contains("Description: a small comparison"));

        let equation = rows.iter().find(|(m, _)| m == "equation").unwrap();
        assert_eq!(equation.1, "E = mc^2");
    }

    #[tokio::test]
    async fn disabled_table_processing_keeps_raw_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let model = DescribingModel {
            calls: calls.clone(),
        };
        let rag = open_temp_with(&tmp, "[multimodal]\nenable_table_processing = false")
            .await
            .with_model(Box::new(model));
        let file = tmp.path().join("results.txt");
        std::fs::write(&file, "Intro text.\n\nmodel | score\nA | 0.91\nB | 0.87").unwrap();

        let report = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap();
        let rows = chunk_texts(&rag, &report.document_id).await;
        let table = rows.iter().find(|(m, _)| m == "table").unwrap();
        assert_eq!(table.1, "model | score\nA | 0.91\nB | 0.87");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ocr_method_fails_for_text_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "hello world").unwrap();

        let opts = IngestOptions {
            method: Some(ParseMethod::Ocr),
            ..Default::default()
        };
        let err = process_document_complete(&rag, &file, &opts).await.unwrap_err();
        assert!(err.to_string().contains("OCR"));

        let record = doc_status::get(rag.pool(), &document_id_for(b"hello world"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DocStatus::Failed);
    }

    #[tokio::test]
    async fn blank_document_fails_without_chunks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let file = tmp.path().join("empty.txt");
        std::fs::write(&file, "   \n\n").unwrap();

        let err = process_document_complete(&rag, &file, &IngestOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no extractable content"));

        let record = doc_status::get(rag.pool(), &document_id_for(b"   \n\n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DocStatus::Failed);
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(rag.pool())
            .await
            .unwrap();
        assert_eq!(chunks, 0);
    }

    #[tokio::test]
    async fn pipeline_error_survives_failed_status_write() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        sqlx::query(
            "CREATE TRIGGER reject_failed BEFORE UPDATE ON doc_status \
             WHEN NEW.status = 'failed' BEGIN SELECT RAISE(ABORT, 'status table locked'); END",
        )
        .execute(rag.pool())
        .await
        .unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "text").unwrap();

        let opts = IngestOptions {
            device: Some("tpu".to_string()),
            ..Default::default()
        };
        let err = process_document_complete(&rag, &file, &opts).await.unwrap_err();
        assert!(err.to_string().contains("invalid device"), "{:#}", err);
    }

    #[tokio::test]
    async fn folder_ingest_filters_and_skips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let rag = open_temp(&tmp).await;
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("nested")).unwrap();
        std::fs::write(docs.join("a.txt"), "alpha").unwrap();
        std::fs::write(docs.join("nested").join("b.md"), "beta").unwrap();
        std::fs::write(docs.join("ignored.bin"), [0u8, 1, 2]).unwrap();

        let opts = EnsureOptions::default();
        let first = process_folder_complete(&rag, &docs, &opts).await.unwrap();
        assert_eq!(first.ingested.len(), 2);
        assert!(first.skipped.is_empty());
        assert!(first.ingested[0].ends_with("a.txt"));

        let second = process_folder_complete(&rag, &docs, &opts).await.unwrap();
        assert!(second.ingested.is_empty());
        assert_eq!(second.skipped.len(), 2);
    }
}
