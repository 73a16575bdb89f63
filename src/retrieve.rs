//! Chunk retrieval: keyword (FTS5), semantic (cosine) and hybrid.
//!
//! Each channel yields up to `candidate_k` candidates with a raw score. Raw
//! scores are min-max normalized per channel and fused as
//! `(1 - alpha) * keyword + alpha * vector`, where alpha is 0 for keyword
//! mode, 1 for semantic mode and `hybrid_alpha` otherwise. Chunks missing
//! from a channel score 0 there.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::embedding;
use crate::models::{Modality, QueryMode, RetrievedChunk};
use crate::rag::Rag;

/// Upper bound on terms passed to FTS5.
const MAX_QUERY_TERMS: usize = 64;

#[derive(Debug, Clone)]
struct ChunkCandidate {
    chunk_id: String,
    raw_score: f64,
}

/// Retrieve the `top_k` best chunks of processed documents for `query`.
///
/// Ordered by fused score descending, ties broken by chunk id.
///
/// # Errors
///
/// Semantic and hybrid modes fail when the embedding provider is disabled.
pub async fn retrieve(
    rag: &Rag,
    query: &str,
    mode: QueryMode,
    top_k: i64,
) -> Result<Vec<RetrievedChunk>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let config = rag.config();
    if mode.uses_vectors() && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            mode
        );
    }

    let keyword_candidates = if mode.uses_keywords() {
        fetch_keyword_candidates(rag.pool(), query, config.retrieval.candidate_k_keyword).await?
    } else {
        Vec::new()
    };

    let vector_candidates = if mode.uses_vectors() {
        fetch_vector_candidates(rag, query, config.retrieval.candidate_k_vector).await?
    } else {
        Vec::new()
    };

    if keyword_candidates.is_empty() && vector_candidates.is_empty() {
        return Ok(Vec::new());
    }

    let alpha = match mode {
        QueryMode::Keyword => 0.0,
        QueryMode::Semantic => 1.0,
        QueryMode::Hybrid => config.retrieval.hybrid_alpha,
    };
    let fused = fuse(&keyword_candidates, &vector_candidates, alpha);

    let mut results = Vec::new();
    for (chunk_id, score) in fused {
        if results.len() as i64 >= top_k {
            break;
        }
        if let Some(chunk) = load_chunk(rag.pool(), &chunk_id, score).await? {
            results.push(chunk);
        }
    }
    Ok(results)
}

/// Build an FTS5 query that ORs every distinct term, each quoted so that
/// FTS syntax characters in user input are never interpreted.
pub fn fts_query(input: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = input
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_QUERY_TERMS)
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

// ============ Keyword search ============

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let Some(match_expr) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT chunk_id, rank
        FROM chunks_fts
        WHERE chunks_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                raw_score: -rank, // bm25 rank: lower is better
            }
        })
        .collect())
}

// ============ Vector search ============

async fn fetch_vector_candidates(
    rag: &Rag,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let query_vec =
        embedding::embed_query(rag.embedder(), &rag.config().embedding, query).await?;

    let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
        .fetch_all(rag.pool())
        .await?;

    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                raw_score: embedding::cosine_similarity(&query_vec, &vec) as f64,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(candidate_k.max(0) as usize);

    Ok(candidates)
}

async fn load_chunk(pool: &SqlitePool, chunk_id: &str, score: f64) -> Result<Option<RetrievedChunk>> {
    let row = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.chunk_index, c.modality, c.text, d.file_path
        FROM chunks c
        JOIN doc_status d ON d.id = c.document_id
        WHERE c.id = ? AND d.status = 'processed'
        "#,
    )
    .bind(chunk_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let file_path: String = row.get("file_path");
        let modality: String = row.get("modality");
        RetrievedChunk {
            chunk_id: row.get("id"),
            document_id: row.get("document_id"),
            file_name: Path::new(&file_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(file_path.clone()),
            chunk_index: row.get("chunk_index"),
            modality: Modality::from_db(&modality),
            text: row.get("text"),
            score,
        }
    }))
}

// ============ Score fusion ============

/// Min-max normalize scores to [0, 1]. Equal scores all normalize to 1.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Fused `(chunk_id, score)` pairs, score descending then chunk id ascending.
fn fuse(keyword: &[ChunkCandidate], vector: &[ChunkCandidate], alpha: f64) -> Vec<(String, f64)> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let ids: HashSet<&str> = kw_map.keys().chain(vec_map.keys()).copied().collect();
    let mut scored: Vec<(String, f64)> = ids
        .into_iter()
        .map(|id| {
            let k = kw_map.get(id).copied().unwrap_or(0.0);
            let v = vec_map.get(id).copied().unwrap_or(0.0);
            (id.to_string(), (1.0 - alpha) * k + alpha * v)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
}
