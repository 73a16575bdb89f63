//! Core data models.
//!
//! Status records track where each source document is in the ingestion
//! pipeline; chunks are the retrievable units produced from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processing state of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Processed => "processed",
            DocStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DocStatus::Pending),
            "processing" => Ok(DocStatus::Processing),
            "processed" => Ok(DocStatus::Processed),
            "failed" => Ok(DocStatus::Failed),
            other => Err(format!(
                "unknown status '{}': expected pending, processing, processed or failed",
                other
            )),
        }
    }
}

/// Tracked state of one source document.
#[derive(Debug, Clone, Serialize)]
pub struct DocStatusRecord {
    pub id: String,
    pub file_path: String,
    pub status: DocStatus,
    pub content_summary: String,
    pub content_length: i64,
    pub chunks_count: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Kind of content a chunk was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Table,
    Equation,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Table => "table",
            Modality::Equation => "equation",
        }
    }

    /// Lenient parse used when reading rows back; unknown values are text.
    pub fn from_db(s: &str) -> Self {
        match s {
            "table" => Modality::Table,
            "equation" => Modality::Equation,
            _ => Modality::Text,
        }
    }
}

/// A chunk of a document's content.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub modality: Modality,
    pub text: String,
    pub hash: String,
}

/// A chunk returned by retrieval, with its fused score.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub file_name: String,
    pub chunk_index: i64,
    pub modality: Modality,
    pub text: String,
    pub score: f64,
}

/// Retrieval channel(s) used to gather context for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl QueryMode {
    pub fn uses_keywords(&self) -> bool {
        matches!(self, QueryMode::Keyword | QueryMode::Hybrid)
    }

    pub fn uses_vectors(&self) -> bool {
        matches!(self, QueryMode::Semantic | QueryMode::Hybrid)
    }
}

impl FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(QueryMode::Keyword),
            "semantic" | "naive" => Ok(QueryMode::Semantic),
            "hybrid" => Ok(QueryMode::Hybrid),
            other => Err(format!(
                "Unknown query mode: {}. Use keyword, semantic, or hybrid.",
                other
            )),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryMode::Keyword => "keyword",
            QueryMode::Semantic => "semantic",
            QueryMode::Hybrid => "hybrid",
        })
    }
}
