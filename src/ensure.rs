//! "Already ingested?" check.
//!
//! Before running the (slow, paid) parse → describe → embed pipeline, the
//! status store is consulted. By default a document counts as ingested when
//! any **processed** record has the same base file name, compared
//! case-insensitively: `files/Paper.PDF` matches a record for
//! `/home/me/archive/paper.pdf`. This is a name heuristic, not a content
//! identity, so two different files called `paper.pdf` collide.
//! [`MatchPolicy::AbsolutePath`] narrows the match to the same resolved path.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::doc_status;
use crate::ingest::{self, IngestOptions, IngestReport};
use crate::models::{DocStatus, DocStatusRecord};
use crate::rag::Rag;

/// How a target path is compared against stored records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Lower-cased base file name.
    #[default]
    FileName,
    /// Canonical absolute path.
    AbsolutePath,
}

/// Outcome of the skip check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestDecision {
    Skip { matched_id: String },
    Proceed,
}

/// Decide whether `target` still needs ingesting.
///
/// Only records in the `processed` state are considered; pending, processing
/// and failed documents never cause a skip.
pub fn decide<'a, I>(records: I, target: &Path, policy: MatchPolicy) -> IngestDecision
where
    I: IntoIterator<Item = &'a DocStatusRecord>,
{
    let key = match policy {
        MatchPolicy::FileName => file_name_key(target),
        MatchPolicy::AbsolutePath => absolute_key(target),
    };
    let Some(key) = key else {
        return IngestDecision::Proceed;
    };

    for record in records {
        if record.status != DocStatus::Processed {
            continue;
        }
        let candidate = match policy {
            MatchPolicy::FileName => file_name_key(Path::new(&record.file_path)),
            MatchPolicy::AbsolutePath => Some(record.file_path.clone()),
        };
        if candidate.as_deref() == Some(key.as_str()) {
            return IngestDecision::Skip {
                matched_id: record.id.clone(),
            };
        }
    }

    IngestDecision::Proceed
}

fn file_name_key(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
}

fn absolute_key(path: &Path) -> Option<String> {
    Some(resolve_path(path).to_string_lossy().into_owned())
}

/// Canonicalize when the file exists, otherwise anchor at the current dir.
pub fn resolve_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// Options for [`ensure_document`].
#[derive(Debug, Clone, Default)]
pub struct EnsureOptions {
    pub policy: MatchPolicy,
    /// Ingest even when a processed record matches.
    pub force: bool,
    pub ingest: IngestOptions,
}

/// Ingest `file_path` unless the status store says it is already processed.
///
/// Returns the decision that was taken. Ingestion errors propagate.
pub async fn ensure_document(
    rag: &Rag,
    file_path: &Path,
    opts: &EnsureOptions,
) -> Result<IngestDecision> {
    if !opts.force {
        let processed = doc_status::get_docs_by_status(rag.pool(), DocStatus::Processed).await?;
        let decision = decide(processed.values(), file_path, opts.policy);
        if let IngestDecision::Skip { .. } = decision {
            println!(
                "'{}' already indexed, skipping parse",
                file_path.display()
            );
            return Ok(decision);
        }
    }

    println!("parsing new document {} ...", file_path.display());
    let report = ingest::process_document_complete(rag, file_path, &opts.ingest).await?;
    println!("{}", finished_line(&report));
    Ok(IngestDecision::Proceed)
}

fn finished_line(report: &IngestReport) -> String {
    format!(
        "parse finished: {} chunks, {} embedded, device {}, content list {}",
        report.chunks,
        report.embedded,
        report.device,
        report.content_list.display()
    )
}
