//! `dq demo`: ingest one document if needed, then ask a text question and
//! a question with an attached equation, timing each step.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::ensure::{self, EnsureOptions};
use crate::models::QueryMode;
use crate::progress::{ProgressMode, Stopwatch};
use crate::query::{self, MultimodalContent, QueryParams};
use crate::rag::Rag;

pub const TEXT_QUESTION: &str = "What are the main findings shown in the figures and tables?";
pub const MULTIMODAL_QUESTION: &str =
    "Explain this formula and its relevance to the document content";

/// The equation attached to [`MULTIMODAL_QUESTION`].
pub fn sample_equation() -> MultimodalContent {
    MultimodalContent::Equation {
        latex: r"P(d|q) = \frac{P(q|d)\,P(d)}{P(q)}".to_string(),
        equation_caption: Some("Document relevance probability".to_string()),
    }
}

pub async fn run_demo(config: Config, document: &Path, progress: ProgressMode) -> Result<()> {
    let total = Stopwatch::start();

    let rag = Rag::open(config).await?.with_progress(progress.reporter());
    println!("store ready ({})", total.elapsed());

    ensure::ensure_document(&rag, document, &EnsureOptions::default()).await?;

    let mut params = QueryParams::from_config(rag.config());
    if !rag.config().embedding.is_enabled() {
        eprintln!("Warning: embeddings disabled, demo queries use keyword mode");
        params.mode = QueryMode::Keyword;
    }

    let sw = Stopwatch::start();
    let answer = query::aquery(&rag, TEXT_QUESTION, &params).await?;
    println!();
    println!("Text-only query in {}", sw.elapsed());
    println!("{}", answer);
    println!();

    let sw = Stopwatch::start();
    let answer =
        query::aquery_with_multimodal(&rag, MULTIMODAL_QUESTION, &[sample_equation()], &params)
            .await?;
    println!("Multimodal query in {}", sw.elapsed());
    println!("{}", answer);

    rag.close().await;
    Ok(())
}
