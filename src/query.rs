//! Question answering over retrieved chunks.
//!
//! A query retrieves chunks, lays them out as a numbered context block and
//! asks the completion model for an answer grounded in that block. When
//! retrieval finds nothing the model is not called at all.
//!
//! Multimodal queries carry extra items (an equation, a table, an image)
//! that are rendered to text and appended to the question, both for
//! retrieval and for the prompt. Image files are also attached to the
//! request when image processing is enabled.
//!
//! Without a completion model the assembled context is returned as the answer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::Config;
use crate::llm::CompletionRequest;
use crate::models::{QueryMode, RetrievedChunk};
use crate::rag::Rag;
use crate::retrieve;

pub const NO_CONTEXT_ANSWER: &str =
    "I could not find any relevant information in the indexed documents to answer this question.";

const SYSTEM_PROMPT: &str = "You answer questions about the user's documents. \
Use only the numbered context passages provided. Cite passages by number in square brackets, e.g. [2]. \
If the passages do not contain the answer, say that the documents do not cover it.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryParams {
    pub mode: QueryMode,
    pub top_k: i64,
    /// Return the assembled context instead of asking the model.
    pub context_only: bool,
}

impl QueryParams {
    /// Hybrid mode with the configured `top_k`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: QueryMode::Hybrid,
            top_k: config.retrieval.top_k,
            context_only: false,
        }
    }
}

/// A non-text item attached to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MultimodalContent {
    Equation {
        latex: String,
        #[serde(default)]
        equation_caption: Option<String>,
    },
    Table {
        table_body: String,
        #[serde(default)]
        table_caption: Option<String>,
        #[serde(default)]
        table_footnote: Option<String>,
    },
    Image {
        img_path: PathBuf,
        #[serde(default)]
        image_caption: Option<String>,
    },
}

impl MultimodalContent {
    /// Plain-text rendering used in the retrieval query and the prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self {
            MultimodalContent::Equation {
                latex,
                equation_caption,
            } => {
                out.push_str("Equation: ");
                out.push_str(latex);
                if let Some(caption) = equation_caption {
                    out.push_str("\nCaption: ");
                    out.push_str(caption);
                }
            }
            MultimodalContent::Table {
                table_body,
                table_caption,
                table_footnote,
            } => {
                if let Some(caption) = table_caption {
                    out.push_str("Table: ");
                    out.push_str(caption);
                    out.push('\n');
                } else {
                    out.push_str("Table:\n");
                }
                out.push_str(table_body);
                if let Some(footnote) = table_footnote {
                    out.push_str("\nFootnote: ");
                    out.push_str(footnote);
                }
            }
            MultimodalContent::Image {
                img_path,
                image_caption,
            } => {
                out.push_str("Image: ");
                out.push_str(&img_path.display().to_string());
                if let Some(caption) = image_caption {
                    out.push_str("\nCaption: ");
                    out.push_str(caption);
                }
            }
        }
        out
    }
}

/// Parse `--multimodal` input: a JSON array of items or a single item.
pub fn parse_multimodal(json: &str) -> Result<Vec<MultimodalContent>> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("multimodal content is not valid JSON")?;
    let items = if value.is_array() {
        serde_json::from_value::<Vec<MultimodalContent>>(value)
    } else {
        serde_json::from_value::<MultimodalContent>(value).map(|item| vec![item])
    };
    items.context("multimodal content must be equation, table or image items")
}

/// Answer a text-only question.
pub async fn aquery(rag: &Rag, question: &str, params: &QueryParams) -> Result<String> {
    answer(rag, question, Vec::new(), params).await
}

/// Answer a question with attached multimodal items.
pub async fn aquery_with_multimodal(
    rag: &Rag,
    question: &str,
    content: &[MultimodalContent],
    params: &QueryParams,
) -> Result<String> {
    let enriched = enrich_question(question, content);
    let images = if rag.config().multimodal.enable_image_processing {
        content
            .iter()
            .filter_map(|item| match item {
                MultimodalContent::Image { img_path, .. } => Some(img_path.clone()),
                _ => None,
            })
            .collect()
    } else {
        Vec::new()
    };
    answer(rag, &enriched, images, params).await
}

fn enrich_question(question: &str, content: &[MultimodalContent]) -> String {
    if content.is_empty() {
        return question.to_string();
    }
    let rendered: Vec<String> = content.iter().map(MultimodalContent::render).collect();
    format!("{}\n\n{}", question, rendered.join("\n\n"))
}

async fn answer(
    rag: &Rag,
    question: &str,
    images: Vec<PathBuf>,
    params: &QueryParams,
) -> Result<String> {
    let chunks = retrieve::retrieve(rag, question, params.mode, params.top_k).await?;
    if chunks.is_empty() {
        return Ok(NO_CONTEXT_ANSWER.to_string());
    }

    let context = build_context(&chunks, rag.config().retrieval.max_context_chars);
    if params.context_only {
        return Ok(context);
    }
    if !rag.has_model() {
        eprintln!("Warning: LLM provider is disabled, printing retrieved context only");
        return Ok(context);
    }

    let request = CompletionRequest::new(format!(
        "Context:\n{}\n\nQuestion: {}",
        context, question
    ))
    .with_system(SYSTEM_PROMPT)
    .with_images(images);
    rag.model().complete(&request).await
}

/// Numbered passages, `[n] file #index (modality)` then the chunk text.
///
/// Passages are added in rank order until `max_chars` would be exceeded; a
/// first passage that alone is too long is cut at a char boundary.
pub fn build_context(chunks: &[RetrievedChunk], max_chars: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let passage = format!(
            "[{}] {} #{} ({})\n{}",
            i + 1,
            chunk.file_name,
            chunk.chunk_index,
            chunk.modality.as_str(),
            chunk.text.trim()
        );
        let sep = if out.is_empty() { 0 } else { 2 };
        if out.len() + sep + passage.len() > max_chars {
            if out.is_empty() {
                let mut end = max_chars.min(passage.len());
                while !passage.is_char_boundary(end) {
                    end -= 1;
                }
                out.push_str(&passage[..end]);
            }
            break;
        }
        if sep > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&passage);
    }
    out
}
