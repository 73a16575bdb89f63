//! # docquery
//!
//! Ingest a document once, then ask it questions.
//!
//! docquery parses PDF and Office documents into text, table and equation
//! blocks, chunks and embeds them into a local SQLite store, and answers
//! questions (optionally with an attached equation, table or image) with an
//! LLM grounded in the retrieved chunks. A status store records every
//! document's processing state so a file is only ingested once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌───────────┐
//! │  Parser  │──▶│ Describe+Chunk+Embed │──▶│  SQLite   │
//! │ PDF/OOXML│   │   (LLM, embeddings)  │   │ FTS5+Vec  │
//! └──────────┘   └──────────────────────┘   └─────┬─────┘
//!                                                 │
//!                              ┌──────────────────┤
//!                              ▼                  ▼
//!                        ┌──────────┐       ┌──────────┐
//!                        │ Retrieve │──────▶│  Query   │
//!                        └──────────┘       │  (LLM)   │
//!                                           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dq init                              # write config, create the store
//! dq ingest files/paper.pdf            # parse and index (skipped if already processed)
//! dq status
//! dq query "What are the main findings?" --mode hybrid
//! dq demo
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`doc_status`] | Document status store |
//! | [`ensure`] | "Already ingested?" check |
//! | [`parser`] | Document parsing into content blocks |
//! | [`chunk`] | Chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Completion models and response cache |
//! | [`ingest`] | Document processing pipeline |
//! | [`retrieve`] | Keyword, semantic, and hybrid retrieval |
//! | [`query`] | Grounded and multimodal question answering |
//! | [`rag`] | The client tying it together |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod demo;
pub mod doc_status;
pub mod embedding;
pub mod ensure;
pub mod http;
pub mod ingest;
pub mod inspect;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod progress;
pub mod query;
pub mod rag;
pub mod retrieve;
