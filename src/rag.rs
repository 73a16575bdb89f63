//! The RAG client.
//!
//! [`Rag`] owns the storage pool, the embedding provider, the completion
//! model and the progress reporter. Opening it initializes storage.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::llm::{self, CompletionModel};
use crate::migrate;
use crate::progress::{NoProgress, ProgressReporter};

pub struct Rag {
    config: Config,
    pool: SqlitePool,
    embedder: Box<dyn EmbeddingProvider>,
    model: Box<dyn CompletionModel>,
    model_enabled: bool,
    progress: Box<dyn ProgressReporter>,
}

impl Rag {
    /// Connect to `<working_dir>/docquery.sqlite`, create missing tables and
    /// build the configured providers.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or a configured provider
    /// cannot be built (for instance `OPENAI_API_KEY` is missing).
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let embedder = embedding::create_provider(&config.embedding)?;
        let model = llm::create_model(&config.llm, &pool)?;
        let model_enabled = config.llm.is_enabled();
        Ok(Self {
            config,
            pool,
            embedder,
            model,
            model_enabled,
            progress: Box::new(NoProgress),
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Replace the completion model. The client then counts as having one.
    pub fn with_model(mut self, model: Box<dyn CompletionModel>) -> Self {
        self.model = model;
        self.model_enabled = true;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn model(&self) -> &dyn CompletionModel {
        self.model.as_ref()
    }

    /// Whether a real completion model is configured.
    pub fn has_model(&self) -> bool {
        self.model_enabled
    }

    pub fn progress(&self) -> &dyn ProgressReporter {
        self.progress.as_ref()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::parse_config;

    /// A client over a fresh temp directory with both providers disabled.
    pub async fn open_temp(tmp: &tempfile::TempDir) -> Rag {
        open_temp_with(tmp, "").await
    }

    /// Like [`open_temp`], with `extra` TOML sections appended.
    pub async fn open_temp_with(tmp: &tempfile::TempDir, extra: &str) -> Rag {
        let toml = format!(
            r#"
            [storage]
            working_dir = "{root}/store"

            [parser]
            output_dir = "{root}/output"

            [llm]
            provider = "disabled"

            [embedding]
            provider = "disabled"

            {extra}
            "#,
            root = tmp.path().display(),
            extra = extra
        );
        let config = parse_config(&toml).unwrap();
        Rag::open(config).await.unwrap()
    }
}
