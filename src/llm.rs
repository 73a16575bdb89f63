//! Completion models.
//!
//! [`CompletionModel`] is the seam between the query pipeline and whatever
//! answers prompts. [`OpenAiChat`] talks to an OpenAI-compatible
//! `/chat/completions` endpoint; [`CachedModel`] wraps any model with a
//! response cache stored in the `llm_cache` table, so re-running the same
//! question against the same context costs nothing.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::config::LlmConfig;
use crate::http;

/// A prior turn passed along with the prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Everything needed for one completion call.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub history: Vec<Message>,
    pub prompt: String,
    /// Local image files attached to the final user turn.
    pub images: Vec<PathBuf>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_images(mut self, images: Vec<PathBuf>) -> Self {
        self.images = images;
        self
    }
}

/// Something that turns a prompt into text.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Model used for this request (vision requests may use a different one).
    fn model_for(&self, request: &CompletionRequest) -> String;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Build the configured model, wrapped in the response cache when enabled.
pub fn create_model(config: &LlmConfig, pool: &SqlitePool) -> Result<Box<dyn CompletionModel>> {
    let inner: Box<dyn CompletionModel> = match config.provider.as_str() {
        "disabled" => return Ok(Box::new(DisabledModel)),
        "openai" => Box::new(OpenAiChat::new(config)?),
        other => bail!("Unknown llm provider: {}", other),
    };
    if config.cache {
        Ok(Box::new(CachedModel::new(inner, pool.clone(), config.temperature)))
    } else {
        Ok(inner)
    }
}

// ============ Disabled ============

/// Refuses every request. Used when `llm.provider = "disabled"`.
pub struct DisabledModel;

#[async_trait]
impl CompletionModel for DisabledModel {
    fn model_for(&self, _request: &CompletionRequest) -> String {
        "disabled".to_string()
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        bail!("LLM provider is disabled. Set [llm] provider in config.")
    }
}

// ============ OpenAI-compatible chat ============

pub struct OpenAiChat {
    config: LlmConfig,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            config: config.clone(),
            api_key,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAiChat {
    fn model_for(&self, request: &CompletionRequest) -> String {
        if request.images.is_empty() {
            self.config.model.clone()
        } else {
            self.config.vision_model().to_string()
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = json!({
            "model": self.model_for(request),
            "messages": build_messages(request)?,
            "temperature": self.config.temperature,
        });
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let json = http::post_json_with_retry(
            &self.client,
            &url,
            Some(&self.api_key),
            &body,
            self.config.max_retries,
            "OpenAI",
        )
        .await?;
        parse_chat_response(&json)
    }
}

/// OpenAI `messages` array: system, history, then the user turn. The user
/// turn becomes a content-part array when images are attached.
pub fn build_messages(request: &CompletionRequest) -> Result<Vec<Value>> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if let Some(system) = &request.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for m in &request.history {
        messages.push(json!({ "role": m.role, "content": m.content }));
    }

    if request.images.is_empty() {
        messages.push(json!({ "role": "user", "content": request.prompt }));
    } else {
        let mut parts = vec![json!({ "type": "text", "text": request.prompt })];
        for path in &request.images {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": image_data_url(path)? }
            }));
        }
        messages.push(json!({ "role": "user", "content": parts }));
    }
    Ok(messages)
}

/// Inline a local image as a `data:` URL.
pub fn image_data_url(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read image: {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => bail!("Unsupported image type: {}", path.display()),
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{}", mime, encoded))
}

fn parse_chat_response(json: &Value) -> Result<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?;
    Ok(content.to_string())
}

// ============ Response cache ============

/// Replays stored responses for identical requests.
pub struct CachedModel {
    inner: Box<dyn CompletionModel>,
    pool: SqlitePool,
    temperature: f32,
}

impl CachedModel {
    pub fn new(inner: Box<dyn CompletionModel>, pool: SqlitePool, temperature: f32) -> Self {
        Self {
            inner,
            pool,
            temperature,
        }
    }
}

#[async_trait]
impl CompletionModel for CachedModel {
    fn model_for(&self, request: &CompletionRequest) -> String {
        self.inner.model_for(request)
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let model = self.inner.model_for(request);
        let key = cache_key(&model, request, self.temperature)?;

        let cached: Option<String> =
            sqlx::query_scalar("SELECT response FROM llm_cache WHERE key = ?")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(response) = cached {
            return Ok(response);
        }

        let response = self.inner.complete(request).await?;

        sqlx::query(
            r#"
            INSERT INTO llm_cache (key, model, response, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET response = excluded.response, created_at = excluded.created_at
            "#,
        )
        .bind(&key)
        .bind(&model)
        .bind(&response)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(response)
    }
}

/// SHA-256 over model, messages (images inlined) and temperature.
pub fn cache_key(model: &str, request: &CompletionRequest, temperature: f32) -> Result<String> {
    let payload = json!({
        "model": model,
        "messages": build_messages(request)?,
        "temperature": temperature,
    });
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&payload)?);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingModel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CompletionModel for CountingModel {
        fn model_for(&self, _request: &CompletionRequest) -> String {
            "counting".to_string()
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("answer {} to {}", n, request.prompt))
        }
    }

    #[test]
    fn messages_order_system_history_user() {
        let mut req = CompletionRequest::new("question").with_system("be brief");
        req.history = vec![Message::user("hi"), Message::assistant("hello")];
        let messages = build_messages(&req).unwrap();
        let roles: Vec<&str> = messages
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3]["content"], "question");
    }

    #[test]
    fn images_become_content_parts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let img = tmp.path().join("fig.png");
        std::fs::write(&img, [0x89, b'P', b'N', b'G']).unwrap();

        let req = CompletionRequest::new("what is shown?").with_images(vec![img]);
        let messages = build_messages(&req).unwrap();
        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn unsupported_image_type_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("fig.bmp");
        std::fs::write(&file, b"BM").unwrap();
        assert!(image_data_url(&file).is_err());
    }

    #[test]
    fn cache_key_depends_on_prompt_and_model() {
        let a = CompletionRequest::new("one");
        let b = CompletionRequest::new("two");
        let ka = cache_key("m", &a, 0.0).unwrap();
        assert_eq!(ka, cache_key("m", &a, 0.0).unwrap());
        assert_ne!(ka, cache_key("m", &b, 0.0).unwrap());
        assert_ne!(ka, cache_key("other", &a, 0.0).unwrap());
        assert_ne!(ka, cache_key("m", &a, 0.7).unwrap());
    }

    #[test]
    fn chat_response_content_is_extracted() {
        let json = json!({ "choices": [ { "message": { "role": "assistant", "content": "42" } } ] });
        assert_eq!(parse_chat_response(&json).unwrap(), "42");
        assert!(parse_chat_response(&json!({ "choices": [] })).is_err());
    }

    #[tokio::test]
    async fn cached_model_replays_identical_requests() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let model = CachedModel::new(
            Box::new(CountingModel {
                calls: calls.clone(),
            }),
            pool,
            0.0,
        );

        let req = CompletionRequest::new("why?");
        let first = model.complete(&req).await.unwrap();
        let second = model.complete(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        model.complete(&CompletionRequest::new("how?")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_model_errors() {
        let err = DisabledModel
            .complete(&CompletionRequest::new("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
