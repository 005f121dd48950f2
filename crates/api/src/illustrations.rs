//! Illustration generation for book passages
//!
//! A thin client for an OpenAI-compatible image endpoint plus a prompt cache.
//! Generation runs behind the spend gate: a fresh image costs tokens, a cache
//! hit is served for free, and a provider failure costs nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use folio_billing::{Charged, Paid, SpendError, SpendGate};

use crate::config::Config;

/// Longest passage accepted for a prompt, in characters
pub const MAX_PASSAGE_CHARS: usize = 2000;

/// Longest style hint accepted, in characters
pub const MAX_STYLE_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ImageProviderError {
    #[error("Image provider is not configured")]
    NotConfigured,
    #[error("Image provider timed out")]
    Timeout,
    #[error("Image provider request failed: {0}")]
    Http(String),
    #[error("Image provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("Malformed image provider response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ImageProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ImageProviderError::Timeout
        } else {
            ImageProviderError::Http(err.to_string())
        }
    }
}

/// A generated (or cached) illustration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Illustration {
    pub image_url: String,
    pub provider: String,
    pub cached: bool,
}

/// Narrow contract for an image backend
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Short provider label stored alongside cached images
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, ImageProviderError>;
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

/// Client for `POST {base}/images/generations`
pub struct OpenAiImageClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiImageClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ImageProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImageProviderError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_url,
            api_key,
            model,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ImageProviderError> {
        Self::new(
            config.image_api_url.clone(),
            config.image_api_key.clone(),
            config.image_model.clone(),
            config.image_timeout,
        )
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, ImageProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ImageProviderError::NotConfigured)?;

        let response = self
            .http
            .post(format!("{}/images/generations", self.api_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
                "response_format": "url",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(http_status = %status, "Image provider request failed");
            return Err(ImageProviderError::Provider {
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let parsed: ImagesResponse = response
            .json()
            .await
            .map_err(|e| ImageProviderError::Malformed(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| ImageProviderError::Malformed("no image url in response".to_string()))
    }
}

/// Build the provider prompt for a passage
pub fn build_prompt(passage: &str, style: Option<&str>) -> String {
    let passage = passage.trim();
    match style.map(str::trim).filter(|s| !s.is_empty()) {
        Some(style) => format!(
            "Book illustration in {} style for the following passage: {}",
            style, passage
        ),
        None => format!("Book illustration for the following passage: {}", passage),
    }
}

/// Cache key for a prompt: hex SHA-256
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

/// Validate a generation request before anything is charged
pub fn validate_request(passage: &str, style: Option<&str>) -> Result<(), String> {
    let passage = passage.trim();
    if passage.is_empty() {
        return Err("passage is required".to_string());
    }
    if passage.chars().count() > MAX_PASSAGE_CHARS {
        return Err(format!("passage must be at most {} characters", MAX_PASSAGE_CHARS));
    }
    if style.is_some_and(|s| s.chars().count() > MAX_STYLE_CHARS) {
        return Err(format!("style must be at most {} characters", MAX_STYLE_CHARS));
    }
    Ok(())
}

/// Illustration service: cache + provider, metered through the spend gate
#[derive(Clone)]
pub struct IllustrationService {
    pool: PgPool,
    provider: Arc<dyn ImageProvider>,
    cost: i64,
}

impl IllustrationService {
    pub fn new(pool: PgPool, provider: Arc<dyn ImageProvider>, cost: i64) -> Self {
        Self {
            pool,
            provider,
            cost,
        }
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    async fn cached(&self, hash: &str) -> Option<Illustration> {
        let row: Result<Option<(String, String)>, sqlx::Error> = sqlx::query_as(
            "SELECT image_url, provider FROM illustration_cache WHERE prompt_hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.map(|(image_url, provider)| Illustration {
                image_url,
                provider,
                cached: true,
            }),
            Err(e) => {
                // Lookup failure falls through to a fresh render.
                tracing::warn!(error = %e, "Illustration cache lookup failed");
                None
            }
        }
    }

    async fn store(&self, hash: &str, illustration: &Illustration) {
        let result = sqlx::query(
            r#"
            INSERT INTO illustration_cache (prompt_hash, image_url, provider)
            VALUES ($1, $2, $3)
            ON CONFLICT (prompt_hash) DO NOTHING
            "#,
        )
        .bind(hash)
        .bind(&illustration.image_url)
        .bind(&illustration.provider)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to cache illustration");
        }
    }

    /// Generate an illustration for `device_id`, charging only for fresh images
    pub async fn generate(
        &self,
        spend_gate: &SpendGate,
        device_id: &str,
        passage: &str,
        style: Option<&str>,
    ) -> Result<Charged<Illustration>, SpendError<ImageProviderError>> {
        let prompt = build_prompt(passage, style);
        let hash = prompt_hash(&prompt);

        spend_gate
            .run(device_id, self.cost, "Illustration generation", || async {
                if let Some(hit) = self.cached(&hash).await {
                    tracing::debug!(prompt_hash = %hash, "Illustration cache hit");
                    return Ok(Paid::free(hit));
                }

                let image_url = match self.provider.generate(&prompt).await {
                    Ok(url) => url,
                    Err(e) => return Err(e),
                };
                let illustration = Illustration {
                    image_url,
                    provider: self.provider.name().to_string(),
                    cached: false,
                };
                self.store(&hash, &illustration).await;

                tracing::info!(prompt_hash = %hash, provider = %illustration.provider, "Illustration generated");
                Ok(Paid::charge(illustration))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: String, key: Option<&str>) -> OpenAiImageClient {
        OpenAiImageClient::new(
            url,
            key.map(str::to_string),
            "dall-e-3".to_string(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_returns_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/images/generations")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({ "model": "dall-e-3", "n": 1 })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"created": 1, "data": [{"url": "https://img.example/1.png"}]}"#)
            .create_async()
            .await;

        let url = client(server.url(), Some("sk-test"))
            .generate("a lighthouse at dusk")
            .await
            .unwrap();
        assert_eq!(url, "https://img.example/1.png");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/images/generations")
            .with_status(400)
            .with_body(r#"{"error": {"message": "content policy"}}"#)
            .create_async()
            .await;

        let err = client(server.url(), Some("sk-test"))
            .generate("prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, ImageProviderError::Provider { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_empty_data_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/images/generations")
            .with_status(200)
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;

        let err = client(server.url(), Some("sk-test"))
            .generate("prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, ImageProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let err = client("http://unused".to_string(), None)
            .generate("prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, ImageProviderError::NotConfigured));
    }

    #[test]
    fn test_prompt_and_hash() {
        let plain = build_prompt("  The sea was calm.  ", None);
        assert_eq!(plain, "Book illustration for the following passage: The sea was calm.");
        let styled = build_prompt("The sea was calm.", Some("watercolor"));
        assert!(styled.contains("watercolor style"));

        assert_eq!(prompt_hash(&plain), prompt_hash(&build_prompt("The sea was calm.", Some(" "))));
        assert_ne!(prompt_hash(&plain), prompt_hash(&styled));
        assert_eq!(prompt_hash("abc").len(), 64);
        assert_eq!(
            prompt_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request("text", None).is_ok());
        assert!(validate_request("   ", None).is_err());
        assert!(validate_request(&"a".repeat(MAX_PASSAGE_CHARS + 1), None).is_err());
        assert!(validate_request("text", Some(&"s".repeat(MAX_STYLE_CHARS + 1))).is_err());
    }
}
