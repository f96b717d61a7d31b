//! Embedding provider interface and the HTTP client used in production.
//!
//! The HTTP service is a small CLIP-style sidecar:
//!   POST {base}/embed/text  {"text": "..."}
//!   POST {base}/embed/image {"image": "<base64 jpeg>"}
//! both answering `{"embedding": [f32, ...]}`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::detector::BBox;
use crate::error::{truncate_body, ProviderError};
use crate::frame::Frame;
use crate::similarity::Embedding;

const PROVIDER: &str = "embedding";

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Embedding, ProviderError>;

    /// Embed the region `bbox` of `frame`.
    async fn embed_region(&self, frame: &Frame, bbox: &BBox) -> Result<Embedding, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    http:          Client,
    base_url:      String,
    region_max_px: u32,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, region_max_px: u32) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|source| ProviderError::Http { provider: PROVIDER, source })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            region_max_px,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<Embedding, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Embedding call → {}", url);

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Http { provider: PROVIDER, source })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status,
                body: truncate_body(&body),
            });
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed { provider: PROVIDER, detail: e.to_string() })?;

        if parsed.embedding.is_empty() {
            return Err(ProviderError::Malformed {
                provider: PROVIDER,
                detail: "empty embedding".into(),
            });
        }
        Ok(Embedding::new(parsed.embedding))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Embedding, ProviderError> {
        self.post("/embed/text", json!({ "text": text })).await
    }

    async fn embed_region(&self, frame: &Frame, bbox: &BBox) -> Result<Embedding, ProviderError> {
        let crop = frame
            .crop_jpeg(bbox, self.region_max_px)
            .ok_or_else(|| ProviderError::Input {
                provider: PROVIDER,
                detail: format!("no pixels for region {:?} in frame {}", bbox.to_tlwh(), frame.index),
            })?;
        self.post("/embed/image", json!({ "image": B64.encode(crop) })).await
    }
}
