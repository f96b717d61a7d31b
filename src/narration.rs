//! Scene narration: throttled LLM descriptions of the tracked scene, with
//! recall of stored narrations when live narration is switched off.
//!
//! The narration channel is user-visible text: provider failures come back as
//! an error sentence instead of an `Err`, and store failures never block a
//! narration from reaching the caller.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::NarrationConfig;
use crate::detector::Detection;
use crate::error::{truncate_body, ProviderError};
use crate::frame::Frame;
use crate::store::{scene_key, SceneStore, SceneSummary};
use crate::tracker::TrackedEntity;

pub const DEFAULT_MIN_INTERVAL_MS: i64 = 5_000;
pub const DEFAULT_LOOKUP_LIMIT: u32 = 100;

// ─── Narrator interface ──────────────────────────────────────────────────────

#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, objects: &[TrackedEntity], frame: &Frame) -> Result<String, ProviderError>;

    fn label(&self) -> String {
        "narrator".to_string()
    }
}

// ─── LLM narrator (OpenAI-compatible chat completions) ──────────────────────

#[derive(Debug, Clone)]
pub enum LlmProvider {
    /// OpenRouter, https://openrouter.ai
    OpenRouter { api_key: String, model: String },
    /// Any local OpenAI-compatible server (Ollama, llama.cpp, LM Studio)
    Local { base_url: String, model: String },
}

impl LlmProvider {
    pub fn label(&self) -> String {
        match self {
            LlmProvider::OpenRouter { model, .. } => format!("OpenRouter/{}", model),
            LlmProvider::Local { model, .. } => format!("Local/{}", model),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model:       String,
    messages:    Vec<Message>,
    max_tokens:  u32,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role:    String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url:    String,
    detail: String,
}

pub struct LlmNarrator {
    http:       Client,
    primary:    Option<LlmProvider>,
    fallback:   Option<LlmProvider>,
    max_tokens: u32,
}

impl LlmNarrator {
    /// Primary = OpenRouter (if a key is set), fallback = local server (if configured).
    pub fn from_config(cfg: &NarrationConfig) -> Result<Self, ProviderError> {
        let primary = cfg
            .openrouter_api_key
            .as_ref()
            .filter(|k| !k.is_empty())
            .map(|key| LlmProvider::OpenRouter {
                api_key: key.clone(),
                model: cfg.openrouter_model.clone(),
            });
        let fallback = cfg
            .local_base_url
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|url| LlmProvider::Local {
                base_url: url.clone(),
                model: cfg.local_model.clone(),
            });

        if primary.is_none() && fallback.is_none() {
            return Err(ProviderError::Unavailable("narration"));
        }
        info!(
            "Narration primary: {}, fallback: {}",
            primary.as_ref().map(|p| p.label()).unwrap_or_else(|| "none".into()),
            fallback.as_ref().map(|p| p.label()).unwrap_or_else(|| "none".into()),
        );

        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|source| ProviderError::Http { provider: "narration", source })?;

        Ok(Self { http, primary, fallback, max_tokens: cfg.max_tokens })
    }

    async fn call_with_fallback(&self, messages: Vec<Message>) -> Result<String, ProviderError> {
        if let Some(ref primary) = self.primary {
            match self.call_provider(primary, messages.clone()).await {
                Ok(r) => return Ok(r),
                Err(e) => warn!("Primary narrator failed: {}, trying fallback", e),
            }
        }
        if let Some(ref fallback) = self.fallback {
            return self.call_provider(fallback, messages).await;
        }
        Err(ProviderError::Unavailable("narration"))
    }

    async fn call_provider(&self, provider: &LlmProvider, messages: Vec<Message>) -> Result<String, ProviderError> {
        let (url, model, auth) = match provider {
            LlmProvider::OpenRouter { api_key, model } => (
                "https://openrouter.ai/api/v1/chat/completions".to_string(),
                model.clone(),
                format!("Bearer {}", api_key),
            ),
            LlmProvider::Local { base_url, model } => (
                format!("{}/chat/completions", base_url.trim_end_matches('/')),
                model.clone(),
                "Bearer local".to_string(),
            ),
        };

        let body = ChatRequest { model, messages, max_tokens: self.max_tokens, temperature: 0.2 };
        debug!("Narration call → {}", url);

        let resp = self
            .http
            .post(&url)
            .header("Authorization", auth)
            .header("HTTP-Referer", "https://github.com/broxeen-scene")
            .header("X-Title", "Broxeen Scene")
            .json(&body)
            .send()
            .await
            .map_err(|source| ProviderError::Http { provider: "narration", source })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status { provider: "narration", status, body: truncate_body(&body) });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed { provider: "narration", detail: e.to_string() })?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Malformed {
                provider: "narration",
                detail: truncate_body(&json.to_string()),
            })
    }
}

/// Text block describing the tracked objects, sent alongside the frame.
pub fn describe_objects(objects: &[TrackedEntity]) -> String {
    let mut lines = vec![format!("Objects currently tracked ({}):", objects.len())];
    for e in objects {
        let state = if e.is_active() { "in view" } else { "recently left" };
        lines.push(format!(
            "  - {} ({}, {} frames in a row, {} total, confidence {:.0}%)",
            e.class,
            state,
            e.consecutive_frames,
            e.total_frames,
            e.confidence * 100.0
        ));
    }
    lines.join("\n")
}

#[async_trait]
impl Narrator for LlmNarrator {
    async fn narrate(&self, objects: &[TrackedEntity], frame: &Frame) -> Result<String, ProviderError> {
        let mut content = Vec::new();
        if frame.has_pixels() {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{}", B64.encode(&frame.jpeg)),
                    detail: "low".into(),
                },
            });
        }
        content.push(ContentPart::Text {
            text: format!(
                "{}\n\n\
                 Describe what is happening in this scene in 2-3 sentences.\n\
                 Mention the objects listed above and how they relate to each other.\n\
                 Present tense. No lists.",
                describe_objects(objects)
            ),
        });

        self.call_with_fallback(vec![Message { role: "user".into(), content }]).await
    }

    fn label(&self) -> String {
        self.primary
            .as_ref()
            .or(self.fallback.as_ref())
            .map(|p| p.label())
            .unwrap_or_else(|| "none".into())
    }
}

// ─── Narration cache ─────────────────────────────────────────────────────────

/// What one `maybe_narrate` call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum NarrationOutcome {
    /// Fresh narration from the provider.
    Narrated(String),
    /// Provider failed; the text explains why.
    Failed(String),
    /// Narration is off and a stored scene with the same class set was found.
    Recalled(String),
    /// Narration is on but the minimum interval has not elapsed.
    Throttled,
    /// Narration is off and nothing stored matches.
    NoMatch,
    /// Nothing tracked, nothing to describe.
    Skipped,
}

impl NarrationOutcome {
    /// User-visible text, if this outcome carries any.
    pub fn text(&self) -> Option<&str> {
        match self {
            NarrationOutcome::Narrated(t) | NarrationOutcome::Failed(t) | NarrationOutcome::Recalled(t) => Some(t),
            _ => None,
        }
    }
}

/// Live narration on or off.
#[derive(Clone)]
pub enum NarrationMode {
    Disabled,
    Enabled(Arc<dyn Narrator>),
}

/// Everything the narration stage needs from one frame.
#[derive(Debug, Clone)]
pub struct SceneSnapshot {
    pub entities:   Vec<TrackedEntity>,
    pub detections: Vec<Detection>,
    pub frame:      Frame,
}

pub struct SceneNarrationCache {
    mode:          NarrationMode,
    store:         Arc<dyn SceneStore>,
    min_interval:  Duration,
    lookup_limit:  u32,
    last_narrated: Option<DateTime<Utc>>,
}

impl SceneNarrationCache {
    pub fn new(mode: NarrationMode, store: Arc<dyn SceneStore>) -> Self {
        Self {
            mode,
            store,
            min_interval: Duration::milliseconds(DEFAULT_MIN_INTERVAL_MS),
            lookup_limit: DEFAULT_LOOKUP_LIMIT,
            last_narrated: None,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_lookup_limit(mut self, limit: u32) -> Self {
        self.lookup_limit = limit;
        self
    }

    pub fn last_narrated(&self) -> Option<DateTime<Utc>> {
        self.last_narrated
    }

    pub async fn maybe_narrate(&mut self, scene: &SceneSnapshot, now: DateTime<Utc>) -> NarrationOutcome {
        if scene.entities.is_empty() {
            return NarrationOutcome::Skipped;
        }

        let narrator = match &self.mode {
            NarrationMode::Disabled => return self.recall(&scene.entities).await,
            NarrationMode::Enabled(narrator) => Arc::clone(narrator),
        };

        if let Some(last) = self.last_narrated {
            if now - last < self.min_interval {
                return NarrationOutcome::Throttled;
            }
        }

        let text = match narrator.narrate(&scene.entities, &scene.frame).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Narration via {} failed: {}", narrator.label(), e);
                return NarrationOutcome::Failed(format!("Error analyzing scene: {}", e));
            }
        };

        self.last_narrated = Some(now);
        info!(
            "Scene narrated [{}]: {}",
            scene_key(scene.entities.iter().map(|e| &e.class)),
            text
        );

        let summary = SceneSummary::from_entities(&scene.entities, &scene.detections, &scene.frame, &text);
        match self.store.record(&summary).await {
            Ok(id) => debug!("Scene stored (id={:?})", id),
            Err(e) => warn!("Scene store write failed (narration still returned): {}", e),
        }

        NarrationOutcome::Narrated(text)
    }

    async fn recall(&self, entities: &[TrackedEntity]) -> NarrationOutcome {
        let key = scene_key(entities.iter().map(|e| &e.class));
        match self.store.find_scene(&key, self.lookup_limit).await {
            Ok(Some(record)) => {
                debug!("Recalled stored narration for [{}]", key);
                NarrationOutcome::Recalled(record.narration)
            }
            Ok(None) => NarrationOutcome::NoMatch,
            Err(e) => {
                warn!("Scene store lookup failed: {}", e);
                NarrationOutcome::NoMatch
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::store::{SceneObject, SceneRecord, SceneBox, SqliteSceneStore, SCENE_CLASS};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) struct MockNarrator {
        pub calls: AtomicUsize,
        pub fail:  AtomicBool,
    }

    impl MockNarrator {
        pub fn new() -> Self {
            Self { calls: AtomicUsize::new(0), fail: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl Narrator for MockNarrator {
        async fn narrate(&self, objects: &[TrackedEntity], _frame: &Frame) -> Result<String, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("narration"));
            }
            let classes: Vec<&str> = objects.iter().map(|e| e.class.as_str()).collect();
            Ok(format!("#{n}: {}", classes.join(" and ")))
        }
    }

    /// Store whose every call fails.
    pub(crate) struct BrokenStore;

    #[async_trait]
    impl SceneStore for BrokenStore {
        async fn record(&self, _s: &SceneSummary) -> Result<Option<i64>, PersistenceError> {
            Err(PersistenceError::Poisoned)
        }
        async fn query(&self, _skip: u32, _limit: u32) -> Result<Vec<SceneRecord>, PersistenceError> {
            Err(PersistenceError::Poisoned)
        }
        async fn update_narration(&self, id: i64, _n: &str) -> Result<(), PersistenceError> {
            Err(PersistenceError::NotFound(id))
        }
    }

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc)
            + Duration::milliseconds(ms)
    }

    pub(crate) fn entity(class: &str) -> TrackedEntity {
        TrackedEntity {
            class: class.into(),
            count: 3,
            confidence: 0.8,
            first_seen: t(0),
            last_seen: t(0),
            total_frames: 3,
            consecutive_frames: 3,
        }
    }

    fn scene(classes: &[&str]) -> SceneSnapshot {
        SceneSnapshot {
            entities: classes.iter().map(|c| entity(c)).collect(),
            detections: Vec::new(),
            frame: Frame::blank(0, t(0)),
        }
    }

    fn stored(classes: &[&str], narration: &str) -> SceneSummary {
        SceneSummary {
            object_class: SCENE_CLASS.into(),
            confidence: 1.0,
            bbox: SceneBox::default(),
            objects: Some(
                classes
                    .iter()
                    .map(|c| SceneObject { class: c.to_string(), bbox: vec![0.0; 4] })
                    .collect(),
            ),
            narration: narration.into(),
        }
    }

    #[tokio::test]
    async fn throttles_within_min_interval() {
        let narrator = Arc::new(MockNarrator::new());
        let store = Arc::new(SqliteSceneStore::open_in_memory().unwrap());
        let mut cache = SceneNarrationCache::new(NarrationMode::Enabled(narrator.clone()), store.clone());
        let s = scene(&["cup"]);

        assert_eq!(cache.maybe_narrate(&s, t(0)).await, NarrationOutcome::Narrated("#1: cup".into()));
        assert_eq!(cache.maybe_narrate(&s, t(3_000)).await, NarrationOutcome::Throttled);
        assert_eq!(cache.maybe_narrate(&s, t(5_001)).await, NarrationOutcome::Narrated("#2: cup".into()));
        assert_eq!(narrator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn provider_failure_returns_text_and_keeps_marker() {
        let narrator = Arc::new(MockNarrator::new());
        let store = Arc::new(SqliteSceneStore::open_in_memory().unwrap());
        let mut cache = SceneNarrationCache::new(NarrationMode::Enabled(narrator.clone()), store.clone());
        let s = scene(&["cup"]);

        assert!(matches!(cache.maybe_narrate(&s, t(0)).await, NarrationOutcome::Narrated(_)));

        narrator.fail.store(true, Ordering::SeqCst);
        let failed = cache.maybe_narrate(&s, t(6_000)).await;
        assert!(matches!(failed, NarrationOutcome::Failed(_)));
        assert!(failed.text().unwrap().starts_with("Error analyzing scene"));
        assert_eq!(cache.last_narrated(), Some(t(0)));

        // Retry on the very next tick, no fresh interval needed
        narrator.fail.store(false, Ordering::SeqCst);
        assert!(matches!(cache.maybe_narrate(&s, t(6_100)).await, NarrationOutcome::Narrated(_)));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn store_failure_still_returns_narration() {
        let narrator = Arc::new(MockNarrator::new());
        let mut cache = SceneNarrationCache::new(NarrationMode::Enabled(narrator), Arc::new(BrokenStore));
        let out = cache.maybe_narrate(&scene(&["dog"]), t(0)).await;
        assert_eq!(out, NarrationOutcome::Narrated("#1: dog".into()));
        assert_eq!(cache.last_narrated(), Some(t(0)));
    }

    #[tokio::test]
    async fn disabled_recalls_exact_class_set() {
        let store = Arc::new(SqliteSceneStore::open_in_memory().unwrap());
        store.record(&stored(&["person", "dog", "ball"], "playing fetch")).await.unwrap();
        store.record(&stored(&["dog", "person"], "walking the dog")).await.unwrap();
        let mut cache = SceneNarrationCache::new(NarrationMode::Disabled, store);

        assert_eq!(
            cache.maybe_narrate(&scene(&["person", "dog"]), t(0)).await,
            NarrationOutcome::Recalled("walking the dog".into())
        );
        // No throttling when disabled
        assert_eq!(
            cache.maybe_narrate(&scene(&["dog", "person"]), t(1)).await,
            NarrationOutcome::Recalled("walking the dog".into())
        );
        assert_eq!(cache.maybe_narrate(&scene(&["person"]), t(2)).await, NarrationOutcome::NoMatch);
    }

    #[tokio::test]
    async fn disabled_with_broken_store_is_no_match() {
        let mut cache = SceneNarrationCache::new(NarrationMode::Disabled, Arc::new(BrokenStore));
        assert_eq!(cache.maybe_narrate(&scene(&["cup"]), t(0)).await, NarrationOutcome::NoMatch);
    }

    #[tokio::test]
    async fn empty_scene_is_skipped() {
        let narrator = Arc::new(MockNarrator::new());
        let mut cache = SceneNarrationCache::new(
            NarrationMode::Enabled(narrator.clone()),
            Arc::new(SqliteSceneStore::open_in_memory().unwrap()),
        );
        assert_eq!(cache.maybe_narrate(&scene(&[]), t(0)).await, NarrationOutcome::Skipped);
        assert_eq!(narrator.calls.load(Ordering::SeqCst), 0);
        assert!(cache.last_narrated().is_none());
    }

    #[test]
    fn object_description_lists_state() {
        let mut gone = entity("cat");
        gone.consecutive_frames = 0;
        let text = describe_objects(&[entity("dog"), gone]);
        assert!(text.starts_with("Objects currently tracked (2):"));
        assert!(text.contains("dog (in view, 3 frames in a row, 3 total, confidence 80%)"));
        assert!(text.contains("cat (recently left"));
    }

    #[test]
    fn chat_request_shape() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![Message {
                role: "user".into(),
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: "data:image/jpeg;base64,AA==".into(), detail: "low".into() },
                    },
                    ContentPart::Text { text: "hi".into() },
                ],
            }],
            max_tokens: 10,
            temperature: 0.2,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["messages"][0]["content"][0]["type"], "image_url");
        assert_eq!(json["messages"][0]["content"][1]["type"], "text");
        assert_eq!(json["messages"][0]["content"][1]["text"], "hi");
    }
}
