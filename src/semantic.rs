//! Open-vocabulary semantic filter.
//!
//! A detection passes when its region embedding is close enough to a free-text
//! prompt. The prompt embedding is the mean over a handful of phrasings and is
//! cached for the life of the matcher. When the detector's own class label is
//! already a strong match for the prompt the threshold is relaxed.
//!
//! Embedding failures fail closed: the detection is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::detector::Detection;
use crate::embedding::Embedder;
use crate::error::{ProviderError, ValidationError};
use crate::frame::Frame;
use crate::similarity::{self, Embedding};

pub const DEFAULT_RELAX_ABOVE: f32 = 0.8;
pub const DEFAULT_RELAX_FACTOR: f32 = 0.8;

#[derive(Debug, Error)]
pub enum SemanticError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Breakdown of a single match decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchVerdict {
    pub similarity:          f32,
    pub class_similarity:    f32,
    pub effective_threshold: f32,
    pub passed:              bool,
}

/// Phrasings averaged into one prompt embedding. Order kept, duplicates dropped.
pub fn prompt_variants(prompt: &str) -> Vec<String> {
    let candidates = [
        prompt.to_string(),
        format!("a photo of {prompt}"),
        format!("an image of {prompt}"),
        prompt.to_lowercase(),
        capitalize(prompt),
    ];
    let mut out: Vec<String> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ─── Matcher ─────────────────────────────────────────────────────────────────

pub struct SemanticMatcher {
    embedder:     Arc<dyn Embedder>,
    prompt_cache: Mutex<HashMap<String, Arc<OnceCell<Embedding>>>>,
    relax_above:  f32,
    relax_factor: f32,
}

impl SemanticMatcher {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_relaxation(embedder, DEFAULT_RELAX_ABOVE, DEFAULT_RELAX_FACTOR)
    }

    pub fn with_relaxation(embedder: Arc<dyn Embedder>, relax_above: f32, relax_factor: f32) -> Self {
        Self {
            embedder,
            prompt_cache: Mutex::new(HashMap::new()),
            relax_above,
            relax_factor,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Threshold actually applied, given how close the class label is to the prompt.
    pub fn effective_threshold(&self, class_similarity: f32, threshold: f32) -> f32 {
        if class_similarity > self.relax_above {
            threshold * self.relax_factor
        } else {
            threshold
        }
    }

    /// Averaged prompt embedding, computed at most once per literal prompt.
    pub async fn prompt_embedding(&self, prompt: &str) -> Result<Embedding, SemanticError> {
        let cell = self
            .prompt_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(prompt.to_string())
            .or_default()
            .clone();
        let embedding = cell
            .get_or_try_init(|| self.compute_prompt_embedding(prompt))
            .await?;
        Ok(embedding.clone())
    }

    async fn compute_prompt_embedding(&self, prompt: &str) -> Result<Embedding, SemanticError> {
        let variants = prompt_variants(prompt);
        let mut vectors = Vec::with_capacity(variants.len());
        for variant in &variants {
            vectors.push(self.embedder.embed_text(variant).await?);
        }
        debug!("Prompt '{}' embedded from {} variants", prompt, variants.len());
        Ok(similarity::mean_embedding(&vectors)?)
    }

    /// Full decision with its intermediate scores.
    pub async fn evaluate(
        &self,
        region: &Embedding,
        prompt: &str,
        class_label: &str,
        threshold: f32,
    ) -> Result<MatchVerdict, SemanticError> {
        let prompt_emb = self.prompt_embedding(prompt).await?;
        let similarity = similarity::score(region, &prompt_emb)?;

        let class_similarity = match self.embedder.embed_text(class_label).await {
            Ok(label_emb) => similarity::score(&label_emb, &prompt_emb).unwrap_or(0.0),
            Err(e) => {
                debug!("Class label '{}' embedding failed: {}", class_label, e);
                0.0
            }
        };

        let effective_threshold = self.effective_threshold(class_similarity, threshold);
        Ok(MatchVerdict {
            similarity,
            class_similarity,
            effective_threshold,
            passed: similarity > effective_threshold,
        })
    }

    /// Pass/fail. An empty prompt always matches; any failure does not.
    pub async fn matches(
        &self,
        region: &Embedding,
        prompt: &str,
        class_label: &str,
        threshold: f32,
    ) -> bool {
        if prompt.trim().is_empty() {
            return true;
        }
        match self.evaluate(region, prompt, class_label, threshold).await {
            Ok(verdict) => verdict.passed,
            Err(e) => {
                warn!("Semantic match for '{}' failed, excluding: {}", class_label, e);
                false
            }
        }
    }
}

// ─── Filter stage ────────────────────────────────────────────────────────────

/// The semantic stage as a pipeline strategy: off, or on with a prompt.
pub enum SemanticFilter {
    Disabled,
    Enabled {
        matcher:   Arc<SemanticMatcher>,
        prompt:    String,
        threshold: f32,
    },
}

impl SemanticFilter {
    pub fn is_enabled(&self) -> bool {
        matches!(self, SemanticFilter::Enabled { .. })
    }

    /// Keep matching detections, sorted by descending score.
    pub async fn apply(&self, detections: Vec<Detection>, frame: &Frame) -> Vec<Detection> {
        let (matcher, prompt, threshold) = match self {
            SemanticFilter::Disabled => return detections,
            SemanticFilter::Enabled { matcher, prompt, threshold } => (matcher, prompt, *threshold),
        };

        let mut kept = if prompt.trim().is_empty() {
            detections
        } else {
            let mut kept = Vec::with_capacity(detections.len());
            for det in detections {
                let region = match matcher.embedder().embed_region(frame, &det.bbox).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Region embedding for '{}' failed, excluding: {}", det.class, e);
                        continue;
                    }
                };
                if matcher.matches(&region, prompt, &det.class, threshold).await {
                    kept.push(det);
                }
            }
            kept
        };

        kept.sort_by(|a, b| b.score.total_cmp(&a.score));
        kept
    }
}
