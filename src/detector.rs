//! Detector interface, the per-frame `Detection` type and the category filter.
//!
//! The model itself lives outside this crate. `ReplayDetector` feeds recorded
//! detections back through the pipeline, one JSON line per frame.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::frame::Frame;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Bounding box in pixels, top-left origin (TLWH).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x:      f32,
    pub y:      f32,
    pub width:  f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn to_tlwh(&self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        b.to_tlwh()
    }
}

/// One raw detection. No identity across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub score: f32,
    pub bbox:  BBox,
}

impl Detection {
    pub fn new(class: impl Into<String>, score: f32, bbox: BBox) -> Self {
        Self { class: class.into(), score, bbox }
    }
}

// ─── Detector interface ──────────────────────────────────────────────────────

/// Any object detection backend.
#[async_trait]
pub trait ObjectDetector: Send {
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ProviderError>;
}

// ─── Category filter ─────────────────────────────────────────────────────────

/// Score threshold plus an optional allow-list of classes.
#[derive(Debug, Clone)]
pub struct CategoryFilter {
    score_threshold: f32,
    /// Empty = every class enabled.
    enabled: HashSet<String>,
}

impl CategoryFilter {
    pub fn new<I, S>(score_threshold: f32, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            score_threshold,
            enabled: categories.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, det: &Detection) -> bool {
        det.score >= self.score_threshold
            && (self.enabled.is_empty() || self.enabled.contains(&det.class))
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections.into_iter().filter(|d| self.allows(d)).collect()
    }
}

// ─── Replay detector ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Plays back recorded detections. Each call to `detect` consumes one frame;
/// once exhausted every further frame is empty.
pub struct ReplayDetector {
    frames: VecDeque<Vec<Detection>>,
}

impl ReplayDetector {
    pub fn new(frames: Vec<Vec<Detection>>) -> Self {
        Self { frames: frames.into() }
    }

    /// Parse JSON Lines: `{"detections":[{"class":"cup","score":0.9,"bbox":[x,y,w,h]}]}`.
    /// Blank lines are empty frames.
    pub fn from_jsonl(text: &str) -> Result<Self, ProviderError> {
        let mut frames = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                frames.push(Vec::new());
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(line).map_err(|e| ProviderError::Input {
                provider: "replay",
                detail: format!("line {}: {}", n + 1, e),
            })?;
            frames.push(parsed.detections);
        }
        Ok(Self::new(frames))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ProviderError::Input {
            provider: "replay",
            detail: format!("{}: {}", path.display(), e),
        })?;
        Self::from_jsonl(&text)
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl ObjectDetector for ReplayDetector {
    async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, ProviderError> {
        Ok(self.frames.pop_front().unwrap_or_default())
    }
}
