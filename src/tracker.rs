//! Per-class entity tracker. Turns independent per-frame detections into
//! persistent entities with occupancy and decay.
//!
//! One slot per class name, not per instance. A class seen in consecutive
//! frames builds up a run; the run resets to zero the first frame the class is
//! missing, and the slot is evicted once the class has been gone for longer
//! than the absence window.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::detector::Detection;
use crate::error::ValidationError;

pub const DEFAULT_ABSENCE_WINDOW_MS: i64 = 10_000;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Derived lifecycle state of a retained entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Present in the latest update.
    Active,
    /// Missing from the latest update, still inside the absence window.
    RecentlyInactive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedEntity {
    pub class:              String,
    pub count:              u64,
    /// Running maximum of observed scores.
    pub confidence:         f32,
    pub first_seen:         DateTime<Utc>,
    pub last_seen:          DateTime<Utc>,
    pub total_frames:       u64,
    pub consecutive_frames: u64,
}

impl TrackedEntity {
    fn new(class: &str, now: DateTime<Utc>) -> Self {
        Self {
            class: class.to_string(),
            count: 0,
            confidence: 0.0,
            first_seen: now,
            last_seen: now,
            total_frames: 0,
            consecutive_frames: 0,
        }
    }

    pub fn state(&self) -> EntityState {
        if self.consecutive_frames > 0 {
            EntityState::Active
        } else {
            EntityState::RecentlyInactive
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == EntityState::Active
    }
}

/// Display order: active first, then longest current run, then highest
/// cumulative count, then class name.
pub fn display_order(a: &TrackedEntity, b: &TrackedEntity) -> Ordering {
    b.is_active()
        .cmp(&a.is_active())
        .then_with(|| b.consecutive_frames.cmp(&a.consecutive_frames))
        .then_with(|| b.count.cmp(&a.count))
        .then_with(|| a.class.cmp(&b.class))
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

pub struct EntityTracker {
    entities:       HashMap<String, TrackedEntity>,
    absence_window: Duration,
    last_update:    Option<DateTime<Utc>>,
}

impl Default for EntityTracker {
    fn default() -> Self {
        Self::new(Duration::milliseconds(DEFAULT_ABSENCE_WINDOW_MS))
    }
}

impl EntityTracker {
    pub fn new(absence_window: Duration) -> Self {
        Self {
            entities: HashMap::new(),
            absence_window,
            last_update: None,
        }
    }

    /// Apply one frame's detections at time `now` and return the ordered
    /// snapshot. Input is validated before any state changes.
    pub fn update(
        &mut self,
        detections: &[Detection],
        now: DateTime<Utc>,
    ) -> Result<Vec<TrackedEntity>, ValidationError> {
        if let Some(previous) = self.last_update {
            if now < previous {
                return Err(ValidationError::ClockWentBackwards { now, previous });
            }
        }

        // Max score per class present in this frame
        let mut present: HashMap<&str, f32> = HashMap::new();
        for det in detections {
            if det.class.is_empty() {
                return Err(ValidationError::EmptyClass);
            }
            if !det.score.is_finite() || !(0.0..=1.0).contains(&det.score) {
                return Err(ValidationError::InvalidScore {
                    class: det.class.clone(),
                    score: det.score,
                });
            }
            let best = present.entry(det.class.as_str()).or_insert(det.score);
            *best = best.max(det.score);
        }

        // ── 1. Refresh classes seen this frame ───────────────────────────
        for (&class, &score) in &present {
            let entity = self
                .entities
                .entry(class.to_string())
                .or_insert_with(|| TrackedEntity::new(class, now));
            entity.count += 1;
            entity.total_frames += 1;
            entity.consecutive_frames += 1;
            entity.last_seen = now;
            entity.confidence = entity.confidence.max(score);
        }

        // ── 2. Break runs of missing classes and evict stale ones ────────
        let window = self.absence_window;
        self.entities.retain(|class, entity| {
            if present.contains_key(class.as_str()) {
                return true;
            }
            entity.consecutive_frames = 0;
            let expired = now - entity.last_seen > window && entity.consecutive_frames == 0;
            if expired {
                debug!("Entity '{}' evicted (count={})", class, entity.count);
            }
            !expired
        });

        self.last_update = Some(now);
        Ok(self.snapshot())
    }

    /// Current entities in display order.
    pub fn snapshot(&self) -> Vec<TrackedEntity> {
        let mut out: Vec<TrackedEntity> = self.entities.values().cloned().collect();
        out.sort_by(display_order);
        out
    }

    pub fn get(&self, class: &str) -> Option<&TrackedEntity> {
        self.entities.get(class)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Classes of every retained entity, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.entities.keys().cloned().collect();
        classes.sort();
        classes
    }
}
