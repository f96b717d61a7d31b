//! Streaming scene understanding on top of an object detector: category and
//! prompt filtering, per-class entity tracking and throttled scene narration.

pub mod config;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod frame;
pub mod logging;
pub mod narration;
pub mod pipeline;
pub mod semantic;
pub mod similarity;
pub mod store;
pub mod tracker;

pub use detector::{BBox, CategoryFilter, Detection, ObjectDetector, ReplayDetector};
pub use embedding::{Embedder, HttpEmbedder};
pub use error::{PersistenceError, PipelineError, ProviderError, ValidationError};
pub use frame::{Frame, FrameSource, PacedFrames};
pub use narration::{LlmNarrator, NarrationMode, NarrationOutcome, Narrator, SceneNarrationCache, SceneSnapshot};
pub use pipeline::{DetectionPipeline, FrameReport, NarrationReport, PipelineHandle, PipelineStats};
pub use semantic::{SemanticFilter, SemanticMatcher};
pub use similarity::Embedding;
pub use store::{HttpSceneStore, SceneRecord, SceneStore, SceneSummary, SqliteSceneStore};
pub use tracker::{EntityTracker, TrackedEntity};
