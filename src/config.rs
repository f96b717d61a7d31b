/// Scene pipeline configuration
///
/// Loaded from broxeen.toml (working directory) with env-var overrides.
/// Env format: BROXEEN__SECTION__KEY (double underscore separators).

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub camera:    CameraConfig,
    #[serde(default)]
    pub detector:  DetectorConfig,
    #[serde(default)]
    pub semantic:  SemanticConfig,
    #[serde(default)]
    pub tracker:   TrackerConfig,
    #[serde(default)]
    pub narration: NarrationConfig,
    #[serde(default)]
    pub store:     StoreConfig,
    #[serde(default)]
    pub logging:   LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_id")]
    pub camera_id: String,
}

fn default_camera_id() -> String {
    "cam0".to_string()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { camera_id: default_camera_id() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// Enabled classes; empty enables every class.
    #[serde(default)]
    pub categories:      Vec<String>,
}

fn default_score_threshold() -> f32 {
    0.5
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { score_threshold: default_score_threshold(), categories: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SemanticConfig {
    #[serde(default)]
    pub enabled:       bool,
    #[serde(default)]
    pub prompt:        String,
    #[serde(default = "default_semantic_threshold")]
    pub threshold:     f32,
    #[serde(default = "default_relax_above")]
    pub relax_above:   f32,
    #[serde(default = "default_relax_factor")]
    pub relax_factor:  f32,
    #[serde(default = "default_embed_url")]
    pub embed_url:     String,
    #[serde(default = "default_region_max_px")]
    pub region_max_px: u32,
}

fn default_semantic_threshold() -> f32 {
    0.5
}
fn default_relax_above() -> f32 {
    crate::semantic::DEFAULT_RELAX_ABOVE
}
fn default_relax_factor() -> f32 {
    crate::semantic::DEFAULT_RELAX_FACTOR
}
fn default_embed_url() -> String {
    "http://localhost:8001".to_string()
}
fn default_region_max_px() -> u32 {
    224
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prompt: String::new(),
            threshold: default_semantic_threshold(),
            relax_above: default_relax_above(),
            relax_factor: default_relax_factor(),
            embed_url: default_embed_url(),
            region_max_px: default_region_max_px(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_absence_window_ms")]
    pub absence_window_ms: i64,
}

fn default_absence_window_ms() -> i64 {
    crate::tracker::DEFAULT_ABSENCE_WINDOW_MS
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { absence_window_ms: default_absence_window_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NarrationConfig {
    #[serde(default)]
    pub enabled:            bool,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms:    i64,
    pub openrouter_api_key: Option<String>,
    #[serde(default = "default_openrouter_model")]
    pub openrouter_model:   String,
    /// OpenAI-compatible local server, e.g. http://localhost:11434/v1
    pub local_base_url:     Option<String>,
    #[serde(default = "default_local_model")]
    pub local_model:        String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens:         u32,
}

fn default_min_interval_ms() -> i64 {
    crate::narration::DEFAULT_MIN_INTERVAL_MS
}
fn default_openrouter_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}
fn default_local_model() -> String {
    "llava:7b".to_string()
}
fn default_max_tokens() -> u32 {
    300
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_ms: default_min_interval_ms(),
            openrouter_api_key: None,
            openrouter_model: default_openrouter_model(),
            local_base_url: None,
            local_model: default_local_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend:     StoreBackend,
    #[serde(default = "default_db_path")]
    pub path:        String,
    #[serde(default = "default_base_url")]
    pub base_url:    String,
    #[serde(default = "default_query_limit")]
    pub query_limit: u32,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}
fn default_db_path() -> String {
    "scenes.db".to_string()
}
fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_query_limit() -> u32 {
    crate::narration::DEFAULT_LOOKUP_LIMIT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
            base_url: default_base_url(),
            query_limit: default_query_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive; RUST_LOG wins when set.
    #[serde(default = "default_log_level")]
    pub level:     String,
    /// Directory for rotated files. Defaults to <data_dir>/broxeen/logs.
    pub dir:       Option<String>,
    #[serde(default = "default_log_file")]
    pub file_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "scene.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), dir: None, file_name: default_log_file() }
    }
}

/// Load configuration from broxeen.toml + environment variable overrides.
///
/// Search order:
///   1. ./broxeen.toml (working directory)
///   2. Environment variables: BROXEEN__NARRATION__ENABLED, etc.
///   3. OPENROUTER_API_KEY when no narration key was configured
pub fn load_config() -> Result<AppConfig, config::ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name("broxeen").required(false))
        .add_source(
            config::Environment::with_prefix("BROXEEN")
                .separator("__")
                .try_parsing(true),
        );

    let mut app: AppConfig = builder.build()?.try_deserialize()?;

    if app.narration.openrouter_api_key.is_none() {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            app.narration.openrouter_api_key = Some(key);
        }
    }

    Ok(app)
}

pub fn default_config() -> AppConfig {
    AppConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(text: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = from_toml("");
        assert_eq!(cfg.camera.camera_id, "cam0");
        assert_eq!(cfg.detector.score_threshold, 0.5);
        assert!(cfg.detector.categories.is_empty());
        assert!(!cfg.semantic.enabled);
        assert_eq!(cfg.semantic.relax_above, 0.8);
        assert_eq!(cfg.tracker.absence_window_ms, 10_000);
        assert_eq!(cfg.narration.min_interval_ms, 5_000);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.store.query_limit, 100);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.file_name, "scene.log");
        assert!(cfg.logging.dir.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = from_toml(
            r#"
            [detector]
            score_threshold = 0.7
            categories = ["person", "dog"]

            [semantic]
            enabled = true
            prompt = "red car"

            [store]
            backend = "http"
            base_url = "http://db:8000"

            [logging]
            level = "broxeen_scene=debug"
            dir = "/var/log/broxeen"
            "#,
        );
        assert_eq!(cfg.detector.score_threshold, 0.7);
        assert_eq!(cfg.detector.categories, vec!["person", "dog"]);
        assert!(cfg.semantic.enabled);
        assert_eq!(cfg.semantic.prompt, "red car");
        assert_eq!(cfg.semantic.threshold, 0.5);
        assert_eq!(cfg.store.backend, StoreBackend::Http);
        assert_eq!(cfg.store.base_url, "http://db:8000");
        assert_eq!(cfg.store.path, "scenes.db");
        assert_eq!(cfg.logging.level, "broxeen_scene=debug");
        assert_eq!(cfg.logging.dir.as_deref(), Some("/var/log/broxeen"));
        assert_eq!(cfg.logging.file_name, "scene.log");
    }
}
