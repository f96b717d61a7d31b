//! Scene store: persisted snapshots of narrated object-class sets.
//!
//! Two backends share the `SceneStore` trait:
//! - `HttpSceneStore` talks to the detections service (`/detections/`);
//! - `SqliteSceneStore` keeps the same records in a local SQLite file.
//!
//! Scenes are matched by exact class-set equality through `scene_key`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{StoreBackend, StoreConfig};
use crate::detector::Detection;
use crate::error::{truncate_body, PersistenceError};
use crate::frame::Frame;
use crate::tracker::TrackedEntity;

pub const SCENE_CLASS: &str = "scene";

/// Sorted, de-duplicated, comma-joined class names.
pub fn scene_key<I, S>(classes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = classes.into_iter().map(|c| c.as_ref().to_string()).collect();
    set.into_iter().collect::<Vec<_>>().join(",")
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneBox {
    pub x:      f32,
    pub y:      f32,
    pub width:  f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub class: String,
    pub bbox:  Vec<f32>,
}

/// Payload written for every narrated scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSummary {
    pub object_class: String,
    pub confidence:   f32,
    /// Scene dimensions.
    pub bbox:         SceneBox,
    #[serde(default)]
    pub objects:      Option<Vec<SceneObject>>,
    #[serde(rename = "gemini_analysis")]
    pub narration:    String,
}

impl SceneSummary {
    /// One object per tracked class; its box is the best detection of that
    /// class in `detections`, zeros when the class was not in this frame.
    pub fn from_entities(
        entities: &[TrackedEntity],
        detections: &[Detection],
        frame: &Frame,
        narration: &str,
    ) -> Self {
        let objects = entities
            .iter()
            .map(|e| {
                let bbox = detections
                    .iter()
                    .filter(|d| d.class == e.class)
                    .max_by(|a, b| a.score.total_cmp(&b.score))
                    .map(|d| d.bbox)
                    .unwrap_or_default();
                SceneObject { class: e.class.clone(), bbox: bbox.to_tlwh().to_vec() }
            })
            .collect();

        let confidence = entities.iter().map(|e| e.confidence).fold(0.0f32, f32::max);

        Self {
            object_class: SCENE_CLASS.to_string(),
            confidence,
            bbox: SceneBox {
                x: 0.0,
                y: 0.0,
                width: frame.width as f32,
                height: frame.height as f32,
            },
            objects: Some(objects),
            narration: narration.to_string(),
        }
    }

    pub fn object_classes(&self) -> Vec<String> {
        self.objects
            .iter()
            .flatten()
            .map(|o| o.class.clone())
            .collect()
    }
}

/// A stored scene as read back from a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneRecord {
    pub id:             Option<i64>,
    pub object_classes: Vec<String>,
    pub narration:      String,
    pub created_at:     Option<DateTime<Utc>>,
}

impl SceneRecord {
    pub fn key(&self) -> String {
        scene_key(&self.object_classes)
    }

    fn from_summary(summary: SceneSummary, id: Option<i64>, created_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            object_classes: summary.object_classes(),
            narration: summary.narration,
            created_at,
        }
    }
}

// ─── Store interface ─────────────────────────────────────────────────────────

#[async_trait]
pub trait SceneStore: Send + Sync {
    /// Persist a scene. Returns the new record id when the backend reports one.
    async fn record(&self, summary: &SceneSummary) -> Result<Option<i64>, PersistenceError>;

    /// Page through stored scenes in insertion order.
    async fn query(&self, skip: u32, limit: u32) -> Result<Vec<SceneRecord>, PersistenceError>;

    async fn update_narration(&self, id: i64, narration: &str) -> Result<(), PersistenceError>;

    /// First stored scene (within `limit`) whose class set equals `key`.
    async fn find_scene(&self, key: &str, limit: u32) -> Result<Option<SceneRecord>, PersistenceError> {
        Ok(self
            .query(0, limit)
            .await?
            .into_iter()
            .find(|r| r.key() == key))
    }
}

// ─── HTTP backend ────────────────────────────────────────────────────────────

pub struct HttpSceneStore {
    http:     Client,
    base_url: String,
}

impl HttpSceneStore {
    pub fn new(base_url: &str) -> Result<Self, PersistenceError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, PersistenceError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(PersistenceError::Status { status, body: truncate_body(&body) })
    }
}

#[async_trait]
impl SceneStore for HttpSceneStore {
    async fn record(&self, summary: &SceneSummary) -> Result<Option<i64>, PersistenceError> {
        let url = format!("{}/detections/", self.base_url);
        debug!("Scene store POST {}", url);
        let resp = self.http.post(&url).json(summary).send().await?;
        Self::check(resp).await?;
        // The service echoes the payload without an id.
        Ok(None)
    }

    async fn query(&self, skip: u32, limit: u32) -> Result<Vec<SceneRecord>, PersistenceError> {
        let url = format!("{}/detections/", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("skip", skip), ("limit", limit)])
            .send()
            .await?;
        let summaries: Vec<SceneSummary> = Self::check(resp).await?.json().await?;
        Ok(summaries
            .into_iter()
            .map(|s| SceneRecord::from_summary(s, None, None))
            .collect())
    }

    async fn update_narration(&self, id: i64, narration: &str) -> Result<(), PersistenceError> {
        let url = format!("{}/detections/{}/analysis", self.base_url, id);
        let resp = self
            .http
            .put(&url)
            .query(&[("analysis", narration)])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(PersistenceError::NotFound(id));
        }
        Self::check(resp).await?;
        Ok(())
    }
}

// ─── SQLite backend ──────────────────────────────────────────────────────────

pub struct SqliteSceneStore {
    conn: Mutex<Connection>,
}

impl SqliteSceneStore {
    /// Open (or create) the database. Bare file names resolve into the local
    /// data directory; `:memory:` opens a private in-memory database.
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(resolve_db_path(path))?
        };
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scenes (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp     TEXT    NOT NULL,
                object_class  TEXT    NOT NULL,
                confidence    REAL    NOT NULL,
                bbox          TEXT    NOT NULL,
                objects       TEXT,
                scene_key     TEXT    NOT NULL,
                narration     TEXT    NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scene_ts  ON scenes (timestamp);
            CREATE INDEX IF NOT EXISTS idx_scene_key ON scenes (scene_key);
        ",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    /// Number of stored scenes.
    pub fn count(&self) -> Result<u64, PersistenceError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM scenes", [], |row| row.get(0))?)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, objects, narration FROM scenes";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, Option<String>, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn to_record(
    (id, ts, objects, narration): (i64, String, Option<String>, String),
) -> Result<SceneRecord, PersistenceError> {
    let objects: Option<Vec<SceneObject>> = objects.map(|s| serde_json::from_str(&s)).transpose()?;
    let created_at = DateTime::parse_from_rfc3339(&ts)
        .map(|dt| dt.with_timezone(&Utc))
        .ok();
    Ok(SceneRecord {
        id: Some(id),
        object_classes: objects.into_iter().flatten().map(|o| o.class).collect(),
        narration,
        created_at,
    })
}

#[async_trait]
impl SceneStore for SqliteSceneStore {
    async fn record(&self, summary: &SceneSummary) -> Result<Option<i64>, PersistenceError> {
        let bbox = serde_json::to_string(&summary.bbox)?;
        let objects = summary.objects.as_ref().map(serde_json::to_string).transpose()?;
        let key = scene_key(summary.object_classes());

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scenes
             (timestamp, object_class, confidence, bbox, objects, scene_key, narration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().to_rfc3339(),
                summary.object_class,
                summary.confidence,
                bbox,
                objects,
                key,
                summary.narration,
            ],
        )?;
        Ok(Some(conn.last_insert_rowid()))
    }

    async fn query(&self, skip: u32, limit: u32) -> Result<Vec<SceneRecord>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id ASC LIMIT ?1 OFFSET ?2"))?;
        let rows = stmt.query_map(params![limit, skip], map_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(to_record(row?)?);
        }
        Ok(out)
    }

    async fn update_narration(&self, id: i64, narration: &str) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE scenes SET narration = ?1 WHERE id = ?2",
            params![narration, id],
        )?;
        if changed == 0 {
            return Err(PersistenceError::NotFound(id));
        }
        Ok(())
    }

    /// Indexed lookup instead of scanning a page.
    async fn find_scene(&self, key: &str, _limit: u32) -> Result<Option<SceneRecord>, PersistenceError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE scene_key = ?1 ORDER BY id ASC LIMIT 1"),
                params![key],
                map_row,
            )
            .optional()?;
        row.map(to_record).transpose()
    }
}

/// Open the backend selected in configuration.
pub fn open_store(cfg: &StoreConfig) -> Result<Arc<dyn SceneStore>, PersistenceError> {
    let store: Arc<dyn SceneStore> = match cfg.backend {
        StoreBackend::Sqlite => Arc::new(SqliteSceneStore::open(&cfg.path)?),
        StoreBackend::Http => Arc::new(HttpSceneStore::new(&cfg.base_url)?),
    };
    Ok(store)
}

/// Resolve bare DB filenames to the local app data directory.
fn resolve_db_path(db_path: &str) -> String {
    if Path::new(db_path).is_absolute() {
        return db_path.to_string();
    }
    if let Some(data_dir) = dirs::data_local_dir() {
        let full = data_dir.join("broxeen").join(db_path);
        if let Some(parent) = full.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return full.to_string_lossy().to_string();
    }
    db_path.to_string()
}
