//! Namespaced vector index over sqlite-vec. One namespace per app; each row
//! is a tool descriptor with its embedded `"<toolName>: <description>"`
//! vector.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

/// Upserts are chunked into batches of this size.
pub const UPSERT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
    pub metadata: serde_json::Value,
    pub vector: Option<Vec<f32>>,
}

#[derive(Clone)]
pub struct VectorIndex {
    db: Arc<Mutex<Connection>>,
}

/// Initialize sqlite-vec extension. Must be called before Connection::open().
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

impl VectorIndex {
    pub fn open(path: &str) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::bootstrap(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tools (
                id         TEXT PRIMARY KEY,
                namespace  TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                embedding  TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tools_namespace ON tools(namespace);
            "#,
        )?;
        Ok(())
    }

    /// Create (or recreate on dimension change) the cosine KNN table.
    pub fn ensure_index(&self, dimensions: usize) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

        let current_dims: Option<String> = db
            .query_row(
                "SELECT value FROM meta WHERE key = 'vec_dimensions'",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let needs_recreate = match current_dims {
            Some(d) => d.parse::<usize>().unwrap_or(0) != dimensions,
            None => true,
        };

        if needs_recreate {
            db.execute_batch("DROP TABLE IF EXISTS tools_vec;")?;
            db.execute_batch(&format!(
                "CREATE VIRTUAL TABLE tools_vec USING vec0(tool_id TEXT PRIMARY KEY, embedding float[{dimensions}] distance_metric=cosine);"
            ))?;
            db.execute(
                "INSERT INTO meta(key, value) VALUES('vec_dimensions', ?1) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![dimensions.to_string()],
            )?;
            tracing::info!("created tools_vec virtual table with {dimensions} dimensions");
        }

        Ok(())
    }

    /// Idempotent upsert into a namespace, chunked into batches of
    /// [`UPSERT_BATCH_SIZE`].
    pub async fn upsert(&self, namespace: &str, entries: Vec<VectorEntry>) -> Result<usize> {
        let mut total = 0;
        for batch in entries.chunks(UPSERT_BATCH_SIZE) {
            total += self.upsert_batch(namespace, batch.to_vec()).await?;
        }
        Ok(total)
    }

    async fn upsert_batch(&self, namespace: &str, batch: Vec<VectorEntry>) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let namespace = namespace.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let has_vec_table = vec_table_exists(&conn);
            let tx = conn.unchecked_transaction()?;
            let now = chrono::Utc::now().to_rfc3339();
            let count = batch.len();
            for entry in batch {
                let embedding_json = embedding_to_json(&entry.vector);
                tx.execute(
                    r#"
                    INSERT INTO tools (id, namespace, metadata, embedding, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        namespace = excluded.namespace,
                        metadata = excluded.metadata,
                        embedding = excluded.embedding,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        entry.id,
                        namespace,
                        serde_json::to_string(&entry.metadata)?,
                        embedding_json,
                        now,
                    ],
                )?;
                if has_vec_table {
                    tx.execute(
                        "DELETE FROM tools_vec WHERE tool_id = ?1",
                        params![entry.id],
                    )?;
                    tx.execute(
                        "INSERT INTO tools_vec (tool_id, embedding) VALUES (?1, ?2)",
                        params![entry.id, embedding_to_json(&entry.vector)],
                    )?;
                }
            }
            tx.commit()?;
            Ok::<usize, anyhow::Error>(count)
        })
        .await?
    }

    /// Cosine KNN within a namespace. Over-fetches candidates because the
    /// vec table is not namespace-aware, then filters and truncates.
    pub async fn query(
        &self,
        namespace: &str,
        vector: Vec<f32>,
        top_k: usize,
        include_vector: bool,
    ) -> Result<Vec<VectorHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let db = Arc::clone(&self.db);
        let namespace = namespace.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            if vec_table_exists(&conn) {
                knn_query(&conn, &namespace, &vector, top_k, include_vector)
            } else {
                scan_query(&conn, &namespace, &vector, top_k, include_vector)
            }
        })
        .await?
    }
}

fn vec_table_exists(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='tools_vec'",
        [],
        |r| r.get(0),
    )
    .unwrap_or(false)
}

fn knn_query(
    conn: &Connection,
    namespace: &str,
    vector: &[f32],
    top_k: usize,
    include_vector: bool,
) -> Result<Vec<VectorHit>> {
    // Candidate pool is larger than top_k so namespace filtering still
    // leaves enough rows.
    let candidate_limit = top_k.saturating_mul(4).max(top_k);
    let query_json = embedding_to_json(vector);

    let mut stmt = conn.prepare(
        r#"
        SELECT v.tool_id, t.namespace, t.metadata, t.embedding, v.distance
        FROM tools_vec v
        JOIN tools t ON t.id = v.tool_id
        WHERE v.embedding MATCH ?1 AND k = ?2
        ORDER BY v.distance
        "#,
    )?;
    let rows = stmt.query_map(params![query_json, candidate_limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, f64>(4)?,
        ))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, row_namespace, metadata, embedding, distance) = row?;
        if row_namespace != namespace {
            continue;
        }
        hits.push(VectorHit {
            id,
            score: (1.0_f64 - distance).max(0.0_f64),
            metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            vector: include_vector.then(|| embedding_from_json(&embedding)),
        });
        if hits.len() >= top_k {
            break;
        }
    }
    Ok(hits)
}

/// Full-scan cosine fallback for when the virtual table is unavailable.
fn scan_query(
    conn: &Connection,
    namespace: &str,
    vector: &[f32],
    top_k: usize,
    include_vector: bool,
) -> Result<Vec<VectorHit>> {
    let mut stmt =
        conn.prepare("SELECT id, metadata, embedding FROM tools WHERE namespace = ?1")?;
    let rows = stmt.query_map(params![namespace], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut hits = Vec::new();
    for row in rows {
        let (id, metadata, embedding_raw) = row?;
        let embedding = embedding_from_json(&embedding_raw);
        let score = cosine_similarity(vector, &embedding) as f64;
        hits.push(VectorHit {
            id,
            score,
            metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            vector: include_vector.then_some(embedding),
        });
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    Ok(hits)
}

fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string())
}

fn embedding_from_json(raw: &str) -> Vec<f32> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vector: Vec<f32>) -> VectorEntry {
        VectorEntry {
            id: id.to_string(),
            vector,
            metadata: serde_json::json!({"toolName": id}),
        }
    }

    #[tokio::test]
    async fn upsert_and_query_same_namespace() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.ensure_index(3).unwrap();
        index
            .upsert(
                "GMAIL",
                vec![
                    entry("GMAIL_SEND_EMAIL", vec![1.0, 0.0, 0.0]),
                    entry("GMAIL_FETCH_EMAILS", vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .query("GMAIL", vec![1.0, 0.0, 0.0], 1, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "GMAIL_SEND_EMAIL");
        assert!(hits[0].score > 0.9);
        assert!(hits[0].vector.is_none());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.ensure_index(3).unwrap();
        index
            .upsert("GMAIL", vec![entry("GMAIL_SEND_EMAIL", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(
                "NOTION",
                vec![entry("NOTION_CREATE_PAGE", vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap();

        let hits = index
            .query("NOTION", vec![1.0, 0.0, 0.0], 10, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "NOTION_CREATE_PAGE");
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.ensure_index(3).unwrap();
        let entries = vec![
            entry("A", vec![1.0, 0.0, 0.0]),
            entry("B", vec![0.0, 1.0, 0.0]),
        ];
        index.upsert("APP", entries.clone()).await.unwrap();
        index.upsert("APP", entries).await.unwrap();

        let hits = index
            .query("APP", vec![1.0, 0.0, 0.0], 10, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata["toolName"], "A");
    }

    #[tokio::test]
    async fn query_respects_top_k() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.ensure_index(3).unwrap();
        let entries: Vec<VectorEntry> = (0..10)
            .map(|i| entry(&format!("tool{i}"), vec![1.0, i as f32 * 0.1, 0.0]))
            .collect();
        index.upsert("APP", entries).await.unwrap();

        let hits = index
            .query("APP", vec![1.0, 0.0, 0.0], 5, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[tokio::test]
    async fn include_vector_returns_embedding() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.ensure_index(3).unwrap();
        index
            .upsert("APP", vec![entry("A", vec![0.5, 0.5, 0.0])])
            .await
            .unwrap();
        let hits = index
            .query("APP", vec![0.5, 0.5, 0.0], 1, true)
            .await
            .unwrap();
        assert_eq!(hits[0].vector.as_deref(), Some(&[0.5, 0.5, 0.0][..]));
    }

    #[tokio::test]
    async fn scan_fallback_without_vec_table() {
        // ensure_index never called: only the plain tools table exists.
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .upsert(
                "APP",
                vec![
                    entry("NEAR", vec![1.0, 0.0, 0.0]),
                    entry("FAR", vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        let hits = index
            .query("APP", vec![1.0, 0.1, 0.0], 1, false)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "NEAR");
    }

    #[tokio::test]
    async fn ensure_index_recreates_on_dimension_change() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.ensure_index(3).unwrap();
        index.ensure_index(3).unwrap();
        index.ensure_index(4).unwrap();
        // The old 3-dim rows are gone from the vec table but a fresh upsert
        // at 4 dims works.
        index
            .upsert("APP", vec![entry("A", vec![1.0, 0.0, 0.0, 0.0])])
            .await
            .unwrap();
        let hits = index
            .query("APP", vec![1.0, 0.0, 0.0, 0.0], 1, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }
}
