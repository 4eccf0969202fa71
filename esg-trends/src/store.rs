//! Durable storage
//!
//! `SqliteStore` persists trend generations and source reliability scores.
//! Trend records are stored one row per `(subject_group, metric_name,
//! computed_at)` with the full record as JSON; `generation_at` groups the
//! rows of one published computed generation and `data_as_of` carries its
//! cache clock across restarts.

use crate::config::ReliabilityConfig;
use crate::fallback::Generation;
use crate::reliability::{ReliabilityScores, ReliabilityStore};
use crate::types::{Confidence, TrendRecord};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use esg_common::{Error, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Storage collaborator for computed trend generations
#[async_trait]
pub trait TrendArchive: Send + Sync {
    /// Store a computed generation; returns the number of records written
    async fn save_generation(&self, generation: &Generation) -> Result<usize>;

    /// Most recent computed generation, if any
    async fn latest_computed(&self) -> Result<Option<Generation>>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed archive and reliability table
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and its tables
    pub async fn open(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trend_generations (
                subject_group TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                computed_at INTEGER NOT NULL,
                generation_at INTEGER NOT NULL,
                data_as_of INTEGER NOT NULL,
                source TEXT NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (subject_group, metric_name, computed_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trend_generations_generation_at ON trend_generations(generation_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_reliability (
                source_id TEXT PRIMARY KEY,
                score REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert reliability scores in one transaction
    pub async fn save_reliability(&self, scores: &BTreeMap<String, Confidence>) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for (source_id, score) in scores {
            sqlx::query(
                "INSERT OR REPLACE INTO source_reliability (source_id, score, updated_at) VALUES (?, ?, ?)",
            )
            .bind(source_id)
            .bind(score)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Persisted {} reliability scores", scores.len());
        Ok(scores.len())
    }

    pub async fn load_reliability(&self) -> Result<BTreeMap<String, Confidence>> {
        let rows: Vec<(String, f64)> =
            sqlx::query_as("SELECT source_id, score FROM source_reliability")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl TrendArchive for SqliteStore {
    async fn save_generation(&self, generation: &Generation) -> Result<usize> {
        let generation_at = generation.computed_at.timestamp_millis();
        let data_as_of = generation.data_as_of.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for record in &generation.records {
            let json = serde_json::to_string(record)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO trend_generations
                    (subject_group, metric_name, computed_at, generation_at, data_as_of, source, record)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.subject_group)
            .bind(&record.metric_name)
            .bind(record.computed_at.timestamp_millis())
            .bind(generation_at)
            .bind(data_as_of)
            .bind(record.source.as_str())
            .bind(json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(generation.records.len())
    }

    async fn latest_computed(&self) -> Result<Option<Generation>> {
        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(generation_at) FROM trend_generations")
            .fetch_one(&self.pool)
            .await?;
        let Some(generation_at) = latest else {
            return Ok(None);
        };

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT record, data_as_of FROM trend_generations WHERE generation_at = ? ORDER BY subject_group, metric_name",
        )
        .bind(generation_at)
        .fetch_all(&self.pool)
        .await?;

        let data_as_of = rows.first().map_or(generation_at, |(_, millis)| *millis);
        let records = rows
            .into_iter()
            .map(|(json, _)| serde_json::from_str::<TrendRecord>(&json))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(Generation {
            computed_at: timestamp(generation_at)?,
            data_as_of: timestamp(data_as_of)?,
            records,
        }))
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Internal(format!("Invalid generation timestamp {}", millis)))
}

/// Reliability scores backed by the `source_reliability` table
pub struct SqliteReliabilityStore {
    scores: ReliabilityScores,
    store: SqliteStore,
}

impl SqliteReliabilityStore {
    pub fn new(config: &ReliabilityConfig, store: SqliteStore) -> Self {
        Self {
            scores: ReliabilityScores::new(config),
            store,
        }
    }
}

#[async_trait]
impl ReliabilityStore for SqliteReliabilityStore {
    fn get(&self, source_id: &str) -> Confidence {
        self.scores.get(source_id)
    }

    fn update(&self, source_id: &str, agreement_delta: f64) -> Confidence {
        self.scores.update(source_id, agreement_delta)
    }

    fn snapshot(&self) -> BTreeMap<String, Confidence> {
        self.scores.snapshot()
    }

    async fn load(&self) -> Result<usize> {
        let stored = self.store.load_reliability().await?;
        let count = self.scores.restore(stored);
        info!("Loaded {} source reliability scores", count);
        Ok(count)
    }

    async fn persist(&self) -> Result<usize> {
        self.store.save_reliability(&self.scores.snapshot()).await
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Archive kept in process memory
#[derive(Debug, Default)]
pub struct MemoryTrendArchive {
    generations: Mutex<Vec<Generation>>,
    fail_writes: AtomicBool,
}

impl MemoryTrendArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (exercises store-failure handling)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn generation_count(&self) -> usize {
        self.generations.lock().map(|g| g.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TrendArchive for MemoryTrendArchive {
    async fn save_generation(&self, generation: &Generation) -> Result<usize> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Error::Internal("archive write failed".to_string()));
        }
        let mut generations = self
            .generations
            .lock()
            .map_err(|_| Error::Internal("archive lock poisoned".to_string()))?;
        generations.push(generation.clone());
        Ok(generation.records.len())
    }

    async fn latest_computed(&self) -> Result<Option<Generation>> {
        let generations = self
            .generations
            .lock()
            .map_err(|_| Error::Internal("archive lock poisoned".to_string()))?;
        Ok(generations.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Stage, TrendSource};
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn record(group: &str, computed_at: DateTime<Utc>) -> TrendRecord {
        TrendRecord {
            subject_group: group.to_string(),
            metric_name: "environmental_score".to_string(),
            growth_rate: 0.8,
            strength: 72.5,
            stage: Stage::Act,
            data_quality_score: 0.85,
            computed_at,
            source: TrendSource::Computed,
            score: 61.0,
            trend_values: vec![60.0, 61.0, 62.0],
            data_points: 40,
            contributing_sources: BTreeSet::from(["msci".to_string()]),
        }
    }

    #[tokio::test]
    async fn test_empty_archive_has_no_generation() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.latest_computed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_generation_wins() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .save_generation(&Generation {
                computed_at: at(0),
                data_as_of: at(0),
                records: vec![record("Climate Tech", at(0)), record("Renewable Energy", at(0))],
            })
            .await
            .unwrap();
        store
            .save_generation(&Generation {
                computed_at: at(1),
                data_as_of: at(0),
                records: vec![record("Climate Tech", at(1))],
            })
            .await
            .unwrap();

        let latest = store.latest_computed().await.unwrap().unwrap();
        assert_eq!(latest.computed_at, at(1));
        assert_eq!(latest.data_as_of, at(0));
        assert_eq!(latest.records.len(), 1);
        assert_eq!(latest.records[0].subject_group, "Climate Tech");
        assert_eq!(latest.records[0].computed_at, at(1));
        assert_eq!(latest.records[0].stage, Stage::Act);
    }

    #[tokio::test]
    async fn test_reliability_roundtrip_through_store() {
        let store = SqliteStore::in_memory().await.unwrap();
        let config = ReliabilityConfig::default();

        let writer = SqliteReliabilityStore::new(&config, store.clone());
        writer.update("msci", 1.0);
        writer.update("scraper", 0.0);
        assert_eq!(writer.persist().await.unwrap(), 2);

        let reader = SqliteReliabilityStore::new(&config, store);
        assert_eq!(reader.get("msci"), 0.5);
        assert_eq!(reader.load().await.unwrap(), 2);
        assert!((reader.get("msci") - writer.get("msci")).abs() < 1e-12);
        assert!((reader.get("scraper") - writer.get("scraper")).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_memory_archive_failure_toggle() {
        let archive = MemoryTrendArchive::new();
        let generation = Generation {
            computed_at: at(0),
            data_as_of: at(0),
            records: vec![record("Climate Tech", at(0))],
        };
        archive.set_fail_writes(true);
        assert!(archive.save_generation(&generation).await.is_err());
        archive.set_fail_writes(false);
        assert_eq!(archive.save_generation(&generation).await.unwrap(), 1);
        assert_eq!(archive.generation_count(), 1);
    }
}
