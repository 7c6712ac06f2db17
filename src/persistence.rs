//! Transactional reads and writes for avatars, content pieces, and job
//! records. No business logic lives here; every query is parameterized.
//! The `(batch_id, piece_index)` uniqueness key makes the orchestrator's
//! persistence stage idempotent under retry.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use log::{debug, info};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use crate::data_structures::{
    Avatar, BatchConfig, BatchResult, BatchState, ContentKind, ContentPiece, GenerationDefaults,
    SafetyRating, Tier,
};
use crate::errors::EngineError;

#[derive(Debug, Clone, Default)]
pub struct PieceFilters {
    pub tier: Option<Tier>,
    pub rating: Option<SafetyRating>,
    pub batch_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct PieceStats {
    pub total: usize,
    pub by_tier: std::collections::HashMap<String, usize>,
    pub by_rating: std::collections::HashMap<String, usize>,
    pub total_cost_usd: f64,
}

/// Durable job record for the asynchronous surface.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub avatar_id: String,
    pub config: BatchConfig,
    pub state: BatchState,
    pub progress_pct: u8,
    pub stage: Option<String>,
    pub error: Option<String>,
    pub result: Option<BatchResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let persistence = Persistence { pool };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same `:memory:` instance.
    pub async fn in_memory() -> Result<Self, EngineError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS avatars (
                id TEXT PRIMARY KEY,
                niche TEXT NOT NULL,
                base_prompt TEXT NOT NULL,
                negative_prompt TEXT NOT NULL,
                trigger_token TEXT NOT NULL,
                weights_uri TEXT,
                default_scale REAL NOT NULL,
                generation_config TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS content_pieces (
                id TEXT PRIMARY KEY,
                avatar_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                tier TEXT NOT NULL,
                url TEXT NOT NULL,
                caption TEXT,
                safety_rating TEXT,
                batch_id TEXT NOT NULL,
                piece_index INTEGER NOT NULL,
                generation_params TEXT NOT NULL,
                generation_cost_usd REAL NOT NULL,
                generation_time_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(batch_id, piece_index)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                avatar_id TEXT NOT NULL,
                config TEXT NOT NULL,
                state TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                stage TEXT,
                error TEXT,
                result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                lease_expires_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        debug!("Database schema ready");
        Ok(())
    }

    pub async fn get_avatar(&self, id: &str) -> Result<Option<Avatar>, EngineError> {
        let row = sqlx::query(
            "SELECT id, niche, base_prompt, negative_prompt, trigger_token,
                    weights_uri, default_scale, generation_config
             FROM avatars WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let config_json: String = row.get("generation_config");
                let default_generation_config: GenerationDefaults =
                    serde_json::from_str(&config_json)
                        .map_err(|e| EngineError::Persistence(e.to_string()))?;
                Ok(Some(Avatar {
                    id: row.get("id"),
                    niche: row.get("niche"),
                    base_prompt: row.get("base_prompt"),
                    negative_prompt: row.get("negative_prompt"),
                    trigger_token: row.get("trigger_token"),
                    weights_uri: row.get("weights_uri"),
                    default_scale: row.get("default_scale"),
                    default_generation_config,
                }))
            }
            None => Ok(None),
        }
    }

    /// Written by the training system in production; exposed here for
    /// seeding and tests.
    pub async fn upsert_avatar(&self, avatar: &Avatar) -> Result<(), EngineError> {
        let config_json = serde_json::to_string(&avatar.default_generation_config)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        sqlx::query(
            "INSERT INTO avatars (id, niche, base_prompt, negative_prompt, trigger_token,
                                  weights_uri, default_scale, generation_config)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                niche = excluded.niche,
                base_prompt = excluded.base_prompt,
                negative_prompt = excluded.negative_prompt,
                trigger_token = excluded.trigger_token,
                weights_uri = excluded.weights_uri,
                default_scale = excluded.default_scale,
                generation_config = excluded.generation_config",
        )
        .bind(&avatar.id)
        .bind(&avatar.niche)
        .bind(&avatar.base_prompt)
        .bind(&avatar.negative_prompt)
        .bind(&avatar.trigger_token)
        .bind(&avatar.weights_uri)
        .bind(avatar.default_scale)
        .bind(config_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a batch's surviving pieces in one transaction. Conflicting
    /// `(batch_id, piece_index)` rows are left untouched, so a replayed
    /// stage converges instead of duplicating.
    pub async fn insert_pieces(&self, pieces: &[ContentPiece]) -> Result<usize, EngineError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for piece in pieces {
            let params_json = serde_json::to_string(&piece.generation_params)
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            let result = sqlx::query(
                "INSERT INTO content_pieces
                    (id, avatar_id, kind, tier, url, caption, safety_rating, batch_id,
                     piece_index, generation_params, generation_cost_usd, generation_time_ms,
                     created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(batch_id, piece_index) DO NOTHING",
            )
            .bind(&piece.id)
            .bind(&piece.avatar_id)
            .bind(piece.kind.as_str())
            .bind(piece.tier.as_str())
            .bind(&piece.url)
            .bind(&piece.caption)
            .bind(piece.safety_rating.map(|r| r.as_str()))
            .bind(&piece.batch_id)
            .bind(piece.piece_index as i64)
            .bind(params_json)
            .bind(piece.generation_cost_usd)
            .bind(piece.generation_time_ms as i64)
            .bind(ts(&piece.created_at))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        info!("Persisted {} piece(s)", inserted);
        Ok(inserted)
    }

    pub async fn list_pieces_by_avatar(
        &self,
        avatar_id: &str,
        filters: &PieceFilters,
    ) -> Result<Vec<ContentPiece>, EngineError> {
        let mut sql = String::from(
            "SELECT id, avatar_id, kind, tier, url, caption, safety_rating, batch_id,
                    piece_index, generation_params, generation_cost_usd, generation_time_ms,
                    created_at
             FROM content_pieces WHERE avatar_id = ?",
        );
        if filters.tier.is_some() {
            sql.push_str(" AND tier = ?");
        }
        if filters.rating.is_some() {
            sql.push_str(" AND safety_rating = ?");
        }
        if filters.batch_id.is_some() {
            sql.push_str(" AND batch_id = ?");
        }
        sql.push_str(" ORDER BY batch_id, piece_index");
        if filters.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(avatar_id);
        if let Some(tier) = filters.tier {
            query = query.bind(tier.as_str());
        }
        if let Some(rating) = filters.rating {
            query = query.bind(rating.as_str());
        }
        if let Some(batch_id) = &filters.batch_id {
            query = query.bind(batch_id);
        }
        if let Some(limit) = filters.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| piece_from_row(&row)).collect()
    }

    pub async fn piece_stats(&self, avatar_id: &str) -> Result<PieceStats, EngineError> {
        let rows = sqlx::query(
            "SELECT tier, safety_rating, COUNT(*) AS n, SUM(generation_cost_usd) AS cost
             FROM content_pieces WHERE avatar_id = ?
             GROUP BY tier, safety_rating",
        )
        .bind(avatar_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = PieceStats::default();
        for row in rows {
            let tier: String = row.get("tier");
            let rating: Option<String> = row.get("safety_rating");
            let n: i64 = row.get("n");
            let cost: f64 = row.get::<Option<f64>, _>("cost").unwrap_or(0.0);
            stats.total += n as usize;
            *stats.by_tier.entry(tier).or_insert(0) += n as usize;
            if let Some(rating) = rating {
                *stats.by_rating.entry(rating).or_insert(0) += n as usize;
            }
            stats.total_cost_usd += cost;
        }
        Ok(stats)
    }

    // ---- job records ----

    pub async fn insert_job(&self, job: &JobRecord) -> Result<(), EngineError> {
        let config_json = serde_json::to_string(&job.config)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        sqlx::query(
            "INSERT INTO jobs (id, avatar_id, config, state, progress, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.avatar_id)
        .bind(config_json)
        .bind(job.state.as_str())
        .bind(job.progress_pct as i64)
        .bind(ts(&job.created_at))
        .bind(ts(&job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, EngineError> {
        let row = sqlx::query(
            "SELECT id, avatar_id, config, state, progress, stage, error, result,
                    created_at, updated_at
             FROM jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Pop the oldest queued job and mark it running under a lease. Returns
    /// `None` when the queue is empty.
    pub async fn claim_next_queued_job(
        &self,
        lease: std::time::Duration,
    ) -> Result<Option<JobRecord>, EngineError> {
        let now = Utc::now();
        let lease_expiry =
            now + ChronoDuration::seconds(lease.as_secs() as i64);
        let row = sqlx::query(
            "UPDATE jobs
             SET state = 'running', updated_at = ?, lease_expires_at = ?
             WHERE id = (SELECT id FROM jobs WHERE state = 'queued'
                         ORDER BY created_at LIMIT 1)
             RETURNING id, avatar_id, config, state, progress, stage, error, result,
                       created_at, updated_at",
        )
        .bind(ts(&now))
        .bind(ts(&lease_expiry))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    pub async fn update_job_progress(
        &self,
        id: &str,
        progress_pct: u8,
        stage: &str,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE jobs SET progress = ?, stage = ?, updated_at = ? WHERE id = ?")
            .bind(progress_pct as i64)
            .bind(stage)
            .bind(ts(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_job(
        &self,
        id: &str,
        state: BatchState,
        error: Option<&str>,
        result: Option<&BatchResult>,
    ) -> Result<(), EngineError> {
        let result_json = match result {
            Some(result) => Some(
                serde_json::to_string(result)
                    .map_err(|e| EngineError::Persistence(e.to_string()))?,
            ),
            None => None,
        };
        sqlx::query(
            "UPDATE jobs
             SET state = ?, error = ?, result = ?, progress = 100,
                 lease_expires_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(result_json)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put jobs whose worker died back on the queue. They re-run from
    /// scratch; blob paths and the piece uniqueness key make that converge.
    pub async fn reclaim_stale_jobs(&self) -> Result<u64, EngineError> {
        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'queued', lease_expires_at = NULL, updated_at = ?
             WHERE state = 'running' AND lease_expires_at IS NOT NULL
               AND lease_expires_at < ?",
        )
        .bind(ts(&Utc::now()))
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            info!("Reclaimed {} stale job(s)", reclaimed);
        }
        Ok(reclaimed)
    }

    pub async fn count_running_jobs(&self) -> Result<usize, EngineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE state IN ('queued', 'running')")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }
}


/// Fixed-precision timestamps so lexicographic comparison in SQL matches
/// chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn piece_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ContentPiece, EngineError> {
    let kind_str: String = row.get("kind");
    let tier_str: String = row.get("tier");
    let rating_str: Option<String> = row.get("safety_rating");
    let params_json: String = row.get("generation_params");
    let created_at_str: String = row.get("created_at");
    Ok(ContentPiece {
        id: row.get("id"),
        avatar_id: row.get("avatar_id"),
        kind: ContentKind::from_str(&kind_str)
            .ok_or_else(|| EngineError::Persistence(format!("bad kind '{}'", kind_str)))?,
        tier: Tier::from_str(&tier_str)
            .ok_or_else(|| EngineError::Persistence(format!("bad tier '{}'", tier_str)))?,
        url: row.get("url"),
        caption: row.get("caption"),
        safety_rating: match rating_str {
            Some(s) => Some(
                SafetyRating::from_str(&s)
                    .ok_or_else(|| EngineError::Persistence(format!("bad rating '{}'", s)))?,
            ),
            None => None,
        },
        batch_id: row.get("batch_id"),
        piece_index: row.get::<i64, _>("piece_index") as usize,
        generation_params: serde_json::from_str(&params_json)
            .map_err(|e| EngineError::Persistence(e.to_string()))?,
        generation_cost_usd: row.get("generation_cost_usd"),
        generation_time_ms: row.get::<i64, _>("generation_time_ms") as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .with_timezone(&Utc),
    })
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, EngineError> {
    let config_json: String = row.get("config");
    let state_str: String = row.get("state");
    let result_json: Option<String> = row.get("result");
    let created_at_str: String = row.get("created_at");
    let updated_at_str: String = row.get("updated_at");
    Ok(JobRecord {
        id: row.get("id"),
        avatar_id: row.get("avatar_id"),
        config: serde_json::from_str(&config_json)
            .map_err(|e| EngineError::Persistence(e.to_string()))?,
        state: BatchState::from_str(&state_str)
            .ok_or_else(|| EngineError::Persistence(format!("bad state '{}'", state_str)))?,
        progress_pct: row.get::<i64, _>("progress") as u8,
        stage: row.get("stage"),
        error: row.get("error"),
        result: match result_json {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| EngineError::Persistence(e.to_string()))?,
            ),
            None => None,
        },
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .with_timezone(&Utc),
    })
}
