use crate::config::DatabaseConfig;
use crate::db::models::{AssessmentRow, DamageRow};
use crate::error::{AppError, Result};
use crate::history::{AssessmentHistory, HistoryEntry, HistoryRange};
use crate::models::{DamageEstimate, RiskAssessment};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};

/// PostgreSQL-backed history. Rows are only ever inserted; the schema also
/// rejects UPDATE and DELETE.
pub struct PgHistory {
    pool: PgPool,
}

impl PgHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn sequence_exists(&self, farm_id: &str, seq: i64) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM risk_assessments WHERE farm_id = $1 AND seq = $2",
        )
        .bind(farm_id)
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }
}

fn to_sequence(seq: i64) -> Result<u64> {
    u64::try_from(seq).map_err(|_| AppError::InvalidData(format!("negative sequence {}", seq)))
}

fn to_db_sequence(seq: u64) -> Result<i64> {
    i64::try_from(seq).map_err(|_| AppError::InvalidData(format!("sequence {} out of range", seq)))
}

#[async_trait]
impl AssessmentHistory for PgHistory {
    async fn append(&self, assessment: RiskAssessment) -> Result<u64> {
        let seq = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO risk_assessments
                (id, farm_id, assessed_at, model_version, period_start, period_end,
                 composite_score, confidence, exposure, premium, feature_fingerprint, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(assessment.id)
        .bind(&assessment.farm_id)
        .bind(assessment.assessed_at)
        .bind(&assessment.model_version)
        .bind(assessment.period.start)
        .bind(assessment.period.end)
        .bind(assessment.composite_score)
        .bind(assessment.confidence)
        .bind(assessment.exposure)
        .bind(assessment.premium)
        .bind(&assessment.feature_fingerprint)
        .bind(Json(&assessment))
        .fetch_optional(&self.pool)
        .await?;

        let seq = seq.ok_or_else(|| {
            AppError::HistoryViolation(format!("assessment {} already recorded", assessment.id))
        })?;
        debug!(
            "Stored assessment {} for farm {} as #{}",
            assessment.id, assessment.farm_id, seq
        );
        to_sequence(seq)
    }

    async fn latest(&self, farm_id: &str) -> Result<Option<RiskAssessment>> {
        let row = sqlx::query_as::<_, AssessmentRow>(
            r#"
            SELECT seq, body FROM risk_assessments
            WHERE farm_id = $1
            ORDER BY assessed_at DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(farm_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.body.0))
    }

    async fn history(&self, farm_id: &str, range: &HistoryRange) -> Result<Vec<HistoryEntry>> {
        let mut query_builder =
            sqlx::QueryBuilder::new("SELECT seq, body FROM risk_assessments WHERE farm_id = ");
        query_builder.push_bind(farm_id);

        if let Some(from) = range.from {
            query_builder.push(" AND assessed_at >= ").push_bind(from);
        }
        if let Some(to) = range.to {
            query_builder.push(" AND assessed_at <= ").push_bind(to);
        }
        if let Some(after) = range.after_sequence {
            let after = to_db_sequence(after)?;
            if !self.sequence_exists(farm_id, after).await? {
                return Err(AppError::NotFound(format!(
                    "sequence {} in history of farm {}",
                    after, farm_id
                )));
            }
            query_builder
                .push(" AND (assessed_at, seq) > (SELECT assessed_at, seq FROM risk_assessments WHERE seq = ")
                .push_bind(after)
                .push(")");
        }

        query_builder.push(" ORDER BY assessed_at, seq");
        if let Some(limit) = range.limit {
            query_builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query_builder
            .build_query_as::<AssessmentRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(HistoryEntry {
                    sequence: to_sequence(row.seq)?,
                    assessment: row.body.0,
                })
            })
            .collect()
    }

    async fn append_damage(&self, estimate: DamageEstimate) -> Result<u64> {
        let seq = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO damage_estimates
                (id, farm_id, peril, event_time, severity, loss_fraction, coverage_fraction, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(estimate.id)
        .bind(&estimate.farm_id)
        .bind(estimate.peril.as_str())
        .bind(estimate.event_time)
        .bind(estimate.severity.as_str())
        .bind(estimate.loss_fraction)
        .bind(estimate.coverage_fraction)
        .bind(Json(&estimate))
        .fetch_optional(&self.pool)
        .await?;

        let seq = seq.ok_or_else(|| {
            AppError::HistoryViolation(format!(
                "damage for farm {} at {} already recorded",
                estimate.farm_id, estimate.event_time
            ))
        })?;
        to_sequence(seq)
    }

    async fn damage_history(&self, farm_id: &str) -> Result<Vec<DamageEstimate>> {
        let rows = sqlx::query_as::<_, DamageRow>(
            "SELECT seq, body FROM damage_estimates WHERE farm_id = $1 ORDER BY event_time, seq",
        )
        .bind(farm_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.body.0).collect())
    }
}
