use crate::models::{DamageEstimate, RiskAssessment};
use sqlx::types::Json;
use sqlx::FromRow;

/// A stored assessment with its append sequence.
#[derive(Debug, Clone, FromRow)]
pub struct AssessmentRow {
    pub seq: i64,
    pub body: Json<RiskAssessment>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DamageRow {
    pub seq: i64,
    pub body: Json<DamageEstimate>,
}
