use crate::error::{AppError, Result};
use crate::models::{DamageEstimate, RiskAssessment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Filter for [`AssessmentHistory::history`]. Pass the last sequence seen as
/// `after_sequence` to resume a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub after_sequence: Option<u64>,
    pub limit: Option<usize>,
}

impl HistoryRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn includes(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sequence: u64,
    pub assessment: RiskAssessment,
}

/// Persistence sink for assessments and damage estimates.
///
/// Implementations never update or delete: a repeated identity is rejected
/// with [`AppError::HistoryViolation`].
#[async_trait]
pub trait AssessmentHistory: Send + Sync {
    /// Append and return the append sequence.
    async fn append(&self, assessment: RiskAssessment) -> Result<u64>;

    /// Greatest `assessed_at`, ties broken by append sequence.
    async fn latest(&self, farm_id: &str) -> Result<Option<RiskAssessment>>;

    /// Oldest first by (`assessed_at`, sequence).
    async fn history(&self, farm_id: &str, range: &HistoryRange) -> Result<Vec<HistoryEntry>>;

    async fn append_damage(&self, estimate: DamageEstimate) -> Result<u64>;

    /// Oldest event first.
    async fn damage_history(&self, farm_id: &str) -> Result<Vec<DamageEstimate>>;
}

#[derive(Debug, Default)]
struct FarmLedger {
    /// Kept sorted by (assessed_at, sequence).
    assessments: Vec<HistoryEntry>,
    /// Kept sorted by event time.
    damage: Vec<DamageEstimate>,
    /// Assessment and estimate ids already recorded for this farm.
    ids: HashSet<Uuid>,
}

impl FarmLedger {
    fn claim_id(&mut self, id: Uuid, what: &str) -> Result<()> {
        if !self.ids.insert(id) {
            return Err(AppError::HistoryViolation(format!(
                "{} {} already recorded",
                what, id
            )));
        }
        Ok(())
    }
}

/// In-process ledger. Each farm has its own lock so appends for different
/// farms do not contend; the sequence counter is a lock-free atomic.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    farms: RwLock<HashMap<String, Arc<Mutex<FarmLedger>>>>,
    sequence: AtomicU64,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ledger(&self, farm_id: &str) -> Arc<Mutex<FarmLedger>> {
        if let Some(ledger) = self.farms.read().await.get(farm_id) {
            return ledger.clone();
        }
        self.farms
            .write()
            .await
            .entry(farm_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing(&self, farm_id: &str) -> Option<Arc<Mutex<FarmLedger>>> {
        self.farms.read().await.get(farm_id).cloned()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl AssessmentHistory for InMemoryHistory {
    async fn append(&self, assessment: RiskAssessment) -> Result<u64> {
        let ledger = self.ledger(&assessment.farm_id).await;
        let mut ledger = ledger.lock().await;
        ledger.claim_id(assessment.id, "assessment")?;
        let sequence = self.next_sequence();

        let key = (assessment.assessed_at, sequence);
        let pos = ledger
            .assessments
            .partition_point(|e| (e.assessment.assessed_at, e.sequence) < key);
        debug!(
            "Appending assessment {} for farm {} as #{}",
            assessment.id, assessment.farm_id, sequence
        );
        ledger.assessments.insert(
            pos,
            HistoryEntry {
                sequence,
                assessment,
            },
        );
        Ok(sequence)
    }

    async fn latest(&self, farm_id: &str) -> Result<Option<RiskAssessment>> {
        let Some(ledger) = self.existing(farm_id).await else {
            return Ok(None);
        };
        let ledger = ledger.lock().await;
        Ok(ledger.assessments.last().map(|e| e.assessment.clone()))
    }

    async fn history(&self, farm_id: &str, range: &HistoryRange) -> Result<Vec<HistoryEntry>> {
        let Some(ledger) = self.existing(farm_id).await else {
            return match range.after_sequence {
                Some(seq) => Err(AppError::NotFound(format!(
                    "sequence {} in history of farm {}",
                    seq, farm_id
                ))),
                None => Ok(Vec::new()),
            };
        };
        let ledger = ledger.lock().await;

        let start = match range.after_sequence {
            Some(seq) => {
                let pos = ledger
                    .assessments
                    .iter()
                    .position(|e| e.sequence == seq)
                    .ok_or_else(|| {
                        AppError::NotFound(format!(
                            "sequence {} in history of farm {}",
                            seq, farm_id
                        ))
                    })?;
                pos + 1
            }
            None => 0,
        };

        Ok(ledger.assessments[start..]
            .iter()
            .filter(|e| range.includes(e.assessment.assessed_at))
            .take(range.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn append_damage(&self, estimate: DamageEstimate) -> Result<u64> {
        let ledger = self.ledger(&estimate.farm_id).await;
        let mut ledger = ledger.lock().await;

        if ledger
            .damage
            .iter()
            .any(|d| d.event_time == estimate.event_time)
        {
            return Err(AppError::HistoryViolation(format!(
                "damage for farm {} at {} already recorded",
                estimate.farm_id, estimate.event_time
            )));
        }
        ledger.claim_id(estimate.id, "damage estimate")?;

        let pos = ledger
            .damage
            .partition_point(|d| d.event_time < estimate.event_time);
        ledger.damage.insert(pos, estimate);
        Ok(self.next_sequence())
    }

    async fn damage_history(&self, farm_id: &str) -> Result<Vec<DamageEstimate>> {
        let Some(ledger) = self.existing(farm_id).await else {
            return Ok(Vec::new());
        };
        let ledger = ledger.lock().await;
        Ok(ledger.damage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Peril, Period, Severity};
    use chrono::{Duration, NaiveDate, TimeZone};
    use geo::MultiPolygon;
    use std::collections::BTreeMap;

    fn assessment(farm: &str, at: DateTime<Utc>) -> RiskAssessment {
        RiskAssessment {
            id: Uuid::new_v4(),
            farm_id: farm.to_string(),
            assessed_at: at,
            model_version: "v1".to_string(),
            period: Period::new(
                NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            )
            .unwrap(),
            perils: BTreeMap::new(),
            unscored_perils: vec![],
            composite_score: 0.4,
            confidence: 1.0,
            exposure: 1000.0,
            premium: 100.0,
            feature_fingerprint: "abc".to_string(),
            recommendations: vec![],
        }
    }

    fn damage(farm: &str, event: DateTime<Utc>) -> DamageEstimate {
        DamageEstimate {
            id: Uuid::new_v4(),
            farm_id: farm.to_string(),
            peril: Peril::Hail,
            event_time: event,
            pre_timestamp: event - Duration::days(2),
            post_timestamp: event + Duration::days(2),
            affected_area: MultiPolygon::new(vec![]),
            affected_fraction: 0.0,
            coverage_fraction: 1.0,
            mean_delta: 0.0,
            severity: Severity::None,
            loss_fraction: 0.0,
            recommendations: vec![],
            created_at: event,
        }
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_latest_and_ordered_history() {
        let history = InMemoryHistory::new();
        let a1 = assessment("f1", t(1));
        let a2 = assessment("f1", t(2));
        history.append(a1.clone()).await.unwrap();
        history.append(a2.clone()).await.unwrap();

        assert_eq!(history.latest("f1").await.unwrap(), Some(a2.clone()));
        let entries = history
            .history("f1", &HistoryRange::between(t(1), t(2)))
            .await
            .unwrap();
        let ids: Vec<Uuid> = entries.iter().map(|e| e.assessment.id).collect();
        assert_eq!(ids, vec![a1.id, a2.id]);
    }

    #[tokio::test]
    async fn test_out_of_order_append_sorted_by_time() {
        let history = InMemoryHistory::new();
        let late = assessment("f1", t(5));
        let early = assessment("f1", t(3));
        history.append(late.clone()).await.unwrap();
        history.append(early.clone()).await.unwrap();

        assert_eq!(history.latest("f1").await.unwrap().unwrap().id, late.id);
        let entries = history.history("f1", &HistoryRange::all()).await.unwrap();
        assert_eq!(entries[0].assessment.id, early.id);
    }

    #[tokio::test]
    async fn test_same_timestamp_tie_broken_by_sequence() {
        let history = InMemoryHistory::new();
        let first = assessment("f1", t(1));
        let second = assessment("f1", t(1));
        history.append(first).await.unwrap();
        history.append(second.clone()).await.unwrap();
        assert_eq!(history.latest("f1").await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_reappend_rejected() {
        let history = InMemoryHistory::new();
        let a1 = assessment("f1", t(1));
        history.append(a1.clone()).await.unwrap();
        let err = history.append(a1).await.unwrap_err();
        assert!(matches!(err, AppError::HistoryViolation(_)));
        assert!(err.is_fatal());
        assert_eq!(history.history("f1", &HistoryRange::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_sequence() {
        let history = InMemoryHistory::new();
        for day in 1..=4 {
            history.append(assessment("f1", t(day))).await.unwrap();
        }
        let page = HistoryRange {
            limit: Some(2),
            ..HistoryRange::default()
        };
        let first = history.history("f1", &page).await.unwrap();
        assert_eq!(first.len(), 2);

        let next = HistoryRange {
            after_sequence: Some(first[1].sequence),
            ..page
        };
        let second = history.history("f1", &next).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].assessment.assessed_at, t(3));
    }

    #[tokio::test]
    async fn test_unknown_farm_is_empty() {
        let history = InMemoryHistory::new();
        assert_eq!(history.latest("nope").await.unwrap(), None);
        assert!(history
            .history("nope", &HistoryRange::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_one_damage_estimate_per_event() {
        let history = InMemoryHistory::new();
        history.append_damage(damage("f1", t(3))).await.unwrap();
        history.append_damage(damage("f1", t(1))).await.unwrap();
        let err = history.append_damage(damage("f1", t(3))).await.unwrap_err();
        assert!(matches!(err, AppError::HistoryViolation(_)));

        // Same event on another farm is fine.
        history.append_damage(damage("f2", t(3))).await.unwrap();

        let events: Vec<_> = history
            .damage_history("f1")
            .await
            .unwrap()
            .iter()
            .map(|d| d.event_time)
            .collect();
        assert_eq!(events, vec![t(1), t(3)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_totally_ordered() {
        let history = Arc::new(InMemoryHistory::new());

        let mut handles = Vec::new();
        for i in 0..32u32 {
            let history = Arc::clone(&history);
            handles.push(tokio::spawn(async move {
                // Pairs share an assessment time.
                let farm = if i % 4 == 3 { "f2" } else { "f1" };
                history.append(assessment(farm, t(1 + i / 2))).await.unwrap()
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap());
        }
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 32);

        let entries = history.history("f1", &HistoryRange::all()).await.unwrap();
        assert_eq!(entries.len(), 24);
        for pair in entries.windows(2) {
            let a = (pair[0].assessment.assessed_at, pair[0].sequence);
            let b = (pair[1].assessment.assessed_at, pair[1].sequence);
            assert!(a < b);
        }

        let latest = history.latest("f1").await.unwrap().unwrap();
        assert_eq!(latest.id, entries[entries.len() - 1].assessment.id);
        assert_eq!(
            history.history("f2", &HistoryRange::all()).await.unwrap().len(),
            8
        );
    }
}
