use crate::config::{BatchConfig, Config, SpatialConfig};
use crate::damage::DamageDetector;
use crate::error::{AppError, Result};
use crate::fusion::{FeatureFuser, FusionInputs};
use crate::history::{AssessmentHistory, HistoryEntry, HistoryRange};
use crate::models::{
    DamageEstimate, EventWindow, FarmId, FarmRecord, FeatureVector, Peril, PerilScore, Period,
    RiskAssessment,
};
use crate::portfolio::{PortfolioAggregator, PortfolioSummary};
use crate::scoring::{
    risk_recommendations, CompositeRule, ModelRegistry, PremiumSchedule, ScoringModel,
};
use crate::sources::{FarmRegistry, ObservationSource};
use crate::spatial::SpatialIndex;
use chrono::{Duration, Utc};
use geo::Point;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-peril scores from one model over one feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSet {
    pub model_version: String,
    pub perils: BTreeMap<Peril, PerilScore>,
    /// Requested perils without a single usable factor.
    pub unscored: Vec<Peril>,
    pub composite: f64,
    /// Lowest coverage over the requested perils; unscored perils count as 0.
    pub confidence: f64,
}

/// Outcome of a batch run, one entry per requested farm in request order.
#[derive(Debug)]
pub struct BatchReport {
    pub results: Vec<(FarmId, Result<RiskAssessment>)>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct Engine {
    registry: Arc<dyn FarmRegistry>,
    source: Arc<dyn ObservationSource>,
    history: Arc<dyn AssessmentHistory>,
    index: RwLock<Arc<SpatialIndex>>,
    spatial: SpatialConfig,
    batch: BatchConfig,
    fuser: FeatureFuser,
    models: ModelRegistry,
    composite: CompositeRule,
    premium: PremiumSchedule,
    detector: DamageDetector,
    portfolio: PortfolioAggregator,
}

impl Engine {
    /// Build an engine with an empty spatial index; call
    /// [`Engine::rebuild_index`] before assessing.
    pub fn new(
        config: &Config,
        registry: Arc<dyn FarmRegistry>,
        source: Arc<dyn ObservationSource>,
        history: Arc<dyn AssessmentHistory>,
    ) -> Result<Self> {
        let models = ModelRegistry::new(
            &config.scoring.models,
            &config.scoring.active_version,
            config.scoring.min_feature_coverage,
        )?;
        let index = SpatialIndex::build(
            Vec::new(),
            Vec::new(),
            config.spatial.cell_size,
            config.spatial.metric,
        )?;

        Ok(Self {
            registry,
            source,
            history,
            index: RwLock::new(Arc::new(index)),
            spatial: config.spatial.clone(),
            batch: config.batch.clone(),
            fuser: FeatureFuser::new(config.fusion.clone()),
            models,
            composite: config.scoring.composite.clone(),
            premium: config.premium.clone(),
            detector: DamageDetector::new(config.damage.clone()),
            portfolio: PortfolioAggregator::new(config.portfolio.clone()),
        })
    }

    /// Build a new index from the registry and station list, then swap it in.
    /// Queries already running keep the index they started with.
    pub async fn rebuild_index(&self) -> Result<()> {
        let mut farms = Vec::new();
        for farm in self.registry.farms().await? {
            if farm.area.id() != farm.id {
                return Err(AppError::InvalidData(format!(
                    "farm '{}' has boundary '{}'",
                    farm.id,
                    farm.area.id()
                )));
            }
            farms.push(farm.area);
        }
        let stations = self.source.stations().await?;
        let cell_size = self.spatial.cell_size;
        let metric = self.spatial.metric;

        let index = tokio::task::spawn_blocking(move || {
            SpatialIndex::build(farms, stations, cell_size, metric)
        })
        .await??;

        info!(
            "Spatial index rebuilt: {} farms, {} stations",
            index.farm_count(),
            index.station_count()
        );
        *self.index.write().await = Arc::new(index);
        Ok(())
    }

    pub async fn index(&self) -> Arc<SpatialIndex> {
        self.index.read().await.clone()
    }

    /// Farm whose boundary strictly contains `point`.
    pub async fn locate_farm(&self, point: Point<f64>) -> Result<FarmId> {
        let index = self.index().await;
        index.resolve_containing(point).map(|area| area.id().to_string())
    }

    /// Every farm known to the registry.
    pub async fn farm_ids(&self) -> Result<Vec<FarmId>> {
        self.registry.farm_ids().await
    }

    pub fn model_registry(&self) -> &ModelRegistry {
        &self.models
    }

    /// Gather inputs, fuse features, score with the active model and append
    /// the assessment to history.
    pub async fn assess_farm(
        &self,
        farm_id: &str,
        period: Period,
        perils: &[Peril],
    ) -> Result<RiskAssessment> {
        let farm = self.registry.farm(farm_id).await?;
        let exposure = farm.insured_value;
        let features = self.fuse(farm, period).await?;
        let model = self.models.active()?;
        let scores = self.score_with(&model, &features, perils)?;

        let premium = self.premium.premium(scores.composite, exposure);
        let assessment = RiskAssessment {
            id: Uuid::new_v4(),
            farm_id: farm_id.to_string(),
            assessed_at: Utc::now(),
            model_version: scores.model_version,
            period,
            recommendations: risk_recommendations(&scores.perils, scores.composite),
            perils: scores.perils,
            unscored_perils: scores.unscored,
            composite_score: scores.composite,
            confidence: scores.confidence,
            exposure,
            premium,
            feature_fingerprint: features.fingerprint,
        };

        let sequence = self.history.append(assessment.clone()).await?;
        debug!(
            "Farm {} assessed: composite {:.3}, confidence {:.2}, premium {:.2} (#{})",
            farm_id, assessment.composite_score, assessment.confidence, assessment.premium, sequence
        );
        Ok(assessment)
    }

    /// Fused feature vector for a farm and period, without scoring.
    pub async fn build_features(&self, farm_id: &str, period: Period) -> Result<FeatureVector> {
        let farm = self.registry.farm(farm_id).await?;
        self.fuse(farm, period).await
    }

    async fn fuse(&self, farm: FarmRecord, period: Period) -> Result<FeatureVector> {
        let farm_id = farm.id.clone();
        let index = self.index().await;

        let stations = self.fuser.select_stations(&index, &farm);
        let station_ids: Vec<String> = stations.iter().map(|s| s.station_id.clone()).collect();
        let readings = self.source.station_series(&station_ids, &period).await?;
        let observations = self.source.index_observations(&farm_id, &period).await?;

        let mut baseline = Vec::new();
        for years_back in 1..=self.fuser.config().baseline_years {
            if let Some(window) = period.shifted_years(years_back as i32) {
                baseline.extend(self.source.index_observations(&farm_id, &window).await?);
            }
        }

        debug!(
            "Farm {}: {} stations, {} observations, {} baseline observations",
            farm_id,
            stations.len(),
            observations.len(),
            baseline.len()
        );

        let inputs = FusionInputs {
            stations,
            readings,
            observations,
            baseline,
        };
        let fuser = self.fuser.clone();
        tokio::task::spawn_blocking(move || fuser.build_features(&farm, period, &inputs)).await?
    }

    fn score_with(
        &self,
        model: &ScoringModel,
        features: &FeatureVector,
        perils: &[Peril],
    ) -> Result<ScoreSet> {
        let mut scored = BTreeMap::new();
        let mut unscored = Vec::new();

        for &peril in perils {
            if scored.contains_key(&peril) || unscored.contains(&peril) {
                continue;
            }
            match model.score(features, peril) {
                Ok(score) => {
                    if score.coverage < 1.0 {
                        debug!(
                            "Farm {} {}: excluded {:?}, coverage {:.2}",
                            features.farm_id, peril, score.excluded, score.coverage
                        );
                    }
                    scored.insert(peril, score);
                }
                Err(AppError::InsufficientData(reason)) => {
                    warn!("Farm {} {} not scored: {}", features.farm_id, peril, reason);
                    unscored.push(peril);
                }
                Err(e) => return Err(e),
            }
        }

        if scored.is_empty() {
            return Err(AppError::InsufficientData(format!(
                "farm {} has no usable features for {:?}",
                features.farm_id, perils
            )));
        }

        let confidence = if unscored.is_empty() {
            scored.values().map(|s| s.coverage).fold(1.0, f64::min)
        } else {
            0.0
        };

        Ok(ScoreSet {
            model_version: model.version().to_string(),
            composite: self.composite.combine(&scored),
            perils: scored,
            unscored,
            confidence,
        })
    }

    /// Rescore a stored feature vector against a named model version.
    pub fn reproduce(
        &self,
        features: &FeatureVector,
        perils: &[Peril],
        model_version: &str,
    ) -> Result<ScoreSet> {
        let model = self.models.get(model_version)?;
        self.score_with(&model, features, perils)
    }

    /// Assess many farms concurrently. Each farm succeeds or fails on its own;
    /// farms not yet started when `cancel` turns true report `Cancelled`.
    pub async fn assess_batch(
        self: &Arc<Self>,
        farm_ids: Vec<FarmId>,
        period: Period,
        perils: Vec<Peril>,
        cancel: watch::Receiver<bool>,
    ) -> BatchReport {
        info!(
            "Assessing {} farms over {} (concurrency {})",
            farm_ids.len(),
            period,
            self.batch.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.batch.max_concurrency));
        let perils: Arc<[Peril]> = perils.into();
        let mut handles = Vec::with_capacity(farm_ids.len());

        for farm_id in &farm_ids {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let perils = Arc::clone(&perils);
            let cancel = cancel.clone();
            let farm_id = farm_id.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Cancelled(format!("farm {}", farm_id)))?;
                if *cancel.borrow() {
                    return Err(AppError::Cancelled(format!("farm {}", farm_id)));
                }
                engine.assess_farm(&farm_id, period, &perils).await
            }));
        }

        let mut report = BatchReport {
            results: Vec::with_capacity(farm_ids.len()),
            succeeded: 0,
            failed: 0,
            cancelled: 0,
        };

        for (farm_id, handle) in farm_ids.into_iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(AppError::Task(e)),
            };
            match &result {
                Ok(_) => report.succeeded += 1,
                Err(AppError::Cancelled(_)) => report.cancelled += 1,
                Err(e) if e.is_fatal() => {
                    error!("Assessment of farm {} failed: {}", farm_id, e);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Farm {} not assessed: {}", farm_id, e);
                    report.failed += 1;
                }
            }
            report.results.push((farm_id, result));
        }

        info!(
            "Batch complete: {} assessed, {} failed, {} cancelled",
            report.succeeded, report.failed, report.cancelled
        );
        report
    }

    pub async fn get_latest_assessment(&self, farm_id: &str) -> Result<Option<RiskAssessment>> {
        self.history.latest(farm_id).await
    }

    pub async fn get_assessment_history(
        &self,
        farm_id: &str,
        range: &HistoryRange,
    ) -> Result<Vec<HistoryEntry>> {
        self.history.history(farm_id, range).await
    }

    pub async fn get_damage_history(&self, farm_id: &str) -> Result<Vec<DamageEstimate>> {
        self.history.damage_history(farm_id).await
    }

    /// Estimate damage from the last raster before the event and the first
    /// one at or after it, within the window, and record the estimate.
    pub async fn analyze_damage(
        &self,
        farm_id: &str,
        window: EventWindow,
    ) -> Result<DamageEstimate> {
        let farm = self.registry.farm(farm_id).await?;
        let event = window.event_time;

        let pre = self
            .source
            .rasters(farm_id, event - Duration::days(window.pre_days as i64), event)
            .await?
            .into_iter()
            .filter(|r| r.timestamp < event)
            .last()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "raster of farm {} within {} days before {}",
                    farm_id, window.pre_days, event
                ))
            })?;

        let post = self
            .source
            .rasters(farm_id, event, event + Duration::days(window.post_days as i64))
            .await?
            .into_iter()
            .find(|r| r.timestamp >= event)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "raster of farm {} within {} days after {}",
                    farm_id, window.post_days, event
                ))
            })?;

        let detector = self.detector.clone();
        let peril = window.peril;
        let estimate = tokio::task::spawn_blocking(move || {
            detector.detect(&farm, &pre, &post, event, peril)
        })
        .await??;

        self.history.append_damage(estimate.clone()).await?;
        info!(
            "Damage for farm {} ({} at {}): {} severity, loss {:.1}%",
            farm_id,
            peril,
            event,
            estimate.severity.as_str(),
            estimate.loss_fraction * 100.0
        );
        Ok(estimate)
    }

    pub async fn get_portfolio_summary(&self, farm_ids: &[FarmId]) -> Result<PortfolioSummary> {
        let mut latest = Vec::with_capacity(farm_ids.len());
        for farm_id in farm_ids {
            latest.push((farm_id.clone(), self.history.latest(farm_id).await?));
        }
        Ok(self.portfolio.summarize(&latest))
    }
}
