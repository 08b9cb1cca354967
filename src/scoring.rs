use crate::error::{AppError, Result};
use crate::models::{Feature, FeatureVector, Peril, PerilScore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maps one feature to a deviation in [0, 1] between a neutral and a
/// saturation value. A peril score is the weighted mean of the deviations of
/// the factors whose feature is present with enough coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub feature: Feature,
    /// Value at which the factor contributes nothing.
    pub neutral: f64,
    /// Value at which the factor contributes fully. May be below `neutral`
    /// when lower values are riskier.
    pub saturation: f64,
    pub weight: f64,
}

impl FactorSpec {
    pub fn new(feature: Feature, neutral: f64, saturation: f64, weight: f64) -> Self {
        Self {
            feature,
            neutral,
            saturation,
            weight,
        }
    }

    pub fn deviation(&self, value: f64) -> f64 {
        let span = self.saturation - self.neutral;
        if span == 0.0 {
            return if value >= self.saturation { 1.0 } else { 0.0 };
        }
        ((value - self.neutral) / span).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    RuleBased,
    Logistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub bias: f64,
    pub steepness: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            bias: 0.5,
            steepness: 6.0,
        }
    }
}

/// Configured description of one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub version: String,
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub logistic: LogisticParams,
    #[serde(default = "default_factors")]
    pub perils: BTreeMap<Peril, Vec<FactorSpec>>,
}

/// Built-in factor table.
pub fn default_factors() -> BTreeMap<Peril, Vec<FactorSpec>> {
    use Feature::*;
    let mut perils = BTreeMap::new();
    perils.insert(
        Peril::Drought,
        vec![
            FactorSpec::new(PrecipitationDailyMean, 2.5, 0.2, 0.30),
            FactorSpec::new(TemperatureMax, 30.0, 40.0, 0.20),
            FactorSpec::new(SoilMoistureMean, 0.25, 0.05, 0.20),
            FactorSpec::new(VegetationTrend, 0.0, -0.005, 0.15),
            FactorSpec::new(VegetationAnomaly, 0.0, -0.2, 0.15),
        ],
    );
    perils.insert(
        Peril::Flood,
        vec![
            FactorSpec::new(PrecipitationMaxDaily, 25.0, 100.0, 0.30),
            FactorSpec::new(PrecipitationDailyMean, 5.0, 15.0, 0.20),
            FactorSpec::new(SlopePercent, 5.0, 0.0, 0.15),
            FactorSpec::new(ElevationM, 500.0, 0.0, 0.15),
            FactorSpec::new(SoilDrainage, 0.3, 1.0, 0.20),
        ],
    );
    perils.insert(
        Peril::Pestilence,
        vec![
            FactorSpec::new(TemperatureMean, 20.0, 30.0, 0.30),
            FactorSpec::new(HumidityMean, 60.0, 90.0, 0.30),
            FactorSpec::new(ClaimFrequency, 0.0, 0.5, 0.20),
            FactorSpec::new(VegetationAnomaly, 0.0, -0.15, 0.20),
        ],
    );
    perils.insert(
        Peril::Hail,
        vec![
            FactorSpec::new(WindMax, 10.0, 30.0, 0.40),
            FactorSpec::new(TemperatureMax, 25.0, 35.0, 0.30),
            FactorSpec::new(PrecipitationMaxDaily, 15.0, 60.0, 0.30),
        ],
    );
    perils.insert(
        Peril::Frost,
        vec![
            FactorSpec::new(TemperatureMin, 4.0, -4.0, 0.70),
            FactorSpec::new(ElevationM, 500.0, 2000.0, 0.30),
        ],
    );
    perils
}

/// Weighted sum of normalised factor deviations.
#[derive(Debug, Clone)]
pub struct RuleBasedModel {
    version: String,
    perils: BTreeMap<Peril, Vec<FactorSpec>>,
    min_feature_coverage: f64,
}

impl RuleBasedModel {
    pub fn new(
        version: impl Into<String>,
        perils: BTreeMap<Peril, Vec<FactorSpec>>,
        min_feature_coverage: f64,
    ) -> Self {
        Self {
            version: version.into(),
            perils,
            min_feature_coverage,
        }
    }

    pub fn score(&self, features: &FeatureVector, peril: Peril) -> Result<PerilScore> {
        let factors = self.perils.get(&peril).filter(|f| !f.is_empty()).ok_or_else(|| {
            AppError::InsufficientData(format!(
                "model {} has no factors for {}",
                self.version, peril
            ))
        })?;

        let total_weight: f64 = factors.iter().map(|f| f.weight).sum();
        let mut sub_scores = BTreeMap::new();
        let mut excluded = Vec::new();
        let mut weighted = 0.0;
        let mut included_weight = 0.0;
        let mut covered_weight = 0.0;

        for factor in factors {
            let fv = features.get(factor.feature);
            match fv.value {
                Some(value) if fv.coverage >= self.min_feature_coverage && value.is_finite() => {
                    let deviation = factor.deviation(value);
                    sub_scores.insert(factor.feature, deviation);
                    weighted += factor.weight * deviation;
                    included_weight += factor.weight;
                    covered_weight += factor.weight * fv.coverage;
                }
                _ => excluded.push(factor.feature),
            }
        }

        if included_weight <= 0.0 {
            return Err(AppError::InsufficientData(format!(
                "no {} factor of farm {} has coverage >= {}",
                peril, features.farm_id, self.min_feature_coverage
            )));
        }

        let coverage = if total_weight > 0.0 {
            covered_weight / total_weight
        } else {
            0.0
        };

        Ok(PerilScore {
            score: (weighted / included_weight).clamp(0.0, 1.0),
            sub_scores,
            excluded,
            coverage: coverage.clamp(0.0, 1.0),
            model_version: self.version.clone(),
        })
    }
}

/// Logistic calibration on top of the rule-based score.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    base: RuleBasedModel,
    params: LogisticParams,
}

impl LogisticModel {
    pub fn new(base: RuleBasedModel, params: LogisticParams) -> Self {
        Self { base, params }
    }

    pub fn score(&self, features: &FeatureVector, peril: Peril) -> Result<PerilScore> {
        let mut scored = self.base.score(features, peril)?;
        scored.score = self.calibrate(scored.score);
        Ok(scored)
    }

    /// Sigmoid rescaled so that 0 maps to 0 and 1 maps to 1.
    fn calibrate(&self, x: f64) -> f64 {
        let sigmoid = |v: f64| 1.0 / (1.0 + (-self.params.steepness * (v - self.params.bias)).exp());
        let lo = sigmoid(0.0);
        let hi = sigmoid(1.0);
        if hi - lo <= f64::EPSILON {
            return x;
        }
        ((sigmoid(x) - lo) / (hi - lo)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub enum ScoringModel {
    RuleBased(RuleBasedModel),
    Logistic(LogisticModel),
}

impl ScoringModel {
    pub fn from_spec(spec: &ModelSpec, min_feature_coverage: f64) -> Self {
        let base = RuleBasedModel::new(spec.version.clone(), spec.perils.clone(), min_feature_coverage);
        match spec.kind {
            ModelKind::RuleBased => ScoringModel::RuleBased(base),
            ModelKind::Logistic => ScoringModel::Logistic(LogisticModel::new(base, spec.logistic.clone())),
        }
    }

    pub fn version(&self) -> &str {
        match self {
            ScoringModel::RuleBased(m) => &m.version,
            ScoringModel::Logistic(m) => &m.base.version,
        }
    }

    pub fn score(&self, features: &FeatureVector, peril: Peril) -> Result<PerilScore> {
        match self {
            ScoringModel::RuleBased(m) => m.score(features, peril),
            ScoringModel::Logistic(m) => m.score(features, peril),
        }
    }
}

/// Every configured model version, one of them active.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    active: String,
    models: BTreeMap<String, Arc<ScoringModel>>,
}

impl ModelRegistry {
    pub fn new(specs: &[ModelSpec], active: &str, min_feature_coverage: f64) -> Result<Self> {
        let mut models = BTreeMap::new();
        for spec in specs {
            let model = Arc::new(ScoringModel::from_spec(spec, min_feature_coverage));
            if models.insert(spec.version.clone(), model).is_some() {
                return Err(AppError::Config(format!(
                    "model version '{}' configured twice",
                    spec.version
                )));
            }
        }
        let registry = Self {
            active: active.to_string(),
            models,
        };
        registry.get(active)?;
        Ok(registry)
    }

    pub fn active(&self) -> Result<Arc<ScoringModel>> {
        self.get(&self.active)
    }

    pub fn active_version(&self) -> &str {
        &self.active
    }

    /// Exact version lookup; never falls back to another version.
    pub fn get(&self, version: &str) -> Result<Arc<ScoringModel>> {
        self.models
            .get(version)
            .cloned()
            .ok_or_else(|| AppError::ModelVersionMismatch {
                requested: version.to_string(),
                available: self.versions().join(", "),
            })
    }

    pub fn versions(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CompositeRule {
    /// The worst peril governs.
    #[default]
    Maximum,
    WeightedMean { weights: BTreeMap<Peril, f64> },
}

impl CompositeRule {
    pub fn combine(&self, scores: &BTreeMap<Peril, PerilScore>) -> f64 {
        match self {
            CompositeRule::Maximum => scores
                .values()
                .map(|s| s.score)
                .fold(0.0, f64::max),
            CompositeRule::WeightedMean { weights } => {
                let (num, den) = scores.iter().fold((0.0, 0.0), |(num, den), (peril, s)| {
                    let w = weights.get(peril).copied().unwrap_or(0.0);
                    (num + w * s.score, den + w)
                });
                if den > 0.0 {
                    (num / den).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumSchedule {
    /// Fraction of exposure charged at zero risk.
    pub base_rate: f64,
    /// Relative surcharge at composite score 1.
    pub risk_loading: f64,
    pub min_premium: f64,
}

impl Default for PremiumSchedule {
    fn default() -> Self {
        Self {
            base_rate: 0.02,
            risk_loading: 2.0,
            min_premium: 100.0,
        }
    }
}

impl PremiumSchedule {
    pub fn premium(&self, composite: f64, exposure: f64) -> f64 {
        let composite = composite.clamp(0.0, 1.0);
        let exposure = exposure.max(0.0);
        (exposure * self.base_rate * (1.0 + self.risk_loading * composite)).max(self.min_premium)
    }
}

const MAX_RECOMMENDATIONS: usize = 5;

/// Advisory notes for an assessment, most pressing peril first.
pub fn risk_recommendations(perils: &BTreeMap<Peril, PerilScore>, composite: f64) -> Vec<String> {
    let score = |p: Peril| perils.get(&p).map(|s| s.score).unwrap_or(0.0);
    let mut notes = Vec::new();

    if score(Peril::Drought) > 0.4 {
        notes.push("Plan irrigation capacity and consider drought-tolerant varieties");
        notes.push("Track soil moisture through the season");
    }
    if score(Peril::Flood) > 0.3 {
        notes.push("Inspect field drainage and clear outlets before heavy rain");
        notes.push("Confirm the policy includes excess-rain cover");
    }
    if score(Peril::Hail) > 0.25 {
        notes.push("Evaluate hail netting for high-value blocks");
    }
    if score(Peril::Pestilence) > 0.3 {
        notes.push("Start an integrated pest management scouting programme");
    }
    if score(Peril::Frost) > 0.3 {
        notes.push("Schedule frost protection for sensitive growth stages");
    }
    if composite > 0.5 {
        notes.push("Overall risk is high; review coverage limits and contingency plans");
    }

    notes
        .into_iter()
        .take(MAX_RECOMMENDATIONS)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureValue, Period};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn vector(values: &[(Feature, Option<f64>, f64)]) -> FeatureVector {
        let period = Period::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        )
        .unwrap();
        let features = values
            .iter()
            .map(|&(f, v, c)| {
                let value = match v {
                    Some(v) => FeatureValue::present(v, c),
                    None => FeatureValue::missing(),
                };
                (f, value)
            })
            .collect();
        FeatureVector::new("farm-1".to_string(), period, features).unwrap()
    }

    fn hail_model() -> RuleBasedModel {
        let mut perils = BTreeMap::new();
        perils.insert(
            Peril::Hail,
            vec![
                FactorSpec::new(Feature::WindMax, 10.0, 30.0, 0.5),
                FactorSpec::new(Feature::TemperatureMax, 25.0, 35.0, 0.5),
            ],
        );
        RuleBasedModel::new("test-1", perils, 0.5)
    }

    #[test]
    fn test_deviation_direction() {
        let rising = FactorSpec::new(Feature::WindMax, 10.0, 30.0, 1.0);
        assert_eq!(rising.deviation(5.0), 0.0);
        assert_relative_eq!(rising.deviation(20.0), 0.5);
        assert_eq!(rising.deviation(50.0), 1.0);

        let falling = FactorSpec::new(Feature::PrecipitationDailyMean, 2.5, 0.5, 1.0);
        assert_eq!(falling.deviation(3.0), 0.0);
        assert_relative_eq!(falling.deviation(1.5), 0.5);
        assert_eq!(falling.deviation(0.0), 1.0);
    }

    #[test]
    fn test_weighted_score() {
        let fv = vector(&[
            (Feature::WindMax, Some(20.0), 1.0),
            (Feature::TemperatureMax, Some(35.0), 1.0),
        ]);
        let scored = hail_model().score(&fv, Peril::Hail).unwrap();
        assert_relative_eq!(scored.score, 0.75);
        assert_relative_eq!(scored.coverage, 1.0);
        assert_eq!(scored.model_version, "test-1");
        assert!(scored.excluded.is_empty());
    }

    #[test]
    fn test_missing_feature_rebalances() {
        let full = vector(&[
            (Feature::WindMax, Some(20.0), 1.0),
            (Feature::TemperatureMax, Some(35.0), 1.0),
        ]);
        let partial = vector(&[
            (Feature::WindMax, Some(20.0), 1.0),
            (Feature::TemperatureMax, None, 0.0),
        ]);
        let model = hail_model();
        let a = model.score(&full, Peril::Hail).unwrap();
        let b = model.score(&partial, Peril::Hail).unwrap();

        assert!(b.coverage < a.coverage);
        assert_eq!(b.sub_scores[&Feature::WindMax], a.sub_scores[&Feature::WindMax]);
        // Rebalanced over the one remaining factor, not treated as zero.
        assert_relative_eq!(b.score, 0.5);
        assert_eq!(b.excluded, vec![Feature::TemperatureMax]);
    }

    #[test]
    fn test_low_coverage_excluded() {
        let fv = vector(&[
            (Feature::WindMax, Some(30.0), 0.2),
            (Feature::TemperatureMax, Some(25.0), 1.0),
        ]);
        let scored = hail_model().score(&fv, Peril::Hail).unwrap();
        assert_eq!(scored.score, 0.0);
        assert_relative_eq!(scored.coverage, 0.5);
    }

    #[test]
    fn test_no_usable_factor_is_insufficient_data() {
        let fv = vector(&[(Feature::WindMax, None, 0.0)]);
        let result = hail_model().score(&fv, Peril::Hail);
        assert!(matches!(result, Err(AppError::InsufficientData(_))));

        let result = hail_model().score(&fv, Peril::Drought);
        assert!(matches!(result, Err(AppError::InsufficientData(_))));
    }

    #[test]
    fn test_logistic_endpoints_and_monotone() {
        let model = LogisticModel::new(hail_model(), LogisticParams::default());
        assert_relative_eq!(model.calibrate(0.0), 0.0, epsilon = 1e-12);
        assert_relative_eq!(model.calibrate(1.0), 1.0, epsilon = 1e-12);
        let mut prev = 0.0;
        for i in 1..=20 {
            let v = model.calibrate(i as f64 / 20.0);
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn test_registry_rejects_unknown_version() {
        let spec = ModelSpec {
            version: "v1".to_string(),
            kind: ModelKind::RuleBased,
            logistic: LogisticParams::default(),
            perils: default_factors(),
        };
        let registry = ModelRegistry::new(&[spec], "v1", 0.5).unwrap();
        assert_eq!(registry.active().unwrap().version(), "v1");
        match registry.get("v0") {
            Err(AppError::ModelVersionMismatch { requested, available }) => {
                assert_eq!(requested, "v0");
                assert_eq!(available, "v1");
            }
            other => panic!("unexpected {:?}", other.map(|m| m.version().to_string())),
        }
        assert!(ModelRegistry::new(&[], "v1", 0.5).is_err());
    }

    #[test]
    fn test_composite_rules() {
        let score = |s: f64| PerilScore {
            score: s,
            sub_scores: BTreeMap::new(),
            excluded: vec![],
            coverage: 1.0,
            model_version: "v1".to_string(),
        };
        let mut scores = BTreeMap::new();
        scores.insert(Peril::Drought, score(0.8));
        scores.insert(Peril::Flood, score(0.2));

        assert_relative_eq!(CompositeRule::Maximum.combine(&scores), 0.8);

        let mut weights = BTreeMap::new();
        weights.insert(Peril::Drought, 0.25);
        weights.insert(Peril::Flood, 0.75);
        let rule = CompositeRule::WeightedMean { weights };
        assert_relative_eq!(rule.combine(&scores), 0.35);
    }

    #[test]
    fn test_premium_is_monotone_with_floor() {
        let schedule = PremiumSchedule::default();
        assert_relative_eq!(schedule.premium(0.0, 100_000.0), 2_000.0);
        assert_relative_eq!(schedule.premium(0.5, 100_000.0), 4_000.0);
        assert!(schedule.premium(0.9, 100_000.0) > schedule.premium(0.5, 100_000.0));
        assert_eq!(schedule.premium(1.0, 10.0), 100.0);
    }

    #[test]
    fn test_recommendations_capped() {
        let score = |s: f64| PerilScore {
            score: s,
            sub_scores: BTreeMap::new(),
            excluded: vec![],
            coverage: 1.0,
            model_version: "v1".to_string(),
        };
        let all_high: BTreeMap<Peril, PerilScore> =
            Peril::ALL.iter().map(|p| (*p, score(0.9))).collect();
        assert_eq!(risk_recommendations(&all_high, 0.9).len(), 5);
        assert!(risk_recommendations(&BTreeMap::new(), 0.1).is_empty());
    }
}
