use crate::config::PortfolioConfig;
use crate::models::{FarmId, Peril, RiskAssessment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskBuckets {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

/// Read-only rollup of the latest assessment per farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub total_farms: usize,
    pub assessed: usize,
    pub unassessed: Vec<FarmId>,
    pub buckets: RiskBuckets,
    pub average_score: Option<f64>,
    pub exposure_weighted_score: Option<f64>,
    pub total_exposure: f64,
    pub total_premium: f64,
    pub peril_means: BTreeMap<Peril, f64>,
    pub max_composite: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct PortfolioAggregator {
    config: PortfolioConfig,
}

impl PortfolioAggregator {
    pub fn new(config: PortfolioConfig) -> Self {
        Self { config }
    }

    pub fn bucket(&self, score: f64, buckets: &mut RiskBuckets) {
        if score < self.config.low_max {
            buckets.low += 1;
        } else if score < self.config.medium_max {
            buckets.medium += 1;
        } else {
            buckets.high += 1;
        }
    }

    /// `latest` pairs each requested farm with its latest assessment, if any.
    pub fn summarize(&self, latest: &[(FarmId, Option<RiskAssessment>)]) -> PortfolioSummary {
        let mut buckets = RiskBuckets::default();
        let mut unassessed = Vec::new();
        let mut score_sum = 0.0;
        let mut weighted_sum = 0.0;
        let mut total_exposure = 0.0;
        let mut total_premium = 0.0;
        let mut max_composite: Option<f64> = None;
        let mut peril_sums: BTreeMap<Peril, (f64, usize)> = BTreeMap::new();
        let mut assessed = 0;

        for (farm_id, assessment) in latest {
            let Some(a) = assessment else {
                unassessed.push(farm_id.clone());
                continue;
            };
            assessed += 1;
            self.bucket(a.composite_score, &mut buckets);
            score_sum += a.composite_score;
            weighted_sum += a.composite_score * a.exposure;
            total_exposure += a.exposure;
            total_premium += a.premium;
            max_composite = Some(
                max_composite.map_or(a.composite_score, |m| m.max(a.composite_score)),
            );
            for (peril, score) in &a.perils {
                let entry = peril_sums.entry(*peril).or_insert((0.0, 0));
                entry.0 += score.score;
                entry.1 += 1;
            }
        }

        let average_score = (assessed > 0).then(|| score_sum / assessed as f64);
        let exposure_weighted_score = if total_exposure > 0.0 {
            Some(weighted_sum / total_exposure)
        } else {
            average_score
        };

        PortfolioSummary {
            total_farms: latest.len(),
            assessed,
            unassessed,
            buckets,
            average_score,
            exposure_weighted_score,
            total_exposure,
            total_premium,
            peril_means: peril_sums
                .into_iter()
                .map(|(peril, (sum, n))| (peril, sum / n as f64))
                .collect(),
            max_composite,
        }
    }
}
