use crate::config::FusionConfig;
use crate::error::Result;
use crate::models::{
    dedup_observations, Feature, FeatureValue, FeatureVector, FarmRecord, IndexObservation,
    ObservationQuality, Period, StationSeries, Variable,
};
use crate::spatial::{SpatialIndex, StationHit};
use chrono::{NaiveDate, NaiveTime};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Stations closer than this are treated as sitting on the farm centroid.
const COLOCATED_KM: f64 = 0.001;

/// Everything the fuser reads for one farm and period. Gathered up front so
/// that feature building itself is a pure function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct FusionInputs {
    /// Eligible stations, nearest first.
    pub stations: Vec<StationHit>,
    pub readings: Vec<StationSeries>,
    /// Vegetation observations for the period.
    pub observations: Vec<IndexObservation>,
    /// Vegetation observations from earlier years, for the anomaly baseline.
    pub baseline: Vec<IndexObservation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum DailyStat {
    PrecipitationSum,
    TemperatureMean,
    TemperatureMax,
    TemperatureMin,
    WindMax,
    HumidityMean,
    SoilMoistureMean,
}

impl DailyStat {
    const ALL: [DailyStat; 7] = [
        DailyStat::PrecipitationSum,
        DailyStat::TemperatureMean,
        DailyStat::TemperatureMax,
        DailyStat::TemperatureMin,
        DailyStat::WindMax,
        DailyStat::HumidityMean,
        DailyStat::SoilMoistureMean,
    ];
}

type DailyValues = BTreeMap<DailyStat, f64>;

#[derive(Debug, Clone)]
pub struct FeatureFuser {
    config: FusionConfig,
}

impl FeatureFuser {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Stations eligible for interpolation at the farm centroid.
    pub fn select_stations(&self, index: &SpatialIndex, farm: &FarmRecord) -> Vec<StationHit> {
        let mut hits =
            index.stations_within(farm.area.centroid(), self.config.max_station_distance_km);
        hits.truncate(self.config.max_stations);
        hits
    }

    pub fn build_features(
        &self,
        farm: &FarmRecord,
        period: Period,
        inputs: &FusionInputs,
    ) -> Result<FeatureVector> {
        let mut features = BTreeMap::new();

        self.weather_features(farm, &period, inputs, &mut features);
        self.vegetation_features(farm, &period, inputs, &mut features);
        static_features(farm, &mut features);

        debug!(
            "Built {} features for farm {} over {} ({} missing)",
            features.len(),
            farm.id,
            period,
            features.values().filter(|f: &&FeatureValue| f.value.is_none()).count()
        );

        FeatureVector::new(farm.id.clone(), period, features)
    }

    fn weather_features(
        &self,
        farm: &FarmRecord,
        period: &Period,
        inputs: &FusionInputs,
        features: &mut BTreeMap<Feature, FeatureValue>,
    ) {
        let series_by_id: HashMap<&str, &StationSeries> = inputs
            .readings
            .iter()
            .map(|s| (s.station().id.as_str(), s))
            .collect();

        let eligible: Vec<(&StationHit, BTreeMap<NaiveDate, DailyValues>)> = inputs
            .stations
            .iter()
            .filter(|hit| hit.distance_km <= self.config.max_station_distance_km)
            .filter_map(|hit| {
                let series = series_by_id.get(hit.station_id.as_str())?;
                Some((hit, daily_aggregates(series, period)))
            })
            .collect();

        if eligible.is_empty() {
            warn!(
                "No stations within {} km of farm {}; weather features missing",
                self.config.max_station_distance_km, farm.id
            );
        }

        // One interpolated value per day and statistic, or None.
        let mut daily: BTreeMap<DailyStat, Vec<Option<f64>>> = BTreeMap::new();
        for stat in DailyStat::ALL {
            let values = period
                .days()
                .map(|day| {
                    let samples: Vec<(f64, f64)> = eligible
                        .iter()
                        .filter_map(|(hit, days)| {
                            days.get(&day)
                                .and_then(|v| v.get(&stat))
                                .map(|value| (hit.distance_km, *value))
                        })
                        .collect();
                    inverse_distance_weighted(&samples, self.config.idw_power)
                })
                .collect();
            daily.insert(stat, values);
        }

        let days = period.num_days() as f64;
        let summarize = |stat: DailyStat, reduce: fn(&[f64]) -> f64| -> FeatureValue {
            let present: Vec<f64> = daily[&stat].iter().flatten().copied().collect();
            if present.is_empty() {
                FeatureValue::missing()
            } else {
                FeatureValue::present(reduce(&present), present.len() as f64 / days)
            }
        };

        features.insert(
            Feature::PrecipitationDailyMean,
            summarize(DailyStat::PrecipitationSum, mean),
        );
        features.insert(
            Feature::PrecipitationMaxDaily,
            summarize(DailyStat::PrecipitationSum, max),
        );
        features.insert(
            Feature::TemperatureMean,
            summarize(DailyStat::TemperatureMean, mean),
        );
        features.insert(
            Feature::TemperatureMax,
            summarize(DailyStat::TemperatureMax, max),
        );
        features.insert(
            Feature::TemperatureMin,
            summarize(DailyStat::TemperatureMin, min),
        );
        features.insert(Feature::WindMax, summarize(DailyStat::WindMax, max));
        features.insert(
            Feature::HumidityMean,
            summarize(DailyStat::HumidityMean, mean),
        );
        features.insert(
            Feature::SoilMoistureMean,
            summarize(DailyStat::SoilMoistureMean, mean),
        );
    }

    fn vegetation_features(
        &self,
        farm: &FarmRecord,
        period: &Period,
        inputs: &FusionInputs,
        features: &mut BTreeMap<Feature, FeatureValue>,
    ) {
        let current = self.observations_in(&inputs.observations, &farm.id, period);

        let expected = (period.num_days() as f64 / self.config.revisit_days.max(1) as f64)
            .ceil()
            .max(1.0);
        let effective: f64 = current.iter().map(|(_, _, w)| w).sum();
        let coverage = (effective / expected).min(1.0);

        let period_mean = weighted_mean(&current);
        features.insert(
            Feature::VegetationMean,
            period_mean
                .map(|m| FeatureValue::present(m, coverage))
                .unwrap_or_else(FeatureValue::missing),
        );
        features.insert(
            Feature::VegetationTrend,
            weighted_slope(&current)
                .map(|s| FeatureValue::present(s, coverage))
                .unwrap_or_else(FeatureValue::missing),
        );

        let mut year_means = Vec::new();
        for years_back in 1..=self.config.baseline_years {
            let Some(window) = period.shifted_years(years_back as i32) else {
                continue;
            };
            let samples = self.observations_in(&inputs.baseline, &farm.id, &window);
            if let Some(m) = weighted_mean(&samples) {
                year_means.push(m);
            }
        }

        let anomaly = match period_mean {
            Some(m) if !year_means.is_empty()
                && year_means.len() >= self.config.min_baseline_years as usize =>
            {
                let baseline = mean(&year_means);
                let baseline_coverage =
                    year_means.len() as f64 / self.config.baseline_years.max(1) as f64;
                FeatureValue::present(m - baseline, coverage.min(baseline_coverage))
            }
            _ => FeatureValue::missing(),
        };
        features.insert(Feature::VegetationAnomaly, anomaly);
    }

    /// (days since window start, value, weight) for the farm's deduplicated
    /// observations inside `window`.
    fn observations_in(
        &self,
        observations: &[IndexObservation],
        farm_id: &str,
        window: &Period,
    ) -> Vec<(f64, f64, f64)> {
        let selected: Vec<IndexObservation> = observations
            .iter()
            .filter(|o| o.farm_id == farm_id && window.contains(o.timestamp))
            .filter(|o| o.value.is_finite())
            .cloned()
            .collect();

        let origin = window.start.and_time(NaiveTime::MIN).and_utc();
        dedup_observations(selected)
            .into_iter()
            .map(|o| {
                let x = (o.timestamp - origin).num_seconds() as f64 / 86_400.0;
                let w = match o.quality {
                    ObservationQuality::Good => 1.0,
                    ObservationQuality::Low => self.config.low_quality_weight,
                };
                (x, o.value, w)
            })
            .filter(|(_, _, w)| *w > 0.0)
            .collect()
    }
}

fn static_features(farm: &FarmRecord, features: &mut BTreeMap<Feature, FeatureValue>) {
    let known = |v: Option<f64>| {
        v.filter(|v| v.is_finite())
            .map(|v| FeatureValue::present(v, 1.0))
            .unwrap_or_else(FeatureValue::missing)
    };

    features.insert(Feature::SlopePercent, known(farm.slope_percent));
    features.insert(Feature::ElevationM, known(farm.elevation_m));
    features.insert(
        Feature::SoilDrainage,
        known(farm.soil_class.map(|c| c.poor_drainage_index())),
    );

    let yields: Vec<f64> = farm
        .yield_history
        .iter()
        .copied()
        .filter(|y| y.is_finite())
        .collect();
    let baseline = (!yields.is_empty()).then(|| mean(&yields));
    features.insert(Feature::YieldBaseline, known(baseline));

    let volatility = match baseline {
        Some(m) if yields.len() >= 2 && m > 0.0 => {
            let var = yields.iter().map(|y| (y - m).powi(2)).sum::<f64>()
                / (yields.len() - 1) as f64;
            Some(var.sqrt() / m)
        }
        _ => None,
    };
    features.insert(Feature::YieldVolatility, known(volatility));

    let paid_claims = farm.claim_history.iter().filter(|c| c.amount > 0.0).count();
    let years_of_record = if !yields.is_empty() {
        Some(yields.len())
    } else {
        let years = farm.claim_history.iter().map(|c| c.year);
        match (years.clone().min(), years.max()) {
            (Some(lo), Some(hi)) => Some((hi - lo + 1) as usize),
            _ => None,
        }
    };
    features.insert(
        Feature::ClaimFrequency,
        known(years_of_record.map(|years| paid_claims as f64 / years as f64)),
    );
}

/// Per-day aggregates of one station's readings within `period`.
fn daily_aggregates(series: &StationSeries, period: &Period) -> BTreeMap<NaiveDate, DailyValues> {
    let mut samples: BTreeMap<NaiveDate, BTreeMap<Variable, Vec<f64>>> = BTreeMap::new();
    for reading in series.in_period(period) {
        let day = samples.entry(reading.timestamp.date_naive()).or_default();
        for variable in Variable::ALL {
            if let Some(value) = reading.value(variable) {
                day.entry(variable).or_default().push(value);
            }
        }
    }

    samples
        .into_iter()
        .map(|(day, vars)| {
            let mut out = DailyValues::new();
            if let Some(v) = vars.get(&Variable::Precipitation) {
                out.insert(DailyStat::PrecipitationSum, v.iter().sum());
            }
            if let Some(v) = vars.get(&Variable::Temperature) {
                out.insert(DailyStat::TemperatureMean, mean(v));
                out.insert(DailyStat::TemperatureMax, max(v));
                out.insert(DailyStat::TemperatureMin, min(v));
            }
            if let Some(v) = vars.get(&Variable::WindSpeed) {
                out.insert(DailyStat::WindMax, max(v));
            }
            if let Some(v) = vars.get(&Variable::Humidity) {
                out.insert(DailyStat::HumidityMean, mean(v));
            }
            if let Some(v) = vars.get(&Variable::SoilMoisture) {
                out.insert(DailyStat::SoilMoistureMean, mean(v));
            }
            (day, out)
        })
        .collect()
}

/// Inverse-distance weighted value from `(distance_km, value)` samples.
/// Co-located stations take over entirely; no samples means no value.
pub fn inverse_distance_weighted(samples: &[(f64, f64)], power: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let colocated: Vec<f64> = samples
        .iter()
        .filter(|(d, _)| *d < COLOCATED_KM)
        .map(|(_, v)| *v)
        .collect();
    if !colocated.is_empty() {
        return Some(mean(&colocated));
    }

    let (num, den) = samples.iter().fold((0.0, 0.0), |(num, den), (d, v)| {
        let w = 1.0 / d.powf(power);
        (num + w * v, den + w)
    });
    (den > 0.0).then(|| num / den)
}

fn weighted_mean(samples: &[(f64, f64, f64)]) -> Option<f64> {
    let total: f64 = samples.iter().map(|(_, _, w)| w).sum();
    (total > 0.0).then(|| samples.iter().map(|(_, v, w)| v * w).sum::<f64>() / total)
}

/// Weighted least-squares slope of value against time (per day).
fn weighted_slope(samples: &[(f64, f64, f64)]) -> Option<f64> {
    let total: f64 = samples.iter().map(|(_, _, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    let x_bar = samples.iter().map(|(x, _, w)| x * w).sum::<f64>() / total;
    let y_bar = samples.iter().map(|(_, y, w)| y * w).sum::<f64>() / total;
    let sxx: f64 = samples.iter().map(|(x, _, w)| w * (x - x_bar).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = samples
        .iter()
        .map(|(x, y, w)| w * (x - x_bar) * (y - y_bar))
        .sum();
    Some(sxy / sxx)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}
