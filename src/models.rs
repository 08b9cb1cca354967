use crate::error::{AppError, Result};
use crate::geometry::GeoArea;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use geo::{MultiPolygon, Point};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type FarmId = String;

/// Inclusive range of calendar days (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(AppError::InvalidData(format!(
                "period end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` calendar days ending on `end`.
    pub fn trailing(end: NaiveDate, days: u32) -> Result<Self> {
        let days = days.max(1) as i64;
        Self::new(end - Duration::days(days - 1), end)
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        (0..self.num_days()).map(move |offset| start + Duration::days(offset))
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        let day = timestamp.date_naive();
        day >= self.start && day <= self.end
    }

    /// The same calendar window shifted back by `years`.
    ///
    /// February 29 falls back to February 28 in non-leap years.
    pub fn shifted_years(&self, years: i32) -> Option<Self> {
        let shift = |d: NaiveDate| {
            let year = d.year() - years;
            d.with_year(year)
                .or_else(|| NaiveDate::from_ymd_opt(year, d.month(), 28))
        };
        Some(Self {
            start: shift(self.start)?,
            end: shift(self.end)?,
        })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Weather stations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    /// Air temperature, °C
    Temperature,
    /// Precipitation, mm
    Precipitation,
    /// Wind speed, m/s
    WindSpeed,
    /// Relative humidity, %
    Humidity,
    /// Volumetric soil moisture at 5 cm, m³/m³
    SoilMoisture,
}

impl Variable {
    pub const ALL: [Variable; 5] = [
        Variable::Temperature,
        Variable::Precipitation,
        Variable::WindSpeed,
        Variable::Humidity,
        Variable::SoilMoisture,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherStation {
    pub id: String,
    pub location: Point<f64>,
}

/// One timestamped record from a station. `None` marks "no data"; a variable
/// absent from the map is equally unknown. Neither is ever read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationReading {
    pub station_id: String,
    pub location: Point<f64>,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<Variable, Option<f64>>,
}

impl StationReading {
    pub fn value(&self, variable: Variable) -> Option<f64> {
        self.values
            .get(&variable)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }
}

/// Readings of a single station in strictly increasing timestamp order.
#[derive(Debug, Clone)]
pub struct StationSeries {
    station: WeatherStation,
    readings: Vec<StationReading>,
}

impl StationSeries {
    pub fn new(station: WeatherStation, readings: Vec<StationReading>) -> Result<Self> {
        if let Some(r) = readings.iter().find(|r| r.station_id != station.id) {
            return Err(AppError::InvalidData(format!(
                "reading from station '{}' in series of station '{}'",
                r.station_id, station.id
            )));
        }
        if let Some(w) = readings.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
            return Err(AppError::InvalidData(format!(
                "station '{}' timestamps not increasing: {} then {}",
                station.id, w[0].timestamp, w[1].timestamp
            )));
        }
        Ok(Self { station, readings })
    }

    pub fn station(&self) -> &WeatherStation {
        &self.station
    }

    pub fn readings(&self) -> &[StationReading] {
        &self.readings
    }

    pub fn in_period(&self, period: &Period) -> impl Iterator<Item = &StationReading> {
        let period = *period;
        self.readings
            .iter()
            .filter(move |r| period.contains(r.timestamp))
    }
}

// ---------------------------------------------------------------------------
// Remote sensing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObservationQuality {
    #[default]
    Good,
    /// Cloud-contaminated or otherwise degraded; kept but down-weighted.
    Low,
}

/// Farm-level vegetation index sample (e.g. NDVI) derived from a raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexObservation {
    pub farm_id: FarmId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub resolution_m: f64,
    #[serde(default)]
    pub quality: ObservationQuality,
}

/// Keep one observation per (farm, timestamp), preferring good quality, then
/// finer resolution, then the larger value. Output is sorted by farm and time.
pub fn dedup_observations(mut observations: Vec<IndexObservation>) -> Vec<IndexObservation> {
    observations.sort_by(|a, b| {
        a.farm_id
            .cmp(&b.farm_id)
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.quality.cmp(&b.quality))
            .then(a.resolution_m.total_cmp(&b.resolution_m))
            .then(b.value.total_cmp(&a.value))
    });
    observations.dedup_by(|later, kept| {
        later.farm_id == kept.farm_id && later.timestamp == kept.timestamp
    });
    observations
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    /// Lower-left corner of cell (0, 0).
    pub origin_x: f64,
    pub origin_y: f64,
    pub cell_size: f64,
    pub cols: usize,
    pub rows: usize,
}

impl RasterGrid {
    pub fn cell_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Bounds of cell `idx` (row-major from the origin) as (min, max).
    pub fn cell_bounds(&self, idx: usize) -> ((f64, f64), (f64, f64)) {
        let col = idx % self.cols;
        let row = idx / self.cols;
        let x0 = self.origin_x + col as f64 * self.cell_size;
        let y0 = self.origin_y + row as f64 * self.cell_size;
        ((x0, y0), (x0 + self.cell_size, y0 + self.cell_size))
    }

    fn approx_eq(&self, other: &RasterGrid) -> bool {
        let eps = self.cell_size.abs() * 1e-9;
        self.cols == other.cols
            && self.rows == other.rows
            && (self.origin_x - other.origin_x).abs() <= eps
            && (self.origin_y - other.origin_y).abs() <= eps
            && (self.cell_size - other.cell_size).abs() <= eps
    }
}

/// Gridded vegetation index over (part of) a farm. `None` cells have no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRaster {
    pub farm_id: FarmId,
    pub timestamp: DateTime<Utc>,
    pub grid: RasterGrid,
    pub values: Vec<Option<f32>>,
}

impl IndexRaster {
    pub fn validate(&self) -> Result<()> {
        if !(self.grid.cell_size > 0.0) || self.grid.cols == 0 || self.grid.rows == 0 {
            return Err(AppError::InvalidData(format!(
                "raster for '{}' at {} has an empty grid",
                self.farm_id, self.timestamp
            )));
        }
        if self.values.len() != self.grid.cell_count() {
            return Err(AppError::InvalidData(format!(
                "raster for '{}' at {} has {} values for {} cells",
                self.farm_id,
                self.timestamp,
                self.values.len(),
                self.grid.cell_count()
            )));
        }
        Ok(())
    }

    pub fn aligned_with(&self, other: &IndexRaster) -> bool {
        self.grid.approx_eq(&other.grid)
    }
}

// ---------------------------------------------------------------------------
// Farm master data (owned by the registry)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoilClass {
    Sand,
    SandyLoam,
    Loam,
    SiltLoam,
    ClayLoam,
    Clay,
    Peat,
}

impl SoilClass {
    /// 0 = free draining, 1 = waterlogs readily.
    pub fn poor_drainage_index(&self) -> f64 {
        match self {
            SoilClass::Sand => 0.1,
            SoilClass::SandyLoam => 0.25,
            SoilClass::Loam => 0.4,
            SoilClass::SiltLoam => 0.55,
            SoilClass::ClayLoam => 0.7,
            SoilClass::Clay => 0.9,
            SoilClass::Peat => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub year: i32,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmRecord {
    pub id: FarmId,
    #[serde(default)]
    pub name: Option<String>,
    pub area: GeoArea,
    #[serde(default)]
    pub crop: Option<String>,
    #[serde(default)]
    pub soil_class: Option<SoilClass>,
    #[serde(default)]
    pub elevation_m: Option<f64>,
    #[serde(default)]
    pub slope_percent: Option<f64>,
    /// Yield per season, t/ha, oldest first.
    #[serde(default)]
    pub yield_history: Vec<f64>,
    #[serde(default)]
    pub claim_history: Vec<ClaimRecord>,
    /// Insured exposure in currency units.
    pub insured_value: f64,
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    PrecipitationDailyMean,
    PrecipitationMaxDaily,
    TemperatureMean,
    TemperatureMax,
    TemperatureMin,
    WindMax,
    HumidityMean,
    SoilMoistureMean,
    VegetationMean,
    VegetationTrend,
    VegetationAnomaly,
    SlopePercent,
    ElevationM,
    SoilDrainage,
    YieldBaseline,
    YieldVolatility,
    ClaimFrequency,
}

impl Feature {
    pub fn is_weather(&self) -> bool {
        matches!(
            self,
            Feature::PrecipitationDailyMean
                | Feature::PrecipitationMaxDaily
                | Feature::TemperatureMean
                | Feature::TemperatureMax
                | Feature::TemperatureMin
                | Feature::WindMax
                | Feature::HumidityMean
                | Feature::SoilMoistureMean
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    /// `None` when the inputs held no usable data.
    pub value: Option<f64>,
    /// Fraction of the period backed by data, in [0, 1].
    pub coverage: f64,
}

impl FeatureValue {
    pub fn present(value: f64, coverage: f64) -> Self {
        Self {
            value: Some(value),
            coverage: coverage.clamp(0.0, 1.0),
        }
    }

    pub fn missing() -> Self {
        Self {
            value: None,
            coverage: 0.0,
        }
    }
}

/// Fused per-farm, per-period model input. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub farm_id: FarmId,
    pub period: Period,
    pub features: BTreeMap<Feature, FeatureValue>,
    pub fingerprint: String,
}

impl FeatureVector {
    pub fn new(
        farm_id: FarmId,
        period: Period,
        features: BTreeMap<Feature, FeatureValue>,
    ) -> Result<Self> {
        let fingerprint = fingerprint(&farm_id, &period, &features)?;
        Ok(Self {
            farm_id,
            period,
            features,
            fingerprint,
        })
    }

    pub fn get(&self, feature: Feature) -> FeatureValue {
        self.features
            .get(&feature)
            .copied()
            .unwrap_or_else(FeatureValue::missing)
    }

    /// Copy with one feature replaced; the fingerprint is recomputed.
    pub fn with_feature(&self, feature: Feature, value: FeatureValue) -> Result<Self> {
        let mut features = self.features.clone();
        features.insert(feature, value);
        Self::new(self.farm_id.clone(), self.period, features)
    }
}

fn fingerprint(
    farm_id: &str,
    period: &Period,
    features: &BTreeMap<Feature, FeatureValue>,
) -> Result<String> {
    let canonical = serde_json::to_vec(&(farm_id, period, features))?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("{:x}", digest))
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peril {
    Drought,
    Flood,
    Pestilence,
    Hail,
    Frost,
}

impl Peril {
    pub const ALL: [Peril; 5] = [
        Peril::Drought,
        Peril::Flood,
        Peril::Pestilence,
        Peril::Hail,
        Peril::Frost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Peril::Drought => "drought",
            Peril::Flood => "flood",
            Peril::Pestilence => "pestilence",
            Peril::Hail => "hail",
            Peril::Frost => "frost",
        }
    }
}

impl fmt::Display for Peril {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerilScore {
    pub score: f64,
    /// Normalised deviation per contributing factor, in [0, 1].
    pub sub_scores: BTreeMap<Feature, f64>,
    /// Factors left out because their feature was missing or under-covered.
    pub excluded: Vec<Feature>,
    /// Weighted data coverage behind `score`, in [0, 1].
    pub coverage: f64,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: Uuid,
    pub farm_id: FarmId,
    pub assessed_at: DateTime<Utc>,
    pub model_version: String,
    pub period: Period,
    pub perils: BTreeMap<Peril, PerilScore>,
    /// Requested perils with no usable factor; they count as zero coverage.
    #[serde(default)]
    pub unscored_perils: Vec<Peril>,
    pub composite_score: f64,
    /// Lowest peril coverage.
    pub confidence: f64,
    pub exposure: f64,
    pub premium: f64,
    pub feature_fingerprint: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Damage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub event_time: DateTime<Utc>,
    pub peril: Peril,
    /// How far before the event to look for the pre-event raster.
    pub pre_days: u32,
    /// How far after the event to look for the post-event raster.
    pub post_days: u32,
}

impl EventWindow {
    pub fn new(event_time: DateTime<Utc>, peril: Peril) -> Self {
        Self {
            event_time,
            peril,
            pre_days: 7,
            post_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Moderate,
    Severe,
    Extreme,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
            Severity::Extreme => "extreme",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageEstimate {
    pub id: Uuid,
    pub farm_id: FarmId,
    pub peril: Peril,
    pub event_time: DateTime<Utc>,
    pub pre_timestamp: DateTime<Utc>,
    pub post_timestamp: DateTime<Utc>,
    /// Affected cells clipped to the farm boundary.
    pub affected_area: MultiPolygon<f64>,
    /// Affected share of the covered farm area.
    pub affected_fraction: f64,
    /// Share of the farm area both rasters observed.
    pub coverage_fraction: f64,
    /// Area-weighted mean of (post - pre) over covered cells.
    pub mean_delta: f64,
    pub severity: Severity,
    pub loss_fraction: f64,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
}
