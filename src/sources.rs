use crate::error::{AppError, Result};
use crate::models::{
    FarmId, FarmRecord, IndexObservation, IndexRaster, Period, StationReading, StationSeries,
    WeatherStation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::warn;

#[async_trait]
pub trait FarmRegistry: Send + Sync {
    /// `NotFound` for an unknown identifier.
    async fn farm(&self, farm_id: &str) -> Result<FarmRecord>;

    async fn farms(&self) -> Result<Vec<FarmRecord>>;

    async fn farm_ids(&self) -> Result<Vec<FarmId>> {
        Ok(self.farms().await?.into_iter().map(|f| f.id).collect())
    }
}

#[async_trait]
pub trait ObservationSource: Send + Sync {
    async fn stations(&self) -> Result<Vec<WeatherStation>>;

    /// Readings of the given stations within `period`; stations without
    /// readings are left out.
    async fn station_series(&self, station_ids: &[String], period: &Period)
        -> Result<Vec<StationSeries>>;

    async fn index_observations(
        &self,
        farm_id: &str,
        period: &Period,
    ) -> Result<Vec<IndexObservation>>;

    /// Rasters of the farm with `from <= timestamp <= to`, oldest first.
    async fn rasters(
        &self,
        farm_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IndexRaster>>;
}

/// In-memory farm registry and observation store.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    farms: BTreeMap<FarmId, FarmRecord>,
    stations: BTreeMap<String, StationSeries>,
    observations: Vec<IndexObservation>,
    rasters: Vec<IndexRaster>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a farm. Its boundary must carry the farm's own id, since the
    /// spatial index resolves points to boundary ids.
    pub fn add_farm(&mut self, farm: FarmRecord) -> Result<()> {
        if farm.area.id() != farm.id {
            return Err(AppError::InvalidData(format!(
                "farm '{}' has boundary '{}'",
                farm.id,
                farm.area.id()
            )));
        }
        if self.farms.contains_key(&farm.id) {
            return Err(AppError::InvalidData(format!("duplicate farm id '{}'", farm.id)));
        }
        self.farms.insert(farm.id.clone(), farm);
        Ok(())
    }

    /// Add readings for one or more stations. Readings are merged with any
    /// already held; a repeated timestamp keeps the first reading seen.
    pub fn add_readings(&mut self, readings: Vec<StationReading>) -> Result<()> {
        let mut by_station: BTreeMap<String, Vec<StationReading>> = BTreeMap::new();
        for reading in readings {
            by_station
                .entry(reading.station_id.clone())
                .or_default()
                .push(reading);
        }

        for (station_id, incoming) in by_station {
            let (station, mut merged) = match self.stations.remove(&station_id) {
                Some(series) => (series.station().clone(), series.readings().to_vec()),
                None => (
                    WeatherStation {
                        id: station_id.clone(),
                        location: incoming[0].location,
                    },
                    Vec::new(),
                ),
            };
            merged.extend(incoming);
            merged.sort_by_key(|r| r.timestamp);

            let before = merged.len();
            merged.dedup_by_key(|r| r.timestamp);
            if merged.len() < before {
                warn!(
                    "Dropped {} duplicate readings for station {}",
                    before - merged.len(),
                    station_id
                );
            }

            self.stations
                .insert(station_id, StationSeries::new(station, merged)?);
        }
        Ok(())
    }

    pub fn add_observations(&mut self, observations: Vec<IndexObservation>) {
        self.observations.extend(observations);
    }

    pub fn add_raster(&mut self, raster: IndexRaster) -> Result<()> {
        raster.validate()?;
        self.rasters.push(raster);
        Ok(())
    }

    pub fn farm_count(&self) -> usize {
        self.farms.len()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }
}

#[async_trait]
impl FarmRegistry for Dataset {
    async fn farm(&self, farm_id: &str) -> Result<FarmRecord> {
        self.farms
            .get(farm_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("farm '{}'", farm_id)))
    }

    async fn farms(&self) -> Result<Vec<FarmRecord>> {
        Ok(self.farms.values().cloned().collect())
    }
}

#[async_trait]
impl ObservationSource for Dataset {
    async fn stations(&self) -> Result<Vec<WeatherStation>> {
        Ok(self.stations.values().map(|s| s.station().clone()).collect())
    }

    async fn station_series(
        &self,
        station_ids: &[String],
        period: &Period,
    ) -> Result<Vec<StationSeries>> {
        station_ids
            .iter()
            .filter_map(|id| self.stations.get(id))
            .map(|series| {
                let readings = series.in_period(period).cloned().collect();
                StationSeries::new(series.station().clone(), readings)
            })
            .collect()
    }

    async fn index_observations(
        &self,
        farm_id: &str,
        period: &Period,
    ) -> Result<Vec<IndexObservation>> {
        Ok(self
            .observations
            .iter()
            .filter(|o| o.farm_id == farm_id && period.contains(o.timestamp))
            .cloned()
            .collect())
    }

    async fn rasters(
        &self,
        farm_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IndexRaster>> {
        let mut found: Vec<IndexRaster> = self
            .rasters
            .iter()
            .filter(|r| r.farm_id == farm_id && r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoArea;
    use crate::models::Variable;
    use chrono::{NaiveDate, TimeZone};
    use geo::Point;

    fn reading(station: &str, hour: u32) -> StationReading {
        let mut values = BTreeMap::new();
        values.insert(Variable::Temperature, Some(hour as f64));
        StationReading {
            station_id: station.to_string(),
            location: Point::new(-81.74, 36.53),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
            values,
        }
    }

    #[tokio::test]
    async fn test_readings_merged_sorted_and_deduplicated() {
        let mut dataset = Dataset::new();
        dataset
            .add_readings(vec![reading("s1", 3), reading("s1", 1), reading("s2", 1)])
            .unwrap();
        dataset
            .add_readings(vec![reading("s1", 2), reading("s1", 3)])
            .unwrap();

        assert_eq!(dataset.station_count(), 2);
        let period = Period::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        )
        .unwrap();
        let series = dataset
            .station_series(&["s1".to_string(), "missing".to_string()], &period)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        let hours: Vec<u32> = series[0]
            .readings()
            .iter()
            .map(|r| r.value(Variable::Temperature).unwrap() as u32)
            .collect();
        assert_eq!(hours, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_farm_not_found() {
        let dataset = Dataset::new();
        let result = dataset.farm("nope").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    fn farm(id: &str, boundary: &str) -> FarmRecord {
        FarmRecord {
            id: id.to_string(),
            name: None,
            area: GeoArea::rectangle(boundary, (0.0, 0.0), (1.0, 1.0)).unwrap(),
            crop: None,
            soil_class: None,
            elevation_m: None,
            slope_percent: None,
            yield_history: vec![],
            claim_history: vec![],
            insured_value: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_farm_boundary_id_must_match() {
        let mut dataset = Dataset::new();
        let result = dataset.add_farm(farm("farm-a", "boundary-7"));
        assert!(matches!(result, Err(AppError::InvalidData(_))));
        assert_eq!(dataset.farm_count(), 0);

        dataset.add_farm(farm("farm-a", "farm-a")).unwrap();
        let duplicate = dataset.add_farm(farm("farm-a", "farm-a"));
        assert!(matches!(duplicate, Err(AppError::InvalidData(_))));
        assert_eq!(dataset.farm("farm-a").await.unwrap().area.id(), "farm-a");
    }
}
