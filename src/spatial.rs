use crate::error::{AppError, Result};
use crate::geometry::GeoArea;
use crate::models::WeatherStation;
use geo::{HaversineDistance, Point};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Coordinates are longitude/latitude degrees.
    #[default]
    Haversine,
    /// Coordinates are projected metres.
    Euclidean,
}

impl DistanceMetric {
    pub fn distance_km(&self, a: Point<f64>, b: Point<f64>) -> f64 {
        match self {
            DistanceMetric::Haversine => a.haversine_distance(&b) / 1000.0,
            DistanceMetric::Euclidean => (a.x() - b.x()).hypot(a.y() - b.y()) / 1000.0,
        }
    }

    /// Coordinate offset beyond which any point is strictly farther than
    /// `km` from `at` (along either axis). Infinite when no finite bound
    /// exists, e.g. near the poles.
    fn coordinate_radius(&self, at: Point<f64>, km: f64) -> f64 {
        match self {
            DistanceMetric::Euclidean => km * 1000.0,
            DistanceMetric::Haversine => {
                let angular = km / EARTH_RADIUS_KM;
                if angular >= std::f64::consts::PI {
                    return f64::INFINITY;
                }
                let lat_deg = angular.to_degrees();
                let lat_max = (at.y().abs() + lat_deg).to_radians();
                if lat_max >= std::f64::consts::FRAC_PI_2 {
                    return f64::INFINITY;
                }
                // hav(d) >= cos²(lat_max) * hav(dlon)
                let s = (angular / 2.0).sin() / lat_max.cos();
                if s >= 1.0 {
                    return f64::INFINITY;
                }
                let lon_deg = (2.0 * s.asin()).to_degrees();
                lat_deg.max(lon_deg)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationHit {
    pub station_id: String,
    pub location: Point<f64>,
    pub distance_km: f64,
}

type CellKey = (i64, i64);

#[derive(Debug, Clone, Copy)]
struct CellExtent {
    min: CellKey,
    max: CellKey,
}

impl CellExtent {
    fn include(&mut self, key: CellKey) {
        self.min = (self.min.0.min(key.0), self.min.1.min(key.1));
        self.max = (self.max.0.max(key.0), self.max.1.max(key.1));
    }
}

pub struct SpatialIndex {
    cell_size: f64,
    metric: DistanceMetric,
    farms: Vec<GeoArea>,
    stations: Vec<WeatherStation>,
    farm_cells: HashMap<CellKey, Vec<usize>>,
    station_cells: HashMap<CellKey, Vec<usize>>,
    station_extent: Option<CellExtent>,
}

impl SpatialIndex {
    /// Build the index. Farms and stations are ordered by identifier so every
    /// query result is deterministic.
    pub fn build(
        mut farms: Vec<GeoArea>,
        mut stations: Vec<WeatherStation>,
        cell_size: f64,
        metric: DistanceMetric,
    ) -> Result<Self> {
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(AppError::Config(format!(
                "spatial cell_size must be positive, got {}",
                cell_size
            )));
        }

        farms.sort_by(|a, b| a.id().cmp(b.id()));
        if let Some(w) = farms.windows(2).find(|w| w[0].id() == w[1].id()) {
            return Err(AppError::InvalidData(format!(
                "duplicate farm id '{}' in spatial index",
                w[0].id()
            )));
        }

        stations.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(w) = stations.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(AppError::InvalidData(format!(
                "duplicate station id '{}' in spatial index",
                w[0].id
            )));
        }
        if let Some(s) = stations
            .iter()
            .find(|s| !s.location.x().is_finite() || !s.location.y().is_finite())
        {
            return Err(AppError::InvalidGeometry(format!(
                "station '{}' has a non-finite location",
                s.id
            )));
        }

        let mut index = SpatialIndex {
            cell_size,
            metric,
            farms,
            stations,
            farm_cells: HashMap::new(),
            station_cells: HashMap::new(),
            station_extent: None,
        };

        for (idx, farm) in index.farms.iter().enumerate() {
            let bounds = farm.bounds();
            let (x0, y0) = index.cell_of(bounds.min().x, bounds.min().y);
            let (x1, y1) = index.cell_of(bounds.max().x, bounds.max().y);
            for ix in x0..=x1 {
                for iy in y0..=y1 {
                    index.farm_cells.entry((ix, iy)).or_default().push(idx);
                }
            }
        }

        for idx in 0..index.stations.len() {
            let location = index.stations[idx].location;
            let key = index.cell_of(location.x(), location.y());
            index.station_cells.entry(key).or_default().push(idx);
            match index.station_extent.as_mut() {
                Some(extent) => extent.include(key),
                None => index.station_extent = Some(CellExtent { min: key, max: key }),
            }
        }

        Ok(index)
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn farm_count(&self) -> usize {
        self.farms.len()
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn farm(&self, id: &str) -> Option<&GeoArea> {
        self.farms
            .binary_search_by(|f| f.id().cmp(id))
            .ok()
            .map(|idx| &self.farms[idx])
    }

    fn cell_of(&self, x: f64, y: f64) -> CellKey {
        (
            (x / self.cell_size).floor() as i64,
            (y / self.cell_size).floor() as i64,
        )
    }

    /// The area strictly containing `point`; overlapping areas resolve to the
    /// smallest identifier.
    pub fn containing(&self, point: Point<f64>) -> Option<&GeoArea> {
        let key = self.cell_of(point.x(), point.y());
        self.farm_cells
            .get(&key)?
            .iter()
            .map(|&idx| &self.farms[idx])
            .filter(|farm| farm.contains_point(point))
            .min_by(|a, b| a.id().cmp(b.id()))
    }

    pub fn resolve_containing(&self, point: Point<f64>) -> Result<&GeoArea> {
        self.containing(point).ok_or_else(|| {
            AppError::NotFound(format!(
                "no farm contains point ({}, {})",
                point.x(),
                point.y()
            ))
        })
    }

    /// Up to `k` stations, nearest first, ties broken by station id.
    pub fn nearest_stations(&self, point: Point<f64>, k: usize) -> Vec<StationHit> {
        let extent = match self.station_extent {
            Some(extent) if k > 0 => extent,
            _ => return Vec::new(),
        };

        let (cx, cy) = self.cell_of(point.x(), point.y());
        let max_ring = [
            cx - extent.min.0,
            extent.max.0 - cx,
            cy - extent.min.1,
            extent.max.1 - cy,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
        .max(0);

        let mut hits = Vec::new();
        let mut seen = HashSet::new();
        let mut pruned_radius = None;
        for ring in 0..=max_ring {
            for key in ring_cells((cx, cy), ring) {
                if let Some(members) = self.station_cells.get(&key) {
                    for &idx in members {
                        if seen.insert(idx) {
                            hits.push(self.hit(idx, point));
                        }
                    }
                }
            }

            if hits.len() >= k {
                sort_hits(&mut hits);
                let kth = hits[k - 1].distance_km;
                // Anything in ring + 1 or further lies at least `ring` cells away.
                let lower_bound = ring as f64 * self.cell_size;
                let radius = self.metric.coordinate_radius(point, kth);
                if radius < lower_bound {
                    pruned_radius = Some(radius);
                    break;
                }
            }
        }

        // The ring walk does not wrap in longitude; stations just across the
        // antimeridian are picked up here.
        if let Some(radius) = pruned_radius {
            for window in self.longitude_windows(point, radius).into_iter().skip(1) {
                self.scan_window(point, window, radius, extent, &mut seen, &mut hits);
            }
        }

        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    /// All stations within `max_km`, nearest first, ties broken by station id.
    pub fn stations_within(&self, point: Point<f64>, max_km: f64) -> Vec<StationHit> {
        let extent = match self.station_extent {
            Some(extent) if max_km >= 0.0 => extent,
            _ => return Vec::new(),
        };

        let radius = self.metric.coordinate_radius(point, max_km);
        let mut hits = Vec::new();
        let mut seen = HashSet::new();
        if radius.is_finite() {
            for window in self.longitude_windows(point, radius) {
                self.scan_window(point, window, radius, extent, &mut seen, &mut hits);
            }
        } else {
            for (ix, iy) in cells_between(extent.min, extent.max) {
                if let Some(members) = self.station_cells.get(&(ix, iy)) {
                    for &idx in members {
                        if seen.insert(idx) {
                            hits.push(self.hit(idx, point));
                        }
                    }
                }
            }
        }

        hits.retain(|hit| hit.distance_km <= max_km);
        sort_hits(&mut hits);
        hits
    }

    /// Longitude ranges covering `radius` around `point`. Under the haversine
    /// metric a range crossing ±180° is repeated one full turn over.
    fn longitude_windows(&self, point: Point<f64>, radius: f64) -> Vec<(f64, f64)> {
        let west = point.x() - radius;
        let east = point.x() + radius;
        let mut windows = vec![(west, east)];
        if self.metric == DistanceMetric::Haversine {
            if east > 180.0 {
                windows.push((west - 360.0, east - 360.0));
            }
            if west < -180.0 {
                windows.push((west + 360.0, east + 360.0));
            }
        }
        windows
    }

    fn scan_window(
        &self,
        point: Point<f64>,
        (west, east): (f64, f64),
        radius: f64,
        extent: CellExtent,
        seen: &mut HashSet<usize>,
        hits: &mut Vec<StationHit>,
    ) {
        let lo = self.cell_of(west, point.y() - radius);
        let hi = self.cell_of(east, point.y() + radius);
        let lo = (lo.0.max(extent.min.0), lo.1.max(extent.min.1));
        let hi = (hi.0.min(extent.max.0), hi.1.min(extent.max.1));

        for key in cells_between(lo, hi) {
            if let Some(members) = self.station_cells.get(&key) {
                for &idx in members {
                    if seen.insert(idx) {
                        hits.push(self.hit(idx, point));
                    }
                }
            }
        }
    }

    fn hit(&self, idx: usize, point: Point<f64>) -> StationHit {
        let station = &self.stations[idx];
        StationHit {
            station_id: station.id.clone(),
            location: station.location,
            distance_km: self.metric.distance_km(point, station.location),
        }
    }
}

fn sort_hits(hits: &mut [StationHit]) {
    hits.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.station_id.cmp(&b.station_id))
    });
}

fn cells_between(lo: CellKey, hi: CellKey) -> impl Iterator<Item = CellKey> {
    (lo.0..=hi.0).flat_map(move |ix| (lo.1..=hi.1).map(move |iy| (ix, iy)))
}

/// Cells at Chebyshev distance exactly `ring` from `center`.
fn ring_cells(center: CellKey, ring: i64) -> Vec<CellKey> {
    let (cx, cy) = center;
    if ring == 0 {
        return vec![center];
    }
    let mut cells = Vec::with_capacity((8 * ring) as usize);
    for dx in -ring..=ring {
        cells.push((cx + dx, cy - ring));
        cells.push((cx + dx, cy + ring));
    }
    for dy in (-ring + 1)..ring {
        cells.push((cx - ring, cy + dy));
        cells.push((cx + ring, cy + dy));
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str, x: f64, y: f64) -> WeatherStation {
        WeatherStation {
            id: id.to_string(),
            location: Point::new(x, y),
        }
    }

    fn planar_index() -> SpatialIndex {
        let farms = vec![
            GeoArea::rectangle("farm-b", (0.0, 0.0), (1000.0, 1000.0)).unwrap(),
            GeoArea::rectangle("farm-a", (5000.0, 5000.0), (7000.0, 6000.0)).unwrap(),
        ];
        let stations = vec![
            station("st-3", 3000.0, 0.0),
            station("st-1", 500.0, 500.0),
            station("st-2", -1500.0, 500.0),
            station("st-4", 500.0, -1500.0),
            station("st-9", 40000.0, 40000.0),
        ];
        SpatialIndex::build(farms, stations, 1000.0, DistanceMetric::Euclidean).unwrap()
    }

    #[test]
    fn test_point_inside_rectangle_resolves() {
        let index = planar_index();
        let farm = index.resolve_containing(Point::new(6000.0, 5500.0)).unwrap();
        assert_eq!(farm.id(), "farm-a");
    }

    #[test]
    fn test_point_outside_is_not_found() {
        let index = planar_index();
        let err = index
            .resolve_containing(Point::new(2500.0, 2500.0))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(index.containing(Point::new(-10.0, 10.0)).is_none());
    }

    #[test]
    fn test_nearest_stations_ordering_and_ties() {
        let index = planar_index();
        let hits = index.nearest_stations(Point::new(500.0, 500.0), 3);
        let ids: Vec<&str> = hits.iter().map(|h| h.station_id.as_str()).collect();
        // st-2 and st-4 are both 2 km away; the id breaks the tie.
        assert_eq!(ids, vec!["st-1", "st-2", "st-4"]);
        assert!((hits[1].distance_km - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_nearest_returns_fewer_when_index_small() {
        let index = planar_index();
        let hits = index.nearest_stations(Point::new(0.0, 0.0), 50);
        assert_eq!(hits.len(), 5);
        assert_eq!(hits.last().unwrap().station_id, "st-9");
        assert!(index.nearest_stations(Point::new(0.0, 0.0), 0).is_empty());
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let index = planar_index();
        let query = Point::new(2900.0, 100.0);
        let hits = index.nearest_stations(query, 2);
        assert_eq!(hits[0].station_id, "st-3");
        assert_eq!(hits[1].station_id, "st-1");
    }

    #[test]
    fn test_stations_within_radius() {
        let index = planar_index();
        let hits = index.stations_within(Point::new(500.0, 500.0), 2.0);
        let ids: Vec<&str> = hits.iter().map(|h| h.station_id.as_str()).collect();
        assert_eq!(ids, vec!["st-1", "st-2", "st-4"]);
    }

    #[test]
    fn test_haversine_within() {
        let stations = vec![
            station("near", -81.70, 36.50),
            station("far", -80.00, 36.50),
        ];
        let index =
            SpatialIndex::build(vec![], stations, 0.25, DistanceMetric::Haversine).unwrap();
        let hits = index.stations_within(Point::new(-81.74, 36.53), 25.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].station_id, "near");
        assert!(hits[0].distance_km < 10.0);
    }

    #[test]
    fn test_haversine_wraps_antimeridian() {
        let stations = vec![
            station("fiji-east", -179.95, -17.0),
            station("fiji-west", 179.0, -17.0),
        ];
        let index =
            SpatialIndex::build(vec![], stations, 0.25, DistanceMetric::Haversine).unwrap();
        let query = Point::new(179.95, -17.0);

        let within = index.stations_within(query, 50.0);
        assert_eq!(within.len(), 1);
        assert_eq!(within[0].station_id, "fiji-east");
        assert!((within[0].distance_km - 10.63).abs() < 0.05);

        let nearest = index.nearest_stations(query, 1);
        assert_eq!(nearest.len(), 1);
        assert_eq!(nearest[0].station_id, "fiji-east");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = SpatialIndex::build(
            vec![],
            vec![station("a", 0.0, 0.0), station("a", 1.0, 1.0)],
            1.0,
            DistanceMetric::Euclidean,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ring_cells_count() {
        assert_eq!(ring_cells((0, 0), 0).len(), 1);
        assert_eq!(ring_cells((0, 0), 1).len(), 8);
        assert_eq!(ring_cells((3, -2), 2).len(), 16);
    }
}
