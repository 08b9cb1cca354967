use crate::error::{AppError, Result};
use geo::{Area, BoundingRect, Centroid, Coord, Intersects, Line, LineString, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};

/// A farm boundary or affected region: an identifier plus a simple polygon.
///
/// Only constructible through [`GeoArea::new`], which rejects malformed rings
/// instead of repairing them.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoArea {
    id: String,
    polygon: Polygon<f64>,
    area: f64,
    bounds: Rect<f64>,
    centroid: Point<f64>,
}

impl GeoArea {
    /// Build an area from an explicitly closed ring of `(x, y)` coordinates
    /// (longitude/latitude or projected metres).
    pub fn new(id: impl Into<String>, ring: Vec<(f64, f64)>) -> Result<Self> {
        let id = id.into();
        validate_ring(&id, &ring)?;

        let exterior = LineString::from(ring);
        let polygon = Polygon::new(exterior, vec![]);

        let area = polygon.unsigned_area();
        if !(area > 0.0) {
            return Err(AppError::InvalidGeometry(format!(
                "area '{}' has zero area",
                id
            )));
        }

        let bounds = polygon.bounding_rect().ok_or_else(|| {
            AppError::InvalidGeometry(format!("area '{}' has no bounding box", id))
        })?;
        let centroid = polygon.centroid().ok_or_else(|| {
            AppError::InvalidGeometry(format!("area '{}' has no centroid", id))
        })?;

        Ok(Self {
            id,
            polygon,
            area,
            bounds,
            centroid,
        })
    }

    /// Axis-aligned rectangle, mostly for tests and gridded regions.
    pub fn rectangle(id: impl Into<String>, min: (f64, f64), max: (f64, f64)) -> Result<Self> {
        Self::new(
            id,
            vec![
                (min.0, min.1),
                (max.0, min.1),
                (max.0, max.1),
                (min.0, max.1),
                (min.0, min.1),
            ],
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    /// Planar area in squared coordinate units.
    pub fn area(&self) -> f64 {
        self.area
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    pub fn centroid(&self) -> Point<f64> {
        self.centroid
    }

    /// Strict interior containment; points on the boundary are outside.
    pub fn contains_point(&self, point: Point<f64>) -> bool {
        use geo::Contains;
        self.polygon.contains(&point)
    }

    pub fn ring(&self) -> Vec<(f64, f64)> {
        self.polygon.exterior().coords().map(|c| (c.x, c.y)).collect()
    }
}

/// Unvalidated `{ id, ring }` form of a [`GeoArea`], as written in data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaDef {
    pub id: String,
    pub ring: Vec<(f64, f64)>,
}

impl AreaDef {
    pub fn build(self) -> Result<GeoArea> {
        GeoArea::new(self.id, self.ring)
    }
}

impl Serialize for GeoArea {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        AreaDef {
            id: self.id.clone(),
            ring: self.ring(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GeoArea {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        AreaDef::deserialize(deserializer)?
            .build()
            .map_err(serde::de::Error::custom)
    }
}

fn validate_ring(id: &str, ring: &[(f64, f64)]) -> Result<()> {
    if ring.len() < 4 {
        return Err(AppError::InvalidGeometry(format!(
            "area '{}' needs at least 4 ring coordinates, got {}",
            id,
            ring.len()
        )));
    }

    if let Some((x, y)) = ring.iter().find(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(AppError::InvalidGeometry(format!(
            "area '{}' has non-finite coordinate ({}, {})",
            id, x, y
        )));
    }

    if ring.first() != ring.last() {
        return Err(AppError::InvalidGeometry(format!(
            "area '{}' ring is not closed",
            id
        )));
    }

    let lines: Vec<Line<f64>> = ring
        .windows(2)
        .map(|w| {
            Line::new(
                Coord { x: w[0].0, y: w[0].1 },
                Coord { x: w[1].0, y: w[1].1 },
            )
        })
        .collect();

    if let Some(idx) = lines.iter().position(|l| l.start == l.end) {
        return Err(AppError::InvalidGeometry(format!(
            "area '{}' has a zero-length edge at vertex {}",
            id, idx
        )));
    }

    let n = lines.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            if adjacent {
                continue;
            }
            if lines[i].intersects(&lines[j]) {
                return Err(AppError::InvalidGeometry(format!(
                    "area '{}' self-intersects between edges {} and {}",
                    id, i, j
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_is_valid() {
        let area = GeoArea::rectangle("farm-1", (0.0, 0.0), (2.0, 1.0)).unwrap();
        assert_eq!(area.id(), "farm-1");
        assert!((area.area() - 2.0).abs() < 1e-12);
        assert_eq!(area.centroid(), Point::new(1.0, 0.5));
    }

    #[test]
    fn test_open_ring_rejected() {
        let result = GeoArea::new("open", vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        assert!(matches!(result, Err(AppError::InvalidGeometry(_))));
    }

    #[test]
    fn test_bowtie_rejected() {
        let result = GeoArea::new(
            "bowtie",
            vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0), (0.0, 1.0), (0.0, 0.0)],
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("self-intersects"));
    }

    #[test]
    fn test_degenerate_ring_rejected() {
        let result = GeoArea::new(
            "line",
            vec![(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (0.0, 0.0)],
        );
        assert!(matches!(result, Err(AppError::InvalidGeometry(_))));
    }

    #[test]
    fn test_repeated_vertex_rejected() {
        let result = GeoArea::new(
            "dup",
            vec![(0.0, 0.0), (1.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)],
        );
        assert!(result.unwrap_err().to_string().contains("zero-length"));
    }

    #[test]
    fn test_boundary_point_not_contained() {
        let area = GeoArea::rectangle("farm", (0.0, 0.0), (1.0, 1.0)).unwrap();
        assert!(area.contains_point(Point::new(0.5, 0.5)));
        assert!(!area.contains_point(Point::new(1.0, 0.5)));
        assert!(!area.contains_point(Point::new(3.0, 3.0)));
    }

    #[test]
    fn test_deserialize_validates() {
        let yaml = "id: bad\nring: [[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]]\n";
        let result: std::result::Result<GeoArea, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }
}
