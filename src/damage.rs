use crate::config::DamageConfig;
use crate::error::{AppError, Result};
use crate::models::{DamageEstimate, FarmRecord, IndexRaster, Peril, Severity};
use chrono::{DateTime, Utc};
use geo::{coord, Area, BooleanOps, MultiPolygon, Rect};
use rayon::prelude::*;
use tracing::{debug, info};
use uuid::Uuid;

/// One raster cell clipped to the farm boundary, observed in both rasters.
struct CoveredCell {
    clipped: MultiPolygon<f64>,
    area: f64,
    delta: f64,
}

#[derive(Debug, Clone)]
pub struct DamageDetector {
    config: DamageConfig,
}

impl DamageDetector {
    pub fn new(config: DamageConfig) -> Self {
        Self { config }
    }

    pub fn detect(
        &self,
        farm: &FarmRecord,
        pre: &IndexRaster,
        post: &IndexRaster,
        event_time: DateTime<Utc>,
        peril: Peril,
    ) -> Result<DamageEstimate> {
        if !(pre.timestamp < event_time && event_time <= post.timestamp) {
            return Err(AppError::InvalidEventWindow(format!(
                "need pre {} < event {} <= post {}",
                pre.timestamp, event_time, post.timestamp
            )));
        }
        for raster in [pre, post] {
            raster.validate()?;
            if raster.farm_id != farm.id {
                return Err(AppError::InvalidData(format!(
                    "raster for farm '{}' passed for farm '{}'",
                    raster.farm_id, farm.id
                )));
            }
        }
        if !pre.aligned_with(post) {
            return Err(AppError::InvalidData(format!(
                "pre and post rasters of farm '{}' are on different grids",
                farm.id
            )));
        }

        let cells = covered_cells(farm, pre, post);
        let farm_area = farm.area.area();
        let covered_area: f64 = cells.iter().map(|c| c.area).sum();
        let coverage = (covered_area / farm_area).clamp(0.0, 1.0);

        if covered_area <= 0.0 || coverage < self.config.min_coverage {
            info!(
                "Imagery covers {:.1}% of farm {}, below the {:.1}% minimum",
                coverage * 100.0,
                farm.id,
                self.config.min_coverage * 100.0
            );
            return Err(AppError::InsufficientCoverage {
                covered: coverage,
                required: self.config.min_coverage,
            });
        }

        let threshold = self.config.threshold(peril);
        let mean_delta = cells.iter().map(|c| c.area * c.delta).sum::<f64>() / covered_area;

        let affected: Vec<&CoveredCell> = cells.iter().filter(|c| c.delta <= -threshold).collect();
        let affected_area: f64 = affected.iter().map(|c| c.area).sum();
        let affected_fraction = (affected_area / covered_area).clamp(0.0, 1.0);

        let geometry = affected
            .iter()
            .fold(MultiPolygon::new(vec![]), |acc, c| acc.union(&c.clipped));

        let loss_fraction = if affected_area > 0.0 {
            let mean_drop =
                affected.iter().map(|c| c.area * -c.delta).sum::<f64>() / affected_area;
            let intensity = (mean_drop / self.config.full_loss_drop).min(1.0);
            (affected_fraction * intensity).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let severity = self.severity(mean_delta);
        debug!(
            "Farm {} {}: {} of {} covered cells affected, mean delta {:.4}, severity {}",
            farm.id,
            peril,
            affected.len(),
            cells.len(),
            mean_delta,
            severity.as_str()
        );

        Ok(DamageEstimate {
            id: Uuid::new_v4(),
            farm_id: farm.id.clone(),
            peril,
            event_time,
            pre_timestamp: pre.timestamp,
            post_timestamp: post.timestamp,
            affected_area: geometry,
            affected_fraction,
            coverage_fraction: coverage,
            mean_delta,
            severity,
            loss_fraction,
            recommendations: damage_recommendations(loss_fraction, peril),
            created_at: Utc::now(),
        })
    }

    /// Buckets the degradation magnitude; improvement counts as no damage.
    pub fn severity(&self, mean_delta: f64) -> Severity {
        let magnitude = (-mean_delta).max(0.0);
        let [minor, moderate, severe, extreme] = self.config.severity_breaks;
        if magnitude >= extreme {
            Severity::Extreme
        } else if magnitude >= severe {
            Severity::Severe
        } else if magnitude >= moderate {
            Severity::Moderate
        } else if magnitude >= minor {
            Severity::Minor
        } else {
            Severity::None
        }
    }
}

fn covered_cells(farm: &FarmRecord, pre: &IndexRaster, post: &IndexRaster) -> Vec<CoveredCell> {
    let bounds = farm.area.bounds();
    let polygon = farm.area.polygon();

    (0..pre.grid.cell_count())
        .into_par_iter()
        .filter_map(|idx| {
            let before = pre.values[idx].filter(|v| v.is_finite())?;
            let after = post.values[idx].filter(|v| v.is_finite())?;

            let ((x0, y0), (x1, y1)) = pre.grid.cell_bounds(idx);
            if x1 <= bounds.min().x
                || x0 >= bounds.max().x
                || y1 <= bounds.min().y
                || y0 >= bounds.max().y
            {
                return None;
            }

            let cell = Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }).to_polygon();
            let clipped = polygon.intersection(&cell);
            let area = clipped.unsigned_area();
            (area > 0.0).then(|| CoveredCell {
                clipped,
                area,
                delta: f64::from(after) - f64::from(before),
            })
        })
        .collect()
}

const MAX_RECOMMENDATIONS: usize = 5;

pub fn damage_recommendations(loss_fraction: f64, peril: Peril) -> Vec<String> {
    let mut notes = if loss_fraction > 0.5 {
        vec![
            "Severe loss: assess replanting options",
            "Notify the insurer and open a claim",
            "Check soil condition before any replanting",
        ]
    } else if loss_fraction > 0.25 {
        vec![
            "Moderate loss: monitor crop recovery over the next weeks",
            "Consider a partial claim",
        ]
    } else {
        vec!["Minor or no loss detected: continue routine monitoring"]
    };

    match peril {
        Peril::Hail => {
            notes.push("Inspect irrigation equipment for hail damage");
            notes.push("Watch damaged tissue for disease");
        }
        Peril::Drought => {
            notes.push("Prioritise remaining water for the most affected blocks");
        }
        Peril::Flood => {
            notes.push("Check for erosion and nutrient leaching");
        }
        Peril::Frost => {
            notes.push("Re-inspect buds and flowers once temperatures recover");
        }
        Peril::Pestilence => {
            notes.push("Confirm the pest or pathogen before treating");
        }
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
    use crate::geometry::GeoArea;
    use crate::models::RasterGrid;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn farm() -> FarmRecord {
        FarmRecord {
            id: "farm-1".to_string(),
            name: None,
            area: GeoArea::rectangle("farm-1", (0.0, 0.0), (100.0, 100.0)).unwrap(),
            crop: None,
            soil_class: None,
            elevation_m: None,
            slope_percent: None,
            yield_history: vec![],
            claim_history: vec![],
            insured_value: 10_000.0,
        }
    }

    fn raster(day: u32, values: Vec<Option<f32>>) -> IndexRaster {
        IndexRaster {
            farm_id: "farm-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 7, day, 10, 0, 0).unwrap(),
            grid: RasterGrid {
                origin_x: 0.0,
                origin_y: 0.0,
                cell_size: 25.0,
                cols: 4,
                rows: 4,
            },
            values,
        }
    }

    fn event() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 10, 15, 0, 0).unwrap()
    }

    /// Left half of the farm drops by 0.3, right half unchanged.
    fn left_half_damaged() -> (IndexRaster, IndexRaster) {
        let pre = raster(5, vec![Some(0.8); 16]);
        let post_values = (0..16)
            .map(|idx| if idx % 4 < 2 { Some(0.5) } else { Some(0.8) })
            .collect();
        (pre, raster(12, post_values))
    }

    #[test]
    fn test_half_farm_damaged() {
        let detector = DamageDetector::new(DamageConfig::default());
        let (pre, post) = left_half_damaged();
        let estimate = detector
            .detect(&farm(), &pre, &post, event(), Peril::Hail)
            .unwrap();

        assert_relative_eq!(estimate.coverage_fraction, 1.0, epsilon = 1e-9);
        assert_relative_eq!(estimate.affected_fraction, 0.5, epsilon = 1e-9);
        assert_relative_eq!(estimate.mean_delta, -0.15, epsilon = 1e-6);
        assert_relative_eq!(estimate.affected_area.unsigned_area(), 5000.0, epsilon = 1e-6);
        assert_relative_eq!(estimate.loss_fraction, 0.375, epsilon = 1e-6);
        assert_eq!(estimate.severity, Severity::Severe);
        assert!(!estimate.recommendations.is_empty());
    }

    #[test]
    fn test_affected_area_within_farm() {
        let detector = DamageDetector::new(DamageConfig::default());
        let small_farm = FarmRecord {
            area: GeoArea::new(
                "farm-1",
                vec![(10.0, 10.0), (90.0, 10.0), (50.0, 80.0), (10.0, 10.0)],
            )
            .unwrap(),
            ..farm()
        };
        let (pre, post) = left_half_damaged();
        let estimate = detector
            .detect(&small_farm, &pre, &post, event(), Peril::Hail)
            .unwrap();

        let boundary = MultiPolygon::new(vec![small_farm.area.polygon().clone()]);
        let outside = estimate.affected_area.difference(&boundary);
        assert!(outside.unsigned_area() < 1e-6);
        assert!(estimate.affected_area.unsigned_area() > 0.0);
    }

    #[test]
    fn test_coverage_gate() {
        let detector = DamageDetector::new(DamageConfig::default());
        let pre = raster(5, vec![Some(0.8); 16]);
        // Only the bottom row observed after the event.
        let post = raster(
            12,
            (0..16).map(|idx| (idx < 4).then_some(0.4)).collect(),
        );
        match detector.detect(&farm(), &pre, &post, event(), Peril::Hail) {
            Err(AppError::InsufficientCoverage { covered, required }) => {
                assert_relative_eq!(covered, 0.25, epsilon = 1e-9);
                assert_eq!(required, DamageConfig::default().min_coverage);
            }
            other => panic!("expected InsufficientCoverage, got {:?}", other.map(|e| e.id)),
        }
    }

    #[test]
    fn test_event_window_checked() {
        let detector = DamageDetector::new(DamageConfig::default());
        let (pre, post) = left_half_damaged();
        let too_early = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let result = detector.detect(&farm(), &pre, &post, too_early, Peril::Hail);
        assert!(matches!(result, Err(AppError::InvalidEventWindow(_))));

        // Event exactly at the post timestamp is allowed.
        let result = detector.detect(&farm(), &pre, &post, post.timestamp, Peril::Hail);
        assert!(result.is_ok());
    }

    #[test]
    fn test_misaligned_grids_rejected() {
        let detector = DamageDetector::new(DamageConfig::default());
        let (pre, mut post) = left_half_damaged();
        post.grid.origin_x = 5.0;
        let result = detector.detect(&farm(), &pre, &post, event(), Peril::Hail);
        assert!(matches!(result, Err(AppError::InvalidData(_))));
    }

    #[test]
    fn test_severity_monotone() {
        let detector = DamageDetector::new(DamageConfig::default());
        let mut previous = Severity::None;
        for step in 0..=50 {
            let severity = detector.severity(-(step as f64) / 100.0);
            assert!(severity >= previous);
            previous = severity;
        }
        assert_eq!(detector.severity(0.3), Severity::None);
        assert_eq!(detector.severity(-0.5), Severity::Extreme);
    }
}
