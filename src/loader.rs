use crate::error::{AppError, Result};
use crate::geometry::AreaDef;
use crate::models::{ClaimRecord, FarmId, FarmRecord, IndexObservation, IndexRaster, SoilClass};
use crate::parser::Parser;
use crate::sources::Dataset;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A `farms.yaml` entry. The boundary is validated after parsing so a bad
/// ring surfaces as `InvalidGeometry`, not as a YAML error.
#[derive(Debug, Deserialize)]
struct FarmEntry {
    id: FarmId,
    #[serde(default)]
    name: Option<String>,
    area: AreaDef,
    #[serde(default)]
    crop: Option<String>,
    #[serde(default)]
    soil_class: Option<SoilClass>,
    #[serde(default)]
    elevation_m: Option<f64>,
    #[serde(default)]
    slope_percent: Option<f64>,
    #[serde(default)]
    yield_history: Vec<f64>,
    #[serde(default)]
    claim_history: Vec<ClaimRecord>,
    insured_value: f64,
}

impl FarmEntry {
    fn into_record(self) -> Result<FarmRecord> {
        Ok(FarmRecord {
            id: self.id,
            name: self.name,
            area: self.area.build()?,
            crop: self.crop,
            soil_class: self.soil_class,
            elevation_m: self.elevation_m,
            slope_percent: self.slope_percent,
            yield_history: self.yield_history,
            claim_history: self.claim_history,
            insured_value: self.insured_value,
        })
    }
}

/// Load a dataset directory:
///
/// ```text
/// <dir>/farms.yaml          list of farm records
/// <dir>/vegetation.yaml     list of vegetation index observations (optional)
/// <dir>/imagery/*.yaml      one vegetation raster per file (optional)
/// <dir>/readings/*.txt      USCRN hourly station files (optional)
/// ```
pub fn load_dataset<P: AsRef<Path>>(dir: P) -> Result<Dataset> {
    let dir = dir.as_ref();
    let mut dataset = Dataset::new();

    let farms_path = dir.join("farms.yaml");
    let content = std::fs::read_to_string(&farms_path).map_err(|e| {
        AppError::Config(format!(
            "Failed to read farm registry {}: {}",
            farms_path.display(),
            e
        ))
    })?;
    let farms: Vec<FarmEntry> = serde_yaml::from_str(&content)?;
    for farm in farms {
        dataset.add_farm(farm.into_record()?)?;
    }

    let vegetation_path = dir.join("vegetation.yaml");
    if vegetation_path.exists() {
        let content = std::fs::read_to_string(&vegetation_path)?;
        let observations: Vec<IndexObservation> = serde_yaml::from_str(&content)?;
        debug!("Loaded {} vegetation observations", observations.len());
        dataset.add_observations(observations);
    }

    for path in matching(dir, "imagery/*.yaml")? {
        let content = std::fs::read_to_string(&path)?;
        let raster: IndexRaster = serde_yaml::from_str(&content)?;
        dataset.add_raster(raster)?;
    }

    for path in matching(dir, "readings/*.txt")? {
        let content = std::fs::read_to_string(&path)?;
        match Parser::parse_file(&content) {
            Ok((readings, stats)) => {
                debug!(
                    "Parsed {}: {} readings, {} failures",
                    path.display(),
                    stats.parsed_successfully,
                    stats.parse_failures
                );
                dataset.add_readings(readings)?;
            }
            Err(e) => {
                warn!("Skipping station file {}: {}", path.display(), e);
            }
        }
    }

    info!(
        "Loaded dataset from {}: {} farms, {} stations",
        dir.display(),
        dataset.farm_count(),
        dataset.station_count()
    );
    Ok(dataset)
}

/// Paths under `dir` matching `pattern`, sorted for a stable load order.
fn matching(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );

    let mut paths = Vec::new();
    for entry in glob::glob(&pattern)
        .map_err(|e| AppError::Config(format!("Invalid dataset pattern '{}': {}", pattern, e)))?
    {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => warn!("Unreadable dataset entry: {}", e),
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FarmRegistry, ObservationSource};
    use std::fs;

    const FARMS: &str = r#"
- id: farm-a
  area:
    id: farm-a
    ring: [[-81.80, 36.50], [-81.70, 36.50], [-81.70, 36.56], [-81.80, 36.56], [-81.80, 36.50]]
  crop: corn
  soil_class: silt_loam
  insured_value: 250000
"#;

    const LINE: &str = "53104 20240115 1400 20240115 0600 3   -81.74    36.53  -9999.0     4.1     4.9     3.4     0.0    45.5 0    58.6 0    35.9 0 C     1.1 0     2.1 0    -0.5 0    81.9 0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0";

    #[tokio::test]
    async fn test_load_dataset_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("farms.yaml"), FARMS).unwrap();
        fs::create_dir(dir.path().join("readings")).unwrap();
        fs::write(dir.path().join("readings").join("station.txt"), LINE).unwrap();
        fs::write(dir.path().join("readings").join("broken.txt"), "garbage\n").unwrap();

        let dataset = load_dataset(dir.path()).unwrap();
        assert_eq!(dataset.farm_count(), 1);
        assert_eq!(dataset.station_count(), 1);

        let farm = dataset.farm("farm-a").await.unwrap();
        assert_eq!(farm.insured_value, 250000.0);
        let stations = dataset.stations().await.unwrap();
        assert_eq!(stations[0].id, "53104");
    }

    #[test]
    fn test_missing_registry_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_dataset(dir.path());
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_invalid_farm_geometry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let farms = r#"
- id: bad
  area:
    id: bad
    ring: [[0, 0], [1, 1], [1, 0], [0, 1], [0, 0]]
  insured_value: 1
"#;
        fs::write(dir.path().join("farms.yaml"), farms).unwrap();
        let err = load_dataset(dir.path()).unwrap_err();
        assert!(matches!(err, AppError::InvalidGeometry(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_mismatched_boundary_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let farms = r#"
- id: farm-a
  area:
    id: boundary-7
    ring: [[0, 0], [1, 0], [1, 1], [0, 1], [0, 0]]
  insured_value: 1
"#;
        fs::write(dir.path().join("farms.yaml"), farms).unwrap();
        let result = load_dataset(dir.path());
        assert!(matches!(result, Err(AppError::InvalidData(_))));
    }
}
