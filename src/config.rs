use crate::error::{AppError, Result};
use crate::models::Peril;
use crate::scoring::{
    default_factors, CompositeRule, LogisticParams, ModelKind, ModelSpec, PremiumSchedule,
};
use crate::spatial::DistanceMetric;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Without a database the binary keeps history in memory.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub spatial: SpatialConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub premium: PremiumSchedule,
    #[serde(default)]
    pub damage: DamageConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
    /// Length of the trailing assessment period, ending yesterday.
    #[serde(default = "default_period_days")]
    pub period_days: u32,
    #[serde(default = "default_perils")]
    pub perils: Vec<Peril>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            initial_delay_seconds: default_initial_delay(),
            period_days: default_period_days(),
            perils: default_perils(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    24 * 60
}

fn default_initial_delay() -> u64 {
    10
}

fn default_period_days() -> u32 {
    30
}

fn default_perils() -> Vec<Peril> {
    Peril::ALL.to_vec()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpatialConfig {
    /// Grid cell edge in coordinate units (degrees for haversine).
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_size: default_cell_size(),
            metric: DistanceMetric::default(),
        }
    }
}

fn default_cell_size() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub max_station_distance_km: f64,
    pub max_stations: usize,
    pub idw_power: f64,
    pub low_quality_weight: f64,
    /// Expected days between vegetation observations.
    pub revisit_days: u32,
    pub baseline_years: u32,
    pub min_baseline_years: u32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_station_distance_km: 50.0,
            max_stations: 5,
            idw_power: 2.0,
            low_quality_weight: 0.5,
            revisit_days: 5,
            baseline_years: 3,
            min_baseline_years: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    #[serde(default = "default_model_version")]
    pub active_version: String,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSpec>,
    #[serde(default = "default_min_feature_coverage")]
    pub min_feature_coverage: f64,
    #[serde(default)]
    pub composite: CompositeRule,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            active_version: default_model_version(),
            models: default_models(),
            min_feature_coverage: default_min_feature_coverage(),
            composite: CompositeRule::default(),
        }
    }
}

fn default_model_version() -> String {
    "rules-v1".to_string()
}

fn default_models() -> Vec<ModelSpec> {
    vec![ModelSpec {
        version: default_model_version(),
        kind: ModelKind::RuleBased,
        logistic: LogisticParams::default(),
        perils: default_factors(),
    }]
}

fn default_min_feature_coverage() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DamageConfig {
    /// Minimum share of the farm both rasters must observe.
    pub min_coverage: f64,
    /// Index drop that marks a cell affected, per peril.
    pub thresholds: BTreeMap<Peril, f64>,
    pub default_threshold: f64,
    /// Degradation magnitudes at which severity becomes minor, moderate,
    /// severe and extreme.
    pub severity_breaks: [f64; 4],
    /// Mean drop over affected cells that counts as total loss there.
    pub full_loss_drop: f64,
}

impl Default for DamageConfig {
    fn default() -> Self {
        let thresholds = [
            (Peril::Hail, 0.10),
            (Peril::Flood, 0.08),
            (Peril::Drought, 0.05),
            (Peril::Pestilence, 0.05),
            (Peril::Frost, 0.08),
        ]
        .into_iter()
        .collect();
        Self {
            min_coverage: 0.6,
            thresholds,
            default_threshold: 0.1,
            severity_breaks: [0.02, 0.05, 0.1, 0.2],
            full_loss_drop: 0.4,
        }
    }
}

impl DamageConfig {
    pub fn threshold(&self, peril: Peril) -> f64 {
        self.thresholds
            .get(&peril)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PortfolioConfig {
    /// Composite scores below this are low risk.
    pub low_max: f64,
    /// Composite scores below this (and not low) are medium risk.
    pub medium_max: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            low_max: 0.3,
            medium_max: 0.7,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables and empty database fields
    /// - Fractions outside [0, 1] and non-positive sizes or intervals
    /// - Severity and bucket breakpoints that are not increasing
    /// - An active model version that is not configured
    pub fn validate(&self) -> Result<()> {
        if let Some(database) = &self.database {
            validate_database(database)?;
        }

        if self.scheduler.interval_minutes == 0 {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.period_days == 0 {
            return Err(AppError::Config(
                "Scheduler period_days must be at least 1".to_string(),
            ));
        }
        if self.scheduler.perils.is_empty() {
            return Err(AppError::Config(
                "Scheduler perils cannot be empty".to_string(),
            ));
        }

        if !(self.spatial.cell_size > 0.0) {
            return Err(AppError::Config(format!(
                "Spatial cell_size must be positive, got {}",
                self.spatial.cell_size
            )));
        }

        let fusion = &self.fusion;
        if !(fusion.max_station_distance_km > 0.0) || fusion.max_stations == 0 {
            return Err(AppError::Config(
                "Fusion needs a positive max_station_distance_km and max_stations".to_string(),
            ));
        }
        if !(fusion.idw_power > 0.0) {
            return Err(AppError::Config(format!(
                "Fusion idw_power must be positive, got {}",
                fusion.idw_power
            )));
        }
        check_fraction("fusion.low_quality_weight", fusion.low_quality_weight)?;
        if fusion.revisit_days == 0 {
            return Err(AppError::Config(
                "Fusion revisit_days must be at least 1".to_string(),
            ));
        }
        if fusion.min_baseline_years > fusion.baseline_years {
            return Err(AppError::Config(format!(
                "Fusion min_baseline_years {} exceeds baseline_years {}",
                fusion.min_baseline_years, fusion.baseline_years
            )));
        }

        check_fraction("scoring.min_feature_coverage", self.scoring.min_feature_coverage)?;
        if !self
            .scoring
            .models
            .iter()
            .any(|m| m.version == self.scoring.active_version)
        {
            return Err(AppError::Config(format!(
                "Active model version '{}' is not among the configured models",
                self.scoring.active_version
            )));
        }
        for model in &self.scoring.models {
            for (peril, factors) in &model.perils {
                if factors.iter().any(|f| !(f.weight >= 0.0)) {
                    return Err(AppError::Config(format!(
                        "Model '{}' has a negative {} factor weight",
                        model.version, peril
                    )));
                }
            }
        }

        let premium = &self.premium;
        if premium.base_rate < 0.0 || premium.risk_loading < 0.0 || premium.min_premium < 0.0 {
            return Err(AppError::Config(
                "Premium base_rate, risk_loading and min_premium cannot be negative".to_string(),
            ));
        }

        let damage = &self.damage;
        check_fraction("damage.min_coverage", damage.min_coverage)?;
        if damage
            .thresholds
            .values()
            .chain(std::iter::once(&damage.default_threshold))
            .any(|t| !(*t >= 0.0))
        {
            return Err(AppError::Config(
                "Damage thresholds cannot be negative".to_string(),
            ));
        }
        if damage.severity_breaks[0] <= 0.0
            || damage.severity_breaks.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(AppError::Config(format!(
                "Damage severity_breaks must be positive and increasing, got {:?}",
                damage.severity_breaks
            )));
        }
        if !(damage.full_loss_drop > 0.0) {
            return Err(AppError::Config(
                "Damage full_loss_drop must be positive".to_string(),
            ));
        }

        let portfolio = &self.portfolio;
        if !(0.0 < portfolio.low_max
            && portfolio.low_max < portfolio.medium_max
            && portfolio.medium_max <= 1.0)
        {
            return Err(AppError::Config(format!(
                "Portfolio buckets need 0 < low_max < medium_max <= 1, got {} and {}",
                portfolio.low_max, portfolio.medium_max
            )));
        }

        if self.batch.max_concurrency == 0 {
            return Err(AppError::Config(
                "Batch max_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_database(database: &DatabaseConfig) -> Result<()> {
    // Check if any database field contains unexpanded environment variables
    let fields_to_check = [
        ("DB_HOST", &database.host),
        ("DB_NAME", &database.name),
        ("DB_USER", &database.user),
        ("DB_PASSWORD", &database.password),
    ];

    for (field_name, value) in &fields_to_check {
        if value.contains("${") {
            return Err(AppError::Config(format!(
                "{} environment variable is not set. \
                 Please set it or create a .env file. \
                 See .env.example for required variables.",
                field_name
            )));
        }
    }

    if database.host.is_empty() {
        return Err(AppError::Config(
            "Database host cannot be empty".to_string(),
        ));
    }

    if database.name.is_empty() {
        return Err(AppError::Config(
            "Database name cannot be empty".to_string(),
        ));
    }

    if database.user.is_empty() {
        return Err(AppError::Config(
            "Database user cannot be empty".to_string(),
        ));
    }

    if database.port == 0 {
        return Err(AppError::Config("Database port cannot be 0".to_string()));
    }

    if database.max_connections == 0 || database.max_connections > 100 {
        return Err(AppError::Config(format!(
            "Database max_connections must be between 1 and 100, got {}",
            database.max_connections
        )));
    }

    Ok(())
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(AppError::Config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
