use chrono::NaiveDate;
use microclimate_risk::models::{Period, Variable};
use microclimate_risk::parser::Parser;
use microclimate_risk::sources::{Dataset, ObservationSource};

const HOUR_14: &str = "53104 20240115 1400 20240115 0600 3   -81.74    36.53  -9999.0     4.1     4.9     3.4     0.0    45.5 0    58.6 0    35.9 0 C     1.1 0     2.1 0    -0.5 0    81.9 0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0";
const HOUR_15: &str = "53104 20240115 1500 20240115 0700 3   -81.74    36.53  -9999.0     4.5     5.2     4.0     1.2    52.3 0    65.4 0    42.1 0 C     1.8 0     2.5 0    -0.2 0    78.5 0     0.312   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0";
const NEXT_DAY: &str = "53104 20240116 0100 20240115 1700 3   -81.74    36.53  -9999.0     2.0     2.2     1.8     0.0    0.0 0     0.0 0     0.0 0 C     0.5 0     0.7 0     0.3 0    90.1 0     0.305   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0   -9999.0";

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Test parsing a station file and serving it through the observation source
#[tokio::test]
async fn test_parse_and_load_complete_flow() {
    let file_content = format!("{}\n{}\n{}", HOUR_14, HOUR_15, NEXT_DAY);

    let (readings, stats) = Parser::parse_file(&file_content).expect("Parse failed");
    assert_eq!(readings.len(), 3);
    assert_eq!(stats.parsed_successfully, 3);
    assert_eq!(stats.parse_failures, 0);

    let mut dataset = Dataset::new();
    dataset.add_readings(readings).expect("Load failed");
    assert_eq!(dataset.station_count(), 1);

    let stations = dataset.stations().await.unwrap();
    assert_eq!(stations[0].id, "53104");
    assert_eq!(stations[0].location.x(), -81.74);
    assert_eq!(stations[0].location.y(), 36.53);

    let period = Period::new(day(2024, 1, 15), day(2024, 1, 15)).unwrap();
    let series = dataset
        .station_series(&["53104".to_string()], &period)
        .await
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].readings().len(), 2);

    let first = &series[0].readings()[0];
    assert_eq!(first.value(Variable::Temperature), Some(4.1));
    assert_eq!(first.value(Variable::Precipitation), Some(0.0));
    assert_eq!(first.value(Variable::Humidity), Some(81.9));
    assert_eq!(first.value(Variable::SoilMoisture), None);

    let second = &series[0].readings()[1];
    assert_eq!(second.value(Variable::Precipitation), Some(1.2));
    assert_eq!(second.value(Variable::SoilMoisture), Some(0.312));
}

/// Test loading the same file twice keeps one reading per timestamp
#[tokio::test]
async fn test_reloading_file_does_not_duplicate_readings() {
    let (readings, _) = Parser::parse_file(HOUR_14).expect("Parse failed");

    let mut dataset = Dataset::new();
    dataset.add_readings(readings.clone()).unwrap();
    dataset.add_readings(readings).unwrap();

    let period = Period::new(day(2024, 1, 15), day(2024, 1, 15)).unwrap();
    let series = dataset
        .station_series(&["53104".to_string()], &period)
        .await
        .unwrap();
    assert_eq!(series[0].readings().len(), 1);
}

/// Test missing values (-9999) never read as zero
#[tokio::test]
async fn test_parse_missing_values_are_no_data() {
    let (readings, _) = Parser::parse_file(HOUR_14).expect("Parse failed");

    assert_eq!(readings[0].values.get(&Variable::SoilMoisture), Some(&None));
    assert_eq!(readings[0].value(Variable::WindSpeed), None);
}

/// Test parsing file with high failure rate rejects the file
#[tokio::test]
async fn test_parse_high_failure_rate_rejects_file() {
    // Mix of valid and invalid lines - 75% failure rate
    let file_content = format!(
        "invalid line without enough fields\n{}\nanother invalid line\nyet another invalid line",
        HOUR_14
    );

    let result = Parser::parse_file(&file_content);

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("exceeds threshold"));
}

/// Test parsing empty file
#[tokio::test]
async fn test_parse_empty_file() {
    let result = Parser::parse_file("");

    // Empty file returns Ok with empty readings
    assert!(result.is_ok());
    let (readings, stats) = result.unwrap();
    assert_eq!(readings.len(), 0);
    assert_eq!(stats.total_lines, 0);
}

/// Test parsing file with only whitespace
#[tokio::test]
async fn test_parse_whitespace_only_file() {
    let result = Parser::parse_file("   \n\n  \n\n");

    assert!(result.is_ok());
    let (readings, stats) = result.unwrap();
    assert_eq!(readings.len(), 0);
    assert_eq!(stats.empty_lines, 4);
}

/// Test custom failure threshold
#[tokio::test]
async fn test_parse_custom_failure_threshold() {
    // 50% failure rate
    let file_content = format!("invalid line\n{}", HOUR_14);

    // Default threshold (10%) should reject
    assert!(Parser::parse_file(&file_content).is_err());

    // 60% threshold should accept
    let (readings, stats) =
        Parser::parse_file_with_threshold(&file_content, 0.6).expect("Parse failed");
    assert_eq!(readings.len(), 1);
    assert_eq!(stats.parse_failures, 1);
}
