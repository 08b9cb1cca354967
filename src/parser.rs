use crate::error::{AppError, Result};
use crate::models::{StationReading, Variable};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use geo::Point;
use std::collections::BTreeMap;
use tracing::warn;

const MISSING_VALUE: f64 = -9999.0;
/// Soil sensors report this instead of -9999.
const MISSING_SOIL_VALUE: f64 = -99.0;

/// Default failure threshold - fail if more than 10% of lines fail to parse
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.10;

// Column positions in USCRN hourly files.
const COL_WBANNO: usize = 0;
const COL_UTC_DATE: usize = 1;
const COL_UTC_TIME: usize = 2;
const COL_LONGITUDE: usize = 6;
const COL_LATITUDE: usize = 7;
const COL_T_CALC: usize = 8;
const COL_T_HR_AVG: usize = 9;
const COL_P_CALC: usize = 12;
const COL_RH_HR_AVG: usize = 26;
const COL_SOIL_MOISTURE_5: usize = 28;
const MIN_FIELDS: usize = 28;

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_lines: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub empty_lines: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        let non_empty = self.total_lines - self.empty_lines;
        self.failure_rate = if non_empty > 0 {
            self.parse_failures as f64 / non_empty as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

/// Reader for USCRN hourly station files.
///
/// Each line becomes a [`StationReading`] keyed by the station's WBAN
/// number, located at the file's longitude/latitude columns. `-9999`
/// (and `-99` for soil sensors) become explicit no-data markers.
pub struct Parser;

impl Parser {
    /// Parse a station file and return readings with parse statistics
    pub fn parse_file(content: &str) -> Result<(Vec<StationReading>, ParseStats)> {
        Self::parse_file_with_threshold(content, DEFAULT_FAILURE_THRESHOLD)
    }

    /// Parse a station file with a custom failure threshold
    pub fn parse_file_with_threshold(
        content: &str,
        failure_threshold: f64,
    ) -> Result<(Vec<StationReading>, ParseStats)> {
        let mut readings = Vec::new();
        let mut stats = ParseStats::new();

        for (line_num, line) in content.lines().enumerate() {
            stats.total_lines += 1;

            let line = line.trim();
            if line.is_empty() {
                stats.empty_lines += 1;
                continue;
            }

            match Self::parse_line(line) {
                Ok(reading) => {
                    readings.push(reading);
                    stats.parsed_successfully += 1;
                }
                Err(e) => {
                    stats.parse_failures += 1;
                    warn!(
                        "Failed to parse line {} (failure {}/{}): {} - {}",
                        line_num + 1,
                        stats.parse_failures,
                        stats.total_lines - stats.empty_lines,
                        e,
                        line
                    );
                }
            }
        }

        stats.finalize();

        if stats.exceeds_threshold(failure_threshold) {
            return Err(AppError::Parse(format!(
                "Parse failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} non-empty lines",
                stats.failure_rate * 100.0,
                failure_threshold * 100.0,
                stats.parse_failures,
                stats.total_lines - stats.empty_lines
            )));
        }

        if readings.is_empty() && stats.total_lines > stats.empty_lines {
            return Err(AppError::Parse(
                "No readings successfully parsed from non-empty file".to_string(),
            ));
        }

        Ok((readings, stats))
    }

    fn parse_line(line: &str) -> Result<StationReading> {
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields.len() < MIN_FIELDS {
            return Err(AppError::Parse(format!(
                "Expected at least {} fields, got {}",
                MIN_FIELDS,
                fields.len()
            )));
        }

        let wbanno = parse_int(fields[COL_WBANNO])?;
        let utc_date = parse_int(fields[COL_UTC_DATE])?;
        let utc_time = parse_int(fields[COL_UTC_TIME])?;
        let timestamp = parse_datetime(utc_date, utc_time)?;

        let longitude = parse_coordinate(fields[COL_LONGITUDE], 180.0)?;
        let latitude = parse_coordinate(fields[COL_LATITUDE], 90.0)?;

        // Hourly average, falling back to the last-5-minute value.
        let temperature = parse_optional_float(fields.get(COL_T_HR_AVG).copied())
            .or_else(|| parse_optional_float(fields.get(COL_T_CALC).copied()));

        let mut values = BTreeMap::new();
        values.insert(Variable::Temperature, temperature);
        values.insert(
            Variable::Precipitation,
            parse_optional_float(fields.get(COL_P_CALC).copied()),
        );
        values.insert(
            Variable::Humidity,
            parse_optional_float(fields.get(COL_RH_HR_AVG).copied()),
        );
        values.insert(
            Variable::SoilMoisture,
            parse_optional_soil(fields.get(COL_SOIL_MOISTURE_5).copied()),
        );
        // Hourly files carry no wind column.
        values.insert(Variable::WindSpeed, None);

        Ok(StationReading {
            station_id: wbanno.to_string(),
            location: Point::new(longitude, latitude),
            timestamp,
            values,
        })
    }
}

fn parse_int(s: &str) -> Result<i32> {
    s.parse::<i32>()
        .map_err(|e| AppError::Parse(format!("Failed to parse int '{}': {}", s, e)))
}

fn parse_coordinate(s: &str, limit: f64) -> Result<f64> {
    let value = s
        .parse::<f64>()
        .map_err(|e| AppError::Parse(format!("Failed to parse coordinate '{}': {}", s, e)))?;
    if !value.is_finite() || value.abs() > limit {
        return Err(AppError::Parse(format!(
            "Coordinate {} outside ±{}",
            value, limit
        )));
    }
    Ok(value)
}

fn parse_optional_float(s: Option<&str>) -> Option<f64> {
    s.and_then(|s| {
        let val = s.parse::<f64>().ok()?;
        if (val - MISSING_VALUE).abs() < 0.1 || !val.is_finite() {
            None
        } else {
            Some(val)
        }
    })
}

fn parse_optional_soil(s: Option<&str>) -> Option<f64> {
    parse_optional_float(s).filter(|v| (v - MISSING_SOIL_VALUE).abs() >= 0.01)
}

fn parse_datetime(date: i32, time: i32) -> Result<chrono::DateTime<Utc>> {
    // Date format: YYYYMMDD
    // Time format: HHMM

    let year = date / 10000;
    let month = (date % 10000) / 100;
    let day = date % 100;

    let hour = time / 100;
    let minute = time % 100;

    // Validate ranges before creating date/time
    if !(1900..=2100).contains(&year) {
        return Err(AppError::Parse(format!(
            "Year {} out of valid range (1900-2100) from date {}",
            year, date
        )));
    }

    if !(1..=12).contains(&month) {
        return Err(AppError::Parse(format!(
            "Month {} out of valid range (1-12) from date {}",
            month, date
        )));
    }

    if !(1..=31).contains(&day) {
        return Err(AppError::Parse(format!(
            "Day {} out of valid range (1-31) from date {}",
            day, date
        )));
    }

    if hour > 23 {
        return Err(AppError::Parse(format!(
            "Hour {} out of valid range (0-23) from time {}",
            hour, time
        )));
    }

    if minute > 59 {
        return Err(AppError::Parse(format!(
            "Minute {} out of valid range (0-59) from time {}",
            minute, time
        )));
    }

    let naive_date = NaiveDate::from_ymd_opt(year, month as u32, day as u32).ok_or_else(|| {
        AppError::Parse(format!(
            "Invalid date combination: year={}, month={}, day={} from {}",
            year, month, day, date
        ))
    })?;

    let naive_time = NaiveTime::from_hms_opt(hour as u32, minute as u32, 0).ok_or_else(|| {
        AppError::Parse(format!(
            "Invalid time combination: hour={}, minute={} from {}",
            hour, minute, time
        ))
    })?;

    let naive_datetime = NaiveDateTime::new(naive_date, naive_time);

    Ok(Utc.from_utc_datetime(&naive_datetime))
}
