//! Typed visit records and the CSV decode step.
//!
//! Expected columns: `date,time,age,arrival,disposition,card_type,stay_minutes`.
//! Extra columns are ignored. Bad rows are counted and reported as warnings;
//! they never abort the whole parse.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const EXPECTED_COLUMNS: [&str; 7] = [
    "date", "time", "age", "arrival", "disposition", "card_type", "stay_minutes",
];

/// Warnings are capped so a pathological file cannot balloon the report.
const MAX_ROW_WARNINGS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalMode {
    WalkIn,
    Ambulance,
    Transfer,
    Other,
}

impl ArrivalMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "walk-in" | "walkin" => ArrivalMode::WalkIn,
            "ambulance" => ArrivalMode::Ambulance,
            "transfer" => ArrivalMode::Transfer,
            _ => ArrivalMode::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArrivalMode::WalkIn => "walk-in",
            ArrivalMode::Ambulance => "ambulance",
            ArrivalMode::Transfer => "transfer",
            ArrivalMode::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Discharged,
    Admitted,
    Transferred,
    Died,
    Left,
}

impl Disposition {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "discharged" => Some(Disposition::Discharged),
            "admitted" => Some(Disposition::Admitted),
            "transferred" => Some(Disposition::Transferred),
            "died" => Some(Disposition::Died),
            "left" => Some(Disposition::Left),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Discharged => "discharged",
            Disposition::Admitted => "admitted",
            Disposition::Transferred => "transferred",
            Disposition::Died => "died",
            Disposition::Left => "left",
        }
    }
}

/// One decoded emergency-department visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub date: NaiveDate,
    /// Arrival hour 0-23; None when the time column is empty or unparsable.
    pub hour: Option<u8>,
    pub age: Option<u16>,
    pub arrival: ArrivalMode,
    pub disposition: Disposition,
    pub card_type: String,
    pub stay_minutes: Option<u32>,
    /// Which configured source this record came from; tagged at decode time.
    pub source_id: String,
}

/// Per-day aggregate. Counter fields are summable across sources; the
/// average is always recomputed from the summed numerator/denominator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub visits: u64,
    pub admitted: u64,
    pub ambulance_arrivals: u64,
    pub total_stay_minutes: u64,
    /// Number of records that carried a stay time. Denominator for
    /// `avg_stay_minutes`; rows without one do not dilute the average.
    pub stay_samples: u64,
    pub avg_stay_minutes: f64,
    pub by_hour: [u64; 24],
}

impl DailyStat {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            visits: 0,
            admitted: 0,
            ambulance_arrivals: 0,
            total_stay_minutes: 0,
            stay_samples: 0,
            avg_stay_minutes: 0.0,
            by_hour: [0; 24],
        }
    }

    pub fn recompute_avg(&mut self) {
        self.avg_stay_minutes = if self.stay_samples > 0 {
            self.total_stay_minutes as f64 / self.stay_samples as f64
        } else {
            0.0
        };
    }
}

/// Per-year secondary aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlyStat {
    pub year: i32,
    pub visits: u64,
    pub admitted: u64,
    pub avg_stay_minutes: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<VisitRecord>,
    pub rows: u64,
    pub bad_rows: u64,
    pub warnings: Vec<String>,
}

/// Decode a CSV body into visit records, tagging each with `source_id`.
pub fn parse_visits(body: &str, source_id: &str) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(err) => {
            out.warnings.push(format!("bad_header: {}", err));
            return out;
        }
    };
    let col = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let date_col = col("date");
    let time_col = col("time");
    let age_col = col("age");
    let arrival_col = col("arrival");
    let disposition_col = col("disposition");
    let card_col = col("card_type");
    let stay_col = col("stay_minutes");

    let date_col = match date_col {
        Some(i) => i,
        None => {
            out.warnings.push("missing_column: date".to_string());
            return out;
        }
    };
    let disposition_col = match disposition_col {
        Some(i) => i,
        None => {
            out.warnings.push("missing_column: disposition".to_string());
            return out;
        }
    };

    for (line, row) in reader.records().enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(err) => {
                out.bad_rows += 1;
                push_warning(&mut out.warnings, format!("bad_row line {}: {}", line + 2, err));
                continue;
            }
        };
        out.rows += 1;

        let date = match row.get(date_col).and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok()) {
            Some(d) => d,
            None => {
                out.bad_rows += 1;
                push_warning(&mut out.warnings, format!("bad_date line {}", line + 2));
                continue;
            }
        };
        let disposition = match row.get(disposition_col).and_then(Disposition::parse) {
            Some(d) => d,
            None => {
                out.bad_rows += 1;
                push_warning(&mut out.warnings, format!("bad_disposition line {}", line + 2));
                continue;
            }
        };

        let hour = time_col
            .and_then(|i| row.get(i))
            .and_then(|v| v.split(':').next())
            .and_then(|h| h.parse::<u8>().ok())
            .filter(|h| *h < 24);
        let age = age_col.and_then(|i| row.get(i)).and_then(|v| v.parse().ok());
        let arrival = arrival_col
            .and_then(|i| row.get(i))
            .map(ArrivalMode::parse)
            .unwrap_or(ArrivalMode::Other);
        let card_type = card_col
            .and_then(|i| row.get(i))
            .unwrap_or("")
            .to_string();
        let stay_minutes = stay_col
            .and_then(|i| row.get(i))
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse().ok());

        out.records.push(VisitRecord {
            date,
            hour,
            age,
            arrival,
            disposition,
            card_type,
            stay_minutes,
            source_id: source_id.to_string(),
        });
    }

    out
}

fn push_warning(warnings: &mut Vec<String>, message: String) {
    if warnings.len() < MAX_ROW_WARNINGS {
        warnings.push(message);
    } else if warnings.len() == MAX_ROW_WARNINGS {
        warnings.push("further row warnings suppressed".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
date,time,age,arrival,disposition,card_type,stay_minutes
2026-02-10,08:15,34,walk-in,discharged,standard,95
2026-02-10,09:40,71,ambulance,admitted,emergency,310
2026-02-11,,55,transfer,transferred,referral,
";

    #[test]
    fn test_parse_basic() {
        let out = parse_visits(SAMPLE, "primary");
        assert_eq!(out.rows, 3);
        assert_eq!(out.bad_rows, 0);
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.records[0].hour, Some(8));
        assert_eq!(out.records[0].stay_minutes, Some(95));
        assert_eq!(out.records[1].arrival, ArrivalMode::Ambulance);
        assert_eq!(out.records[1].disposition, Disposition::Admitted);
        assert_eq!(out.records[2].hour, None);
        assert_eq!(out.records[2].stay_minutes, None);
        assert!(out.records.iter().all(|r| r.source_id == "primary"));
    }

    #[test]
    fn test_parse_bad_rows_skipped() {
        let body = "\
date,time,age,arrival,disposition,card_type,stay_minutes
not-a-date,08:15,34,walk-in,discharged,standard,95
2026-02-10,09:40,71,ambulance,severed,emergency,310
2026-02-10,10:00,20,walk-in,discharged,standard,40
";
        let out = parse_visits(body, "primary");
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.bad_rows, 2);
        assert!(out.warnings.iter().any(|w| w.contains("bad_date")));
        assert!(out.warnings.iter().any(|w| w.contains("bad_disposition")));
    }

    #[test]
    fn test_parse_missing_required_column() {
        let body = "time,age\n08:15,34\n";
        let out = parse_visits(body, "primary");
        assert!(out.records.is_empty());
        assert!(out.warnings.iter().any(|w| w.contains("missing_column")));
    }

    #[test]
    fn test_expected_header_parses_cleanly() {
        let body = format!(
            "{}\n2026-02-10,08:15,34,walk-in,discharged,standard,95\n",
            EXPECTED_COLUMNS.join(",")
        );
        let out = parse_visits(&body, "primary");
        assert_eq!(out.records.len(), 1);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_parse_extra_columns_ignored() {
        let body = "\
date,time,age,arrival,disposition,card_type,stay_minutes,notes
2026-02-10,08:15,34,walk-in,discharged,standard,95,followed up
";
        let out = parse_visits(body, "primary");
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn test_arrival_unknown_maps_to_other() {
        assert_eq!(ArrivalMode::parse("helicopter"), ArrivalMode::Other);
        assert_eq!(ArrivalMode::parse("Walk-In"), ArrivalMode::WalkIn);
    }

    #[test]
    fn test_recompute_avg() {
        let mut d = DailyStat::empty(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        d.total_stay_minutes = 300;
        d.stay_samples = 4;
        d.recompute_avg();
        assert_eq!(d.avg_stay_minutes, 75.0);

        d.stay_samples = 0;
        d.recompute_avg();
        assert_eq!(d.avg_stay_minutes, 0.0);
    }
}
