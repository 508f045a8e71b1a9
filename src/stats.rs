//! Pure aggregation functions over visit records and daily series.
//!
//! Everything here is deterministic and allocation-only: no I/O, no logging.
//! The fetch orchestrator and the computation worker both call into this
//! module, so results are identical regardless of where they are computed.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::records::{ArrivalMode, DailyStat, Disposition, VisitRecord, YearlyStat};

/// Category filters shared by chart stages and worker-side KPI queries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VisitFilters {
    pub arrival: Option<ArrivalMode>,
    pub disposition: Option<Disposition>,
    pub card_type: Option<String>,
}

impl VisitFilters {
    pub fn is_empty(&self) -> bool {
        self.arrival.is_none() && self.disposition.is_none() && self.card_type.is_none()
    }

    pub fn matches(&self, record: &VisitRecord) -> bool {
        if let Some(a) = self.arrival {
            if record.arrival != a {
                return false;
            }
        }
        if let Some(d) = self.disposition {
            if record.disposition != d {
                return false;
            }
        }
        if let Some(c) = &self.card_type {
            if &record.card_type != c {
                return false;
            }
        }
        true
    }
}

/// Build the per-day series from a record set. Output is date-ordered.
pub fn daily_from_records(records: &[VisitRecord]) -> Vec<DailyStat> {
    let mut by_date: BTreeMap<NaiveDate, DailyStat> = BTreeMap::new();
    for r in records {
        let stat = by_date.entry(r.date).or_insert_with(|| DailyStat::empty(r.date));
        stat.visits += 1;
        if r.disposition == Disposition::Admitted {
            stat.admitted += 1;
        }
        if r.arrival == ArrivalMode::Ambulance {
            stat.ambulance_arrivals += 1;
        }
        if let Some(m) = r.stay_minutes {
            stat.total_stay_minutes += m as u64;
            stat.stay_samples += 1;
        }
        if let Some(h) = r.hour {
            stat.by_hour[h as usize] += 1;
        }
    }
    let mut out: Vec<DailyStat> = by_date.into_values().collect();
    for stat in &mut out {
        stat.recompute_avg();
    }
    out
}

/// Union-merge daily fragments by date. Counters are summed and the average
/// stay is recomputed from the summed numerator/denominator, never from the
/// fragments' own averages.
pub fn merge_daily(fragments: &[Vec<DailyStat>]) -> Vec<DailyStat> {
    let mut by_date: BTreeMap<NaiveDate, DailyStat> = BTreeMap::new();
    for fragment in fragments {
        for stat in fragment {
            let merged = by_date
                .entry(stat.date)
                .or_insert_with(|| DailyStat::empty(stat.date));
            merged.visits += stat.visits;
            merged.admitted += stat.admitted;
            merged.ambulance_arrivals += stat.ambulance_arrivals;
            merged.total_stay_minutes += stat.total_stay_minutes;
            merged.stay_samples += stat.stay_samples;
            for (i, n) in stat.by_hour.iter().enumerate() {
                merged.by_hour[i] += n;
            }
        }
    }
    let mut out: Vec<DailyStat> = by_date.into_values().collect();
    for stat in &mut out {
        stat.recompute_avg();
    }
    out
}

/// Per-year rollup of a daily series.
pub fn yearly_from_daily(daily: &[DailyStat]) -> Vec<YearlyStat> {
    let mut by_year: BTreeMap<i32, (u64, u64, u64, u64)> = BTreeMap::new();
    for stat in daily {
        let entry = by_year.entry(stat.date.year()).or_insert((0, 0, 0, 0));
        entry.0 += stat.visits;
        entry.1 += stat.admitted;
        entry.2 += stat.total_stay_minutes;
        entry.3 += stat.stay_samples;
    }
    by_year
        .into_iter()
        .map(|(year, (visits, admitted, total_stay, samples))| YearlyStat {
            year,
            visits,
            admitted,
            avg_stay_minutes: if samples > 0 {
                total_stay as f64 / samples as f64
            } else {
                0.0
            },
        })
        .collect()
}

pub fn scope_daily_to_year(daily: &[DailyStat], year: i32) -> Vec<DailyStat> {
    daily.iter().filter(|d| d.date.year() == year).cloned().collect()
}

pub fn scope_records_to_year(records: &[VisitRecord], year: i32) -> Vec<VisitRecord> {
    records.iter().filter(|r| r.date.year() == year).cloned().collect()
}

pub fn filter_records(records: &[VisitRecord], filters: &VisitFilters) -> Vec<VisitRecord> {
    if filters.is_empty() {
        return records.to_vec();
    }
    records.iter().filter(|r| filters.matches(r)).cloned().collect()
}

/// One point of a rolling-window series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedPoint {
    pub date: NaiveDate,
    pub visits: u64,
    pub rolling_avg_visits: f64,
}

/// Trailing rolling average of daily visit counts. A window of 0 or 1
/// degenerates to the raw series.
pub fn rolling_window(daily: &[DailyStat], window: usize) -> Vec<WindowedPoint> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(daily.len());
    let mut sum = 0u64;
    for (i, stat) in daily.iter().enumerate() {
        sum += stat.visits;
        if i >= window {
            sum -= daily[i - window].visits;
        }
        let span = (i + 1).min(window);
        out.push(WindowedPoint {
            date: stat.date,
            visits: stat.visits,
            rolling_avg_visits: sum as f64 / span as f64,
        });
    }
    out
}

/// Disposition funnel over a daily series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunnelData {
    pub visits: u64,
    pub admitted: u64,
    pub ambulance_arrivals: u64,
}

/// Compute the funnel from the windowed daily output; when it is empty
/// (e.g. the window filtered everything out) the fallback series is used.
pub fn funnel_from_daily(daily: &[DailyStat], fallback: &[DailyStat]) -> FunnelData {
    let series = if daily.is_empty() { fallback } else { daily };
    let mut out = FunnelData::default();
    for stat in series {
        out.visits += stat.visits;
        out.admitted += stat.admitted;
        out.ambulance_arrivals += stat.ambulance_arrivals;
    }
    out
}

/// Weekday (Mon=0) x hour-of-day visit counts.
pub type HeatmapGrid = [[u64; 24]; 7];

pub fn heatmap_from_records(records: &[VisitRecord]) -> HeatmapGrid {
    let mut grid: HeatmapGrid = [[0; 24]; 7];
    for r in records {
        if let Some(h) = r.hour {
            let weekday = r.date.weekday().num_days_from_monday() as usize;
            grid[weekday][h as usize] += 1;
        }
    }
    grid
}

/// KPI rollup for a filtered record set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KpiSummary {
    pub visits: u64,
    pub admitted: u64,
    pub admission_rate: f64,
    pub avg_stay_minutes: f64,
    pub ambulance_share: f64,
}

/// Apply filters and summarize. `defaults` is the baseline filter set the
/// dashboard always applies; the per-query `filters` narrow it further.
pub fn apply_kpi_filters(
    records: &[VisitRecord],
    filters: &VisitFilters,
    defaults: &VisitFilters,
) -> KpiSummary {
    let mut visits = 0u64;
    let mut admitted = 0u64;
    let mut ambulance = 0u64;
    let mut total_stay = 0u64;
    let mut stay_samples = 0u64;
    for r in records {
        if !defaults.matches(r) || !filters.matches(r) {
            continue;
        }
        visits += 1;
        if r.disposition == Disposition::Admitted {
            admitted += 1;
        }
        if r.arrival == ArrivalMode::Ambulance {
            ambulance += 1;
        }
        if let Some(m) = r.stay_minutes {
            total_stay += m as u64;
            stay_samples += 1;
        }
    }
    KpiSummary {
        visits,
        admitted,
        admission_rate: if visits > 0 { admitted as f64 / visits as f64 } else { 0.0 },
        avg_stay_minutes: if stay_samples > 0 {
            total_stay as f64 / stay_samples as f64
        } else {
            0.0
        },
        ambulance_share: if visits > 0 { ambulance as f64 / visits as f64 } else { 0.0 },
    }
}

pub fn records_for_date(records: &[VisitRecord], date: NaiveDate) -> Vec<VisitRecord> {
    records.iter().filter(|r| r.date == date).cloned().collect()
}

/// Hourly visit counts for the most recent date in the record set.
pub fn last_shift_hourly(records: &[VisitRecord]) -> (Option<NaiveDate>, [u64; 24]) {
    let last = records.iter().map(|r| r.date).max();
    let mut hours = [0u64; 24];
    if let Some(date) = last {
        for r in records.iter().filter(|r| r.date == date) {
            if let Some(h) = r.hour {
                hours[h as usize] += 1;
            }
        }
    }
    (last, hours)
}
