//! Staged derived cache for chart data.
//!
//! Each chart-consuming view owns one `DerivedPipeline`. The pipeline holds
//! five memoized stages; every stage stores its output next to a
//! fingerprint of the inputs that produced it. On each prepare call the
//! fingerprints are re-evaluated in dependency order: the first stage whose
//! fingerprint differs is recomputed, and every stage downstream of it is
//! recomputed unconditionally, because each downstream fingerprint embeds
//! the upstream stage's lineage counter, which changes on every recompute.
//! Stages whose dependency set did not change return their memoized output
//! at zero cost, so N interactions that leave a stage's dependencies alone
//! trigger exactly one computation of that stage.
//!
//! Calls are serialized on the view's thread, so the pipeline needs no
//! internal locking. A monotonically increasing render token discards
//! stale in-flight render completions (last write wins).

use std::sync::Arc;

use crate::handle::Versioned;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::records::{DailyStat, VisitRecord};
use crate::stats::{
    self, FunnelData, HeatmapGrid, VisitFilters, WindowedPoint,
};

/// Which charts are currently on screen. Hidden charts are not computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleCharts {
    pub windowed: bool,
    pub funnel: bool,
    pub heatmap: bool,
}

impl Default for VisibleCharts {
    fn default() -> Self {
        Self {
            windowed: true,
            funnel: true,
            heatmap: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartControls {
    pub year: i32,
    pub filters: VisitFilters,
    /// Part of the filtered stage's dependency set: toggling comparison
    /// re-renders filtered views even though the base filter math is the
    /// same.
    pub compare_mode: bool,
    pub window_days: usize,
    pub visible: VisibleCharts,
}

impl Default for ChartControls {
    fn default() -> Self {
        Self {
            year: 0,
            filters: VisitFilters::default(),
            compare_mode: false,
            window_days: 7,
            visible: VisibleCharts::default(),
        }
    }
}

/// Token identifying one render pass; later passes supersede earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RenderToken(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct YearScopedOut {
    pub daily: Vec<DailyStat>,
    pub records: Vec<VisitRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredOut {
    pub daily: Vec<DailyStat>,
    pub records: Vec<VisitRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowedOut {
    pub points: Vec<WindowedPoint>,
    pub daily: Vec<DailyStat>,
    pub records: Vec<VisitRecord>,
}

pub struct ChartData {
    pub year_scoped: Arc<YearScopedOut>,
    pub filtered: Arc<FilteredOut>,
    pub windowed: Option<Arc<WindowedOut>>,
    pub funnel: Option<Arc<FunnelData>>,
    pub heatmap: Option<Arc<HeatmapGrid>>,
    pub render_token: RenderToken,
}

/// Cumulative per-stage recompute counts; test observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageComputations {
    pub year_scoped: u64,
    pub filtered: u64,
    pub windowed: u64,
    pub funnel: u64,
    pub heatmap: u64,
}

// Stage fingerprints. Every downstream fingerprint carries the upstream
// stage's lineage, never its literal inputs.

#[derive(Debug, Clone, PartialEq)]
struct YearScopedFp {
    daily_generation: u64,
    records_generation: u64,
    year: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct FilteredFp {
    upstream: u64,
    filters: VisitFilters,
    compare_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct WindowedFp {
    upstream: u64,
    window_days: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct FunnelFp {
    windowed: Option<u64>,
    fallback: u64,
    year: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct HeatmapFp {
    windowed: u64,
}

struct Stage<F, O> {
    fingerprint: Option<F>,
    output: Option<Arc<O>>,
    lineage: u64,
    computations: u64,
}

impl<F: PartialEq, O> Stage<F, O> {
    fn new() -> Self {
        Self {
            fingerprint: None,
            output: None,
            lineage: 0,
            computations: 0,
        }
    }

    fn reset(&mut self) {
        self.fingerprint = None;
        self.output = None;
    }

    /// Return the memoized output when `fingerprint` matches the one that
    /// produced it; otherwise recompute and take a fresh lineage number.
    fn ensure(
        &mut self,
        fingerprint: F,
        lineage_seq: &mut u64,
        compute: impl FnOnce() -> O,
    ) -> (Arc<O>, u64) {
        if self.fingerprint.as_ref() == Some(&fingerprint) {
            if let Some(output) = &self.output {
                return (output.clone(), self.lineage);
            }
        }
        let output = Arc::new(compute());
        *lineage_seq += 1;
        self.lineage = *lineage_seq;
        self.computations += 1;
        self.fingerprint = Some(fingerprint);
        self.output = Some(output.clone());
        (output, self.lineage)
    }
}

pub struct DerivedPipeline {
    base_daily: Versioned<Vec<DailyStat>>,
    base_records: Versioned<Vec<VisitRecord>>,
    controls: ChartControls,
    year_scoped: Stage<YearScopedFp, YearScopedOut>,
    filtered: Stage<FilteredFp, FilteredOut>,
    windowed: Stage<WindowedFp, WindowedOut>,
    funnel: Stage<FunnelFp, FunnelData>,
    heatmap: Stage<HeatmapFp, HeatmapGrid>,
    lineage_seq: u64,
    render_seq: u64,
}

impl DerivedPipeline {
    pub fn new(
        base_daily: Versioned<Vec<DailyStat>>,
        base_records: Versioned<Vec<VisitRecord>>,
    ) -> Self {
        Self {
            base_daily,
            base_records,
            controls: ChartControls::default(),
            year_scoped: Stage::new(),
            filtered: Stage::new(),
            windowed: Stage::new(),
            funnel: Stage::new(),
            heatmap: Stage::new(),
            lineage_seq: 0,
            render_seq: 0,
        }
    }

    /// Swap in a new base dataset. All stage memos are discarded wholesale;
    /// the next prepare call rebuilds from the new base.
    pub fn set_base(
        &mut self,
        base_daily: Versioned<Vec<DailyStat>>,
        base_records: Versioned<Vec<VisitRecord>>,
    ) {
        self.base_daily = base_daily;
        self.base_records = base_records;
        self.year_scoped.reset();
        self.filtered.reset();
        self.windowed.reset();
        self.funnel.reset();
        self.heatmap.reset();
        log(
            Level::Debug,
            Domain::Derived,
            "base_replaced",
            obj(&[
                ("daily_generation", v_num(self.base_daily.generation() as f64)),
                ("records_generation", v_num(self.base_records.generation() as f64)),
            ]),
        );
    }

    pub fn controls(&self) -> &ChartControls {
        &self.controls
    }

    /// Recompute chart data for a full set of controls.
    pub fn prepare_chart_data(&mut self, controls: ChartControls) -> ChartData {
        self.controls = controls;
        self.prepare_current()
    }

    /// Recompute after a year change, keeping all other controls.
    pub fn update_chart_year(&mut self, year: i32) -> ChartData {
        self.controls.year = year;
        self.prepare_current()
    }

    /// Recompute after a filter change, keeping all other controls.
    pub fn apply_chart_filters(&mut self, filters: VisitFilters, compare_mode: bool) -> ChartData {
        self.controls.filters = filters;
        self.controls.compare_mode = compare_mode;
        self.prepare_current()
    }

    /// Issue a render token; completions carrying an older token are stale.
    pub fn begin_render(&mut self) -> RenderToken {
        self.render_seq += 1;
        RenderToken(self.render_seq)
    }

    pub fn is_current(&self, token: RenderToken) -> bool {
        token.0 == self.render_seq
    }

    pub fn computations(&self) -> StageComputations {
        StageComputations {
            year_scoped: self.year_scoped.computations,
            filtered: self.filtered.computations,
            windowed: self.windowed.computations,
            funnel: self.funnel.computations,
            heatmap: self.heatmap.computations,
        }
    }

    fn prepare_current(&mut self) -> ChartData {
        let render_token = self.begin_render();
        let controls = self.controls.clone();
        let base_daily = self.base_daily.share();
        let base_records = self.base_records.share();

        let (year_scoped, year_lineage) = self.year_scoped.ensure(
            YearScopedFp {
                daily_generation: self.base_daily.generation(),
                records_generation: self.base_records.generation(),
                year: controls.year,
            },
            &mut self.lineage_seq,
            || YearScopedOut {
                daily: stats::scope_daily_to_year(&base_daily, controls.year),
                records: stats::scope_records_to_year(&base_records, controls.year),
            },
        );

        let year_scoped_for_filter = year_scoped.clone();
        let filters = controls.filters.clone();
        let (filtered, filtered_lineage) = self.filtered.ensure(
            FilteredFp {
                upstream: year_lineage,
                filters: controls.filters.clone(),
                compare_mode: controls.compare_mode,
            },
            &mut self.lineage_seq,
            move || {
                if filters.is_empty() {
                    return FilteredOut {
                        daily: year_scoped_for_filter.daily.clone(),
                        records: year_scoped_for_filter.records.clone(),
                    };
                }
                let records = stats::filter_records(&year_scoped_for_filter.records, &filters);
                // A daily-only base has no records to filter; the scoped
                // series is the best available answer.
                let daily = if year_scoped_for_filter.records.is_empty() {
                    year_scoped_for_filter.daily.clone()
                } else {
                    stats::daily_from_records(&records)
                };
                FilteredOut { daily, records }
            },
        );

        // The windowed stage is skipped outright when nothing on screen
        // needs per-record granularity.
        let needs_windowed = controls.visible.windowed || controls.visible.heatmap;
        let windowed = if needs_windowed {
            let filtered_for_window = filtered.clone();
            let window_days = controls.window_days;
            Some(self.windowed.ensure(
                WindowedFp {
                    upstream: filtered_lineage,
                    window_days,
                },
                &mut self.lineage_seq,
                move || WindowedOut {
                    points: stats::rolling_window(&filtered_for_window.daily, window_days),
                    daily: filtered_for_window.daily.clone(),
                    records: filtered_for_window.records.clone(),
                },
            ))
        } else {
            None
        };

        let funnel = if controls.visible.funnel {
            let windowed_daily = windowed.as_ref().map(|(out, _)| out.clone());
            let fallback = year_scoped.clone();
            let (out, _) = self.funnel.ensure(
                FunnelFp {
                    windowed: windowed.as_ref().map(|(_, lineage)| *lineage),
                    fallback: year_lineage,
                    year: controls.year,
                },
                &mut self.lineage_seq,
                move || match windowed_daily {
                    Some(windowed) => stats::funnel_from_daily(&windowed.daily, &fallback.daily),
                    None => stats::funnel_from_daily(&[], &fallback.daily),
                },
            );
            Some(out)
        } else {
            None
        };

        // Computed independently of the funnel: each keys on its own
        // dependencies, so neither invalidates the other.
        let heatmap = match (&windowed, controls.visible.heatmap) {
            (Some((windowed_out, windowed_lineage)), true) => {
                let records_for_grid = windowed_out.clone();
                let (out, _) = self.heatmap.ensure(
                    HeatmapFp {
                        windowed: *windowed_lineage,
                    },
                    &mut self.lineage_seq,
                    move || stats::heatmap_from_records(&records_for_grid.records),
                );
                Some(out)
            }
            _ => None,
        };

        log(
            Level::Trace,
            Domain::Derived,
            "prepared",
            obj(&[
                ("year", v_num(controls.year as f64)),
                ("windowed", v_str(if windowed.is_some() { "yes" } else { "skipped" })),
            ]),
        );

        ChartData {
            year_scoped,
            filtered,
            windowed: windowed.map(|(out, _)| out),
            funnel,
            heatmap,
            render_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{parse_visits, ArrivalMode};

    const SAMPLE: &str = "\
date,time,age,arrival,disposition,card_type,stay_minutes
2025-12-30,22:10,64,ambulance,admitted,emergency,410
2026-02-10,08:15,34,walk-in,discharged,standard,95
2026-02-10,09:40,71,ambulance,admitted,emergency,310
2026-02-11,14:05,55,walk-in,discharged,standard,45
2026-02-12,02:30,29,transfer,transferred,referral,120
";

    fn pipeline() -> DerivedPipeline {
        let outcome = parse_visits(SAMPLE, "primary");
        let daily = stats::daily_from_records(&outcome.records);
        DerivedPipeline::new(Versioned::new(daily), Versioned::new(outcome.records))
    }

    fn controls_2026() -> ChartControls {
        ChartControls {
            year: 2026,
            ..Default::default()
        }
    }

    #[test]
    fn test_year_scoping() {
        let mut pipeline = pipeline();
        let data = pipeline.prepare_chart_data(controls_2026());
        assert_eq!(data.year_scoped.records.len(), 4);
        assert_eq!(data.year_scoped.daily.len(), 3);

        let data = pipeline.update_chart_year(2025);
        assert_eq!(data.year_scoped.records.len(), 1);
    }

    #[test]
    fn test_repeat_call_is_fully_memoized() {
        let mut pipeline = pipeline();
        pipeline.prepare_chart_data(controls_2026());
        let counts = pipeline.computations();

        pipeline.prepare_chart_data(controls_2026());
        assert_eq!(pipeline.computations(), counts);
    }

    #[test]
    fn test_year_change_invalidates_everything() {
        let mut pipeline = pipeline();
        pipeline.prepare_chart_data(controls_2026());
        let before = pipeline.computations();

        pipeline.update_chart_year(2025);
        let after = pipeline.computations();
        assert_eq!(after.year_scoped, before.year_scoped + 1);
        assert_eq!(after.filtered, before.filtered + 1);
        assert_eq!(after.windowed, before.windowed + 1);
        assert_eq!(after.funnel, before.funnel + 1);
        assert_eq!(after.heatmap, before.heatmap + 1);
    }

    #[test]
    fn test_filter_change_leaves_year_scope_memoized() {
        let mut pipeline = pipeline();
        pipeline.prepare_chart_data(controls_2026());
        let before = pipeline.computations();

        pipeline.apply_chart_filters(
            VisitFilters {
                arrival: Some(ArrivalMode::Ambulance),
                ..Default::default()
            },
            false,
        );
        let after = pipeline.computations();
        assert_eq!(after.year_scoped, before.year_scoped, "year scope must stay memoized");
        assert_eq!(after.filtered, before.filtered + 1);
        assert_eq!(after.windowed, before.windowed + 1);
        assert_eq!(after.funnel, before.funnel + 1);
        assert_eq!(after.heatmap, before.heatmap + 1);
    }

    #[test]
    fn test_filtered_output() {
        let mut pipeline = pipeline();
        let data = pipeline.prepare_chart_data(ChartControls {
            year: 2026,
            filters: VisitFilters {
                arrival: Some(ArrivalMode::Ambulance),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(data.filtered.records.len(), 1);
        assert_eq!(data.filtered.daily.len(), 1);
        assert_eq!(data.filtered.daily[0].visits, 1);
    }

    #[test]
    fn test_windowed_skipped_when_not_needed() {
        let mut pipeline = pipeline();
        let data = pipeline.prepare_chart_data(ChartControls {
            year: 2026,
            visible: VisibleCharts {
                windowed: false,
                funnel: true,
                heatmap: false,
            },
            ..Default::default()
        });
        assert!(data.windowed.is_none());
        assert!(data.heatmap.is_none());
        assert_eq!(pipeline.computations().windowed, 0);
        // The funnel still renders from the fallback daily series.
        let funnel = data.funnel.expect("funnel visible");
        assert_eq!(funnel.visits, 4);
    }

    #[test]
    fn test_funnel_and_heatmap_independent() {
        let mut pipeline = pipeline();
        // Funnel only.
        pipeline.prepare_chart_data(ChartControls {
            year: 2026,
            visible: VisibleCharts {
                windowed: true,
                funnel: true,
                heatmap: false,
            },
            ..Default::default()
        });
        let before = pipeline.computations();
        assert_eq!(before.heatmap, 0);

        // Turning the heatmap on computes it once without touching the
        // funnel's memo.
        pipeline.prepare_chart_data(ChartControls {
            year: 2026,
            visible: VisibleCharts {
                windowed: true,
                funnel: true,
                heatmap: true,
            },
            ..Default::default()
        });
        let after = pipeline.computations();
        assert_eq!(after.heatmap, 1);
        assert_eq!(after.funnel, before.funnel);
    }

    #[test]
    fn test_window_change_spares_filtered() {
        let mut pipeline = pipeline();
        pipeline.prepare_chart_data(controls_2026());
        let before = pipeline.computations();

        let mut controls = controls_2026();
        controls.window_days = 14;
        pipeline.prepare_chart_data(controls);
        let after = pipeline.computations();
        assert_eq!(after.year_scoped, before.year_scoped);
        assert_eq!(after.filtered, before.filtered);
        assert_eq!(after.windowed, before.windowed + 1);
    }

    #[test]
    fn test_set_base_discards_memos() {
        let mut pipeline = pipeline();
        let stale = pipeline.prepare_chart_data(controls_2026());
        assert_eq!(stale.year_scoped.records.len(), 4);

        let outcome = parse_visits(
            "date,time,age,arrival,disposition,card_type,stay_minutes\n\
             2026-03-01,10:00,40,walk-in,discharged,standard,60\n",
            "primary",
        );
        let daily = stats::daily_from_records(&outcome.records);
        pipeline.set_base(Versioned::new(daily), Versioned::new(outcome.records));

        let fresh = pipeline.prepare_chart_data(controls_2026());
        assert_eq!(fresh.year_scoped.records.len(), 1);
        assert_eq!(fresh.year_scoped.daily[0].visits, 1);
    }

    #[test]
    fn test_render_tokens_supersede() {
        let mut pipeline = pipeline();
        let first = pipeline.prepare_chart_data(controls_2026());
        let second = pipeline.update_chart_year(2025);
        assert!(!pipeline.is_current(first.render_token));
        assert!(pipeline.is_current(second.render_token));
        assert!(first.render_token < second.render_token);
    }

    #[test]
    fn test_compare_mode_is_part_of_filtered_dependencies() {
        let mut pipeline = pipeline();
        pipeline.prepare_chart_data(controls_2026());
        let before = pipeline.computations();

        pipeline.apply_chart_filters(VisitFilters::default(), true);
        let after = pipeline.computations();
        assert_eq!(after.filtered, before.filtered + 1);
        assert_eq!(after.year_scoped, before.year_scoped);
    }
}
