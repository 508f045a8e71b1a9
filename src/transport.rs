//! Computation transport: isolated worker units behind a message channel.
//!
//! A `TransportSession` owns at most one live computation unit (a dedicated
//! OS thread), created lazily on first use. Every `request` gets a unique
//! correlation id; all in-flight calls are multiplexed over the single unit
//! and replies are matched back to pending calls by that id. Three reply
//! shapes exist: `Progress` (informational), `Partial` (an intermediate
//! usable result, delivered via callback), and a final `Success`/`Error`
//! that resolves the call exactly once.
//!
//! The unit shares no mutable state with callers: requests and replies are
//! owned values crossing channels. If the unit thread dies, every pending
//! call is rejected with a `ComputationUnit` error and the next request
//! transparently starts a fresh unit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::records::{parse_visits, DailyStat, VisitRecord, YearlyStat};
use crate::stats::{self, KpiSummary, VisitFilters};

// ============================================================================
// Messages
// ============================================================================

/// A dataset as shipped to (and retained by) a computation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetPayload {
    /// True when per-record data was never materialized (daily-only).
    pub lite: bool,
    pub records: Vec<VisitRecord>,
    pub daily_stats: Vec<DailyStat>,
    /// Baseline filters applied when a query does not carry its own.
    pub defaults: VisitFilters,
}

/// Reference to the dataset a query runs against: either a handle to one
/// previously stored in the unit, or the full payload inline (the legacy
/// path used when no handle is available or the handle path failed).
#[derive(Debug)]
pub enum DatasetRef {
    Handle(u64),
    Inline(Box<DatasetPayload>),
}

#[derive(Debug)]
pub enum WorkerRequest {
    /// Parse a CSV body and aggregate it. Emits a `parse` progress update,
    /// then a `Partial` with the daily series as soon as it is ready, then
    /// the final transformed payload.
    TransformCsv {
        body: String,
        source_id: String,
        keep_records: bool,
        want_yearly: bool,
    },
    StoreDataset { dataset: Box<DatasetPayload> },
    /// Idempotent; releasing an unknown handle succeeds.
    ReleaseDataset { handle: u64 },
    KpiFilters {
        dataset: DatasetRef,
        filters: VisitFilters,
        defaults: Option<VisitFilters>,
    },
    KpiRecordsForDate { dataset: DatasetRef, date: NaiveDate },
    KpiLastShiftHourly { dataset: DatasetRef },
    /// Test hook: make the unit thread die as if it had crashed.
    #[cfg(test)]
    Crash,
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: &'static str,
    pub rows_done: u64,
}

#[derive(Debug, Clone)]
pub enum PartialUpdate {
    DailyReady { daily_stats: Vec<DailyStat> },
}

/// Per-query metadata. `requires_full_records` signals that a lite dataset
/// cannot answer a per-record query and the caller should hydrate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMeta {
    pub requires_full_records: bool,
}

#[derive(Debug)]
pub enum ResponsePayload {
    Transformed {
        records: Vec<VisitRecord>,
        daily_stats: Vec<DailyStat>,
        yearly_stats: Option<Vec<YearlyStat>>,
        rows: u64,
        bad_rows: u64,
        warnings: Vec<String>,
    },
    DatasetStored { handle: u64 },
    DatasetReleased,
    Kpi { summary: KpiSummary, meta: QueryMeta },
    RecordsForDate { records: Vec<VisitRecord>, meta: QueryMeta },
    LastShiftHourly {
        date: Option<NaiveDate>,
        by_hour: [u64; 24],
        meta: QueryMeta,
    },
}

#[derive(Debug)]
enum WorkerReply {
    Progress(ProgressUpdate),
    Partial(PartialUpdate),
    Success(ResponsePayload),
    Error { name: String, message: String },
}

struct RequestEnvelope {
    id: u64,
    request: WorkerRequest,
}

struct ReplyEnvelope {
    id: u64,
    reply: WorkerReply,
}

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    fired: AtomicBool,
    notify: tokio::sync::Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            // Register interest before the check so a cancel between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Session
// ============================================================================

pub type ProgressFn = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type PartialFn = Arc<dyn Fn(&PartialUpdate) + Send + Sync>;

#[derive(Default)]
pub struct RequestCallbacks {
    pub on_progress: Option<ProgressFn>,
    pub on_partial: Option<PartialFn>,
    pub cancel: Option<CancelToken>,
}

struct PendingCall {
    on_progress: Option<ProgressFn>,
    on_partial: Option<PartialFn>,
    done: Option<oneshot::Sender<Result<ResponsePayload, PipelineError>>>,
}

struct SharedState {
    pending: Mutex<HashMap<u64, PendingCall>>,
    /// Highest unit epoch known to have failed. A unit whose epoch is at or
    /// below this is dead and must be replaced before the next send.
    failed_epoch: AtomicU64,
}

struct Unit {
    tx: mpsc::Sender<RequestEnvelope>,
    epoch: u64,
}

/// One transport session: a lazily created computation unit plus the table
/// of pending calls. Constructed once per orchestrator; tests construct
/// their own isolated sessions.
pub struct TransportSession {
    shared: Arc<SharedState>,
    unit: Mutex<Option<Unit>>,
    next_id: AtomicU64,
    next_epoch: AtomicU64,
    idle_reclaim: Duration,
}

impl TransportSession {
    pub fn new(idle_reclaim: Duration) -> Self {
        Self {
            shared: Arc::new(SharedState {
                pending: Mutex::new(HashMap::new()),
                failed_epoch: AtomicU64::new(0),
            }),
            unit: Mutex::new(None),
            next_id: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
            idle_reclaim,
        }
    }

    /// Dispatch a request and await its final reply.
    pub async fn request(
        &self,
        request: WorkerRequest,
        callbacks: RequestCallbacks,
    ) -> Result<ResponsePayload, PipelineError> {
        if let Some(token) = &callbacks.cancel {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().expect("pending table poisoned");
            pending.insert(
                id,
                PendingCall {
                    on_progress: callbacks.on_progress,
                    on_partial: callbacks.on_partial,
                    done: Some(done_tx),
                },
            );
        }

        // Send, transparently respawning the unit once if it is dead. The
        // envelope comes back inside SendError, so no clone is needed.
        let mut envelope = RequestEnvelope { id, request };
        let mut sent = false;
        for _ in 0..2 {
            let (tx, epoch) = self.ensure_unit();
            match tx.send(envelope) {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(mpsc::SendError(returned)) => {
                    envelope = returned;
                    self.discard_unit(epoch);
                }
            }
        }
        if !sent {
            self.remove_pending(id);
            return Err(PipelineError::ComputationUnit(
                "computation unit unavailable".to_string(),
            ));
        }

        match callbacks.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        // Forget the call; a late reply for this id is
                        // ignored by the router.
                        self.remove_pending(id);
                        Err(PipelineError::Cancelled)
                    }
                    result = done_rx => result.unwrap_or_else(|_| {
                        Err(PipelineError::ComputationUnit(
                            "computation unit dropped reply".to_string(),
                        ))
                    }),
                }
            }
            None => done_rx.await.unwrap_or_else(|_| {
                Err(PipelineError::ComputationUnit(
                    "computation unit dropped reply".to_string(),
                ))
            }),
        }
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&id);
        }
    }

    fn ensure_unit(&self) -> (mpsc::Sender<RequestEnvelope>, u64) {
        let mut slot = self.unit.lock().expect("unit slot poisoned");
        let failed = self.shared.failed_epoch.load(Ordering::SeqCst);
        if let Some(unit) = slot.as_ref() {
            if unit.epoch > failed {
                return (unit.tx.clone(), unit.epoch);
            }
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let unit = spawn_unit(self.shared.clone(), self.idle_reclaim, epoch);
        let handles = (unit.tx.clone(), unit.epoch);
        *slot = Some(unit);
        handles
    }

    fn discard_unit(&self, epoch: u64) {
        let mut slot = self.unit.lock().expect("unit slot poisoned");
        if let Some(unit) = slot.as_ref() {
            if unit.epoch == epoch {
                *slot = None;
            }
        }
    }
}

fn spawn_unit(shared: Arc<SharedState>, idle_reclaim: Duration, epoch: u64) -> Unit {
    let (req_tx, req_rx) = mpsc::channel::<RequestEnvelope>();
    let (reply_tx, reply_rx) = mpsc::channel::<ReplyEnvelope>();

    std::thread::Builder::new()
        .name(format!("edpulse-unit-{}", epoch))
        .spawn(move || worker_loop(req_rx, reply_tx, idle_reclaim))
        .expect("spawn computation unit");

    std::thread::Builder::new()
        .name(format!("edpulse-router-{}", epoch))
        .spawn(move || {
            loop {
                match reply_rx.recv() {
                    Ok(envelope) => route_reply(&shared, envelope),
                    Err(_) => {
                        // The unit hung up: either a normal shutdown (no
                        // pending calls) or a crash. Reject everything
                        // still in flight and mark the epoch dead.
                        shared.failed_epoch.fetch_max(epoch, Ordering::SeqCst);
                        let rejected = reject_all_pending(&shared);
                        if rejected > 0 {
                            log(
                                Level::Warn,
                                Domain::Worker,
                                "unit_failed",
                                obj(&[
                                    ("epoch", v_num(epoch as f64)),
                                    ("rejected_calls", v_num(rejected as f64)),
                                ]),
                            );
                        }
                        break;
                    }
                }
            }
        })
        .expect("spawn reply router");

    log(
        Level::Debug,
        Domain::Worker,
        "unit_spawned",
        obj(&[("epoch", v_num(epoch as f64))]),
    );
    Unit { tx: req_tx, epoch }
}

fn reject_all_pending(shared: &SharedState) -> usize {
    let mut pending = match shared.pending.lock() {
        Ok(p) => p,
        Err(_) => return 0,
    };
    let mut rejected = 0;
    for (_, mut call) in pending.drain() {
        if let Some(done) = call.done.take() {
            let _ = done.send(Err(PipelineError::ComputationUnit(
                "computation unit terminated".to_string(),
            )));
            rejected += 1;
        }
    }
    rejected
}

fn route_reply(shared: &SharedState, envelope: ReplyEnvelope) {
    // Clone callbacks out so they run without holding the table lock.
    let callback: Option<(Option<ProgressFn>, Option<PartialFn>)> = {
        let pending = match shared.pending.lock() {
            Ok(p) => p,
            Err(_) => return,
        };
        match &envelope.reply {
            WorkerReply::Progress(_) | WorkerReply::Partial(_) => pending
                .get(&envelope.id)
                .map(|call| (call.on_progress.clone(), call.on_partial.clone())),
            _ => None,
        }
    };

    match envelope.reply {
        WorkerReply::Progress(update) => {
            if let Some((Some(on_progress), _)) = callback {
                on_progress(&update);
            }
        }
        WorkerReply::Partial(update) => {
            if let Some((_, Some(on_partial))) = callback {
                on_partial(&update);
            }
        }
        WorkerReply::Success(payload) => {
            resolve(shared, envelope.id, Ok(payload));
        }
        WorkerReply::Error { name, message } => {
            resolve(
                shared,
                envelope.id,
                Err(PipelineError::ComputationUnit(format!("{}: {}", name, message))),
            );
        }
    }
}

fn resolve(shared: &SharedState, id: u64, result: Result<ResponsePayload, PipelineError>) {
    let call = {
        let mut pending = match shared.pending.lock() {
            Ok(p) => p,
            Err(_) => return,
        };
        pending.remove(&id)
    };
    // Replies for an unknown or already-resolved id are dropped here.
    if let Some(mut call) = call {
        if let Some(done) = call.done.take() {
            let _ = done.send(result);
        }
    }
}

// ============================================================================
// Worker side
// ============================================================================

struct StoredDataset {
    payload: DatasetPayload,
    last_used: Instant,
}

fn worker_loop(
    req_rx: mpsc::Receiver<RequestEnvelope>,
    reply_tx: mpsc::Sender<ReplyEnvelope>,
    idle_reclaim: Duration,
) {
    let mut datasets: HashMap<u64, StoredDataset> = HashMap::new();
    let mut next_handle: u64 = 1;

    while let Ok(envelope) = req_rx.recv() {
        sweep_idle(&mut datasets, idle_reclaim);
        let id = envelope.id;
        let reply = match envelope.request {
            WorkerRequest::TransformCsv {
                body,
                source_id,
                keep_records,
                want_yearly,
            } => {
                let _ = reply_tx.send(ReplyEnvelope {
                    id,
                    reply: WorkerReply::Progress(ProgressUpdate { phase: "parse", rows_done: 0 }),
                });
                let outcome = parse_visits(&body, &source_id);
                let _ = reply_tx.send(ReplyEnvelope {
                    id,
                    reply: WorkerReply::Progress(ProgressUpdate {
                        phase: "aggregate",
                        rows_done: outcome.rows,
                    }),
                });
                let daily_stats = stats::daily_from_records(&outcome.records);
                // Daily series is usable before the (larger) record payload
                // is shipped, so surface it early.
                let _ = reply_tx.send(ReplyEnvelope {
                    id,
                    reply: WorkerReply::Partial(PartialUpdate::DailyReady {
                        daily_stats: daily_stats.clone(),
                    }),
                });
                let yearly_stats = if want_yearly {
                    Some(stats::yearly_from_daily(&daily_stats))
                } else {
                    None
                };
                let records = if keep_records { outcome.records } else { Vec::new() };
                WorkerReply::Success(ResponsePayload::Transformed {
                    records,
                    daily_stats,
                    yearly_stats,
                    rows: outcome.rows,
                    bad_rows: outcome.bad_rows,
                    warnings: outcome.warnings,
                })
            }
            WorkerRequest::StoreDataset { dataset } => {
                let handle = next_handle;
                next_handle += 1;
                datasets.insert(
                    handle,
                    StoredDataset {
                        payload: *dataset,
                        last_used: Instant::now(),
                    },
                );
                WorkerReply::Success(ResponsePayload::DatasetStored { handle })
            }
            WorkerRequest::ReleaseDataset { handle } => {
                datasets.remove(&handle);
                WorkerReply::Success(ResponsePayload::DatasetReleased)
            }
            WorkerRequest::KpiFilters {
                dataset,
                filters,
                defaults,
            } => match resolve_dataset(&mut datasets, &dataset) {
                Some(payload) => {
                    let effective_defaults =
                        defaults.unwrap_or_else(|| payload.defaults.clone());
                    kpi_filters_reply(payload, &filters, &effective_defaults)
                }
                None => unknown_handle_reply(&dataset),
            },
            WorkerRequest::KpiRecordsForDate { dataset, date } => {
                match resolve_dataset(&mut datasets, &dataset) {
                    Some(payload) => {
                        if payload.lite {
                            WorkerReply::Success(ResponsePayload::RecordsForDate {
                                records: Vec::new(),
                                meta: QueryMeta { requires_full_records: true },
                            })
                        } else {
                            WorkerReply::Success(ResponsePayload::RecordsForDate {
                                records: stats::records_for_date(&payload.records, date),
                                meta: QueryMeta::default(),
                            })
                        }
                    }
                    None => unknown_handle_reply(&dataset),
                }
            }
            WorkerRequest::KpiLastShiftHourly { dataset } => {
                match resolve_dataset(&mut datasets, &dataset) {
                    Some(payload) => {
                        // A lite dataset can still answer this: the daily
                        // series carries per-hour counts.
                        let (date, by_hour) = if payload.lite {
                            match payload.daily_stats.last() {
                                Some(stat) => (Some(stat.date), stat.by_hour),
                                None => (None, [0; 24]),
                            }
                        } else {
                            stats::last_shift_hourly(&payload.records)
                        };
                        WorkerReply::Success(ResponsePayload::LastShiftHourly {
                            date,
                            by_hour,
                            meta: QueryMeta::default(),
                        })
                    }
                    None => unknown_handle_reply(&dataset),
                }
            }
            #[cfg(test)]
            WorkerRequest::Crash => return,
        };
        let _ = reply_tx.send(ReplyEnvelope { id, reply });
    }
}

fn kpi_filters_reply(
    payload: &DatasetPayload,
    filters: &VisitFilters,
    defaults: &VisitFilters,
) -> WorkerReply {
    if payload.lite {
        if filters.is_empty() && defaults.is_empty() {
            // Aggregate KPIs are answerable from the daily series alone.
            let mut summary = KpiSummary::default();
            let mut total_stay = 0u64;
            let mut stay_samples = 0u64;
            let mut ambulance = 0u64;
            for stat in &payload.daily_stats {
                summary.visits += stat.visits;
                summary.admitted += stat.admitted;
                ambulance += stat.ambulance_arrivals;
                total_stay += stat.total_stay_minutes;
                stay_samples += stat.stay_samples;
            }
            if summary.visits > 0 {
                summary.admission_rate = summary.admitted as f64 / summary.visits as f64;
                summary.ambulance_share = ambulance as f64 / summary.visits as f64;
            }
            if stay_samples > 0 {
                summary.avg_stay_minutes = total_stay as f64 / stay_samples as f64;
            }
            WorkerReply::Success(ResponsePayload::Kpi {
                summary,
                meta: QueryMeta::default(),
            })
        } else {
            WorkerReply::Success(ResponsePayload::Kpi {
                summary: KpiSummary::default(),
                meta: QueryMeta { requires_full_records: true },
            })
        }
    } else {
        WorkerReply::Success(ResponsePayload::Kpi {
            summary: stats::apply_kpi_filters(&payload.records, filters, defaults),
            meta: QueryMeta::default(),
        })
    }
}

fn resolve_dataset<'a>(
    datasets: &'a mut HashMap<u64, StoredDataset>,
    dataset: &'a DatasetRef,
) -> Option<&'a DatasetPayload> {
    match dataset {
        DatasetRef::Handle(handle) => datasets.get_mut(handle).map(|stored| {
            stored.last_used = Instant::now();
            &stored.payload
        }),
        DatasetRef::Inline(payload) => Some(payload),
    }
}

fn unknown_handle_reply(dataset: &DatasetRef) -> WorkerReply {
    let handle = match dataset {
        DatasetRef::Handle(h) => *h,
        DatasetRef::Inline(_) => 0,
    };
    WorkerReply::Error {
        name: "UnknownHandle".to_string(),
        message: format!("dataset handle {} is not stored", handle),
    }
}

fn sweep_idle(datasets: &mut HashMap<u64, StoredDataset>, idle_reclaim: Duration) {
    if datasets.is_empty() {
        return;
    }
    let before = datasets.len();
    datasets.retain(|_, stored| stored.last_used.elapsed() <= idle_reclaim);
    let dropped = before - datasets.len();
    if dropped > 0 {
        log(
            Level::Debug,
            Domain::Worker,
            "idle_datasets_reclaimed",
            obj(&[("dropped", v_num(dropped as f64))]),
        );
    }
}
