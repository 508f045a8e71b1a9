//! Data fetch orchestrator.
//!
//! For every configured source, concurrently: read the cache entry for the
//! requested artifact kind, issue a conditional request carrying the stored
//! validators, and either reuse the cached artifact (not-modified or
//! matching content signature) or ship the fresh body through the
//! computation transport and write the result back to the cache. Source
//! failures are isolated: a failed source falls back to its last good cache
//! entry when one exists, and only a `required` source with no usable cache
//! aborts the whole fetch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};

use crate::cache::{ArtifactKind, CacheEntry, CachePolicy, CacheStore, CacheTier, Validators};
use crate::config::Config;
use crate::error::PipelineError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::records::{DailyStat, VisitRecord, YearlyStat};
use crate::stats;
use crate::transport::{
    CancelToken, PartialFn, ProgressFn, RequestCallbacks, ResponsePayload, TransportSession,
    WorkerRequest,
};

pub mod http;
pub mod retry;

pub use http::{ChunkFn, HttpSourceClient, SourceClient, SourceResponse};
pub use retry::RetryConfig;

/// One configured remote source. Static per session.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub url: String,
    pub label: String,
    pub required: bool,
    pub enabled: bool,
    /// Historical archives can be skipped via `FetchOptions::skip_historical`.
    pub historical: bool,
}

/// Which subset of the transformed data to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchProfile {
    /// Records + daily series + yearly aggregate.
    #[default]
    Full,
    /// Daily series only; the per-record payload is never built.
    DailyLite,
    /// Daily series + yearly aggregate.
    DailyPlusAgg,
}

impl FetchProfile {
    pub fn artifact_kind(&self) -> ArtifactKind {
        match self {
            FetchProfile::Full => ArtifactKind::Full,
            FetchProfile::DailyLite => ArtifactKind::DailyLite,
            FetchProfile::DailyPlusAgg => ArtifactKind::DailyPlusAgg,
        }
    }

    fn keep_records(&self) -> bool {
        matches!(self, FetchProfile::Full)
    }

    fn want_yearly(&self) -> bool {
        matches!(self, FetchProfile::Full | FetchProfile::DailyPlusAgg)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchProfile::Full => "full",
            FetchProfile::DailyLite => "daily-lite",
            FetchProfile::DailyPlusAgg => "daily-plus-agg",
        }
    }
}

#[derive(Clone)]
pub struct FetchOptions {
    pub profile: FetchProfile,
    pub cache_policy: CachePolicy,
    /// When false, only the in-memory tier is consulted.
    pub allow_persistent_cache: bool,
    pub skip_historical: bool,
    /// Fetch the lite artifact now and hand back a ticket that hydrates
    /// the full per-record payload on demand.
    pub defer_full_records: bool,
    /// Ignore stored validators and refetch unconditionally.
    pub force_refresh: bool,
    pub cancel: Option<CancelToken>,
    pub on_primary_chunk: Option<ChunkFn>,
    pub on_worker_progress: Option<ProgressFn>,
    pub on_primary_partial: Option<PartialFn>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            profile: FetchProfile::Full,
            cache_policy: CachePolicy::MemoryFirst,
            allow_persistent_cache: true,
            skip_historical: false,
            defer_full_records: false,
            force_refresh: false,
            cancel: None,
            on_primary_chunk: None,
            on_worker_progress: None,
            on_primary_partial: None,
        }
    }
}

/// How much per-record data the outcome carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordsState {
    Full,
    DailyOnly,
    /// Lite data now; use the hydration ticket for the full payload.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub id: String,
    pub label: String,
    /// Whether this source contributed data to the merged result.
    pub used: bool,
    pub from_cache: bool,
    pub cache_tier: Option<&'static str>,
    pub not_modified: bool,
    /// Whether fresh data (different from the cache) was produced.
    pub changed: bool,
    pub records_count: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchMeta {
    pub sources: Vec<SourceOutcome>,
    pub warnings: Vec<String>,
    pub profile: FetchProfile,
    pub records_state: RecordsState,
}

pub struct FetchOutcome {
    pub records: Vec<VisitRecord>,
    pub primary_records: Vec<VisitRecord>,
    pub daily_stats: Vec<DailyStat>,
    pub primary_daily: Vec<DailyStat>,
    pub yearly_stats: Option<Vec<YearlyStat>>,
    pub meta: FetchMeta,
    /// Present when full records were deferred.
    pub hydration: Option<HydrationTicket>,
}

impl std::fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOutcome")
            .field("records", &self.records.len())
            .field("primary_records", &self.primary_records.len())
            .field("daily_stats", &self.daily_stats.len())
            .field("primary_daily", &self.primary_daily.len())
            .field("yearly_stats", &self.yearly_stats.as_ref().map(|v| v.len()))
            .field("meta", &self.meta)
            .field("hydration", &self.hydration.is_some())
            .finish()
    }
}

/// Capability to fetch the full per-record payload after a deferred fetch.
pub struct HydrationTicket {
    orchestrator: FetchOrchestrator,
    options: FetchOptions,
}

impl HydrationTicket {
    pub async fn hydrate(self) -> Result<FetchOutcome, PipelineError> {
        self.orchestrator.fetch_data(self.options).await
    }
}

struct AggregateMemo {
    signatures: Vec<(String, Option<String>)>,
    yearly: Vec<YearlyStat>,
}

struct OrchestratorInner {
    sources: Vec<SourceDescriptor>,
    client: Arc<dyn SourceClient>,
    cache: Arc<CacheStore>,
    transport: Arc<TransportSession>,
    schema_version: u32,
    yearly_memo: Mutex<Option<AggregateMemo>>,
}

#[derive(Clone)]
pub struct FetchOrchestrator {
    inner: Arc<OrchestratorInner>,
}

/// Per-source result, error captured rather than propagated so one bad
/// source cannot abort its siblings.
struct SourceFetch {
    outcome: SourceOutcome,
    records: Vec<VisitRecord>,
    daily: Vec<DailyStat>,
    warnings: Vec<String>,
    signature: Option<String>,
    fatal: Option<PipelineError>,
}

impl SourceFetch {
    fn empty(source: &SourceDescriptor) -> Self {
        Self {
            outcome: SourceOutcome {
                id: source.id.clone(),
                label: source.label.clone(),
                used: false,
                from_cache: false,
                cache_tier: None,
                not_modified: false,
                changed: false,
                records_count: 0,
                error: None,
            },
            records: Vec::new(),
            daily: Vec::new(),
            warnings: Vec::new(),
            signature: None,
            fatal: None,
        }
    }
}

impl FetchOrchestrator {
    pub fn new(
        cfg: &Config,
        cache: Arc<CacheStore>,
        transport: Arc<TransportSession>,
    ) -> Result<Self, PipelineError> {
        let retry = RetryConfig {
            max_retries: cfg.max_retries,
            base_delay_ms: cfg.retry_base_delay_ms,
            max_delay_ms: cfg.retry_max_delay_ms,
            ..Default::default()
        };
        let client = Arc::new(HttpSourceClient::new(
            Duration::from_secs(cfg.fetch_timeout_secs),
            retry,
        )?);
        Ok(Self::with_client(cfg.sources(), client, cache, transport, cfg.schema_version))
    }

    /// Construct with an explicit source client; the test seam.
    pub fn with_client(
        sources: Vec<SourceDescriptor>,
        client: Arc<dyn SourceClient>,
        cache: Arc<CacheStore>,
        transport: Arc<TransportSession>,
        schema_version: u32,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                sources,
                client,
                cache,
                transport,
                schema_version,
                yearly_memo: Mutex::new(None),
            }),
        }
    }

    /// Fetch all configured sources and merge their artifacts.
    pub async fn fetch_data(&self, options: FetchOptions) -> Result<FetchOutcome, PipelineError> {
        let sources: Vec<&SourceDescriptor> = self
            .inner
            .sources
            .iter()
            .filter(|s| s.enabled && !(options.skip_historical && s.historical))
            .collect();
        if sources.is_empty() {
            return Err(PipelineError::Config("no enabled sources".to_string()));
        }

        // Deferred hydration fetches the lite artifact now; the ticket
        // re-runs with the full profile later.
        let effective_profile = if options.defer_full_records
            && options.profile == FetchProfile::Full
        {
            FetchProfile::DailyPlusAgg
        } else {
            options.profile
        };

        let fetches = join_all(
            sources
                .iter()
                .enumerate()
                .map(|(index, source)| self.fetch_source(source, &options, effective_profile, index == 0)),
        )
        .await;

        // A cancellation anywhere aborts the whole fetch before any other
        // fatal is considered.
        if fetches
            .iter()
            .any(|f| matches!(f.fatal, Some(PipelineError::Cancelled)))
        {
            return Err(PipelineError::Cancelled);
        }
        if let Some(index) = fetches.iter().position(|f| f.fatal.is_some()) {
            let fetch = fetches
                .into_iter()
                .nth(index)
                .expect("fatal index in range");
            log(
                Level::Error,
                Domain::Fetch,
                "required_source_failed",
                obj(&[("source", v_str(&fetch.outcome.id))]),
            );
            return Err(fetch.fatal.expect("fatal present"));
        }

        // Merge: concatenate records (already tagged by source id), union
        // daily series by date, recompute averages from summed numerators.
        let mut records: Vec<VisitRecord> = Vec::new();
        let mut fragments: Vec<Vec<DailyStat>> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut outcomes: Vec<SourceOutcome> = Vec::new();
        let mut primary_records: Vec<VisitRecord> = Vec::new();
        let mut primary_daily: Vec<DailyStat> = Vec::new();
        let mut any_changed = false;
        let mut signatures: Vec<(String, Option<String>)> = Vec::new();

        for (index, fetch) in fetches.into_iter().enumerate() {
            if index == 0 {
                primary_records = fetch.records.clone();
                primary_daily = fetch.daily.clone();
            }
            any_changed |= fetch.outcome.changed;
            signatures.push((fetch.outcome.id.clone(), fetch.signature.clone()));
            records.extend(fetch.records);
            fragments.push(fetch.daily);
            warnings.extend(fetch.warnings);
            outcomes.push(fetch.outcome);
        }
        let daily_stats = stats::merge_daily(&fragments);

        let yearly_stats = if effective_profile.want_yearly() {
            Some(self.yearly_with_memo(any_changed, signatures, &daily_stats))
        } else {
            None
        };

        let (records_state, hydration) = if options.defer_full_records
            && options.profile == FetchProfile::Full
        {
            let ticket = HydrationTicket {
                orchestrator: self.clone(),
                options: FetchOptions {
                    profile: FetchProfile::Full,
                    defer_full_records: false,
                    on_primary_chunk: None,
                    on_worker_progress: None,
                    on_primary_partial: None,
                    ..options.clone()
                },
            };
            (RecordsState::Deferred, Some(ticket))
        } else if effective_profile == FetchProfile::Full {
            (RecordsState::Full, None)
        } else {
            (RecordsState::DailyOnly, None)
        };

        log(
            Level::Info,
            Domain::Fetch,
            "fetch_done",
            obj(&[
                ("profile", v_str(effective_profile.as_str())),
                ("sources", v_num(outcomes.len() as f64)),
                ("records", v_num(records.len() as f64)),
                ("days", v_num(daily_stats.len() as f64)),
                ("warnings", v_num(warnings.len() as f64)),
            ]),
        );

        Ok(FetchOutcome {
            records,
            primary_records,
            daily_stats,
            primary_daily,
            yearly_stats,
            meta: FetchMeta {
                sources: outcomes,
                warnings,
                profile: effective_profile,
                records_state,
            },
            hydration,
        })
    }

    fn yearly_with_memo(
        &self,
        any_changed: bool,
        signatures: Vec<(String, Option<String>)>,
        daily: &[DailyStat],
    ) -> Vec<YearlyStat> {
        let mut memo = self.inner.yearly_memo.lock().expect("yearly memo poisoned");
        if !any_changed {
            if let Some(existing) = memo.as_ref() {
                if existing.signatures == signatures {
                    return existing.yearly.clone();
                }
            }
        }
        let yearly = stats::yearly_from_daily(daily);
        *memo = Some(AggregateMemo {
            signatures,
            yearly: yearly.clone(),
        });
        yearly
    }

    async fn fetch_source(
        &self,
        source: &SourceDescriptor,
        options: &FetchOptions,
        profile: FetchProfile,
        is_primary: bool,
    ) -> SourceFetch {
        let mut fetch = SourceFetch::empty(source);

        if url::Url::parse(&source.url).is_err() {
            let message = format!("invalid url: {}", source.url);
            fetch.outcome.error = Some(message.clone());
            if source.required {
                fetch.fatal = Some(PipelineError::Config(message));
            }
            return fetch;
        }

        let kind = profile.artifact_kind();
        let read_policy = if options.allow_persistent_cache {
            options.cache_policy
        } else {
            CachePolicy::NetworkFirst
        };
        let cached = self.inner.cache.read_traced(&source.url, kind, read_policy);

        let validators = if options.force_refresh {
            Validators::default()
        } else {
            cached
                .as_ref()
                .map(|(entry, _)| entry.validators.clone())
                .unwrap_or_default()
        };

        let on_chunk = if is_primary {
            options.on_primary_chunk.clone()
        } else {
            None
        };
        let response = with_cancel(
            &options.cancel,
            self.inner
                .client
                .fetch(&source.id, &source.url, &validators, on_chunk),
        )
        .await;

        match response {
            Ok(SourceResponse::NotModified) => match cached {
                Some((entry, tier)) => {
                    log(
                        Level::Debug,
                        Domain::Fetch,
                        "not_modified",
                        obj(&[("source", v_str(&source.id))]),
                    );
                    self.reuse_cached(&mut fetch, &entry, Some(tier), true);
                }
                None => {
                    // We sent no validators, so a 304 here is a server bug.
                    let message = "not-modified without cached entry".to_string();
                    fetch.outcome.error = Some(message.clone());
                    if source.required {
                        fetch.fatal = Some(PipelineError::network_fatal(&source.id, message));
                    }
                }
            },
            Ok(SourceResponse::Modified {
                body,
                etag,
                last_modified,
            }) => {
                let signature = hex::encode(Sha256::digest(body.as_bytes()));
                let signature_match = !options.force_refresh
                    && cached
                        .as_ref()
                        .map(|(entry, _)| {
                            entry.validators.content_signature.as_deref() == Some(signature.as_str())
                        })
                        .unwrap_or(false);
                if signature_match {
                    // Same bytes under new headers: skip the parse, refresh
                    // the stored validators.
                    let (entry, tier) = cached.expect("signature match implies cache entry");
                    let mut refreshed = (*entry).clone();
                    refreshed.validators = Validators {
                        etag,
                        last_modified,
                        content_signature: Some(signature.clone()),
                    };
                    refreshed.stored_at = Utc::now().timestamp();
                    self.inner.cache.write(&source.url, kind, refreshed);
                    self.reuse_cached(&mut fetch, &entry, Some(tier), true);
                } else {
                    self.transform_and_store(
                        &mut fetch,
                        source,
                        options,
                        profile,
                        is_primary,
                        body,
                        Validators {
                            etag,
                            last_modified,
                            content_signature: Some(signature),
                        },
                        cached.map(|(entry, _)| entry),
                    )
                    .await;
                }
            }
            Err(err) if err.is_cancelled() => {
                fetch.fatal = Some(PipelineError::Cancelled);
            }
            Err(err) => {
                match cached {
                    Some((entry, tier)) => {
                        // Degraded but available: last good artifact.
                        fetch
                            .warnings
                            .push(format!("{}: using cached data ({})", source.id, err));
                        fetch.outcome.error = Some(err.to_string());
                        self.reuse_cached(&mut fetch, &entry, Some(tier), false);
                        log(
                            Level::Warn,
                            Domain::Fetch,
                            "stale_cache_fallback",
                            obj(&[
                                ("source", v_str(&source.id)),
                                ("error", v_str(&err.to_string())),
                            ]),
                        );
                    }
                    None => {
                        fetch.outcome.error = Some(err.to_string());
                        if source.required {
                            fetch.fatal = Some(err);
                        } else {
                            fetch
                                .warnings
                                .push(format!("{}: unavailable ({})", source.id, err));
                        }
                    }
                }
            }
        }

        fetch
    }

    fn reuse_cached(
        &self,
        fetch: &mut SourceFetch,
        entry: &CacheEntry,
        tier: Option<CacheTier>,
        not_modified: bool,
    ) {
        fetch.outcome.used = true;
        fetch.outcome.from_cache = true;
        fetch.outcome.cache_tier = tier.map(|t| t.as_str());
        fetch.outcome.not_modified = not_modified;
        fetch.outcome.changed = false;
        fetch.outcome.records_count = entry.records.len().max(entry.daily_stats.len()) as u64;
        fetch.signature = entry.validators.content_signature.clone();
        fetch.records = entry.records.clone();
        fetch.daily = entry.daily_stats.clone();
    }

    #[allow(clippy::too_many_arguments)]
    async fn transform_and_store(
        &self,
        fetch: &mut SourceFetch,
        source: &SourceDescriptor,
        options: &FetchOptions,
        profile: FetchProfile,
        is_primary: bool,
        body: String,
        validators: Validators,
        stale: Option<Arc<CacheEntry>>,
    ) {
        let callbacks = RequestCallbacks {
            on_progress: options.on_worker_progress.clone(),
            on_partial: if is_primary {
                options.on_primary_partial.clone()
            } else {
                None
            },
            cancel: options.cancel.clone(),
        };
        let result = self
            .inner
            .transport
            .request(
                WorkerRequest::TransformCsv {
                    body,
                    source_id: source.id.clone(),
                    keep_records: profile.keep_records(),
                    want_yearly: profile.want_yearly(),
                },
                callbacks,
            )
            .await;

        match result {
            Ok(ResponsePayload::Transformed {
                records,
                daily_stats,
                yearly_stats,
                rows,
                bad_rows,
                warnings,
            }) => {
                let signature = validators.content_signature.clone();
                let entry = CacheEntry {
                    schema_version: self.inner.schema_version,
                    artifact_kind: profile.artifact_kind(),
                    validators,
                    stored_at: Utc::now().timestamp(),
                    records: records.clone(),
                    daily_stats: daily_stats.clone(),
                    yearly_stats,
                };
                self.inner
                    .cache
                    .write(&source.url, profile.artifact_kind(), entry);

                fetch.outcome.used = true;
                fetch.outcome.changed = true;
                fetch.outcome.records_count = rows;
                fetch.signature = signature;
                for warning in warnings {
                    fetch.warnings.push(format!("{}: {}", source.id, warning));
                }
                if bad_rows > 0 {
                    fetch
                        .warnings
                        .push(format!("{}: {} bad rows skipped", source.id, bad_rows));
                }
                fetch.records = records;
                fetch.daily = daily_stats;
            }
            Ok(_) => {
                fetch.outcome.error = Some("unexpected transform reply".to_string());
                if source.required {
                    fetch.fatal = Some(PipelineError::ComputationUnit(
                        "unexpected transform reply".to_string(),
                    ));
                }
            }
            Err(err) if err.is_cancelled() => {
                fetch.fatal = Some(PipelineError::Cancelled);
            }
            Err(err) => match stale {
                Some(entry) => {
                    fetch
                        .warnings
                        .push(format!("{}: using cached data ({})", source.id, err));
                    fetch.outcome.error = Some(err.to_string());
                    self.reuse_cached(fetch, &entry, None, false);
                }
                None => {
                    fetch.outcome.error = Some(err.to_string());
                    if source.required {
                        fetch.fatal = Some(err);
                    } else {
                        fetch
                            .warnings
                            .push(format!("{}: transform failed ({})", source.id, err));
                    }
                }
            },
        }
    }

}

async fn with_cancel<T>(
    cancel: &Option<CancelToken>,
    fut: impl std::future::Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(PipelineError::Cancelled),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}
