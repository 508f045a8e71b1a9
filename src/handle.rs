//! Client-side registry of datasets retained inside the computation unit.
//!
//! A dataset is shipped to the unit once per change; subsequent queries
//! reference it by an opaque handle instead of re-transferring the arrays.
//! Change detection uses explicit generation counters on owned data
//! (`Versioned<T>`), not reference identity: producers replace a dataset
//! wholesale, which bumps its generation.
//!
//! The registry keeps at most one live handle per dataset role. A replaced
//! handle is released fire-and-forget; failures are swallowed because the
//! unit independently reclaims idle datasets (the leak-safe contract).

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::PipelineError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::records::{DailyStat, VisitRecord};
use crate::stats::VisitFilters;
use crate::transport::{
    DatasetPayload, DatasetRef, RequestCallbacks, ResponsePayload, TransportSession, WorkerRequest,
};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Owned value with a process-wide monotonically increasing generation.
/// Two `Versioned` wrappers compare as "same input" iff their generations
/// match, which only happens when one is a clone of the other.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    value: Arc<T>,
    generation: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(value),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the value wholesale, assigning a fresh generation.
    pub fn replace(&mut self, value: T) {
        self.value = Arc::new(value);
        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::SeqCst);
    }

    pub fn share(&self) -> Arc<T> {
        self.value.clone()
    }
}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Logical slot a dataset occupies on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetRole {
    KpiPrimary,
    KpiCompare,
}

impl DatasetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetRole::KpiPrimary => "kpi-primary",
            DatasetRole::KpiCompare => "kpi-compare",
        }
    }
}

/// Inputs a handle is minted from. Arrays are referenced by generation; the
/// config part is compared structurally.
#[derive(Clone)]
pub struct DatasetInputs {
    pub lite: bool,
    pub records: Versioned<Vec<VisitRecord>>,
    pub daily_stats: Versioned<Vec<DailyStat>>,
    pub defaults: VisitFilters,
}

impl DatasetInputs {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            records_generation: self.records.generation(),
            daily_generation: self.daily_stats.generation(),
            lite: self.lite,
            defaults: self.defaults.clone(),
        }
    }

    fn payload(&self) -> DatasetPayload {
        DatasetPayload {
            lite: self.lite,
            records: (*self.records).clone(),
            daily_stats: (*self.daily_stats).clone(),
            defaults: self.defaults.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    records_generation: u64,
    daily_generation: u64,
    lite: bool,
    defaults: VisitFilters,
}

struct HandleState {
    fingerprint: Fingerprint,
    handle: u64,
}

pub struct HandleRegistry {
    transport: Arc<TransportSession>,
    state: Mutex<HashMap<DatasetRole, HandleState>>,
}

impl HandleRegistry {
    pub fn new(transport: Arc<TransportSession>) -> Self {
        Self {
            transport,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live handle for `role`, shipping the dataset to the unit
    /// only when its fingerprint changed since the last store.
    pub async fn ensure_handle(
        &self,
        role: DatasetRole,
        inputs: &DatasetInputs,
    ) -> Result<u64, PipelineError> {
        let fingerprint = inputs.fingerprint();
        {
            let state = self.state.lock().expect("handle state poisoned");
            if let Some(existing) = state.get(&role) {
                if existing.fingerprint == fingerprint {
                    return Ok(existing.handle);
                }
            }
        }

        let payload = inputs.payload();
        let response = self
            .transport
            .request(
                WorkerRequest::StoreDataset {
                    dataset: Box::new(payload),
                },
                RequestCallbacks::default(),
            )
            .await;

        let handle = match response {
            Ok(ResponsePayload::DatasetStored { handle }) => handle,
            Ok(_) => {
                return Err(PipelineError::ComputationUnit(
                    "unexpected reply to store request".to_string(),
                ))
            }
            Err(err) => {
                self.invalidate(role);
                return Err(err);
            }
        };

        let previous = {
            let mut state = self.state.lock().expect("handle state poisoned");
            state
                .insert(role, HandleState { fingerprint, handle })
                .map(|old| old.handle)
        };
        if let Some(old) = previous {
            if old != handle {
                self.release_async(old);
            }
        }
        log(
            Level::Debug,
            Domain::Worker,
            "dataset_handle_stored",
            obj(&[
                ("role", v_str(role.as_str())),
                ("handle", v_num(handle as f64)),
            ]),
        );
        Ok(handle)
    }

    /// Forget the current handle for a role without releasing it; the unit
    /// reclaims it after the idle period.
    pub fn invalidate(&self, role: DatasetRole) {
        if let Ok(mut state) = self.state.lock() {
            state.remove(&role);
        }
    }

    fn release_async(&self, handle: u64) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            // Best-effort: a failed release is not an error, the unit's
            // idle sweep covers it.
            let _ = transport
                .request(
                    WorkerRequest::ReleaseDataset { handle },
                    RequestCallbacks::default(),
                )
                .await;
        });
    }

    /// Run a dataset query through the handle path, falling back to the
    /// legacy whole-payload path for this one call if the handle path
    /// fails. Cancellations propagate without triggering the fallback.
    pub async fn query(
        &self,
        role: DatasetRole,
        inputs: &DatasetInputs,
        build: impl Fn(DatasetRef) -> WorkerRequest,
        callbacks: RequestCallbacks,
    ) -> Result<ResponsePayload, PipelineError> {
        let handle = match self.ensure_handle(role, inputs).await {
            Ok(handle) => Some(handle),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            let cancel = callbacks.cancel.clone();
            match self
                .transport
                .request(build(DatasetRef::Handle(handle)), callbacks)
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Worker,
                        "handle_query_failed",
                        obj(&[
                            ("role", v_str(role.as_str())),
                            ("handle", v_num(handle as f64)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    self.invalidate(role);
                    return self
                        .transport
                        .request(
                            build(DatasetRef::Inline(Box::new(inputs.payload()))),
                            RequestCallbacks {
                                cancel,
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
        }

        self.transport
            .request(build(DatasetRef::Inline(Box::new(inputs.payload()))), callbacks)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::parse_visits;
    use crate::stats;
    use std::time::Duration;

    const SAMPLE: &str = "\
date,time,age,arrival,disposition,card_type,stay_minutes
2026-02-10,08:15,34,walk-in,discharged,standard,95
2026-02-10,09:40,71,ambulance,admitted,emergency,310
";

    fn inputs() -> DatasetInputs {
        let outcome = parse_visits(SAMPLE, "primary");
        let daily = stats::daily_from_records(&outcome.records);
        DatasetInputs {
            lite: false,
            records: Versioned::new(outcome.records),
            daily_stats: Versioned::new(daily),
            defaults: VisitFilters::default(),
        }
    }

    fn registry() -> HandleRegistry {
        HandleRegistry::new(Arc::new(TransportSession::new(Duration::from_secs(600))))
    }

    #[test]
    fn test_versioned_generations_increase() {
        let a = Versioned::new(vec![1]);
        let mut b = Versioned::new(vec![2]);
        assert!(b.generation() > a.generation());
        let before = b.generation();
        b.replace(vec![3]);
        assert!(b.generation() > before);
    }

    #[test]
    fn test_versioned_clone_shares_generation() {
        let a = Versioned::new(vec![1]);
        let b = a.clone();
        assert_eq!(a.generation(), b.generation());
    }

    #[tokio::test]
    async fn test_ensure_handle_reuse_idempotent() {
        let registry = registry();
        let inputs = inputs();
        let first = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        // The unit numbers handles sequentially, so getting the same value
        // back proves no second store message was sent.
        let second = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_changed_generation_mints_new_handle() {
        let registry = registry();
        let mut inputs = inputs();
        let first = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();

        let outcome = parse_visits(SAMPLE, "primary");
        inputs.records = Versioned::new(outcome.records);
        let second = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_config_change_mints_new_handle() {
        let registry = registry();
        let mut inputs = inputs();
        let first = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        inputs.defaults = VisitFilters {
            arrival: Some(crate::records::ArrivalMode::Ambulance),
            ..Default::default()
        };
        let second = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_roles_are_independent() {
        let registry = registry();
        let inputs = inputs();
        let primary = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        let compare = registry
            .ensure_handle(DatasetRole::KpiCompare, &inputs)
            .await
            .unwrap();
        assert_ne!(primary, compare);
    }

    #[tokio::test]
    async fn test_query_falls_back_when_handle_lost() {
        let transport = Arc::new(TransportSession::new(Duration::from_secs(600)));
        let registry = HandleRegistry::new(transport.clone());
        let inputs = inputs();
        let handle = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();

        // Simulate the unit reclaiming the dataset behind our back.
        transport
            .request(
                WorkerRequest::ReleaseDataset { handle },
                RequestCallbacks::default(),
            )
            .await
            .unwrap();

        let payload = registry
            .query(
                DatasetRole::KpiPrimary,
                &inputs,
                |dataset| WorkerRequest::KpiFilters {
                    dataset,
                    filters: VisitFilters::default(),
                    defaults: None,
                },
                RequestCallbacks::default(),
            )
            .await
            .expect("fallback path should answer");
        match payload {
            ResponsePayload::Kpi { summary, .. } => assert_eq!(summary.visits, 2),
            other => panic!("unexpected payload: {:?}", other),
        }

        // The failed handle was invalidated; the next ensure stores again.
        let fresh = registry
            .ensure_handle(DatasetRole::KpiPrimary, &inputs)
            .await
            .unwrap();
        assert_ne!(fresh, handle);
    }
}
