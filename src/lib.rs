//! edpulse: data backend for an emergency-department visits dashboard.
//!
//! Fetches delimited visit datasets from remote sources with conditional
//! revalidation, caches artifacts in two tiers (in-process + SQLite),
//! offloads parsing/aggregation to an isolated computation unit, and keeps
//! chart queries interactive through a staged memoized recompute pipeline.

pub mod cache;
pub mod config;
pub mod derived;
pub mod error;
pub mod fetch;
pub mod handle;
pub mod logging;
pub mod records;
pub mod stats;
pub mod transport;

pub use cache::{ArtifactKind, CachePolicy, CacheStore};
pub use config::Config;
pub use derived::{ChartControls, DerivedPipeline};
pub use error::PipelineError;
pub use fetch::{FetchOptions, FetchOrchestrator, FetchProfile};
pub use handle::{DatasetRole, HandleRegistry, Versioned};
pub use transport::{CancelToken, TransportSession};
