use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

use edpulse::cache::CacheStore;
use edpulse::config::Config;
use edpulse::fetch::{FetchOptions, FetchOrchestrator, RecordsState};
use edpulse::logging::{log, obj, v_num, v_str, Domain, Level};
use edpulse::transport::TransportSession;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let cache = Arc::new(CacheStore::open(
        &cfg.cache_namespace,
        &cfg.sqlite_path,
        cfg.schema_version,
    ));
    let transport = Arc::new(TransportSession::new(Duration::from_secs(
        cfg.worker_idle_reclaim_secs,
    )));
    let orchestrator = FetchOrchestrator::new(&cfg, cache, transport)?;

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("primary_url", v_str(&cfg.primary_url)),
            (
                "historical_url",
                v_str(cfg.historical_url.as_deref().unwrap_or("-")),
            ),
            ("interval_secs", v_num(cfg.fetch_interval_secs as f64)),
        ]),
    );

    // First pass defers the per-record payload so daily charts are ready
    // quickly even on a cold cache; the ticket hydrates the rest.
    let mut defer_first = true;

    loop {
        let options = FetchOptions {
            defer_full_records: defer_first,
            ..Default::default()
        };
        match orchestrator.fetch_data(options).await {
            Ok(outcome) => {
                for source in &outcome.meta.sources {
                    log(
                        Level::Info,
                        Domain::System,
                        "source_summary",
                        obj(&[
                            ("source", v_str(&source.id)),
                            ("used", v_str(if source.used { "yes" } else { "no" })),
                            ("from_cache", v_str(if source.from_cache { "yes" } else { "no" })),
                            ("records", v_num(source.records_count as f64)),
                            ("error", v_str(source.error.as_deref().unwrap_or("-"))),
                        ]),
                    );
                }
                for warning in &outcome.meta.warnings {
                    log(
                        Level::Warn,
                        Domain::System,
                        "fetch_warning",
                        obj(&[("msg", v_str(warning))]),
                    );
                }
                if outcome.meta.records_state == RecordsState::Deferred {
                    if let Some(ticket) = outcome.hydration {
                        match ticket.hydrate().await {
                            Ok(full) => log(
                                Level::Info,
                                Domain::System,
                                "hydrated",
                                obj(&[("records", v_num(full.records.len() as f64))]),
                            ),
                            Err(err) => log(
                                Level::Warn,
                                Domain::System,
                                "hydration_failed",
                                obj(&[("error", v_str(&err.to_string()))]),
                            ),
                        }
                    }
                }
                defer_first = false;
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                log(
                    Level::Error,
                    Domain::System,
                    "fetch_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        }

        sleep(Duration::from_secs(cfg.fetch_interval_secs)).await;
    }
}
