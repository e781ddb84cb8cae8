//! Periodic cache maintenance: purge expired rows and retire vanished listings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use estate_core::{Property, DETAIL_KEY_PREFIX};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

use crate::chain::FetchChain;
use crate::IngestConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub purged: u64,
    pub checked: usize,
    pub still_active: usize,
    pub deactivated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Reconciler {
    config: Arc<IngestConfig>,
    chain: Arc<FetchChain>,
}

impl Reconciler {
    pub fn new(config: Arc<IngestConfig>, chain: Arc<FetchChain>) -> Self {
        Self { config, chain }
    }

    /// One maintenance pass. Credential failures abort the pass; other per-listing
    /// failures are counted and left for the next run.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let cache = self.chain.cache();
        let mut report = ReconcileReport::default();

        match cache.purge_expired(self.config.cache_ttl()).await {
            Ok(purged) => report.purged = purged,
            Err(err) => warn!(error = %err, "purge of expired cache rows failed"),
        }

        if self.config.mock_mode {
            info!(purged = report.purged, "mock mode: skipping listing re-validation");
            return Ok(report);
        }

        let entries = cache
            .scan_active(DETAIL_KEY_PREFIX, self.config.reconcile.batch_size)
            .await
            .context("scanning cached listings")?;

        let mut first = true;
        for entry in entries {
            let mut property: Property = match serde_json::from_value(entry.data.clone()) {
                Ok(property) => property,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "skipping undecodable cache entry");
                    report.skipped += 1;
                    continue;
                }
            };
            if property.is_synthetic {
                report.skipped += 1;
                continue;
            }

            if !first {
                tokio::time::sleep(self.config.reconcile.request_delay).await;
            }
            first = false;
            report.checked += 1;

            match self
                .chain
                .live_detail(&property.id, Some(property.source_url.as_str()))
                .await
            {
                Ok(Some(_)) => report.still_active += 1,
                Ok(None) => {
                    property.is_active = false;
                    let data = serde_json::to_value(&property).context("serializing listing")?;
                    cache
                        .update_data(&entry.key, &data)
                        .await
                        .with_context(|| format!("deactivating {}", entry.key))?;
                    info!(id = %property.id, "listing no longer available; marked inactive");
                    report.deactivated += 1;
                }
                Err(err) if err.is_auth() => {
                    anyhow::bail!("provider rejected credentials during reconciliation: {err}");
                }
                Err(err) => {
                    warn!(id = %property.id, error = %err, "could not re-check listing");
                    report.failed += 1;
                }
            }
        }

        info!(
            purged = report.purged,
            checked = report.checked,
            deactivated = report.deactivated,
            failed = report.failed,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Scheduler that runs once shortly after start and then on a fixed interval.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let settings = &self.config.reconcile;

        let startup = self.clone();
        let first_run = Job::new_one_shot_async(settings.startup_delay, move |_uuid, _l| {
            let reconciler = startup.clone();
            Box::pin(async move { reconciler.run_logged("startup").await })
        })
        .context("creating startup reconciliation job")?;
        sched.add(first_run).await.context("adding startup job")?;

        let periodic = self.clone();
        let repeated = Job::new_repeated_async(settings.interval, move |_uuid, _l| {
            let reconciler = periodic.clone();
            Box::pin(async move { reconciler.run_logged("interval").await })
        })
        .context("creating periodic reconciliation job")?;
        sched.add(repeated).await.context("adding periodic job")?;

        Ok(sched)
    }

    async fn run_logged(&self, trigger: &'static str) {
        let span = info_span!("reconcile", trigger);
        if let Err(err) = self.run_once().instrument(span).await {
            error!(error = %err, trigger, "reconciliation run failed");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub enabled: bool,
    pub startup_delay: Duration,
    pub interval: Duration,
    pub batch_size: usize,
    pub request_delay: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay: Duration::from_secs(60),
            interval: Duration::from_secs(24 * 60 * 60),
            batch_size: 50,
            request_delay: Duration::from_secs(2),
        }
    }
}
