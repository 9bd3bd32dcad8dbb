//! Periodic background work: name index rebuilds and sweeps.

use chrono::Utc;
use metrics::counter;
use std::{sync::Arc, time::Duration};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{
    cache::CacheStore, governor::Governor, resolver::ItemResolver, store::ListingStore,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub snapshots: u64,
    pub listings: u64,
    pub cooldowns: usize,
}

pub struct Maintenance {
    pub resolver: Arc<ItemResolver>,
    pub cache: CacheStore,
    pub listings: Arc<dyn ListingStore>,
    pub governor: Arc<Governor>,
    /// How long an expired snapshot is kept for stale fallback.
    pub snapshot_retention: Duration,
    pub listing_retention: Duration,
}

impl Maintenance {
    pub async fn refresh_index(&self) {
        if let Err(err) = self.resolver.rebuild().await {
            error!(error = %err, "item name index rebuild failed, keeping previous index");
        }
    }

    /// Removes expired data. Each part runs even if another fails.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.cache.sweep(self.snapshot_retention).await {
            Ok(deleted) => report.snapshots = deleted,
            Err(err) => error!(error = %err, "snapshot sweep failed"),
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.listing_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        match self.listings.delete_older_than(cutoff).await {
            Ok(deleted) => report.listings = deleted,
            Err(err) => error!(error = %err, "listing sweep failed"),
        }

        report.cooldowns = self.governor.prune();

        counter!("vending_swept", report.snapshots, "kind" => "snapshot");
        counter!("vending_swept", report.listings, "kind" => "listing");
        info!(
            snapshots = report.snapshots,
            listings = report.listings,
            cooldowns = report.cooldowns,
            "sweep finished"
        );
        report
    }
}

/// Starts the repeated jobs. The returned scheduler must be kept alive.
pub async fn start(
    maintenance: Arc<Maintenance>,
    resolver_refresh: Duration,
    sweep_interval: Duration,
) -> color_eyre::Result<JobScheduler> {
    let sched = JobScheduler::new().await?;

    let index_job = {
        let maintenance = Arc::clone(&maintenance);
        Job::new_repeated_async(resolver_refresh, move |_uuid, _lock| {
            let maintenance = Arc::clone(&maintenance);
            Box::pin(async move {
                maintenance.refresh_index().await;
            })
        })?
    };

    let sweep_job = Job::new_repeated_async(sweep_interval, move |_uuid, _lock| {
        let maintenance = Arc::clone(&maintenance);
        Box::pin(async move {
            maintenance.sweep().await;
        })
    })?;

    sched.add(index_job).await?;
    sched.add(sweep_job).await?;
    sched.start().await?;

    info!(
        resolver_refresh_secs = resolver_refresh.as_secs(),
        sweep_interval_secs = sweep_interval.as_secs(),
        "scheduler started"
    );
    Ok(sched)
}
