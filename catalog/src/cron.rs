//! Background refresh worker (spec §4.4).
//!
//! Every `cron_period_seconds`, every table whose period has elapsed gets
//! one refresh. Refreshes for the same table never overlap: each table's
//! refresh future is awaited to completion before `Cron` considers that
//! table again, and distinct tables refresh concurrently via `JoinSet`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::catalog::Catalog;
use crate::source::RowSource;

pub struct Cron {
    catalog: Arc<Catalog>,
    source: Arc<dyn RowSource>,
    period: Duration,
    stop: Arc<Notify>,
}

impl Cron {
    pub fn new(catalog: Arc<Catalog>, source: Arc<dyn RowSource>) -> Self {
        let period = Duration::from_secs(catalog.config().cron_period_seconds.max(1));
        Cron {
            catalog,
            source,
            period,
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Drives an initial synchronous refresh of every table so the server
    /// doesn't start serving empty tables while it waits for the first
    /// tick.
    pub async fn initial_load(&self) {
        let now = unix_now();
        let caps = self.catalog.config().caps.clone();
        let strip_nulls = self.catalog.config().strip_nulls;
        let mut joins = JoinSet::new();
        for table in self.catalog.tables().iter().cloned() {
            let source = self.source.clone();
            let caps = caps.clone();
            joins.spawn(async move {
                if let Err(e) = table.refresh(source.as_ref(), &caps, strip_nulls, now).await {
                    handle_refresh_error(&table.spec.name, &e, "initial load failed");
                }
            });
        }
        while joins.join_next().await.is_some() {}
    }

    /// Runs until `stop_handle().notify_one()` is called. Returns once the
    /// current tick's in-flight refreshes have drained.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = self.stop.notified() => {
                    warn!("cron worker stopping");
                    return;
                }
            }
        }
    }

    async fn tick(&self) {
        let now = unix_now();
        let caps = self.catalog.config().caps.clone();
        let strip_nulls = self.catalog.config().strip_nulls;
        let mut joins = JoinSet::new();
        for table in self.catalog.tables().iter().cloned() {
            if !table.needs_refresh(now) {
                continue;
            }
            let source = self.source.clone();
            let caps = caps.clone();
            joins.spawn(async move {
                if let Err(e) = table.refresh(source.as_ref(), &caps, strip_nulls, now).await {
                    handle_refresh_error(&table.spec.name, &e, "refresh failed, retaining previous snapshot");
                }
            });
        }
        while joins.join_next().await.is_some() {}
    }
}

/// A fatal error (arena exhaustion) ends the process per spec §7; anything
/// else is logged and the table keeps serving its previous snapshot.
fn handle_refresh_error(table: &str, e: &common::err::CacheError, context: &str) {
    if e.is_fatal() {
        error!(table, error = %e, "fatal error during refresh, exiting process");
        std::process::exit(1);
    }
    error!(table, error = %e, "{}", context);
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
