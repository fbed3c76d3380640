//! Catalog refresh job.
//!
//! Fetches the authoritative product list, replaces the catalog file when
//! it changed (keeping a timestamped backup) and invalidates the vector
//! index. A failed refresh leaves both catalog and index untouched.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use reqwest::blocking::Client;
use serde_json::Value;

use crate::catalog::{CatalogError, CatalogSnapshot, CatalogStore};
use crate::config::{CatalogConfig, ConfigError, RefreshConfig};
use crate::lock::FileLock;
use crate::provider::{self, ProviderError};
use crate::semantic::{InvalidateIndex, VectorStorageError};

const REFRESH_LOCK: &str = "refresh.lock";

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("catalog source failed: {0}")]
    Source(#[from] ProviderError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("another refresh is already running")]
    Busy,

    #[error("could not take the refresh lock: {0}")]
    Lock(io::Error),

    #[error("catalog updated but the vector index could not be invalidated: {0}")]
    Invalidate(#[from] VectorStorageError),
}

/// Where the authoritative catalog comes from.
pub trait CatalogSource: Send + Sync {
    /// Raw query result, normalized by [`CatalogSnapshot::from_upstream`].
    fn fetch(&self) -> Result<Value, ProviderError>;
}

const SERVICE: &str = "catalog source";

/// `GET <url>?token=<token>&query=<sql>` returning a JSON list of rows.
pub struct SqlHttpSource {
    client: Client,
    url: String,
    token: String,
    query: String,
}

impl SqlHttpSource {
    pub fn new(config: &CatalogConfig, token: String) -> Result<Self, ConfigError> {
        let client = provider::http_client(Duration::from_secs(config.timeout_secs))
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        Ok(Self {
            client,
            url: config.source_url.clone(),
            token,
            query: config.query.clone(),
        })
    }
}

impl CatalogSource for SqlHttpSource {
    fn fetch(&self) -> Result<Value, ProviderError> {
        log::info!("querying catalog source {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .query(&[("token", self.token.as_str()), ("query", self.query.as_str())])
            .send()
            .map_err(provider::transport(SERVICE))?;

        let body = provider::check_response(SERVICE, response)?
            .text()
            .map_err(provider::transport(SERVICE))?;

        serde_json::from_str(&body)
            .map_err(|err| ProviderError::invalid(SERVICE, format!("response is not JSON: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub products: usize,
    /// False when the fetched catalog equals the stored one
    pub changed: bool,
    pub backup: Option<PathBuf>,
}

pub struct Refresher {
    source: Box<dyn CatalogSource>,
    store: CatalogStore,
    lock_dir: PathBuf,
}

impl Refresher {
    pub fn new(source: Box<dyn CatalogSource>, store: CatalogStore, lock_dir: PathBuf) -> Self {
        Self {
            source,
            store,
            lock_dir,
        }
    }

    pub fn run(&self, index: &dyn InvalidateIndex) -> Result<RefreshReport, RefreshError> {
        let _lock = FileLock::try_acquire(&self.lock_dir, REFRESH_LOCK).map_err(|err| {
            if err.kind() == io::ErrorKind::WouldBlock {
                RefreshError::Busy
            } else {
                RefreshError::Lock(err)
            }
        })?;

        log::info!("refreshing catalog {}", self.store.path().display());

        let snapshot = CatalogSnapshot::from_upstream(self.source.fetch()?)?;

        let changed = match self.store.load() {
            Ok(current) => current != snapshot,
            Err(CatalogError::Missing(_)) => true,
            Err(err) => {
                log::warn!("current catalog unreadable, replacing it: {err}");
                true
            }
        };

        if !changed {
            log::info!("catalog unchanged ({} products)", snapshot.len());
            return Ok(RefreshReport {
                products: snapshot.len(),
                changed: false,
                backup: None,
            });
        }

        let backup = self.store.save(&snapshot)?;
        index.invalidate_index()?;

        log::info!("catalog refreshed with {} products", snapshot.len());

        Ok(RefreshReport {
            products: snapshot.len(),
            changed: true,
            backup,
        })
    }

    fn run_logged(&self, index: &dyn InvalidateIndex) {
        match self.run(index) {
            Ok(report) if report.changed => {
                log::info!("scheduled refresh done, {} products", report.products)
            }
            Ok(_) => log::info!("scheduled refresh done, no changes"),
            Err(err) => log::error!("scheduled refresh failed: {err}"),
        }
    }
}

/// Daily refresh at a configured local time.
pub struct DailySchedule {
    refresher: Refresher,
    at: NaiveTime,
    run_on_start: bool,
}

impl DailySchedule {
    pub fn new(refresher: Refresher, config: &RefreshConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            refresher,
            at: config.daily_at_time()?,
            run_on_start: config.run_on_start,
        })
    }

    /// Blocks until `stop` is set.
    pub fn run(&self, index: &dyn InvalidateIndex, stop: &AtomicBool) {
        run_schedule(&self.refresher, index, self.at, self.run_on_start, stop);
    }
}

/// First occurrence of wall clock time `at` strictly after `now`.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();

    // a day is skipped only when `at` falls into a DST gap
    for _ in 0..3 {
        if let Some(candidate) = date.and_time(at).and_local_timezone(tz.clone()).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }

    now.clone() + chrono::Duration::days(1)
}

/// Refresh every day at `at` local time until `stop` is set.
pub fn run_schedule(
    refresher: &Refresher,
    index: &dyn InvalidateIndex,
    at: NaiveTime,
    run_on_start: bool,
    stop: &AtomicBool,
) {
    if run_on_start {
        refresher.run_logged(index);
    }

    while !stop.load(Ordering::Relaxed) {
        let next = next_run_after(&Local::now(), at);
        log::info!("next catalog refresh at {}", next.format("%Y-%m-%d %H:%M"));

        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let remaining = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(Duration::from_secs(1)));
        }

        refresher.run_logged(index);
    }

    log::info!("refresh scheduler stopped");
}
