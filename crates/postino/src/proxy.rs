//! Central orchestrator.
//!
//! [`MailProxy`] owns the storage engine, the SMTP pool, the rate limiter,
//! the attachment fetcher, and the wake/cancel plumbing shared by the
//! background loops. `open` builds everything without spawning; `start`
//! also launches the dispatch loop, the reporter, one IMAP poller per
//! inbound account, and the maintenance loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use postino_cache::TieredCache;
use postino_retry::RetryStrategy;
use postino_store::Store;
use postino_types::ReportedEvent;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attachments::AttachmentFetcher;
use crate::commands;
use crate::config::ProxyConfig;
use crate::ratelimit::RateLimiter;
use crate::receiver;
use crate::reporter;
use crate::scheduler;
use crate::smtp::SmtpPool;

/// Shared state behind every loop and command handler.
pub(crate) struct ProxyInner {
    pub config: ProxyConfig,
    pub store: Store,
    pub pool: SmtpPool,
    pub limiter: RateLimiter,
    pub fetcher: AttachmentFetcher,
    pub cache: Option<Arc<TieredCache>>,
    pub retry: RetryStrategy,

    /// Wakes the dispatch loop out of its timer.
    pub wake_dispatch: Notify,
    /// Wakes the reporter out of its timer.
    pub wake_reporter: Notify,
    pub cancel: CancellationToken,
    pub active: AtomicBool,

    /// Per-tenant reporter cadence; a future timestamp is a DND cooloff.
    pub last_sync: Mutex<HashMap<String, i64>>,

    pub results_tx: mpsc::Sender<ReportedEvent>,

    pub global_sem: Arc<Semaphore>,
    pub attachment_sem: Arc<Semaphore>,
    /// Per-account send semaphores, created lazily, kept for the process
    /// lifetime.
    pub account_sems: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ProxyInner {
    pub(crate) async fn account_semaphore(&self, account_key: &str) -> Arc<Semaphore> {
        let mut sems = self.account_sems.lock().await;
        sems.entry(account_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_per_account)))
            .clone()
    }

    /// Push a delivery result onto the in-memory channel with bounded
    /// backpressure; on timeout the result is dropped with a warning (the
    /// event log row is authoritative either way).
    pub(crate) async fn publish_result(&self, event: ReportedEvent) {
        if let Err(e) = self
            .results_tx
            .send_timeout(event, self.config.queue_put_timeout)
            .await
        {
            warn!("timed out publishing delivery result, dropping: {e}");
        }
    }
}

/// The mail dispatch service.
pub struct MailProxy {
    inner: Arc<ProxyInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    results_rx: std::sync::Mutex<Option<mpsc::Receiver<ReportedEvent>>>,
}

impl MailProxy {
    /// Build the service without spawning any background task. Used by
    /// one-shot CLI commands and tests; [`MailProxy::start`] is the
    /// recommended entry point for a running instance.
    pub async fn open(config: ProxyConfig) -> Result<Self> {
        let store = Store::open(&config.db_path).await?;

        let cache = if config.cache.enabled {
            let cache = Arc::new(TieredCache::new(config.cache.to_cache_config()));
            cache.init().await?;
            Some(cache)
        } else {
            None
        };

        let fetcher = AttachmentFetcher::new(
            config.attachment_timeout,
            cache.clone(),
            config.attachments_base_dir.clone(),
        )?;

        let (results_tx, results_rx) = mpsc::channel(config.result_queue_size.max(1));

        let inner = Arc::new(ProxyInner {
            limiter: RateLimiter::new(store.clone()),
            retry: config.retry.clone(),
            global_sem: Arc::new(Semaphore::new(config.max_concurrent_sends)),
            attachment_sem: Arc::new(Semaphore::new(config.max_concurrent_attachments)),
            pool: SmtpPool::new(),
            cache,
            fetcher,
            wake_dispatch: Notify::new(),
            wake_reporter: Notify::new(),
            cancel: CancellationToken::new(),
            active: AtomicBool::new(true),
            last_sync: Mutex::new(HashMap::new()),
            account_sems: Mutex::new(HashMap::new()),
            results_tx,
            store,
            config,
        });

        Ok(Self {
            inner,
            tasks: Mutex::new(Vec::new()),
            results_rx: std::sync::Mutex::new(Some(results_rx)),
        })
    }

    /// Build the service and launch every background loop.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        let proxy = Self::open(config).await?;
        proxy.spawn_loops().await?;
        Ok(proxy)
    }

    /// Spawn the dispatch loop, reporter, IMAP pollers, and maintenance.
    pub async fn spawn_loops(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(scheduler::run_dispatch_loop(self.inner.clone())));
        tasks.push(tokio::spawn(reporter::run_report_loop(self.inner.clone())));
        tasks.push(tokio::spawn(run_maintenance_loop(self.inner.clone())));

        for account in self.inner.store.accounts().imap_accounts().await? {
            tasks.push(tokio::spawn(receiver::run_imap_poller(
                self.inner.store.clone(),
                account.pk.clone(),
                self.inner.config.poll_interval,
                self.inner.cancel.clone(),
            )));
        }

        Ok(())
    }

    /// Signal every loop to stop, await them, and close the store.
    ///
    /// In-flight sends complete; the reporter finishes its current tenant.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.wake_dispatch.notify_waiters();
        self.inner.wake_reporter.notify_waiters();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("background task ended with error: {e}");
            }
        }
        self.inner.pool.clear().await;
        self.inner.store.close().await;
    }

    /// Execute a control command; see [`crate::commands`].
    pub async fn handle_command(&self, cmd: &str, payload: Value) -> Value {
        commands::handle_command(&self.inner, cmd, payload).await
    }

    /// Take the delivery-result receiver; yields each outcome at most once.
    pub fn take_results(&self) -> Option<mpsc::Receiver<ReportedEvent>> {
        self.results_rx.lock().expect("results lock").take()
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub(crate) fn inner(&self) -> &Arc<ProxyInner> {
        &self.inner
    }
}

/// Periodic housekeeping: SMTP pool eviction, send-log pruning, cache
/// expiry, and the PEC acceptance sweep.
async fn run_maintenance_loop(inner: Arc<ProxyInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.maintenance_interval) => {}
        }

        let evicted = inner.pool.evict_idle().await;
        if evicted > 0 {
            debug!(evicted, "evicted idle SMTP transports");
        }

        if let Err(e) = inner.limiter.prune(postino_types::now_ts()).await {
            warn!("send log pruning failed: {e}");
        }

        if let Some(cache) = &inner.cache {
            let (memory, disk) = cache.cleanup_expired().await;
            if memory + disk > 0 {
                debug!(memory, disk, "expired cache entries removed");
            }
        }

        match receiver::sweep_pec_without_acceptance(
            &inner.store,
            inner.config.pec_acceptance_timeout,
        )
        .await
        {
            Ok(0) => {}
            Ok(n) => debug!(downgraded = n, "PEC acceptance sweep"),
            Err(e) => warn!("PEC acceptance sweep failed: {e:#}"),
        }
    }
}
