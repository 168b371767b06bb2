//! # Polling Agent
//!
//! Drives the recurring reconciliation pass for every configured printer.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PollingAgent Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        PollingAgent                              │  │
//! │  │                                                                  │  │
//! │  │  • Resolves the printer set at start, retrying each tick on error│  │
//! │  │  • One interval loop; every tick polls all printers concurrently │  │
//! │  │  • Sweeps the thumbnail cache after each tick                    │  │
//! │  │  • Stops on AuthRejected, keeping cached state                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌──────────────────┐      │
//! │  │   CloudApi     │  │ ReconciliationStore│  │  ThumbnailCache  │      │
//! │  │                │  │                    │  │                  │      │
//! │  │ Vendor REST    │  │ Single-flight poll │  │ Signed images    │      │
//! │  │ calls          │  │ staleness rules    │  │ bounded LRU      │      │
//! │  └────────────────┘  └────────────────────┘  └──────────────────┘      │
//! │                                                                         │
//! │  EVENTS (to the host platform):                                        │
//! │  ────────────────────────────                                          │
//! │  emit_snapshot        - printer entities changed                       │
//! │  emit_stale           - printer crossed the failure threshold          │
//! │  emit_reauth_required - authorization lost, polling stopped            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use formlink_core::{Applied, PrinterEntities};

use crate::client::{printer_serial, CloudApi};
use crate::config::BridgeConfig;
use crate::error::{CloudError, CloudResult};
use crate::store::ReconciliationStore;
use crate::thumbnail::{Thumbnail, ThumbnailCache};

/// Poll interval when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Agent Status
// =============================================================================

/// Current agent status for external queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStatus {
    /// Whether the poll loop is running.
    pub running: bool,

    /// Printers polled on every tick.
    pub printers: Vec<String>,

    /// Completed ticks.
    pub ticks: u64,

    pub last_tick_at: Option<DateTime<Utc>>,

    /// Printers currently flagged stale.
    pub stale_printers: usize,

    /// Polling stopped until the account is re-authorized.
    pub reauth_required: bool,

    pub last_error: Option<String>,
}

/// Outcome of one pass over all printers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub stale: usize,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives entity updates (implemented by the host platform integration).
pub trait PollEventEmitter: Send + Sync {
    /// A printer's entities changed.
    fn emit_snapshot(&self, entities: &PrinterEntities);

    /// A printer crossed the consecutive-failure threshold.
    fn emit_stale(&self, printer_id: &str, consecutive_failures: u32);

    /// Authorization was lost; the user has to re-authorize.
    fn emit_reauth_required(&self);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl PollEventEmitter for NoOpEmitter {
    fn emit_snapshot(&self, _entities: &PrinterEntities) {}
    fn emit_stale(&self, _printer_id: &str, _consecutive_failures: u32) {}
    fn emit_reauth_required(&self) {}
}

// =============================================================================
// Polling Agent
// =============================================================================

/// Polls the vendor cloud and feeds the reconciliation store.
pub struct PollingAgent {
    api: Arc<dyn CloudApi>,
    store: Arc<ReconciliationStore>,
    thumbnails: Option<Arc<ThumbnailCache>>,
    emitter: Arc<dyn PollEventEmitter>,
    interval: Duration,
    /// Explicit allow-list; `None` polls whatever the account lists.
    printers: Option<Vec<String>>,
    status: Arc<RwLock<AgentStatus>>,
}

impl PollingAgent {
    /// Creates an agent with default store and no thumbnail cache.
    pub fn new(api: Arc<dyn CloudApi>) -> Self {
        PollingAgentBuilder::new(api).build()
    }

    pub fn store(&self) -> &Arc<ReconciliationStore> {
        &self.store
    }

    pub fn thumbnails(&self) -> Option<&Arc<ThumbnailCache>> {
        self.thumbnails.as_ref()
    }

    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    /// Printer serials to poll: the configured list, or every printer the
    /// account reports.
    pub async fn resolve_printers(&self) -> CloudResult<Vec<String>> {
        if let Some(printers) = &self.printers {
            return Ok(printers.clone());
        }

        let listed = self.api.list_printers().await?;
        let mut serials: Vec<String> = listed
            .iter()
            .filter_map(printer_serial)
            .map(str::to_string)
            .collect();
        serials.sort();
        serials.dedup();
        info!(count = serials.len(), "Discovered printers");
        Ok(serials)
    }

    /// Runs one reconciliation pass over `printers`. Polls for distinct
    /// printers run concurrently. `Err` only for lost authorization.
    pub async fn poll_once(&self, printers: &[String]) -> CloudResult<TickSummary> {
        let polls = printers
            .iter()
            .map(|id| self.store.poll_printer(self.api.clone(), id));
        let results = join_all(polls).await;

        let mut summary = TickSummary::default();
        let mut auth_error = None;

        for (id, result) in printers.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    if outcome.failure.is_some() {
                        summary.failed += 1;
                    }
                    if outcome.stale {
                        summary.stale += 1;
                    }
                    if outcome.became_stale {
                        let failures = self
                            .store
                            .state(id)
                            .await
                            .map_or(0, |s| s.consecutive_failures);
                        self.emitter.emit_stale(id, failures);
                    }
                    match outcome.applied {
                        Applied::Changed => {
                            summary.changed += 1;
                            if let Some(entities) = self.store.entities(id).await {
                                self.emitter.emit_snapshot(&entities);
                            }
                        }
                        Applied::Unchanged | Applied::Discarded => summary.unchanged += 1,
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    auth_error.get_or_insert(err);
                }
            }
        }

        if let Some(thumbnails) = &self.thumbnails {
            thumbnails.sweep(&self.store.referenced_job_ids().await);
        }

        {
            let mut status = self.status.write().await;
            status.ticks += 1;
            status.last_tick_at = Some(Utc::now());
            status.stale_printers = summary.stale;
            status.last_error = auth_error.as_ref().map(ToString::to_string);
        }

        debug!(
            changed = summary.changed,
            unchanged = summary.unchanged,
            failed = summary.failed,
            stale = summary.stale,
            "Poll tick complete"
        );

        match auth_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Starts the poll loop in the background.
    ///
    /// Fails only if authorization is rejected while resolving the printer
    /// set. A transient discovery failure is retried on every tick.
    pub async fn start(self) -> CloudResult<PollingAgentHandle> {
        let printers = match self.resolve_printers().await {
            Ok(printers) => Some(printers),
            Err(err) if err.is_auth() => {
                self.mark_reauth(&err).await;
                return Err(err);
            }
            Err(err) => {
                warn!(error = %err, "Printer discovery failed, retrying on next tick");
                self.status.write().await.last_error = Some(err.to_string());
                None
            }
        };

        info!(
            printers = printers.as_ref().map(Vec::len),
            interval_secs = self.interval.as_secs(),
            "Starting polling agent"
        );

        {
            let mut status = self.status.write().await;
            status.running = true;
            status.printers = printers.clone().unwrap_or_default();
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (poll_now_tx, poll_now_rx) = mpsc::channel(1);

        let handle_parts = (
            self.status.clone(),
            self.store.clone(),
            self.thumbnails.clone(),
        );
        let task = tokio::spawn(self.run(printers, shutdown_rx, poll_now_rx));

        Ok(PollingAgentHandle {
            shutdown_tx,
            poll_now_tx,
            status: handle_parts.0,
            store: handle_parts.1,
            thumbnails: handle_parts.2,
            task,
        })
    }

    /// Main poll loop.
    async fn run(
        self,
        mut printers: Option<Vec<String>>,
        mut shutdown_rx: mpsc::Receiver<()>,
        mut poll_now_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Polling agent received shutdown");
                    break;
                }

                _ = ticker.tick() => {}

                Some(()) = poll_now_rx.recv() => {
                    debug!("Immediate poll requested");
                    ticker.reset();
                }
            }

            if printers.is_none() {
                match self.resolve_printers().await {
                    Ok(resolved) => {
                        info!(printers = resolved.len(), "Printer discovery recovered");
                        let mut status = self.status.write().await;
                        status.printers = resolved.clone();
                        status.last_error = None;
                        drop(status);
                        printers = Some(resolved);
                    }
                    Err(err) if err.is_auth() => {
                        self.mark_reauth(&err).await;
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "Printer discovery failed, retrying on next tick");
                        self.status.write().await.last_error = Some(err.to_string());
                        continue;
                    }
                }
            }
            let Some(targets) = printers.as_deref() else {
                continue;
            };

            if let Err(err) = self.poll_once(targets).await {
                self.mark_reauth(&err).await;
                break;
            }
        }

        self.status.write().await.running = false;
        info!("Polling agent stopped");
    }

    async fn mark_reauth(&self, err: &CloudError) {
        error!(error = %err, "Authorization rejected, polling stopped until re-authorized");
        {
            let mut status = self.status.write().await;
            status.reauth_required = true;
            status.last_error = Some(err.to_string());
        }
        self.emitter.emit_reauth_required();
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running PollingAgent from outside.
pub struct PollingAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
    poll_now_tx: mpsc::Sender<()>,
    status: Arc<RwLock<AgentStatus>>,
    store: Arc<ReconciliationStore>,
    thumbnails: Option<Arc<ThumbnailCache>>,
    task: JoinHandle<()>,
}

impl PollingAgentHandle {
    /// Gets the current agent status.
    pub async fn status(&self) -> AgentStatus {
        self.status.read().await.clone()
    }

    pub fn store(&self) -> &Arc<ReconciliationStore> {
        &self.store
    }

    /// Requests a poll now. Requests made while one is queued coalesce.
    pub fn poll_now(&self) {
        if self.poll_now_tx.try_send(()).is_err() {
            debug!("Immediate poll already queued");
        }
    }

    /// Thumbnail for the printer's current or last job. `None` when the
    /// camera is disabled or the job has no thumbnail.
    pub async fn thumbnail(&self, printer_id: &str) -> Option<CloudResult<Thumbnail>> {
        let thumbnails = self.thumbnails.as_ref()?;
        let state = self.store.state(printer_id).await?;
        let job = state.snapshot.job.as_ref().or(state.last_job.as_ref())?;
        let descriptor = job.thumbnail.as_ref()?;
        Some(thumbnails.get(&job.job_id, descriptor).await)
    }

    /// Whether the poll loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the agent to shut down and waits for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(err) = self.task.await {
            warn!(error = %err, "Polling agent task ended abnormally");
        }
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating PollingAgent with options.
pub struct PollingAgentBuilder {
    api: Arc<dyn CloudApi>,
    store: Option<Arc<ReconciliationStore>>,
    thumbnails: Option<Arc<ThumbnailCache>>,
    emitter: Option<Arc<dyn PollEventEmitter>>,
    interval: Duration,
    printers: Option<Vec<String>>,
}

impl PollingAgentBuilder {
    pub fn new(api: Arc<dyn CloudApi>) -> Self {
        PollingAgentBuilder {
            api,
            store: None,
            thumbnails: None,
            emitter: None,
            interval: DEFAULT_POLL_INTERVAL,
            printers: None,
        }
    }

    /// Applies interval, printer list, staleness and thumbnail settings.
    pub fn from_config(api: Arc<dyn CloudApi>, config: &BridgeConfig) -> Self {
        let store = ReconciliationStore::new(config.normalizer(), config.staleness_policy());
        let thumbnails = config
            .thumbnails
            .enabled
            .then(|| Arc::new(ThumbnailCache::new(api.clone(), config.thumbnails.max_entries)));

        PollingAgentBuilder {
            store: Some(Arc::new(store)),
            thumbnails,
            interval: config.poll_interval(),
            printers: config.polling.printers.clone(),
            ..PollingAgentBuilder::new(api)
        }
    }

    pub fn with_store(mut self, store: Arc<ReconciliationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_thumbnails(mut self, thumbnails: Arc<ThumbnailCache>) -> Self {
        self.thumbnails = Some(thumbnails);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn PollEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_printers(mut self, printers: Vec<String>) -> Self {
        self.printers = Some(printers);
        self
    }

    /// Builds the PollingAgent.
    pub fn build(self) -> PollingAgent {
        PollingAgent {
            api: self.api,
            store: self.store.unwrap_or_default(),
            thumbnails: self.thumbnails,
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
            interval: self.interval,
            printers: self.printers,
            status: Arc::new(RwLock::new(AgentStatus::default())),
        }
    }
}
