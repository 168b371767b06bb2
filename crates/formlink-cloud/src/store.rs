//! # Reconciliation Store
//!
//! Owns every printer's [`ReconciledState`] and applies poll results to it.
//!
//! ## Concurrency Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ReconciliationStore                                 │
//! │                                                                         │
//! │  slots: RwLock<HashMap<printer_id, Arc<PrinterSlot>>>   (lookup only)   │
//! │                                                                         │
//! │  PrinterSlot ─┬─ state: Mutex<Option<ReconciledState>>  per-printer     │
//! │               ├─ next_seq: AtomicU64                    issue order     │
//! │               ├─ in_flight: Option<Shared<poll future>> single-flight   │
//! │               └─ diagnostics                                            │
//! │                                                                         │
//! │  poll_with(id, fetch)                                                   │
//! │     in flight? ──yes──► clone of the same Shared future (no new call)   │
//! │         │ no                                                            │
//! │         ▼                                                               │
//! │     seq = next_seq++ ──► fetch().await ──► complete(id, seq, result)    │
//! │                                                │                        │
//! │                  seq ≤ stored seq ──► Discarded                         │
//! │                  Ok(payload)      ──► normalize ──► apply_success       │
//! │                  transient Err    ──► apply_failure (may go STALE)      │
//! │                  AuthRejected     ──► Err, state untouched              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Polls for different printers never share a lock beyond the slot lookup.
//! The state swap happens only after the payload is fully fetched and
//! normalized, so dropping a poll mid-request leaves nothing half-written.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use formlink_core::normalize::referenced_job_id;
use formlink_core::projection::{project, PrinterEntities};
use formlink_core::{Applied, Normalizer, ReconciledState, StalenessPolicy};

use crate::client::CloudApi;
use crate::error::{CloudError, CloudResult};

// =============================================================================
// Poll Types
// =============================================================================

/// Everything one poll fetched for a printer, ready for normalization.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub printer: Value,
    /// Print run fetched separately when the printer only referenced it.
    pub job: Option<Value>,
    pub observed_at: DateTime<Utc>,
}

/// What a completed poll did to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub seq: u64,
    pub applied: Applied,
    /// State is STALE after this poll.
    pub stale: bool,
    /// This poll moved the printer from LIVE to STALE.
    pub became_stale: bool,
    /// The transient failure absorbed by this poll, if any.
    pub failure: Option<CloudError>,
}

/// Result shared by every waiter of one in-flight poll. `Err` is only ever
/// an authorization failure.
pub type PollResult = Result<PollOutcome, CloudError>;

pub type SharedPoll = Shared<BoxFuture<'static, PollResult>>;

// =============================================================================
// Diagnostics
// =============================================================================

/// Operator troubleshooting data for one printer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrinterDiagnostics {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub unmapped_statuses: u64,
    /// Warnings from the most recent successful normalization.
    pub last_warnings: Vec<String>,
    pub discarded_polls: u64,
}

// =============================================================================
// Printer Slot
// =============================================================================

#[derive(Default)]
struct PrinterSlot {
    state: Mutex<Option<ReconciledState>>,
    next_seq: AtomicU64,
    in_flight: StdMutex<Option<SharedPoll>>,
    diagnostics: StdMutex<PrinterDiagnostics>,
}

impl PrinterSlot {
    fn diagnostics(&self) -> std::sync::MutexGuard<'_, PrinterDiagnostics> {
        self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, Option<SharedPoll>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Reconciliation Store
// =============================================================================

/// Per-printer state cache. The only component that decides availability.
pub struct ReconciliationStore {
    slots: StdRwLock<HashMap<String, Arc<PrinterSlot>>>,
    normalizer: Normalizer,
    policy: StalenessPolicy,
    unmapped_statuses: AtomicU64,
    reauth_required: AtomicBool,
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        ReconciliationStore::new(Normalizer::default(), StalenessPolicy::default())
    }
}

impl ReconciliationStore {
    pub fn new(normalizer: Normalizer, policy: StalenessPolicy) -> Self {
        ReconciliationStore {
            slots: StdRwLock::new(HashMap::new()),
            normalizer,
            policy,
            unmapped_statuses: AtomicU64::new(0),
            reauth_required: AtomicBool::new(false),
        }
    }

    fn slot(&self, printer_id: &str) -> Arc<PrinterSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(printer_id)
        {
            return slot.clone();
        }

        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(printer_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, printer_id: &str) -> Option<Arc<PrinterSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(printer_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<(String, Arc<PrinterSlot>)> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Starts a poll for `printer_id` unless one is already in flight, in
    /// which case the caller joins that one and `fetch` is never called.
    pub fn poll_with<F, Fut>(self: &Arc<Self>, printer_id: &str, fetch: F) -> SharedPoll
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CloudResult<FetchedPayload>> + Send + 'static,
    {
        let slot = self.slot(printer_id);
        let mut in_flight = slot.in_flight();

        if let Some(existing) = in_flight.as_ref() {
            debug!(printer_id, "Joining in-flight poll");
            return existing.clone();
        }

        let seq = slot.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let fetching = fetch();
        let store = Arc::clone(self);
        let owner = Arc::clone(&slot);
        let id = printer_id.to_string();

        let poll = async move {
            let result = fetching.await;
            let outcome = store.complete(&id, seq, result).await;
            owner.in_flight().take();
            outcome
        }
        .boxed()
        .shared();

        *in_flight = Some(poll.clone());
        poll
    }

    /// Polls one printer through `api`: printer detail, plus the print run
    /// when the detail only references it by id.
    pub fn poll_printer(self: &Arc<Self>, api: Arc<dyn CloudApi>, printer_id: &str) -> SharedPoll {
        let id = printer_id.to_string();
        self.poll_with(printer_id, move || async move { fetch_payload(api.as_ref(), &id).await })
    }

    /// Reserves the next sequence number for a poll issued outside
    /// [`Self::poll_with`].
    pub fn begin_poll(&self, printer_id: &str) -> u64 {
        self.slot(printer_id).next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Applies a finished poll. Completions older than the stored state are
    /// discarded; transient failures are absorbed; `Err` means re-auth.
    pub async fn complete(
        &self,
        printer_id: &str,
        seq: u64,
        result: CloudResult<FetchedPayload>,
    ) -> PollResult {
        let slot = self.slot(printer_id);

        match result {
            Err(err) if err.is_auth() => {
                if !self.reauth_required.swap(true, Ordering::SeqCst) {
                    warn!(printer_id, error = %err, "Authorization lost, re-authorization required");
                }
                Err(err)
            }
            Ok(payload) => {
                let normalized =
                    self.normalizer
                        .normalize_printer(&payload.printer, payload.job.as_ref(), payload.observed_at);

                let unmapped = normalized
                    .warnings
                    .iter()
                    .filter(|w| w.is_unmapped_status())
                    .count() as u64;
                for warning in &normalized.warnings {
                    warn!(printer_id, %warning, "Normalization warning");
                }
                self.unmapped_statuses.fetch_add(unmapped, Ordering::Relaxed);

                let mut state = slot.state.lock().await;
                let was_stale = state.as_ref().map_or(false, |s| s.stale);
                let applied = match state.as_mut() {
                    None => {
                        info!(printer_id, seq, "Printer is live");
                        *state = Some(ReconciledState::from_first_poll(
                            normalized.snapshot,
                            seq,
                            payload.observed_at,
                        ));
                        Applied::Changed
                    }
                    Some(current) => current.apply_success(normalized.snapshot, seq, payload.observed_at),
                };
                drop(state);

                let mut diag = slot.diagnostics();
                diag.unmapped_statuses += unmapped;
                if applied == Applied::Discarded {
                    diag.discarded_polls += 1;
                    debug!(printer_id, seq, "Discarded out-of-order poll completion");
                } else {
                    self.reauth_required.store(false, Ordering::SeqCst);
                    diag.last_success_at = Some(payload.observed_at);
                    diag.last_warnings = normalized.warnings.iter().map(ToString::to_string).collect();
                    if was_stale {
                        info!(printer_id, seq, "Printer recovered from stale state");
                    }
                }

                // A discarded completion leaves the state as it was.
                let stale = if applied == Applied::Discarded { was_stale } else { false };
                Ok(PollOutcome {
                    seq,
                    applied,
                    stale,
                    became_stale: false,
                    failure: None,
                })
            }
            Err(err) => {
                let now = Utc::now();
                let mut state = slot.state.lock().await;
                let (applied, stale, became_stale, failures) = match state.as_mut() {
                    // Nothing to mark stale before the first success.
                    None => (Applied::Unchanged, false, false, 0),
                    Some(current) => {
                        let was_stale = current.stale;
                        let applied = current.apply_failure(err.to_string(), seq, now, &self.policy);
                        (
                            applied,
                            current.stale,
                            !was_stale && current.stale,
                            current.consecutive_failures,
                        )
                    }
                };
                drop(state);

                let mut diag = slot.diagnostics();
                if applied == Applied::Discarded {
                    diag.discarded_polls += 1;
                    debug!(printer_id, seq, "Discarded out-of-order poll failure");
                } else {
                    diag.last_failure_at = Some(now);
                    diag.last_error = Some(err.to_string());
                    warn!(printer_id, seq, consecutive_failures = failures, error = %err, "Poll failed");
                }
                if became_stale {
                    info!(printer_id, consecutive_failures = failures, "Printer went stale");
                }

                Ok(PollOutcome {
                    seq,
                    applied,
                    stale,
                    became_stale,
                    failure: Some(err),
                })
            }
        }
    }

    // =========================================================================
    // Read Access (copies only)
    // =========================================================================

    /// Copy of a printer's state. `None` while UNINITIALIZED.
    pub async fn state(&self, printer_id: &str) -> Option<ReconciledState> {
        let slot = self.existing_slot(printer_id)?;
        let state = slot.state.lock().await;
        state.clone()
    }

    /// Entity value objects for one printer.
    pub async fn entities(&self, printer_id: &str) -> Option<PrinterEntities> {
        let state = self.state(printer_id).await?;
        Some(project(printer_id, &state, self.reauth_required()))
    }

    /// Entity value objects for every initialized printer, sorted by id.
    pub async fn all_entities(&self) -> Vec<PrinterEntities> {
        let mut out = Vec::new();
        for (id, _) in self.all_slots() {
            if let Some(entities) = self.entities(&id).await {
                out.push(entities);
            }
        }
        out.sort_by(|a, b| a.printer_id.cmp(&b.printer_id));
        out
    }

    /// Ids of every printer the store has a slot for.
    pub fn printer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.all_slots().into_iter().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    /// Job ids still referenced by any printer's state (current or retained).
    pub async fn referenced_job_ids(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        for (_, slot) in self.all_slots() {
            let state = slot.state.lock().await;
            if let Some(state) = state.as_ref() {
                ids.extend(state.snapshot.job.as_ref().map(|j| j.job_id.clone()));
                ids.extend(state.last_job.as_ref().map(|j| j.job_id.clone()));
            }
        }
        ids
    }

    /// Drops a printer the device registry unregistered.
    pub fn remove(&self, printer_id: &str) -> bool {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(printer_id)
            .is_some();
        if removed {
            info!(printer_id, "Printer removed from store");
        }
        removed
    }

    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::SeqCst)
    }

    /// Called once the external config flow re-authorized the account.
    pub fn clear_reauth(&self) {
        self.reauth_required.store(false, Ordering::SeqCst);
    }

    /// Unmapped status strings seen across all printers.
    pub fn unmapped_status_count(&self) -> u64 {
        self.unmapped_statuses.load(Ordering::Relaxed)
    }

    pub fn diagnostics(&self, printer_id: &str) -> Option<PrinterDiagnostics> {
        self.existing_slot(printer_id).map(|slot| slot.diagnostics().clone())
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }
}

/// Fetches printer detail, plus the print run when it is only referenced.
/// Any failure fails the whole poll so nothing partial is applied.
pub async fn fetch_payload(api: &dyn CloudApi, printer_id: &str) -> CloudResult<FetchedPayload> {
    let printer = api.get_printer(printer_id).await?;
    let job = match referenced_job_id(&printer) {
        Some(job_id) => {
            debug!(printer_id, job_id = %job_id, "Fetching referenced print run");
            Some(api.get_job(printer_id, &job_id).await?)
        }
        None => None,
    };

    Ok(FetchedPayload {
        printer,
        job,
        observed_at: Utc::now(),
    })
}
