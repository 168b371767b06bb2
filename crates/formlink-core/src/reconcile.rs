//! # Reconciliation Rules
//!
//! Pure transition rules for one printer's [`ReconciledState`]. Locking,
//! sequencing of in-flight polls and diagnostics live in the cloud crate's
//! store; this module only decides what the next state is.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   UNINITIALIZED ──success──► LIVE ◄──────────success──────┐             │
//! │   (no entry)                  │                            │             │
//! │                               │ failure #n                 │             │
//! │                               ▼                            │             │
//! │                    n < threshold: LIVE                     │             │
//! │                    n ≥ threshold: STALE ───────────────────┘             │
//! │                                                                         │
//! │   Failures never clear values. AuthRejected never reaches these rules.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Job Continuity
//! ```text
//!   previous job          new poll                    stored job
//!   ────────────          ────────                    ──────────
//!   PRINTING (0.97)       no job, machine IDLE    →   COMPLETED (0.97)
//!   COMPLETED id=A        job id=A PRINTING       →   COMPLETED id=A (kept)
//!   any                   job id=B                →   job B
//!   any                   no job, not IDLE        →   previous (unchanged)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobSnapshot, MachineStatus, PrinterSnapshot};

/// Default number of consecutive failed polls before state is marked stale.
pub const DEFAULT_STALE_AFTER_FAILURES: u32 = 3;

/// When consecutive failures turn LIVE state into STALE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessPolicy {
    pub stale_after_failures: u32,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        StalenessPolicy {
            stale_after_failures: DEFAULT_STALE_AFTER_FAILURES,
        }
    }
}

impl StalenessPolicy {
    pub fn new(stale_after_failures: u32) -> Self {
        StalenessPolicy {
            stale_after_failures: stale_after_failures.max(1),
        }
    }

    pub fn is_stale(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.stale_after_failures
    }
}

/// Outcome of applying one poll completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Observable content changed; downstream should be notified.
    Changed,
    /// Accepted, but nothing a consumer can see differs.
    Unchanged,
    /// Completion was older than the stored state and was dropped.
    Discarded,
}

/// Per-printer state owned by the reconciliation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledState {
    pub snapshot: PrinterSnapshot,
    /// Last job seen, kept after it disappears from the API.
    pub last_job: Option<JobSnapshot>,
    pub last_success_at: DateTime<Utc>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Display form of the last transient failure.
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub stale: bool,
    /// Sequence number of the newest poll applied to this state.
    pub seq: u64,
}

impl ReconciledState {
    /// UNINITIALIZED → LIVE.
    pub fn from_first_poll(snapshot: PrinterSnapshot, seq: u64, at: DateTime<Utc>) -> Self {
        let last_job = snapshot.job.clone();
        ReconciledState {
            snapshot,
            last_job,
            last_success_at: at,
            last_failure_at: None,
            last_error: None,
            consecutive_failures: 0,
            stale: false,
            seq,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.stale
    }

    /// Applies a successful poll. Any completion not newer than `self.seq`
    /// is discarded.
    pub fn apply_success(
        &mut self,
        mut snapshot: PrinterSnapshot,
        seq: u64,
        at: DateTime<Utc>,
    ) -> Applied {
        if seq <= self.seq {
            return Applied::Discarded;
        }

        if let Some(job) = snapshot.job.as_mut() {
            keep_thumbnail_expiry(&[self.snapshot.job.as_ref(), self.last_job.as_ref()], job);
        }
        let last_job = carry_job(self.last_job.as_ref(), &snapshot);
        let changed = self.snapshot != snapshot
            || self.last_job != last_job
            || self.stale
            || self.consecutive_failures != 0;

        self.snapshot = snapshot;
        self.last_job = last_job;
        self.last_success_at = at;
        self.consecutive_failures = 0;
        self.stale = false;
        self.seq = seq;

        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    /// Applies a transient poll failure. Values are kept as they were.
    pub fn apply_failure(
        &mut self,
        error: impl Into<String>,
        seq: u64,
        at: DateTime<Utc>,
        policy: &StalenessPolicy,
    ) -> Applied {
        if seq <= self.seq {
            return Applied::Discarded;
        }

        let was_stale = self.stale;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.stale = policy.is_stale(self.consecutive_failures);
        self.last_failure_at = Some(at);
        self.last_error = Some(error.into());
        self.seq = seq;

        // The failure count is visible through availability, so every
        // accepted failure is a change.
        if was_stale && self.stale {
            Applied::Unchanged
        } else {
            Applied::Changed
        }
    }
}

/// Job continuity rule.
/// An unchanged thumbnail URL keeps the expiry it was first seen with, so a
/// TTL-derived expiry does not move forward on every poll.
fn keep_thumbnail_expiry(previous: &[Option<&JobSnapshot>], job: &mut JobSnapshot) {
    let Some(thumbnail) = job.thumbnail.as_mut() else {
        return;
    };
    let known = previous
        .iter()
        .flatten()
        .filter(|prev| prev.job_id == job.job_id)
        .filter_map(|prev| prev.thumbnail.as_ref())
        .find(|prev| prev.url == thumbnail.url);
    if let Some(known) = known {
        thumbnail.expires_at = known.expires_at;
    }
}

fn carry_job(previous: Option<&JobSnapshot>, snapshot: &PrinterSnapshot) -> Option<JobSnapshot> {
    match (previous, snapshot.job.as_ref()) {
        // A finished job never flips back to active under the same id.
        (Some(prev), Some(new))
            if prev.job_id == new.job_id && prev.status.is_terminal() && new.status.is_active() =>
        {
            Some(prev.clone())
        }
        (_, Some(new)) => Some(new.clone()),
        (Some(prev), None)
            if prev.status.is_active() && snapshot.machine_status == MachineStatus::Idle =>
        {
            Some(prev.frozen_as_completed())
        }
        (prev, None) => prev.cloned(),
    }
}
