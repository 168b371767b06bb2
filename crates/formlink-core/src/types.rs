//! # Canonical Printer Types
//!
//! One printer model for every Formlabs generation.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         PrinterSnapshot                                 │
//! │                                                                         │
//! │  serial, display_name, model_family, machine_status, flags, firmware    │
//! │       │                                                                 │
//! │       ├── cartridges: Vec<CartridgeState>   (1 for Form 4, n for 3L)    │
//! │       ├── tank: Option<TankState>                                       │
//! │       ├── job: Option<JobSnapshot>                                      │
//! │       │        └── thumbnail: Option<ThumbnailDescriptor>               │
//! │       └── raw_payload: RawPayload (redacted JSON)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Units
//! - Durations: whole seconds, except tank print time (milliseconds)
//! - Volumes: milliliters as `f64`
//! - Instants: `DateTime<Utc>`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::family::ModelFamily;

// =============================================================================
// Machine Status
// =============================================================================

/// Printer-level status. Unmapped vendor strings degrade to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Idle,
    Printing,
    Paused,
    Error,
    Offline,
    #[default]
    Unknown,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Idle => write!(f, "IDLE"),
            MachineStatus::Printing => write!(f, "PRINTING"),
            MachineStatus::Paused => write!(f, "PAUSED"),
            MachineStatus::Error => write!(f, "ERROR"),
            MachineStatus::Offline => write!(f, "OFFLINE"),
            MachineStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// Print run status.
///
/// `Unknown` only appears when the vendor reports a string missing from the
/// lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Printing,
    Paused,
    Completed,
    Cancelled,
    Error,
    Unknown,
}

impl JobStatus {
    /// Job currently occupies the printer.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Printing | JobStatus::Paused)
    }

    /// Job has ended and must not move back to an active status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Printing => write!(f, "PRINTING"),
            JobStatus::Paused => write!(f, "PAUSED"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
            JobStatus::Error => write!(f, "ERROR"),
            JobStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// =============================================================================
// Thumbnail Descriptor
// =============================================================================

/// Signed, time-limited thumbnail link issued by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailDescriptor {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl ThumbnailDescriptor {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// =============================================================================
// Job Snapshot
// =============================================================================

/// Canonical print job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub name: Option<String>,
    pub status: JobStatus,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    pub current_layer: Option<u32>,
    /// Always `>= current_layer` when both are known.
    pub total_layers: Option<u32>,
    pub elapsed_secs: Option<u64>,
    /// Not every job state reports it.
    pub remaining_secs: Option<u64>,
    pub estimated_volume_ml: Option<f64>,
    pub material: Option<String>,
    pub thumbnail: Option<ThumbnailDescriptor>,
}

impl JobSnapshot {
    /// Copy of this job with its status forced to `Completed`. Every other
    /// value, progress included, stays frozen.
    pub fn frozen_as_completed(&self) -> JobSnapshot {
        JobSnapshot {
            status: JobStatus::Completed,
            ..self.clone()
        }
    }
}

// =============================================================================
// Consumables
// =============================================================================

/// Slot id used for printers that only ever hold one cartridge.
pub const DEFAULT_CARTRIDGE_SLOT: &str = "default";

/// Resin cartridge in one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartridgeState {
    pub slot_id: String,
    pub material: Option<String>,
    /// Never negative.
    pub remaining_ml: Option<f64>,
    pub empty: bool,
}

/// Resin tank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TankState {
    pub material: Option<String>,
    pub print_time_ms: Option<u64>,
    pub layers_printed: Option<u64>,
}

// =============================================================================
// Raw Payload
// =============================================================================

/// Redacted copy of the vendor payload, shared cheaply between copies of a
/// snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(Arc<serde_json::Value>);

impl RawPayload {
    /// Wraps an already redacted value.
    pub fn new(value: serde_json::Value) -> Self {
        RawPayload(Arc::new(value))
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }
}

// =============================================================================
// Printer Snapshot
// =============================================================================

/// Canonical per-printer record produced by one successful poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    pub serial: String,
    pub display_name: String,
    pub model_family: ModelFamily,
    /// Vendor machine type id as reported (e.g. `FORM-4-0`).
    pub machine_type: Option<String>,
    pub machine_status: MachineStatus,
    pub online: bool,
    pub ready_to_print: bool,
    pub needs_resolution: bool,
    pub firmware_version: Option<String>,
    pub last_ping: Option<DateTime<Utc>>,
    pub cartridges: Vec<CartridgeState>,
    pub tank: Option<TankState>,
    /// Active job as reported by this poll. Continuity across polls lives in
    /// [`crate::reconcile::ReconciledState::last_job`].
    pub job: Option<JobSnapshot>,
    pub raw_payload: RawPayload,
}
