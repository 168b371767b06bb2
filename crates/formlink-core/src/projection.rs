//! # Entity Projection
//!
//! Read-only value objects handed to the host platform. Everything here is
//! built from a copy of a [`ReconciledState`], never a reference into the
//! store.
//!
//! ```text
//! ReconciledState ──project()──► PrinterEntities
//!                                  ├── status: StatusView
//!                                  ├── job: Option<JobView>        (last_job)
//!                                  ├── tank: Option<TankView>
//!                                  ├── cartridges: Vec<CartridgeView>
//!                                  ├── raw_payload: String         (redacted)
//!                                  └── availability: Availability
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::reconcile::ReconciledState;
use crate::types::{CartridgeState, JobSnapshot, JobStatus, MachineStatus, TankState};

/// Formats a duration as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Printer status value object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub serial: String,
    pub display_name: String,
    pub model: &'static str,
    pub machine_type: Option<String>,
    pub machine_status: MachineStatus,
    pub online: bool,
    pub ready_to_print: bool,
    pub needs_resolution: bool,
    pub firmware_version: Option<String>,
    pub last_ping: Option<DateTime<Utc>>,
    pub printing: bool,
    pub paused: bool,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub name: Option<String>,
    pub status: JobStatus,
    pub progress: f64,
    /// Whole percent, `0..=100`.
    pub progress_percent: u8,
    pub current_layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub elapsed_secs: Option<u64>,
    pub elapsed_hms: Option<String>,
    pub remaining_secs: Option<u64>,
    pub remaining_hms: Option<String>,
    pub estimated_volume_ml: Option<f64>,
    pub material: Option<String>,
    /// Thumbnail bytes are available from the thumbnail cache under `job_id`.
    pub has_thumbnail: bool,
}

impl From<&JobSnapshot> for JobView {
    fn from(job: &JobSnapshot) -> Self {
        JobView {
            job_id: job.job_id.clone(),
            name: job.name.clone(),
            status: job.status,
            progress: job.progress,
            progress_percent: (job.progress.clamp(0.0, 1.0) * 100.0).round() as u8,
            current_layer: job.current_layer,
            total_layers: job.total_layers,
            elapsed_secs: job.elapsed_secs,
            elapsed_hms: job.elapsed_secs.map(format_hms),
            remaining_secs: job.remaining_secs,
            remaining_hms: job.remaining_secs.map(format_hms),
            estimated_volume_ml: job.estimated_volume_ml,
            material: job.material.clone(),
            has_thumbnail: job.thumbnail.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TankView {
    pub material: Option<String>,
    pub print_time_ms: Option<u64>,
    pub print_time_hms: Option<String>,
    pub layers_printed: Option<u64>,
}

impl From<&TankState> for TankView {
    fn from(tank: &TankState) -> Self {
        TankView {
            material: tank.material.clone(),
            print_time_ms: tank.print_time_ms,
            print_time_hms: tank.print_time_ms.map(|ms| format_hms(ms / 1000)),
            layers_printed: tank.layers_printed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartridgeView {
    pub slot_id: String,
    pub material: Option<String>,
    pub remaining_ml: Option<f64>,
    pub empty: bool,
}

impl From<&CartridgeState> for CartridgeView {
    fn from(cartridge: &CartridgeState) -> Self {
        CartridgeView {
            slot_id: cartridge.slot_id.clone(),
            material: cartridge.material.clone(),
            remaining_ml: cartridge.remaining_ml,
            empty: cartridge.empty,
        }
    }
}

/// Staleness annotation. Stale entities keep their values; this is an
/// attribute, not an "unavailable" state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Availability {
    pub stale: bool,
    pub consecutive_failures: u32,
    pub last_success_at: DateTime<Utc>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reauth_required: bool,
}

/// Everything the host platform needs for one printer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterEntities {
    pub printer_id: String,
    pub status: StatusView,
    pub job: Option<JobView>,
    pub tank: Option<TankView>,
    pub cartridges: Vec<CartridgeView>,
    pub raw_payload: String,
    pub availability: Availability,
}

/// Projects a state copy into entity value objects.
pub fn project(printer_id: &str, state: &ReconciledState, reauth_required: bool) -> PrinterEntities {
    let snap = &state.snapshot;

    // Binary sensors follow the reported job when there is one, else the printer.
    let (printing, paused, error) = match snap.job.as_ref() {
        Some(job) => (
            job.status == JobStatus::Printing,
            job.status == JobStatus::Paused,
            job.status == JobStatus::Error,
        ),
        None => (
            snap.machine_status == MachineStatus::Printing,
            snap.machine_status == MachineStatus::Paused,
            snap.machine_status == MachineStatus::Error,
        ),
    };

    PrinterEntities {
        printer_id: printer_id.to_string(),
        status: StatusView {
            serial: snap.serial.clone(),
            display_name: snap.display_name.clone(),
            model: snap.model_family.label(),
            machine_type: snap.machine_type.clone(),
            machine_status: snap.machine_status,
            online: snap.online,
            ready_to_print: snap.ready_to_print,
            needs_resolution: snap.needs_resolution,
            firmware_version: snap.firmware_version.clone(),
            last_ping: snap.last_ping,
            printing,
            paused,
            error,
        },
        job: state.last_job.as_ref().map(JobView::from),
        tank: snap.tank.as_ref().map(TankView::from),
        cartridges: snap.cartridges.iter().map(CartridgeView::from).collect(),
        raw_payload: snap.raw_payload.to_json_string(),
        availability: Availability {
            stale: state.stale,
            consecutive_failures: state.consecutive_failures,
            last_success_at: state.last_success_at,
            last_failure_at: state.last_failure_at,
            last_error: state.last_error.clone(),
            reauth_required,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::reconcile::StalenessPolicy;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn state_from(raw: serde_json::Value) -> ReconciledState {
        let normalized = Normalizer::default().normalize_printer(&raw, None, now());
        ReconciledState::from_first_poll(normalized.snapshot, 1, now())
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(3723), "01:02:03");
        assert_eq!(format_hms(100 * 3600 + 59), "100:00:59");
    }

    #[test]
    fn test_project_printing_job() {
        let state = state_from(json!({
            "serial": "Form4-Bright-Otter",
            "machine_type_id": "FORM-4-0",
            "client_secret": "hunter2",
            "printer_status": {
                "status": "PRINTING",
                "current_print_run": {
                    "guid": "run-1",
                    "status": "PRINTING",
                    "currently_printing_layer": 123,
                    "layer_count": 1000,
                    "elapsed_duration_ms": 3_723_000,
                    "estimated_time_remaining_ms": 59_000
                }
            },
            "tank_status": { "tank": { "print_time_ms": 90_061_000, "layers_printed": 12 } }
        }));

        let entities = project("Form4-Bright-Otter", &state, false);
        assert_eq!(entities.status.model, "Form 4");
        assert!(entities.status.printing);
        assert!(!entities.status.paused);

        let job = entities.job.unwrap();
        assert_eq!(job.progress_percent, 12);
        assert_eq!(job.elapsed_hms.as_deref(), Some("01:02:03"));
        assert_eq!(job.remaining_hms.as_deref(), Some("00:00:59"));
        assert!(!job.has_thumbnail);

        let tank = entities.tank.unwrap();
        assert_eq!(tank.print_time_hms.as_deref(), Some("25:01:01"));

        assert!(!entities.raw_payload.contains("hunter2"));
        assert!(!entities.availability.stale);
    }

    #[test]
    fn test_project_stale_keeps_values() {
        let mut state = state_from(json!({
            "serial": "X",
            "printer_status": { "status": "IDLE" },
            "cartridges": [{ "material": "FLGPGR05", "ml": 450 }]
        }));
        let policy = StalenessPolicy::new(1);
        state.apply_failure("connection refused", 2, now(), &policy);

        let entities = project("X", &state, true);
        assert!(entities.availability.stale);
        assert!(entities.availability.reauth_required);
        assert_eq!(entities.availability.consecutive_failures, 1);
        assert_eq!(entities.cartridges[0].remaining_ml, Some(450.0));
        assert_eq!(entities.status.machine_status, MachineStatus::Idle);
        assert!(entities.job.is_none());
    }

    #[test]
    fn test_binary_sensors_fall_back_to_machine_status() {
        let state = state_from(json!({ "serial": "X", "printer_status": { "status": "ERROR" } }));
        let status = project("X", &state, false).status;
        assert!(status.error);
        assert!(!status.printing);
    }
}
