//! Publishes entity snapshots as structured log events.

use formlink_cloud::PollEventEmitter;
use formlink_core::PrinterEntities;
use tracing::{debug, info, warn};

/// Emitter for running the bridge without a host platform attached.
pub struct LogEmitter;

impl PollEventEmitter for LogEmitter {
    fn emit_snapshot(&self, entities: &PrinterEntities) {
        let job = entities.job.as_ref();
        info!(
            printer_id = %entities.printer_id,
            model = entities.status.model,
            status = %entities.status.machine_status,
            online = entities.status.online,
            job_status = ?job.map(|j| j.status),
            progress_percent = ?job.map(|j| j.progress_percent),
            remaining = ?job.and_then(|j| j.remaining_hms.as_deref()),
            stale = entities.availability.stale,
            "Printer updated"
        );

        match serde_json::to_string(entities) {
            Ok(json) => debug!(printer_id = %entities.printer_id, entities = %json, "Entity snapshot"),
            Err(err) => warn!(printer_id = %entities.printer_id, error = %err, "Entity snapshot not serializable"),
        }
    }

    fn emit_stale(&self, printer_id: &str, consecutive_failures: u32) {
        warn!(printer_id, consecutive_failures, "Printer data is stale, keeping last known values");
    }

    fn emit_reauth_required(&self) {
        warn!("Formlabs account needs to be re-authorized; update auth settings and restart");
    }
}
