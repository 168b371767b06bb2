//! # Model Normalizer
//!
//! Translates per-model vendor JSON into [`PrinterSnapshot`] and friends.
//!
//! ## Resilience Policy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Vendor payload → Snapshot                           │
//! │                                                                         │
//! │  unknown field          → dropped silently                              │
//! │  missing field          → None / UNKNOWN                                │
//! │  malformed value        → None + MalformedField warning                 │
//! │  unmapped status string → UNKNOWN + Unmapped*Status warning             │
//! │                                                                         │
//! │  normalize_printer() never returns an error.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Payload Shapes
//! ```text
//! {
//!   "serial": "Form4-Bright-Otter",
//!   "alias": "Lab printer",
//!   "machine_type_id": "FORM-4-0",
//!   "firmware_version": "1.9.1",
//!   "printer_status": {
//!     "status": "PRINTING",
//!     "last_pinged_at": "2026-03-01T12:00:00Z",
//!     "ready_to_print": "READY",
//!     "current_print_run": { "guid": "...", "status": "PRINTING", ... }
//!   },
//!   "cartridge_status": { "cartridge": {...} }        ← Form 4 (object)
//!   "cartridge_status": [ { "cartridge": {...} }, … ] ← Form 3 / 3L (list)
//!   "tank_status": { "tank": {...} }
//! }
//! ```

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::NormalizationWarning;
use crate::family::{CartridgeLayout, ModelFamily};
use crate::redact::redact;
use crate::types::{
    CartridgeState, JobSnapshot, JobStatus, MachineStatus, PrinterSnapshot, RawPayload,
    TankState, ThumbnailDescriptor, DEFAULT_CARTRIDGE_SLOT,
};

// =============================================================================
// Constants
// =============================================================================

/// A printer is considered online when it pinged the cloud this recently.
pub const DEFAULT_ONLINE_MAX_AGE_SECS: i64 = 600;

/// Lifetime assumed for signed thumbnail URLs that do not advertise one.
pub const DEFAULT_THUMBNAIL_TTL_SECS: i64 = 3600;

const FALLBACK_PRINTER_NAME: &str = "Formlabs printer";

// =============================================================================
// Status Lookup Tables
// =============================================================================

/// Vendor printer status → [`MachineStatus`]. Keys are uppercase with
/// spaces and dashes folded to underscores.
const MACHINE_STATUS_TABLE: &[(&str, MachineStatus)] = &[
    ("IDLE", MachineStatus::Idle),
    ("READY", MachineStatus::Idle),
    ("STANDBY", MachineStatus::Idle),
    ("FINISHED", MachineStatus::Idle),
    ("WAITING_FOR_RESOLUTION", MachineStatus::Idle),
    ("PRINTING", MachineStatus::Printing),
    ("PREPRINT", MachineStatus::Printing),
    ("PRE_PRINT", MachineStatus::Printing),
    ("PREHEAT", MachineStatus::Printing),
    ("PRECOAT", MachineStatus::Printing),
    ("POSTCOAT", MachineStatus::Printing),
    ("FILLING", MachineStatus::Printing),
    ("ABORTING", MachineStatus::Printing),
    ("PAUSED", MachineStatus::Paused),
    ("PAUSING", MachineStatus::Paused),
    ("ERROR", MachineStatus::Error),
    ("FAULT", MachineStatus::Error),
    ("OFFLINE", MachineStatus::Offline),
    ("DISCONNECTED", MachineStatus::Offline),
];

/// Vendor print run status → [`JobStatus`].
const JOB_STATUS_TABLE: &[(&str, JobStatus)] = &[
    ("QUEUED", JobStatus::Queued),
    ("WAITING", JobStatus::Queued),
    ("PENDING", JobStatus::Queued),
    ("PRINTING", JobStatus::Printing),
    ("PREPRINT", JobStatus::Printing),
    ("PRE_PRINT", JobStatus::Printing),
    ("PREHEAT", JobStatus::Printing),
    ("PRECOAT", JobStatus::Printing),
    ("POSTCOAT", JobStatus::Printing),
    ("RUNNING", JobStatus::Printing),
    ("PAUSED", JobStatus::Paused),
    ("PAUSING", JobStatus::Paused),
    ("WAITING_FOR_RESOLUTION", JobStatus::Paused),
    ("FINISHED", JobStatus::Completed),
    ("COMPLETED", JobStatus::Completed),
    ("COMPLETE", JobStatus::Completed),
    ("DONE", JobStatus::Completed),
    ("ABORTED", JobStatus::Cancelled),
    ("ABORTING", JobStatus::Cancelled),
    ("CANCELLED", JobStatus::Cancelled),
    ("CANCELED", JobStatus::Cancelled),
    ("ERROR", JobStatus::Error),
    ("FAILED", JobStatus::Error),
];

fn status_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .flat_map(char::to_uppercase)
        .collect()
}

/// Looks a printer status string up in the table.
pub fn map_machine_status(raw: &str) -> Option<MachineStatus> {
    let key = status_key(raw);
    MACHINE_STATUS_TABLE
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, status)| *status)
}

/// Looks a print run status string up in the table.
pub fn map_job_status(raw: &str) -> Option<JobStatus> {
    let key = status_key(raw);
    JOB_STATUS_TABLE
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, status)| *status)
}

// =============================================================================
// Normalized Output
// =============================================================================

/// Result of normalizing one poll's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub snapshot: PrinterSnapshot,
    pub warnings: Vec<NormalizationWarning>,
}

// =============================================================================
// Normalizer
// =============================================================================

/// Stateless payload normalizer. Holds only tunables.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    online_max_age: Duration,
    thumbnail_ttl: Duration,
}

impl Default for Normalizer {
    fn default() -> Self {
        Normalizer {
            online_max_age: Duration::seconds(DEFAULT_ONLINE_MAX_AGE_SECS),
            thumbnail_ttl: Duration::seconds(DEFAULT_THUMBNAIL_TTL_SECS),
        }
    }
}

impl Normalizer {
    pub fn new(online_max_age: Duration, thumbnail_ttl: Duration) -> Self {
        Normalizer {
            online_max_age,
            thumbnail_ttl,
        }
    }

    /// Normalizes a printer detail payload.
    ///
    /// `job_detail` is the separately fetched print run when the printer
    /// payload only referenced it by id (see [`referenced_job_id`]).
    pub fn normalize_printer(
        &self,
        raw: &Value,
        job_detail: Option<&Value>,
        observed_at: DateTime<Utc>,
    ) -> Normalized {
        let mut warnings = Vec::new();
        let empty = Map::new();
        let printer = raw.as_object().unwrap_or(&empty);
        let status_obj = object_field(printer, "printer_status").unwrap_or(&empty);

        let serial = read_string(printer, &["serial", "printer_serial"]).unwrap_or_default();
        let display_name = read_string(printer, &["alias", "name", "printer_name"])
            .filter(|s| !s.is_empty())
            .or_else(|| (!serial.is_empty()).then(|| serial.clone()))
            .unwrap_or_else(|| FALLBACK_PRINTER_NAME.to_string());

        let machine_type = read_string(printer, &["machine_type_id", "machine_type", "printer_type"]);
        let model_family = machine_type
            .as_deref()
            .map(ModelFamily::from_machine_type)
            .unwrap_or_default();

        let last_ping = read_timestamp(status_obj, &["last_pinged_at"], "printer_status", &mut warnings)
            .or_else(|| read_timestamp(printer, &["last_pinged_at"], "printer", &mut warnings));
        let pinged_recently = last_ping.map(|ping| observed_at - ping <= self.online_max_age);

        let status_str = read_string(status_obj, &["status"]).or_else(|| read_string(printer, &["status"]));
        let machine_status = match status_str.as_deref() {
            Some(s) if !s.trim().is_empty() => map_machine_status(s).unwrap_or_else(|| {
                warnings.push(NormalizationWarning::UnmappedMachineStatus(s.to_string()));
                MachineStatus::Unknown
            }),
            _ if pinged_recently == Some(false) => MachineStatus::Offline,
            _ => MachineStatus::Unknown,
        };

        let online = pinged_recently.unwrap_or(!matches!(
            machine_status,
            MachineStatus::Offline | MachineStatus::Unknown
        ));

        let ready_to_print = status_obj
            .get("ready_to_print")
            .map(truthy_ready)
            .unwrap_or(false);
        let needs_resolution = status_obj
            .get("waiting_for_resolution")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || status_str
                .as_deref()
                .map(|s| status_key(s) == "WAITING_FOR_RESOLUTION")
                .unwrap_or(false);

        let firmware_version = read_string(printer, &["firmware_version", "firmware"]);

        let job = match (object_field(status_obj, "current_print_run"), job_detail) {
            (_, Some(detail)) => self.normalize_job(detail, observed_at, &mut warnings),
            (Some(run), None) => self.normalize_job(&Value::Object(run.clone()), observed_at, &mut warnings),
            (None, None) => None,
        };

        let cartridges = normalize_cartridges(printer, model_family, &mut warnings);
        let tank = normalize_tank(printer, &mut warnings);

        let snapshot = PrinterSnapshot {
            serial,
            display_name,
            model_family,
            machine_type,
            machine_status,
            online,
            ready_to_print,
            needs_resolution,
            firmware_version,
            last_ping,
            cartridges,
            tank,
            job,
            raw_payload: RawPayload::new(redact(raw)),
        };

        Normalized { snapshot, warnings }
    }

    /// Normalizes one print run object. Returns `None` for non-objects.
    pub fn normalize_job(
        &self,
        raw: &Value,
        observed_at: DateTime<Utc>,
        warnings: &mut Vec<NormalizationWarning>,
    ) -> Option<JobSnapshot> {
        let run = raw.as_object()?;

        let name = read_string(run, &["name", "print_name", "job_name"]);
        let job_id = read_string(run, &["guid", "id", "print_run_id", "job_id"])
            .or_else(|| name.clone())
            .unwrap_or_else(|| "unidentified".to_string());

        let status = match read_string(run, &["status"]) {
            Some(s) => map_job_status(&s).unwrap_or_else(|| {
                warnings.push(NormalizationWarning::UnmappedJobStatus(s));
                JobStatus::Unknown
            }),
            None => JobStatus::Unknown,
        };

        let current_layer = read_u64(run, &["currently_printing_layer", "current_layer"], "job", warnings)
            .map(saturate_u32);
        let total_layers = read_u64(run, &["layer_count", "total_layers"], "job", warnings)
            .map(saturate_u32)
            .filter(|total| current_layer.map_or(true, |current| *total >= current));

        let explicit_progress = read_f64(run, &["progress"], "job", warnings)
            .map(|p| if p > 1.0 { p / 100.0 } else { p });
        let layer_progress = match (current_layer, total_layers) {
            (Some(current), Some(total)) if total > 0 => Some(f64::from(current) / f64::from(total)),
            _ => None,
        };
        let progress = explicit_progress
            .or(layer_progress)
            .unwrap_or(if status == JobStatus::Completed { 1.0 } else { 0.0 })
            .clamp(0.0, 1.0);

        let elapsed_secs = read_ms_as_secs(run, &["elapsed_duration_ms"], "job", warnings)
            .or_else(|| read_u64(run, &["elapsed_seconds", "elapsed_secs"], "job", warnings));
        let remaining_secs = read_ms_as_secs(
            run,
            &["estimated_time_remaining_ms", "time_remaining_ms"],
            "job",
            warnings,
        )
        .or_else(|| read_u64(run, &["remaining_seconds", "remaining_secs"], "job", warnings));

        let estimated_volume_ml = read_f64(
            run,
            &["volume_ml", "estimated_volume_ml", "print_volume_ml"],
            "job",
            warnings,
        )
        .map(|ml| ml.max(0.0));
        let material = read_string(run, &["material_name", "material"]);

        let thumbnail = run
            .get("print_thumbnail")
            .or_else(|| run.get("thumbnail"))
            .and_then(|t| self.descriptor_with_warnings(t, observed_at, warnings));

        Some(JobSnapshot {
            job_id,
            name,
            status,
            progress,
            current_layer,
            total_layers,
            elapsed_secs,
            remaining_secs,
            estimated_volume_ml,
            material,
            thumbnail,
        })
    }

    /// Builds a thumbnail descriptor from either a bare URL string or an
    /// object like `{"thumbnail": "<url>", "expires_at": "..."}`.
    ///
    /// Expiry comes from `expires_at`, then the signed URL's own query
    /// parameters, then `observed_at + ttl`.
    pub fn thumbnail_descriptor(
        &self,
        raw: &Value,
        observed_at: DateTime<Utc>,
    ) -> Option<ThumbnailDescriptor> {
        self.descriptor_with_warnings(raw, observed_at, &mut Vec::new())
    }

    fn descriptor_with_warnings(
        &self,
        raw: &Value,
        observed_at: DateTime<Utc>,
        warnings: &mut Vec<NormalizationWarning>,
    ) -> Option<ThumbnailDescriptor> {
        let (url, explicit_expiry) = match raw {
            Value::String(url) => (url.clone(), None),
            Value::Object(obj) => {
                let url = read_string(obj, &["thumbnail", "url", "signed_url"])?;
                let expiry = read_string(obj, &["expires_at", "expiry"]).and_then(|s| parse_timestamp(&s));
                (url, expiry)
            }
            _ => return None,
        };
        if url.trim().is_empty() {
            return None;
        }

        let signed_expiry = match explicit_expiry {
            Some(_) => None,
            None => match signed_url_expiry(&url) {
                Some(Ok(at)) => Some(at),
                Some(Err(value)) => {
                    warnings.push(NormalizationWarning::MalformedField {
                        scope: "job",
                        field: "thumbnail_expiry",
                        value,
                    });
                    None
                }
                None => None,
            },
        };

        let expires_at = explicit_expiry
            .or(signed_expiry)
            .unwrap_or_else(|| observed_at.checked_add_signed(self.thumbnail_ttl).unwrap_or(observed_at));

        Some(ThumbnailDescriptor { url, expires_at })
    }
}

/// Job id the printer payload points at without embedding the run itself.
/// The poller fetches those through the job endpoint.
pub fn referenced_job_id(raw: &Value) -> Option<String> {
    let status = raw.get("printer_status")?.as_object()?;
    if status.get("current_print_run").map_or(false, Value::is_object) {
        return None;
    }
    match status.get("current_print_run") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        _ => read_string(status, &["current_print_run_id", "current_print_run_guid"]),
    }
}

// =============================================================================
// Consumables
// =============================================================================

fn normalize_cartridges(
    printer: &Map<String, Value>,
    family: ModelFamily,
    warnings: &mut Vec<NormalizationWarning>,
) -> Vec<CartridgeState> {
    let source = printer
        .get("cartridge_status")
        .filter(|v| !v.is_null())
        .or_else(|| printer.get("cartridges"));

    let (items, from_object): (Vec<&Map<String, Value>>, bool) = match source {
        Some(Value::Object(obj)) => (vec![obj], true),
        Some(Value::Array(list)) => (list.iter().filter_map(Value::as_object).collect(), false),
        _ => return Vec::new(),
    };

    // Entries whose cartridge is explicitly null are empty slots with nothing to report.
    let items: Vec<&Map<String, Value>> = items
        .into_iter()
        .filter(|item| !matches!(item.get("cartridge"), Some(Value::Null)))
        .collect();

    let single = match family.cartridge_layout() {
        CartridgeLayout::Single => true,
        CartridgeLayout::PerSlot => false,
        CartridgeLayout::Auto => from_object || items.len() == 1,
    };

    if single {
        return items
            .first()
            .map(|item| cartridge_state(item, DEFAULT_CARTRIDGE_SLOT.to_string(), warnings))
            .into_iter()
            .collect();
    }

    items
        .iter()
        .enumerate()
        .map(|(index, &item)| {
            let cart = object_field(item, "cartridge").unwrap_or(item);
            let slot = read_string(item, &["cartridge_slot", "slot", "position"])
                .or_else(|| read_string(cart, &["slot", "position"]))
                .unwrap_or_else(|| index.to_string());
            cartridge_state(item, slot, warnings)
        })
        .collect()
}

fn cartridge_state(
    item: &Map<String, Value>,
    slot_id: String,
    warnings: &mut Vec<NormalizationWarning>,
) -> CartridgeState {
    let cart = object_field(item, "cartridge").unwrap_or(item);

    let material = read_string(cart, &["material", "material_code", "material_name"]);
    let direct = read_f64(
        cart,
        &["ml", "remaining_ml", "volume_remaining_ml"],
        "cartridge",
        warnings,
    );
    let derived = match (
        read_f64(cart, &["initial_volume_ml"], "cartridge", warnings),
        read_f64(cart, &["volume_dispensed_ml"], "cartridge", warnings),
    ) {
        (Some(initial), Some(dispensed)) => Some(initial - dispensed),
        _ => None,
    };
    let remaining_ml = direct.or(derived).map(|ml| ml.max(0.0));

    let empty = match cart.get("is_empty").or_else(|| item.get("is_empty")) {
        Some(Value::Bool(b)) => *b,
        _ => remaining_ml.map_or(false, |ml| ml <= 0.0),
    };

    CartridgeState {
        slot_id,
        material,
        remaining_ml,
        empty,
    }
}

fn normalize_tank(
    printer: &Map<String, Value>,
    warnings: &mut Vec<NormalizationWarning>,
) -> Option<TankState> {
    let status = object_field(printer, "tank_status")?;
    let tank = object_field(status, "tank")?;

    Some(TankState {
        material: read_string(tank, &["material", "material_name", "display_name"]),
        print_time_ms: read_u64(tank, &["print_time_ms"], "tank", warnings),
        layers_printed: read_u64(tank, &["layers_printed"], "tank", warnings),
    })
}

// =============================================================================
// Field Readers
// =============================================================================

fn object_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

/// First present, non-null value among `keys`.
fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
}

fn read_string(obj: &Map<String, Value>, keys: &[&'static str]) -> Option<String> {
    match first_present(obj, keys)?.1 {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|f| f.is_finite())
}

fn read_f64(
    obj: &Map<String, Value>,
    keys: &[&'static str],
    scope: &'static str,
    warnings: &mut Vec<NormalizationWarning>,
) -> Option<f64> {
    let (field, value) = first_present(obj, keys)?;
    let parsed = as_number(value);
    if parsed.is_none() {
        warnings.push(NormalizationWarning::MalformedField {
            scope,
            field,
            value: value.to_string(),
        });
    }
    parsed
}

fn read_u64(
    obj: &Map<String, Value>,
    keys: &[&'static str],
    scope: &'static str,
    warnings: &mut Vec<NormalizationWarning>,
) -> Option<u64> {
    let (field, value) = first_present(obj, keys)?;
    match as_number(value).filter(|f| *f >= 0.0) {
        Some(f) => Some(f.floor() as u64),
        None => {
            warnings.push(NormalizationWarning::MalformedField {
                scope,
                field,
                value: value.to_string(),
            });
            None
        }
    }
}

fn read_ms_as_secs(
    obj: &Map<String, Value>,
    keys: &[&'static str],
    scope: &'static str,
    warnings: &mut Vec<NormalizationWarning>,
) -> Option<u64> {
    read_u64(obj, keys, scope, warnings).map(|ms| ms / 1000)
}

fn read_timestamp(
    obj: &Map<String, Value>,
    keys: &[&'static str],
    scope: &'static str,
    warnings: &mut Vec<NormalizationWarning>,
) -> Option<DateTime<Utc>> {
    let (field, value) = first_present(obj, keys)?;
    let parsed = value.as_str().and_then(parse_timestamp);
    if parsed.is_none() {
        warnings.push(NormalizationWarning::MalformedField {
            scope,
            field,
            value: value.to_string(),
        });
    }
    parsed
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Some(dt.with_timezone(&Utc));
    }
    // The API occasionally omits the offset; those values are UTC.
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn saturate_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn truthy_ready(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => {
            let upper = s.trim().to_uppercase();
            matches!(upper.as_str(), "READY" | "TRUE" | "YES" | "ON" | "1")
                || (upper.contains("READY") && !upper.contains("NOT"))
        }
        _ => false,
    }
}

/// Expiry encoded in a signed URL: SigV4 `X-Amz-Date` + `X-Amz-Expires`,
/// or a unix `Expires` timestamp. `None` when the URL carries neither;
/// `Some(Err(raw))` when it does but the value is out of range.
fn signed_url_expiry(raw: &str) -> Option<Result<DateTime<Utc>, String>> {
    let parsed = url::Url::parse(raw).ok()?;
    let mut amz_date = None;
    let mut amz_expires = None;
    let mut expires = None;
    for (key, value) in parsed.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "x-amz-date" => amz_date = Some(value.into_owned()),
            "x-amz-expires" => amz_expires = Some(value.into_owned()),
            "expires" => expires = Some(value.into_owned()),
            _ => {}
        }
    }

    if let (Some(date), Some(secs)) = (amz_date, amz_expires) {
        let signed_at = NaiveDateTime::parse_from_str(&date, "%Y%m%dT%H%M%SZ").ok()?;
        let expiry = secs
            .parse::<i64>()
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|valid_for| signed_at.and_utc().checked_add_signed(valid_for));
        return Some(expiry.ok_or(secs));
    }

    let ts = expires?;
    Some(
        ts.parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(ts),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn normalize(raw: &Value) -> Normalized {
        Normalizer::default().normalize_printer(raw, None, now())
    }

    fn form4_payload() -> Value {
        json!({
            "serial": "Form4-Bright-Otter",
            "alias": "Lab printer",
            "machine_type_id": "FORM-4-0",
            "firmware_version": "1.9.1",
            "some_future_field": { "nested": true },
            "printer_status": {
                "status": "PRINTING",
                "last_pinged_at": "2026-03-01T11:58:00Z",
                "ready_to_print": "READY",
                "current_print_run": {
                    "guid": "run-1",
                    "name": "bracket_v3",
                    "status": "PRINTING",
                    "currently_printing_layer": 485,
                    "layer_count": 1000,
                    "elapsed_duration_ms": 3_723_456,
                    "estimated_time_remaining_ms": 3_600_999,
                    "volume_ml": 12.5,
                    "material_name": "Grey V5",
                    "print_thumbnail": {
                        "thumbnail": "https://bucket.s3.amazonaws.com/run-1.png?X-Amz-Date=20260301T115500Z&X-Amz-Expires=600&X-Amz-Signature=ab12"
                    }
                }
            },
            "cartridge_status": {
                "cartridge": {
                    "material": "FLGPGR05",
                    "initial_volume_ml": 1000.0,
                    "volume_dispensed_ml": 250.5,
                    "is_empty": false
                }
            },
            "tank_status": {
                "tank": { "material": "FLGPGR05", "print_time_ms": 7_200_000, "layers_printed": 5400 }
            }
        })
    }

    #[test]
    fn test_single_cartridge_generic_shape() {
        let out = normalize(&json!({"cartridges":[{"material":"FLGPGR05","ml":450}]}));
        assert_eq!(
            out.snapshot.cartridges,
            vec![CartridgeState {
                slot_id: "default".into(),
                material: Some("FLGPGR05".into()),
                remaining_ml: Some(450.0),
                empty: false,
            }]
        );
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_form4_full_payload() {
        let out = normalize(&form4_payload());
        let snap = &out.snapshot;

        assert_eq!(snap.serial, "Form4-Bright-Otter");
        assert_eq!(snap.display_name, "Lab printer");
        assert_eq!(snap.model_family, ModelFamily::Form4);
        assert_eq!(snap.machine_status, MachineStatus::Printing);
        assert!(snap.online);
        assert!(snap.ready_to_print);
        assert!(!snap.needs_resolution);
        assert_eq!(snap.firmware_version.as_deref(), Some("1.9.1"));

        assert_eq!(snap.cartridges.len(), 1);
        assert_eq!(snap.cartridges[0].slot_id, "default");
        assert_eq!(snap.cartridges[0].remaining_ml, Some(749.5));

        let tank = snap.tank.as_ref().unwrap();
        assert_eq!(tank.print_time_ms, Some(7_200_000));
        assert_eq!(tank.layers_printed, Some(5400));

        let job = snap.job.as_ref().unwrap();
        assert_eq!(job.job_id, "run-1");
        assert_eq!(job.status, JobStatus::Printing);
        assert!((job.progress - 0.485).abs() < 1e-9);
        assert_eq!(job.elapsed_secs, Some(3723));
        assert_eq!(job.remaining_secs, Some(3600));
        assert_eq!(job.estimated_volume_ml, Some(12.5));
        assert_eq!(job.material.as_deref(), Some("Grey V5"));

        let thumb = job.thumbnail.as_ref().unwrap();
        assert_eq!(thumb.expires_at, Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_form3l_maps_each_slot() {
        let raw = json!({
            "serial": "Form3L-Calm-Heron",
            "machine_type_id": "FORM-3L-0",
            "cartridge_status": [
                { "cartridge_slot": "FRONT", "cartridge": { "material": "FLGPCL04", "initial_volume_ml": 1000, "volume_dispensed_ml": 1200 } },
                { "cartridge_slot": "BACK", "cartridge": { "material": "FLGPCL04", "initial_volume_ml": 1000, "volume_dispensed_ml": 100 } }
            ]
        });
        let carts = normalize(&raw).snapshot.cartridges;
        assert_eq!(carts.len(), 2);
        assert_eq!(carts[0].slot_id, "FRONT");
        assert_eq!(carts[0].remaining_ml, Some(0.0));
        assert!(carts[0].empty);
        assert_eq!(carts[1].slot_id, "BACK");
        assert_eq!(carts[1].remaining_ml, Some(900.0));
        assert!(!carts[1].empty);
    }

    #[test]
    fn test_form3_list_uses_default_slot() {
        let raw = json!({
            "machine_type_id": "FORM-3-0",
            "cartridge_status": [
                { "cartridge": null },
                { "cartridge": { "material": "FLTOTL05", "ml": 80 } }
            ]
        });
        let carts = normalize(&raw).snapshot.cartridges;
        assert_eq!(carts.len(), 1);
        assert_eq!(carts[0].slot_id, "default");
        assert_eq!(carts[0].material.as_deref(), Some("FLTOTL05"));
    }

    #[test]
    fn test_unmapped_status_degrades_to_unknown() {
        let raw = json!({
            "serial": "X",
            "printer_status": {
                "status": "CALIBRATING_LASER",
                "current_print_run": { "guid": "r", "status": "RINSING" }
            }
        });
        let out = normalize(&raw);
        assert_eq!(out.snapshot.machine_status, MachineStatus::Unknown);
        assert_eq!(out.snapshot.job.as_ref().unwrap().status, JobStatus::Unknown);
        assert_eq!(
            out.warnings,
            vec![
                NormalizationWarning::UnmappedMachineStatus("CALIBRATING_LASER".into()),
                NormalizationWarning::UnmappedJobStatus("RINSING".into()),
            ]
        );
    }

    #[test]
    fn test_missing_fields_map_to_none() {
        let out = normalize(&json!({}));
        let snap = out.snapshot;
        assert_eq!(snap.serial, "");
        assert_eq!(snap.display_name, "Formlabs printer");
        assert_eq!(snap.machine_status, MachineStatus::Unknown);
        assert!(!snap.online);
        assert!(snap.cartridges.is_empty());
        assert!(snap.tank.is_none());
        assert!(snap.job.is_none());
        assert!(snap.last_ping.is_none());
        assert!(out.warnings.is_empty());

        // Non-object payloads are tolerated too.
        let out = normalize(&json!("garbage"));
        assert_eq!(out.snapshot.machine_status, MachineStatus::Unknown);
    }

    #[test]
    fn test_stale_ping_without_status_is_offline() {
        let raw = json!({
            "serial": "X",
            "printer_status": { "last_pinged_at": "2026-03-01T10:00:00Z" }
        });
        let snap = normalize(&raw).snapshot;
        assert!(!snap.online);
        assert_eq!(snap.machine_status, MachineStatus::Offline);
    }

    #[test]
    fn test_malformed_numbers_warn() {
        let raw = json!({
            "printer_status": {
                "status": "printing",
                "current_print_run": { "guid": "r", "status": "printing", "layer_count": "many", "currently_printing_layer": 10 }
            }
        });
        let out = normalize(&raw);
        let job = out.snapshot.job.unwrap();
        assert_eq!(job.total_layers, None);
        assert_eq!(job.current_layer, Some(10));
        assert_eq!(out.snapshot.machine_status, MachineStatus::Printing);
        assert!(matches!(
            out.warnings.as_slice(),
            [NormalizationWarning::MalformedField { field: "layer_count", .. }]
        ));
    }

    #[test]
    fn test_total_layers_below_current_becomes_unknown() {
        let mut warnings = Vec::new();
        let job = Normalizer::default()
            .normalize_job(
                &json!({ "guid": "r", "status": "PRINTING", "currently_printing_layer": 50, "layer_count": 20, "progress": 40 }),
                now(),
                &mut warnings,
            )
            .unwrap();
        assert_eq!(job.total_layers, None);
        assert!((job.progress - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_waiting_for_resolution() {
        let raw = json!({ "printer_status": { "status": "WAITING_FOR_RESOLUTION" } });
        let snap = normalize(&raw).snapshot;
        assert!(snap.needs_resolution);
        assert_eq!(snap.machine_status, MachineStatus::Idle);

        let raw = json!({ "printer_status": { "status": "IDLE", "waiting_for_resolution": true } });
        assert!(normalize(&raw).snapshot.needs_resolution);
    }

    #[test]
    fn test_ready_to_print_variants() {
        assert!(truthy_ready(&json!(true)));
        assert!(truthy_ready(&json!("ready")));
        assert!(truthy_ready(&json!("READY_TO_PRINT_READY")));
        assert!(truthy_ready(&json!("1")));
        assert!(!truthy_ready(&json!("NOT_READY")));
        assert!(!truthy_ready(&json!(null)));
    }

    #[test]
    fn test_thumbnail_expiry_sources() {
        let normalizer = Normalizer::default();

        let explicit = normalizer
            .thumbnail_descriptor(
                &json!({ "thumbnail": "https://cdn.invalid/t.png", "expires_at": "2026-03-01T13:00:00Z" }),
                now(),
            )
            .unwrap();
        assert_eq!(explicit.expires_at, Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap());

        let unix = normalizer
            .thumbnail_descriptor(&json!("https://cdn.invalid/t.png?Expires=1772367000&Signature=x"), now())
            .unwrap();
        assert_eq!(unix.expires_at, DateTime::from_timestamp(1_772_367_000, 0).unwrap());

        let fallback = normalizer
            .thumbnail_descriptor(&json!("https://cdn.invalid/t.png"), now())
            .unwrap();
        assert_eq!(fallback.expires_at, now() + Duration::seconds(DEFAULT_THUMBNAIL_TTL_SECS));

        assert!(normalizer.thumbnail_descriptor(&json!(""), now()).is_none());
        assert!(normalizer.thumbnail_descriptor(&json!(42), now()).is_none());
    }

    #[test]
    fn test_out_of_range_signed_expiry_falls_back_to_ttl() {
        let raw = json!({
            "serial": "Form4-Bright-Otter",
            "printer_status": {
                "status": "PRINTING",
                "current_print_run": {
                    "guid": "run-1",
                    "status": "PRINTING",
                    "print_thumbnail": {
                        "thumbnail": "https://bucket.s3.amazonaws.com/run-1.png?X-Amz-Date=20260301T115500Z&X-Amz-Expires=9223372036854775807"
                    }
                }
            }
        });

        let out = normalize(&raw);
        let thumb = out.snapshot.job.unwrap().thumbnail.unwrap();
        assert_eq!(thumb.expires_at, now() + Duration::seconds(DEFAULT_THUMBNAIL_TTL_SECS));
        assert!(out.warnings.iter().any(|w| matches!(
            w,
            NormalizationWarning::MalformedField { field: "thumbnail_expiry", .. }
        )));

        let unix = Normalizer::default()
            .thumbnail_descriptor(&json!("https://cdn.invalid/t.png?Expires=99999999999999999"), now())
            .unwrap();
        assert_eq!(unix.expires_at, now() + Duration::seconds(DEFAULT_THUMBNAIL_TTL_SECS));
    }

    #[test]
    fn test_job_detail_overrides_embedded_run() {
        let raw = json!({ "printer_status": { "status": "PRINTING", "current_print_run": "run-9" } });
        assert_eq!(referenced_job_id(&raw).as_deref(), Some("run-9"));

        let detail = json!({ "guid": "run-9", "status": "PAUSED", "name": "gear" });
        let snap = Normalizer::default()
            .normalize_printer(&raw, Some(&detail), now())
            .snapshot;
        let job = snap.job.unwrap();
        assert_eq!(job.job_id, "run-9");
        assert_eq!(job.status, JobStatus::Paused);

        assert_eq!(referenced_job_id(&form4_payload()), None);
    }

    #[test]
    fn test_raw_payload_is_redacted() {
        let out = normalize(&form4_payload());
        let raw = out.snapshot.raw_payload.to_json_string();
        assert!(!raw.contains("X-Amz-Signature"));
        assert!(raw.contains("Form4-Bright-Otter"));
    }

    #[test]
    fn test_status_tables() {
        assert_eq!(map_machine_status(" paused "), Some(MachineStatus::Paused));
        assert_eq!(map_machine_status("pre-print"), Some(MachineStatus::Printing));
        assert_eq!(map_machine_status("SLEEPING"), None);
        assert_eq!(map_job_status("Finished"), Some(JobStatus::Completed));
        assert_eq!(map_job_status("canceled"), Some(JobStatus::Cancelled));
        assert_eq!(map_job_status("WARMUP"), None);
    }
}
