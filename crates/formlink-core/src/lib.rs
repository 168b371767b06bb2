//! # formlink-core: Pure Printer State Logic for Formlink
//!
//! This crate turns heterogeneous Formlabs cloud payloads into one stable
//! printer model and decides how successive polls merge into observable state.
//! It performs no I/O: every function takes the observation instant as an
//! argument, so the same inputs always produce the same outputs.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Formlink Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                formlink-cloud (network + locks)                 │   │
//! │  │   TokenManager ──► CloudClient ──► ReconciliationStore          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ raw JSON + observation instant         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ formlink-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ normalize │  │ reconcile │  │projection │  │   │
//! │  │   │ Snapshot  │  │  family   │  │  Live /   │  │  Status / │  │   │
//! │  │   │ Job, Tank │  │  tables   │  │  Stale    │  │  Job view │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO CLOCK READS • NO NETWORK • PURE FUNCTIONS        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical printer, job and consumable records
//! - [`family`] - Model family table (cartridge layout per printer generation)
//! - [`normalize`] - Vendor JSON → [`types::PrinterSnapshot`]
//! - [`reconcile`] - Continuity and staleness transition rules
//! - [`projection`] - Read-only entity value objects for the host platform
//! - [`redact`] - Raw payload redaction
//! - [`error`] - Non-fatal normalization warnings
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use formlink_core::normalize::Normalizer;
//!
//! let raw = serde_json::json!({
//!     "serial": "Form4-Bright-Otter",
//!     "cartridges": [{ "material": "FLGPGR05", "ml": 450 }]
//! });
//!
//! let normalized = Normalizer::default().normalize_printer(&raw, None, Utc::now());
//! let cartridge = &normalized.snapshot.cartridges[0];
//! assert_eq!(cartridge.slot_id, "default");
//! assert_eq!(cartridge.remaining_ml, Some(450.0));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod family;
pub mod normalize;
pub mod projection;
pub mod reconcile;
pub mod redact;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::NormalizationWarning;
pub use family::ModelFamily;
pub use normalize::{Normalized, Normalizer};
pub use projection::PrinterEntities;
pub use reconcile::{Applied, ReconciledState, StalenessPolicy};
pub use types::{
    CartridgeState, JobSnapshot, JobStatus, MachineStatus, PrinterSnapshot, RawPayload,
    TankState, ThumbnailDescriptor,
};
