//! # Normalization Warnings
//!
//! The normalizer never fails. Anything it cannot map is degraded to an
//! explicit null/UNKNOWN and reported here so operators can see it in
//! diagnostics.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Where Warnings Go                                   │
//! │                                                                         │
//! │  Normalizer ──► Normalized { snapshot, warnings }                       │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │  ReconciliationStore ──► unmapped-status counter + warn! log            │
//! │                                                                         │
//! │  Never surfaced to the user as a failure.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Non-fatal issue found while normalizing a vendor payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationWarning {
    /// Printer status string not present in the lookup table.
    #[error("Unmapped machine status '{0}' (degraded to UNKNOWN)")]
    UnmappedMachineStatus(String),

    /// Print run status string not present in the lookup table.
    #[error("Unmapped job status '{0}' (degraded to UNKNOWN)")]
    UnmappedJobStatus(String),

    /// A field was present but had an unusable value.
    #[error("Malformed {scope}.{field}: {value}")]
    MalformedField {
        scope: &'static str,
        field: &'static str,
        value: String,
    },
}

impl NormalizationWarning {
    /// Returns true for warnings that count towards the unmapped-status
    /// diagnostic counter.
    pub fn is_unmapped_status(&self) -> bool {
        matches!(
            self,
            NormalizationWarning::UnmappedMachineStatus(_)
                | NormalizationWarning::UnmappedJobStatus(_)
        )
    }
}
