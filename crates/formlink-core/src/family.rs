//! # Model Family Table
//!
//! Printer generations that share one payload shape are grouped into a
//! family. Supporting a new printer means adding a row to [`FAMILY_TABLE`],
//! not a new type.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │  machine_type_id      family    cartridge_status shape   layout        │
//! │  ───────────────      ──────    ──────────────────────   ──────        │
//! │  FORM-4-0, FORM-4B    Form4     single object            Single        │
//! │  FORM-4L-0            Form4L    list, two slots          PerSlot       │
//! │  FORM-3-0, FORM-3B    Form3     list, one entry          Single        │
//! │  FORM-3L-0, FORM-3BL  Form3L    list, two slots          PerSlot       │
//! │  (anything else)      Unknown   detected from shape      Auto          │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Group of printer generations sharing one API payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Form4,
    Form4L,
    Form3,
    Form3L,
    #[default]
    Unknown,
}

/// How cartridge entries map onto [`crate::types::CartridgeState`] slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartridgeLayout {
    /// One cartridge, reported under the synthetic `"default"` slot.
    Single,
    /// Each API slot maps to its own state.
    PerSlot,
    /// Decide from the payload shape (object or one-element list → single).
    Auto,
}

/// One row of the family table.
#[derive(Debug, Clone, Copy)]
pub struct FamilyEntry {
    pub family: ModelFamily,
    /// Uppercase prefixes with spaces, dashes and underscores removed.
    pub prefixes: &'static [&'static str],
    pub cartridge_layout: CartridgeLayout,
    pub label: &'static str,
}

pub const FAMILY_TABLE: &[FamilyEntry] = &[
    FamilyEntry {
        family: ModelFamily::Form4L,
        prefixes: &["FORM4L", "FORM4BL"],
        cartridge_layout: CartridgeLayout::PerSlot,
        label: "Form 4L",
    },
    FamilyEntry {
        family: ModelFamily::Form4,
        prefixes: &["FORM4", "FORM4B"],
        cartridge_layout: CartridgeLayout::Single,
        label: "Form 4",
    },
    FamilyEntry {
        family: ModelFamily::Form3L,
        prefixes: &["FORM3L", "FORM3BL"],
        cartridge_layout: CartridgeLayout::PerSlot,
        label: "Form 3L",
    },
    FamilyEntry {
        family: ModelFamily::Form3,
        prefixes: &["FORM3", "FORM3B", "FORM3PLUS"],
        cartridge_layout: CartridgeLayout::Single,
        label: "Form 3",
    },
];

const UNKNOWN_ENTRY: FamilyEntry = FamilyEntry {
    family: ModelFamily::Unknown,
    prefixes: &[],
    cartridge_layout: CartridgeLayout::Auto,
    label: "Formlabs printer",
};

impl ModelFamily {
    /// Resolves a vendor machine type id (`FORM-3L-0`, `Form 4`, ...).
    /// The longest matching prefix wins so `FORM-3L` never lands in `Form3`.
    pub fn from_machine_type(machine_type: &str) -> ModelFamily {
        let key: String = machine_type
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_uppercase)
            .collect();

        FAMILY_TABLE
            .iter()
            .flat_map(|entry| entry.prefixes.iter().map(move |p| (entry.family, *p)))
            .filter(|(_, prefix)| key.starts_with(prefix))
            .max_by_key(|(_, prefix)| prefix.len())
            .map(|(family, _)| family)
            .unwrap_or(ModelFamily::Unknown)
    }

    pub fn entry(&self) -> &'static FamilyEntry {
        FAMILY_TABLE
            .iter()
            .find(|entry| entry.family == *self)
            .unwrap_or(&UNKNOWN_ENTRY)
    }

    pub fn cartridge_layout(&self) -> CartridgeLayout {
        self.entry().cartridge_layout
    }

    pub fn label(&self) -> &'static str {
        self.entry().label
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
