//! Core data models for extraction records.
//!
//! An [`ExtractionRecord`] is both the unit of work (claimed by one worker at
//! a time through its [`ProcessingState`]) and the unit of optimistic
//! concurrency (every accepted patch bumps `review_version` by exactly one).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::fields::CanonicalField;

/// Opaque, externally stable record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Mint a fresh identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an extraction record.
///
/// ```text
/// PENDING ──▶ PROCESSING ──▶ EXTRACTED ──▶ VALIDATED ──▶ STAGED
///    ▲            │  │           │  ▲           │
///    │            │  └──▶ ERROR ◀┘  └───────────┘
///    └────────────┴───────┘
/// ```
///
/// A record in `PROCESSING` is owned by exactly one worker. The worker must
/// leave that state explicitly (`EXTRACTED`, `ERROR`, or back to `PENDING`)
/// so the record never gets stuck unclaimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Pending,
    Processing,
    Extracted,
    Validated,
    Staged,
    Error,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 6] = [
        ProcessingState::Pending,
        ProcessingState::Processing,
        ProcessingState::Extracted,
        ProcessingState::Validated,
        ProcessingState::Staged,
        ProcessingState::Error,
    ];

    /// Stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Pending => "PENDING",
            ProcessingState::Processing => "PROCESSING",
            ProcessingState::Extracted => "EXTRACTED",
            ProcessingState::Validated => "VALIDATED",
            ProcessingState::Staged => "STAGED",
            ProcessingState::Error => "ERROR",
        }
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ProcessingState) -> bool {
        use ProcessingState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Extracted)
                | (Processing, Error)
                | (Processing, Pending)
                | (Extracted, Validated)
                | (Extracted, Processing)
                | (Extracted, Error)
                | (Validated, Staged)
                | (Validated, Extracted)
                | (Error, Pending)
        )
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        ProcessingState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown processing state: '{}'", s))
    }
}

/// Where a field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    DocumentAnalysis,
    CompletionService,
    Human,
}

/// A structured postal address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Typed field payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldData {
    Text(String),
    Date(NaiveDate),
    Amount(f64),
    Address(Address),
}

impl FieldData {
    /// Amount value, if this is a monetary field.
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            FieldData::Amount(v) => Some(*v),
            _ => None,
        }
    }

    /// True when the value carries no usable content.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldData::Text(s) => s.trim().is_empty(),
            FieldData::Address(a) => a.street.trim().is_empty() && a.city.trim().is_empty(),
            FieldData::Amount(v) => !v.is_finite(),
            FieldData::Date(_) => false,
        }
    }

    /// Whether two values say the same thing, ignoring case, surrounding
    /// whitespace, and sub-cent amount noise.
    pub fn agrees_with(&self, other: &FieldData) -> bool {
        match (self, other) {
            (FieldData::Text(a), FieldData::Text(b)) => {
                a.trim().eq_ignore_ascii_case(b.trim())
            }
            (FieldData::Date(a), FieldData::Date(b)) => a == b,
            (FieldData::Amount(a), FieldData::Amount(b)) => (a - b).abs() < 0.005,
            (FieldData::Address(a), FieldData::Address(b)) => {
                norm(&a.street) == norm(&b.street)
                    && norm(&a.city) == norm(&b.city)
                    && opt_norm(&a.region) == opt_norm(&b.region)
                    && opt_norm(&a.postal_code) == opt_norm(&b.postal_code)
            }
            _ => false,
        }
    }
}

fn norm(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn opt_norm(s: &Option<String>) -> Option<String> {
    s.as_deref().map(norm).filter(|v| !v.is_empty())
}

/// A field value with its confidence score in `[0, 1]` and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub data: FieldData,
    pub confidence: f64,
    pub provenance: Provenance,
}

impl FieldValue {
    pub fn new(data: FieldData, confidence: f64, provenance: Provenance) -> Self {
        Self {
            data,
            confidence: confidence.clamp(0.0, 1.0),
            provenance,
        }
    }

    /// A reviewer-entered value. Human edits carry full confidence, so the
    /// fallback merge never displaces them.
    pub fn human(data: FieldData) -> Self {
        Self::new(data, 1.0, Provenance::Human)
    }
}

/// Tax jurisdictions tracked per line and at invoice level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxJurisdiction {
    Gst,
    Hst,
    Pst,
    Qst,
}

impl TaxJurisdiction {
    pub const ALL: [TaxJurisdiction; 4] = [
        TaxJurisdiction::Gst,
        TaxJurisdiction::Hst,
        TaxJurisdiction::Pst,
        TaxJurisdiction::Qst,
    ];

    /// Invoice-level field holding this jurisdiction's total.
    pub fn total_field(self) -> CanonicalField {
        match self {
            TaxJurisdiction::Gst => CanonicalField::GstAmount,
            TaxJurisdiction::Hst => CanonicalField::HstAmount,
            TaxJurisdiction::Pst => CanonicalField::PstAmount,
            TaxJurisdiction::Qst => CanonicalField::QstAmount,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaxJurisdiction::Gst => "gst",
            TaxJurisdiction::Hst => "hst",
            TaxJurisdiction::Pst => "pst",
            TaxJurisdiction::Qst => "qst",
        }
    }
}

/// One invoice line. Owned by its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taxes: BTreeMap<TaxJurisdiction, f64>,
}

impl LineItem {
    pub fn new(amount: f64) -> Self {
        Self {
            description: None,
            quantity: None,
            unit_price: None,
            amount,
            taxes: BTreeMap::new(),
        }
    }

    pub fn with_tax(mut self, jurisdiction: TaxJurisdiction, amount: f64) -> Self {
        self.taxes.insert(jurisdiction, amount);
        self
    }
}

/// Canonical field map. Ordered so serialisation is deterministic.
pub type FieldMap = BTreeMap<CanonicalField, FieldValue>;

/// The unit of work and of optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: RecordId,
    /// SHA-256 of the source document bytes.
    pub document_fingerprint: String,
    pub processing_state: ProcessingState,
    pub review_version: u64,
    pub fields: FieldMap,
    pub line_items: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    /// Set by the store on every successful write.
    pub updated_at: DateTime<Utc>,
}

impl ExtractionRecord {
    /// Monetary value of a field, when present and numeric.
    pub fn amount(&self, field: CanonicalField) -> Option<f64> {
        self.fields.get(&field).and_then(|v| v.data.as_amount())
    }
}

/// Insertion shape used by the ingestion collaborator. Records always start
/// `PENDING` at version 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRecord {
    #[serde(default)]
    pub id: Option<RecordId>,
    pub document_fingerprint: String,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

/// A versioned change set. `None` clears a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    #[serde(default)]
    pub fields: BTreeMap<CanonicalField, Option<FieldValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_items: Option<Vec<LineItem>>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.line_items.is_none()
    }

    pub fn set(mut self, field: CanonicalField, value: FieldValue) -> Self {
        self.fields.insert(field, Some(value));
        self
    }

    pub fn clear(mut self, field: CanonicalField) -> Self {
        self.fields.insert(field, None);
        self
    }

    /// Build a patch that sets every entry of `fields`.
    pub fn from_fields(fields: &FieldMap) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|(k, v)| (*k, Some(v.clone())))
                .collect(),
            line_items: None,
        }
    }

    /// Apply to in-memory state: set keys replace the whole value, `None`
    /// keys are removed.
    pub fn apply_to(&self, fields: &mut FieldMap, line_items: &mut Vec<LineItem>) {
        for (field, value) in &self.fields {
            match value {
                Some(v) => {
                    fields.insert(*field, v.clone());
                }
                None => {
                    fields.remove(field);
                }
            }
        }
        if let Some(items) = &self.line_items {
            *line_items = items.clone();
        }
    }
}
