//! Canonical field set and the static field groups.
//!
//! Field names are a closed enum: anything the completion service returns
//! that does not parse as a [`CanonicalField`] is rejected before merge.
//! [`FieldGroup`] partitions the set into the batches sent together in one
//! external call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::models::FieldMap;

/// Value shape expected for a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Date,
    Amount,
    CurrencyCode,
    Address,
}

/// Every field this system knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    InvoiceNumber,
    InvoiceDate,
    DueDate,
    PurchaseOrder,
    VendorName,
    CustomerName,
    Currency,
    PaymentTerms,
    VendorAddress,
    BillingAddress,
    ShippingAddress,
    VendorTaxId,
    GstAmount,
    HstAmount,
    PstAmount,
    QstAmount,
    TotalTax,
    Subtotal,
    ShippingAmount,
    HandlingAmount,
    DiscountAmount,
    InvoiceTotal,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 22] = [
        CanonicalField::InvoiceNumber,
        CanonicalField::InvoiceDate,
        CanonicalField::DueDate,
        CanonicalField::PurchaseOrder,
        CanonicalField::VendorName,
        CanonicalField::CustomerName,
        CanonicalField::Currency,
        CanonicalField::PaymentTerms,
        CanonicalField::VendorAddress,
        CanonicalField::BillingAddress,
        CanonicalField::ShippingAddress,
        CanonicalField::VendorTaxId,
        CanonicalField::GstAmount,
        CanonicalField::HstAmount,
        CanonicalField::PstAmount,
        CanonicalField::QstAmount,
        CanonicalField::TotalTax,
        CanonicalField::Subtotal,
        CanonicalField::ShippingAmount,
        CanonicalField::HandlingAmount,
        CanonicalField::DiscountAmount,
        CanonicalField::InvoiceTotal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::InvoiceNumber => "invoice_number",
            CanonicalField::InvoiceDate => "invoice_date",
            CanonicalField::DueDate => "due_date",
            CanonicalField::PurchaseOrder => "purchase_order",
            CanonicalField::VendorName => "vendor_name",
            CanonicalField::CustomerName => "customer_name",
            CanonicalField::Currency => "currency",
            CanonicalField::PaymentTerms => "payment_terms",
            CanonicalField::VendorAddress => "vendor_address",
            CanonicalField::BillingAddress => "billing_address",
            CanonicalField::ShippingAddress => "shipping_address",
            CanonicalField::VendorTaxId => "vendor_tax_id",
            CanonicalField::GstAmount => "gst_amount",
            CanonicalField::HstAmount => "hst_amount",
            CanonicalField::PstAmount => "pst_amount",
            CanonicalField::QstAmount => "qst_amount",
            CanonicalField::TotalTax => "total_tax",
            CanonicalField::Subtotal => "subtotal",
            CanonicalField::ShippingAmount => "shipping_amount",
            CanonicalField::HandlingAmount => "handling_amount",
            CanonicalField::DiscountAmount => "discount_amount",
            CanonicalField::InvoiceTotal => "invoice_total",
        }
    }

    pub fn kind(self) -> FieldKind {
        use CanonicalField::*;
        match self {
            InvoiceDate | DueDate => FieldKind::Date,
            Currency => FieldKind::CurrencyCode,
            VendorAddress | BillingAddress | ShippingAddress => FieldKind::Address,
            GstAmount | HstAmount | PstAmount | QstAmount | TotalTax | Subtotal
            | ShippingAmount | HandlingAmount | DiscountAmount | InvoiceTotal => FieldKind::Amount,
            InvoiceNumber | PurchaseOrder | VendorName | CustomerName | PaymentTerms
            | VendorTaxId => FieldKind::Text,
        }
    }

    pub fn group(self) -> FieldGroup {
        FieldGroup::ALL
            .into_iter()
            .find(|g| g.fields().contains(&self))
            .unwrap_or(FieldGroup::Header)
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("not a canonical field: '{}'", s))
    }
}

/// Fixed batches of canonical fields, one external call each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldGroup {
    Header,
    Addresses,
    JurisdictionalTax,
    /// Amount fields that roll up from the line items.
    LineItems,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 4] = [
        FieldGroup::Header,
        FieldGroup::Addresses,
        FieldGroup::JurisdictionalTax,
        FieldGroup::LineItems,
    ];

    /// Stable identifier used in cache keys and request payloads.
    pub fn id(self) -> &'static str {
        match self {
            FieldGroup::Header => "header",
            FieldGroup::Addresses => "addresses",
            FieldGroup::JurisdictionalTax => "jurisdictional-tax",
            FieldGroup::LineItems => "line-items",
        }
    }

    pub fn fields(self) -> &'static [CanonicalField] {
        use CanonicalField::*;
        match self {
            FieldGroup::Header => &[
                InvoiceNumber,
                InvoiceDate,
                DueDate,
                PurchaseOrder,
                VendorName,
                CustomerName,
                Currency,
                PaymentTerms,
            ],
            FieldGroup::Addresses => &[VendorAddress, BillingAddress, ShippingAddress],
            FieldGroup::JurisdictionalTax => &[
                VendorTaxId,
                GstAmount,
                HstAmount,
                PstAmount,
                QstAmount,
                TotalTax,
            ],
            FieldGroup::LineItems => &[
                Subtotal,
                ShippingAmount,
                HandlingAmount,
                DiscountAmount,
                InvoiceTotal,
            ],
        }
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// The qualifying fields of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBatch {
    pub group: FieldGroup,
    pub fields: Vec<CanonicalField>,
}

/// Partition fields needing help into their groups.
///
/// A field qualifies when its stored confidence is below `threshold` or it
/// is listed in `missing`. Groups with no qualifying field are skipped.
/// Batches come back in [`FieldGroup::ALL`] order.
pub fn partition_for_fallback(
    fields: &FieldMap,
    missing: &BTreeSet<CanonicalField>,
    threshold: f64,
) -> Vec<GroupBatch> {
    FieldGroup::ALL
        .into_iter()
        .filter_map(|group| {
            let qualifying: Vec<CanonicalField> = group
                .fields()
                .iter()
                .copied()
                .filter(|f| match fields.get(f) {
                    Some(v) => v.confidence < threshold || v.data.is_blank(),
                    None => missing.contains(f),
                })
                .collect();
            if qualifying.is_empty() {
                None
            } else {
                Some(GroupBatch {
                    group,
                    fields: qualifying,
                })
            }
        })
        .collect()
}
