//! Aggregation consistency checks.
//!
//! Cross-validates invoice-level totals against the line items. Every check
//! passes or fails on its own within an absolute tolerance. The checker is a
//! pure function of the record: it never mutates anything, and a failure is
//! a warning on the extraction outcome rather than an error.
//!
//! | Check | Rule |
//! |-------|------|
//! | `subtotal` | subtotal = Σ line amounts |
//! | `tax:<jurisdiction>` | jurisdiction total = Σ that jurisdiction's line taxes |
//! | `tax:combined` | total tax = Σ jurisdiction totals |
//! | `grand_total` | total = subtotal + tax + shipping + handling − discount |
//!
//! A check whose inputs are absent is reported as skipped, which counts as
//! passing.

use serde::Serialize;

use crate::fields::CanonicalField;
use crate::models::{ExtractionRecord, FieldMap, LineItem, TaxJurisdiction};

/// Default absolute tolerance: one hundredth of a cent.
pub const DEFAULT_TOLERANCE: f64 = 0.0001;

/// Float slack so that a difference equal to the tolerance still passes.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// True when the inputs for this check were absent.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    /// Absolute difference, rounded to 1e-6.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discrepancy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: true,
            expected: None,
            actual: None,
            discrepancy: None,
            message: None,
        }
    }

    /// `stated` is the invoice-level value, `computed` the aggregate.
    fn compare(name: impl Into<String>, stated: f64, computed: f64, tolerance: f64, what: &str) -> Self {
        let name = name.into();
        let diff = (stated - computed).abs();
        let passed = diff <= tolerance + EPSILON;
        let discrepancy = (diff * 1_000_000.0).round() / 1_000_000.0;
        let message = (!passed).then(|| {
            format!(
                "{}: stated {:.2} differs from {} {:.2} by {:.2}",
                name, stated, what, computed, discrepancy
            )
        });
        Self {
            name,
            passed,
            skipped: false,
            expected: Some(computed),
            actual: Some(stated),
            discrepancy: Some(discrepancy),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub all_valid: bool,
    pub tolerance: f64,
    pub checks: Vec<CheckResult>,
}

impl ConsistencyReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Discrepancy messages for failed checks.
    pub fn warnings(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter_map(|c| c.message.clone())
            .collect()
    }
}

/// Run every aggregation check against a record.
pub fn check_record(record: &ExtractionRecord, tolerance: f64) -> ConsistencyReport {
    check_totals(&record.fields, &record.line_items, tolerance)
}

/// Run every aggregation check against a field map and its line items.
pub fn check_totals(fields: &FieldMap, line_items: &[LineItem], tolerance: f64) -> ConsistencyReport {
    let amount = |f: CanonicalField| fields.get(&f).and_then(|v| v.data.as_amount());
    let mut checks = Vec::new();

    // Subtotal vs line amounts.
    let line_sum = line_items.iter().fold(0.0, |a, l| a + l.amount);
    checks.push(match amount(CanonicalField::Subtotal) {
        Some(subtotal) if !line_items.is_empty() => CheckResult::compare(
            "subtotal",
            subtotal,
            line_sum,
            tolerance,
            "line-item sum",
        ),
        _ => CheckResult::skipped("subtotal"),
    });

    // Per-jurisdiction tax totals vs per-line taxes.
    let mut jurisdiction_sum = 0.0;
    let mut any_jurisdiction = false;
    for jurisdiction in TaxJurisdiction::ALL {
        let name = format!("tax:{}", jurisdiction.as_str());
        let stated = amount(jurisdiction.total_field());
        let lines: Vec<f64> = line_items
            .iter()
            .filter_map(|l| l.taxes.get(&jurisdiction).copied())
            .collect();
        if let Some(total) = stated {
            jurisdiction_sum += total;
            any_jurisdiction = true;
        }
        // Nothing to compare a header total against without a per-line breakdown.
        checks.push(if lines.is_empty() {
            CheckResult::skipped(name)
        } else {
            CheckResult::compare(
                name,
                stated.unwrap_or(0.0),
                lines.iter().fold(0.0, |a, b| a + b),
                tolerance,
                "per-line tax sum",
            )
        });
    }

    // Combined tax vs jurisdiction totals.
    let direct_tax = amount(CanonicalField::TotalTax);
    checks.push(match direct_tax {
        Some(total) if any_jurisdiction => CheckResult::compare(
            "tax:combined",
            total,
            jurisdiction_sum,
            tolerance,
            "jurisdictional tax sum",
        ),
        _ => CheckResult::skipped("tax:combined"),
    });

    // Grand total.
    let tax = direct_tax.or(any_jurisdiction.then_some(jurisdiction_sum));
    checks.push(
        match (amount(CanonicalField::InvoiceTotal), amount(CanonicalField::Subtotal)) {
            (Some(total), Some(subtotal)) => {
                let computed = subtotal
                    + tax.unwrap_or(0.0)
                    + amount(CanonicalField::ShippingAmount).unwrap_or(0.0)
                    + amount(CanonicalField::HandlingAmount).unwrap_or(0.0)
                    - amount(CanonicalField::DiscountAmount).unwrap_or(0.0);
                CheckResult::compare("grand_total", total, computed, tolerance, "computed total")
            }
            _ => CheckResult::skipped("grand_total"),
        },
    );

    ConsistencyReport {
        all_valid: checks.iter().all(|c| c.passed),
        tolerance,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldData, FieldValue, Provenance};

    fn fields(values: &[(CanonicalField, f64)]) -> FieldMap {
        values
            .iter()
            .map(|(f, v)| {
                (
                    *f,
                    FieldValue::new(FieldData::Amount(*v), 0.9, Provenance::DocumentAnalysis),
                )
            })
            .collect()
    }

    #[test]
    fn test_subtotal_off_by_a_cent() {
        let f = fields(&[(CanonicalField::Subtotal, 100.00)]);
        let items = vec![LineItem::new(50.00), LineItem::new(49.99)];

        let strict = check_totals(&f, &items, DEFAULT_TOLERANCE);
        let check = strict.check("subtotal").unwrap();
        assert!(!check.passed);
        assert!((check.discrepancy.unwrap() - 0.01).abs() < 1e-9);
        assert!(check.message.as_ref().unwrap().contains("0.01"));
        assert!(!strict.all_valid);

        let lenient = check_totals(&f, &items, 0.01);
        assert!(lenient.check("subtotal").unwrap().passed);
        assert!(lenient.all_valid);
    }

    #[test]
    fn test_full_invoice_consistent() {
        let f = fields(&[
            (CanonicalField::Subtotal, 200.0),
            (CanonicalField::GstAmount, 10.0),
            (CanonicalField::PstAmount, 14.0),
            (CanonicalField::TotalTax, 24.0),
            (CanonicalField::ShippingAmount, 15.0),
            (CanonicalField::HandlingAmount, 5.0),
            (CanonicalField::DiscountAmount, 20.0),
            (CanonicalField::InvoiceTotal, 224.0),
        ]);
        let items = vec![
            LineItem::new(120.0)
                .with_tax(TaxJurisdiction::Gst, 6.0)
                .with_tax(TaxJurisdiction::Pst, 8.4),
            LineItem::new(80.0)
                .with_tax(TaxJurisdiction::Gst, 4.0)
                .with_tax(TaxJurisdiction::Pst, 5.6),
        ];
        let report = check_totals(&f, &items, DEFAULT_TOLERANCE);
        assert!(report.all_valid, "{:?}", report.warnings());
        assert!(report.check("tax:hst").unwrap().skipped);
        assert!(!report.check("tax:gst").unwrap().skipped);
    }

    #[test]
    fn test_grand_total_uses_jurisdiction_sum_without_direct_tax() {
        let f = fields(&[
            (CanonicalField::Subtotal, 100.0),
            (CanonicalField::HstAmount, 13.0),
            (CanonicalField::InvoiceTotal, 113.0),
        ]);
        let report = check_totals(&f, &[], DEFAULT_TOLERANCE);
        assert!(report.check("grand_total").unwrap().passed);
        assert!(report.check("tax:combined").unwrap().skipped);
        assert!(report.check("tax:hst").unwrap().skipped);
        assert!(report.all_valid, "{:?}", report.warnings());
    }

    #[test]
    fn test_stated_tax_with_lines_lacking_breakdown_is_skipped() {
        let f = fields(&[
            (CanonicalField::Subtotal, 100.0),
            (CanonicalField::HstAmount, 13.0),
            (CanonicalField::InvoiceTotal, 113.0),
        ]);
        let items = vec![LineItem::new(60.0), LineItem::new(40.0)];
        let report = check_totals(&f, &items, DEFAULT_TOLERANCE);
        let hst = report.check("tax:hst").unwrap();
        assert!(hst.skipped);
        assert!(hst.passed);
        assert!(report.check("subtotal").unwrap().passed);
        assert!(report.check("grand_total").unwrap().passed);
        assert!(report.all_valid, "{:?}", report.warnings());
    }

    #[test]
    fn test_line_tax_without_header_total_fails() {
        let f = FieldMap::new();
        let items = vec![LineItem::new(10.0).with_tax(TaxJurisdiction::Qst, 1.0)];
        let report = check_totals(&f, &items, DEFAULT_TOLERANCE);
        let qst = report.check("tax:qst").unwrap();
        assert!(!qst.passed);
    }

    #[test]
    fn test_combined_tax_mismatch() {
        let f = fields(&[
            (CanonicalField::GstAmount, 5.0),
            (CanonicalField::QstAmount, 9.98),
            (CanonicalField::TotalTax, 15.0),
        ]);
        let report = check_totals(&f, &[], DEFAULT_TOLERANCE);
        assert!(!report.check("tax:combined").unwrap().passed);
    }

    #[test]
    fn test_empty_record_all_skipped() {
        let report = check_totals(&FieldMap::new(), &[], DEFAULT_TOLERANCE);
        assert!(report.all_valid);
        assert!(report.checks.iter().all(|c| c.skipped));
    }

    #[test]
    fn test_rerun_is_identical() {
        let f = fields(&[(CanonicalField::Subtotal, 100.0), (CanonicalField::InvoiceTotal, 99.0)]);
        let items = vec![LineItem::new(99.99)];
        let first = check_totals(&f, &items, DEFAULT_TOLERANCE);
        let second = check_totals(&f, &items, DEFAULT_TOLERANCE);
        assert_eq!(first, second);
    }
}
