//! Cross-checks extracted lines against the declared totals.
//!
//! The pipeline favors "extract and flag" over "refuse to extract": a line
//! whose stated total deviates from quantity × unit price is reported as an
//! implicit discount, and a header-level mismatch becomes a data-quality
//! warning for the reviewer. Nothing here is a hard failure and nothing is
//! ever auto-corrected.

use rust_decimal::Decimal;

use crate::models::{ExtractedLine, InvoiceLine};

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub lines: Vec<InvoiceLine>,
    pub warnings: Vec<String>,
    /// Σ line_total over the accepted lines.
    pub line_sum: Decimal,
}

/// Builds persistable lines from extracted ones, flagging per-line
/// discounts beyond `line_tolerance` and comparing the sum against the
/// declared net total within `header_tolerance` (both fractions, 0.01 = 1%).
pub fn reconcile(
    invoice_id: &str,
    extracted: &[ExtractedLine],
    declared_net: Option<Decimal>,
    line_tolerance: Decimal,
    header_tolerance: Decimal,
) -> ReconcileReport {
    let mut lines = Vec::with_capacity(extracted.len());
    let mut warnings = Vec::new();
    let mut line_sum = Decimal::ZERO;

    for (idx, line) in extracted.iter().enumerate() {
        let discount_pct = line_discount_pct(line, line_tolerance);
        if let Some(pct) = discount_pct {
            warnings.push(format!(
                "line {} \"{}\": stated total {} deviates {}% from quantity × unit price",
                idx + 1,
                line.description,
                line.line_total,
                pct
            ));
        }
        line_sum += line.line_total;
        lines.push(InvoiceLine {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: invoice_id.to_string(),
            line_no: (idx + 1) as u32,
            description: line.description.clone(),
            quantity: line.quantity,
            unit: line.unit.clone(),
            unit_price: line.unit_price,
            line_total: line.line_total,
            discount_pct,
        });
    }

    if let Some(declared) = declared_net {
        if declared != Decimal::ZERO {
            let deviation = ((line_sum - declared) / declared).abs();
            if deviation > header_tolerance {
                warnings.push(format!(
                    "sum of line totals {} deviates from declared net total {} by {}%",
                    line_sum,
                    declared,
                    (deviation * Decimal::ONE_HUNDRED).round_dp(2)
                ));
            }
        }
    }

    ReconcileReport { lines, warnings, line_sum }
}

/// Percentage by which the stated total undercuts (positive) or exceeds
/// (negative) quantity × unit price, relative to the stated total, when
/// beyond tolerance.
fn line_discount_pct(line: &ExtractedLine, tolerance: Decimal) -> Option<Decimal> {
    if line.line_total == Decimal::ZERO {
        return None;
    }
    let expected = line.quantity * line.unit_price;
    let deviation = (expected - line.line_total) / line.line_total;
    if deviation.abs() > tolerance {
        Some((deviation * Decimal::ONE_HUNDRED).round_dp(2))
    } else {
        None
    }
}
