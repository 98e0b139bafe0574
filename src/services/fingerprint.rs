//! Layout fingerprinting and template matching.
//!
//! A fingerprint summarizes an invoice's structure: the token set of the
//! header region, the overall line count and how many numeric columns the
//! densest line carries. Similarity is a weighted blend (70% header-token
//! Jaccard, 15% line-count closeness, 15% numeric-column agreement) scaled
//! to 0-100; the weights are a chosen heuristic, the acceptance threshold
//! is configuration.

use std::collections::BTreeSet;

use regex::Regex;

use rust_decimal::Decimal;

use crate::models::{Fingerprint, Template};
use crate::utils::{normalize_name, normalize_tax_id, parse_amount};

/// Lines considered "header" when tokenizing, counted over non-empty lines.
const HEADER_LINES: usize = 12;

pub fn compute_fingerprint(text: &str) -> Fingerprint {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut header_tokens = BTreeSet::new();
    for line in lines.iter().take(HEADER_LINES) {
        for word in line.split_whitespace() {
            let token = normalize_name(word);
            if token.len() >= 3 && token.chars().any(|c| c.is_alphabetic()) {
                header_tokens.insert(token);
            }
        }
    }

    let numeric_column_count = lines
        .iter()
        .map(|line| {
            line.split_whitespace()
                .filter(|w| looks_numeric(w))
                .count()
        })
        .max()
        .unwrap_or(0)
        .min(u8::MAX as usize) as u8;

    Fingerprint {
        header_tokens,
        line_count: lines.len() as u32,
        numeric_column_count,
    }
}

fn looks_numeric(word: &str) -> bool {
    let stripped: String = word.chars().filter(|c| !matches!(c, ',' | '.' | '-')).collect();
    !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit())
}

/// Structural similarity of two fingerprints in [0, 100].
pub fn similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let intersection = a.header_tokens.intersection(&b.header_tokens).count() as f64;
    let union = a.header_tokens.union(&b.header_tokens).count() as f64;
    let jaccard = if union == 0.0 { 0.0 } else { intersection / union };

    let max_lines = a.line_count.max(b.line_count) as f64;
    let line_closeness = if max_lines == 0.0 {
        1.0
    } else {
        1.0 - (a.line_count as f64 - b.line_count as f64).abs() / max_lines
    };

    let max_cols = a.numeric_column_count.max(b.numeric_column_count) as f64;
    let col_agreement = if max_cols == 0.0 {
        1.0
    } else {
        1.0 - (a.numeric_column_count as f64 - b.numeric_column_count as f64).abs() / max_cols
    };

    (jaccard * 70.0 + line_closeness * 15.0 + col_agreement * 15.0).clamp(0.0, 100.0)
}

/// Supplier identity probed from the raw text before any extraction ran:
/// the first non-empty line as the name candidate and a labelled tax id.
#[derive(Debug, Clone, Default)]
pub struct SupplierProbe {
    pub name: Option<String>,
    pub tax_id: Option<String>,
}

pub fn probe_supplier(text: &str) -> SupplierProbe {
    let name = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && l.chars().any(|c| c.is_alphabetic()))
        .map(|l| l.to_string());

    // NIP / VAT-id style labels followed by a separated digit run.
    let tax_pattern = Regex::new(
        r"(?i)(?:NIP|VAT\s*ID|Tax\s*ID|USt[-.\s]*IdNr\.?)[:\s]*((?:[A-Z]{2})?[\d\s\-]{9,16})",
    )
    .expect("tax id pattern");
    let tax_id = tax_pattern
        .captures(text)
        .map(|caps| normalize_tax_id(&caps[1]))
        .filter(|digits| digits.len() >= 9);

    SupplierProbe { name, tax_id }
}

/// Declared totals read off labelled summary lines, used to cross-check
/// extracted line items. Any of the three may be absent.
#[derive(Debug, Clone, Default)]
pub struct TotalsProbe {
    pub net: Option<Decimal>,
    pub tax: Option<Decimal>,
    pub gross: Option<Decimal>,
}

pub fn probe_totals(text: &str) -> TotalsProbe {
    let net = labelled_amount(text, r"(?im)^.*(?:razem\s+netto|netto|net\s+total)[:\s]+([\d\s]+[.,]\d{2})\s*(?:PLN|EUR|zł)?\s*$");
    let tax = labelled_amount(
        text,
        r"(?im)^.*(?:podatek|vat|tax)(?:\s*\d+\s*%)?[:\s]+([\d\s]+[.,]\d{2})\s*(?:PLN|EUR|zł)?\s*$",
    );
    let gross = labelled_amount(
        text,
        r"(?im)^.*(?:razem\s+brutto|brutto|do\s+zap[łl]aty|gross|total\s+due)[:\s]+([\d\s]+[.,]\d{2})\s*(?:PLN|EUR|zł)?\s*$",
    );
    TotalsProbe { net, tax, gross }
}

fn labelled_amount(text: &str, pattern: &str) -> Option<Decimal> {
    let re = Regex::new(pattern).expect("totals pattern");
    re.captures(text).and_then(|caps| parse_amount(&caps[1]))
}

#[derive(Debug, Clone)]
pub struct TemplateMatch {
    pub template: Template,
    pub score: f64,
}

/// Best-matching active template for this supplier, or none. Candidates are
/// first filtered by exact tax id, falling back to normalized supplier name;
/// a supplier mismatch is never scored. Ties break on confidence, then most
/// recent update. Pure scoring, no side effects.
pub fn best_match(
    probe: &SupplierProbe,
    fingerprint: &Fingerprint,
    candidates: Vec<Template>,
) -> Option<TemplateMatch> {
    let probe_tax = probe.tax_id.as_deref().map(normalize_tax_id);
    let probe_name = probe.name.as_deref().map(normalize_name);

    let mut scored: Vec<TemplateMatch> = candidates
        .into_iter()
        .filter(|tpl| supplier_matches(tpl, probe_tax.as_deref(), probe_name.as_deref()))
        .map(|tpl| {
            let score = similarity(fingerprint, &tpl.fingerprint);
            TemplateMatch { template: tpl, score }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.template
                    .confidence
                    .partial_cmp(&a.template.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.template.updated_at.cmp(&a.template.updated_at))
    });

    scored.into_iter().next()
}

fn supplier_matches(
    template: &Template,
    probe_tax: Option<&str>,
    probe_name: Option<&str>,
) -> bool {
    if let (Some(probe), Some(stored)) = (probe_tax, template.supplier_tax_id.as_deref()) {
        return probe == normalize_tax_id(stored);
    }
    if let Some(probe) = probe_name {
        let stored = normalize_name(&template.supplier_name);
        return !probe.is_empty()
            && (probe == stored || probe.contains(&stored) || stored.contains(&probe));
    }
    false
}
