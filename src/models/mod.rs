use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Invoice lifecycle. The worker owns `pending → processing → {reviewing |
/// error}`; a human reviewer owns `reviewing → {approved | rejected}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Processing,
    Reviewing,
    Approved,
    Rejected,
    Error,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Reviewing => "reviewing",
            InvoiceStatus::Approved => "approved",
            InvoiceStatus::Rejected => "rejected",
            InvoiceStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(InvoiceStatus::Pending),
            "processing" => Some(InvoiceStatus::Processing),
            "reviewing" => Some(InvoiceStatus::Reviewing),
            "approved" => Some(InvoiceStatus::Approved),
            "rejected" => Some(InvoiceStatus::Rejected),
            "error" => Some(InvoiceStatus::Error),
            _ => None,
        }
    }

    /// Terminal for the worker: re-delivering a job is a no-op.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Reviewing | InvoiceStatus::Approved | InvoiceStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Template,
    Ai,
    Manual,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Template => "template",
            ExtractionMethod::Ai => "ai",
            ExtractionMethod::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "template" => Some(ExtractionMethod::Template),
            "ai" => Some(ExtractionMethod::Ai),
            "manual" => Some(ExtractionMethod::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    pub uploaded_by: String,
    pub file_ref: String,
    pub ocr_text: Option<String>,
    pub supplier_name: Option<String>,
    pub supplier_tax_id: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<String>,
    pub net_total: Option<Decimal>,
    pub tax_total: Option<Decimal>,
    pub gross_total: Option<Decimal>,
    pub status: InvoiceStatus,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    /// Reconciliation warnings attached to a successful run, newline
    /// separated. Shown to the reviewer, never a failure.
    pub review_warnings: Option<String>,
    pub retry_count: u32,
    pub extraction_method: Option<ExtractionMethod>,
    pub processed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: String,
    pub invoice_id: String,
    pub line_no: u32,
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    /// Set by reconciliation when quantity × unit_price deviates from the
    /// stated line total. Reported, never corrected.
    pub discount_pct: Option<Decimal>,
}

/// Structural signature of an invoice layout. Compared by similarity, not
/// equality, so minor OCR drift still matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub header_tokens: BTreeSet<String>,
    pub line_count: u32,
    pub numeric_column_count: u8,
}

/// One line-item field a zone knows how to pull out of a matched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineField {
    Description,
    Quantity,
    Unit,
    UnitPrice,
    LineTotal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub field: LineField,
    /// Named capture group in the template's line pattern.
    pub capture: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Regex applied per text line; named captures feed the zones.
    pub line_pattern: String,
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub tenant_id: String,
    pub supplier_tax_id: Option<String>,
    pub supplier_name: String,
    pub fingerprint: Fingerprint,
    pub zones: ZoneConfig,
    pub version: u32,
    pub times_used: u32,
    pub times_successful: u32,
    /// Derived from the counters, bounded to [0, 100].
    pub confidence: f64,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Header fields as extracted from the document, before they are written
/// onto the invoice row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedHeader {
    pub supplier_name: Option<String>,
    pub supplier_tax_id: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<String>,
    pub net_total: Option<Decimal>,
    pub tax_total: Option<Decimal>,
    pub gross_total: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLine {
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Tagged result of one extraction run, so downstream code is exhaustive
/// over provenance instead of inspecting a loosely typed blob.
#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Template {
        template_id: String,
        match_score: f64,
        lines: Vec<ExtractedLine>,
        partial_misses: u32,
    },
    Ai {
        model: String,
        attempts: u32,
        header: ExtractedHeader,
        lines: Vec<ExtractedLine>,
    },
    Manual {
        lines: Vec<ExtractedLine>,
    },
}

impl ExtractionOutcome {
    pub fn method(&self) -> ExtractionMethod {
        match self {
            ExtractionOutcome::Template { .. } => ExtractionMethod::Template,
            ExtractionOutcome::Ai { .. } => ExtractionMethod::Ai,
            ExtractionOutcome::Manual { .. } => ExtractionMethod::Manual,
        }
    }

    pub fn lines(&self) -> &[ExtractedLine] {
        match self {
            ExtractionOutcome::Template { lines, .. } => lines,
            ExtractionOutcome::Ai { lines, .. } => lines,
            ExtractionOutcome::Manual { lines } => lines,
        }
    }
}

/// Immutable audit record, one per processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetric {
    pub id: String,
    pub invoice_id: String,
    pub extraction_method: ExtractionMethod,
    pub template_id: Option<String>,
    pub match_score: Option<f64>,
    pub duration_ms: u64,
    pub ai_attempts: u32,
    pub line_count: u32,
    pub success: bool,
    pub ai_model: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogEntity {
    Product,
    Recipe,
    MenuItem,
}

impl CatalogEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogEntity::Product => "product",
            CatalogEntity::Recipe => "recipe",
            CatalogEntity::MenuItem => "menu_item",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "product" => Some(CatalogEntity::Product),
            "recipe" => Some(CatalogEntity::Recipe),
            "menu_item" => Some(CatalogEntity::MenuItem),
            _ => None,
        }
    }
}

/// One field-level catalog change caused by an approved invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationLogItem {
    pub id: String,
    pub log_id: String,
    pub entity_type: CatalogEntity,
    pub entity_id: String,
    pub entity_name: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationLog {
    pub id: String,
    pub invoice_id: String,
    pub tenant_id: String,
    pub created_at: String,
    pub items: Vec<IntegrationLogItem>,
}

// Catalog rows. The catalog itself is a collaborator of the pipeline; these
// are the minimal shapes the approval cascade touches.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub unit: Option<String>,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub tenant_id: String,
    pub recipe_id: String,
    pub name: String,
    pub price: Decimal,
    pub margin_pct: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_round_trip() {
        for status in [
            InvoiceStatus::Pending,
            InvoiceStatus::Processing,
            InvoiceStatus::Reviewing,
            InvoiceStatus::Approved,
            InvoiceStatus::Rejected,
            InvoiceStatus::Error,
        ] {
            assert_eq!(InvoiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InvoiceStatus::parse("bogus"), None);
    }

    #[test]
    fn settled_statuses_are_worker_terminal() {
        assert!(InvoiceStatus::Reviewing.is_settled());
        assert!(InvoiceStatus::Approved.is_settled());
        assert!(InvoiceStatus::Rejected.is_settled());
        assert!(!InvoiceStatus::Pending.is_settled());
        assert!(!InvoiceStatus::Processing.is_settled());
        assert!(!InvoiceStatus::Error.is_settled());
    }

    #[test]
    fn outcome_reports_method() {
        let outcome = ExtractionOutcome::Template {
            template_id: "t1".into(),
            match_score: 92.0,
            lines: vec![],
            partial_misses: 0,
        };
        assert_eq!(outcome.method(), ExtractionMethod::Template);
    }
}
