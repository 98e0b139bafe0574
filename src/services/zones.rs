//! Deterministic line-item extraction from a matched template's zones.
//!
//! A template carries one line pattern (regex with named captures) and a
//! zone list mapping captures to line-item fields. Lines that match the
//! pattern but fail a required zone are dropped, not fabricated; the drop
//! count is reported so the caller can judge extraction coverage. Falling
//! back to the AI is the worker's decision, never this module's.

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::{PipelineError, Result};
use crate::models::{ExtractedLine, LineField, ZoneConfig};
use crate::utils::{parse_amount, parse_quantity};

#[derive(Debug, Clone)]
pub struct ZoneExtraction {
    pub lines: Vec<ExtractedLine>,
    /// Candidate lines dropped because a required zone failed to parse.
    pub partial_misses: u32,
}

pub fn extract_lines(text: &str, config: &ZoneConfig) -> Result<ZoneExtraction> {
    let pattern = Regex::new(&config.line_pattern).map_err(|e| {
        PipelineError::Validation(format!("template line pattern is invalid: {e}"))
    })?;

    let mut lines = Vec::new();
    let mut partial_misses = 0u32;

    for raw_line in text.lines() {
        let Some(caps) = pattern.captures(raw_line.trim_end()) else {
            continue;
        };

        match build_line(&caps, config) {
            Some(line) => lines.push(line),
            None => partial_misses += 1,
        }
    }

    Ok(ZoneExtraction { lines, partial_misses })
}

fn build_line(caps: &regex::Captures<'_>, config: &ZoneConfig) -> Option<ExtractedLine> {
    let mut description: Option<String> = None;
    let mut quantity: Option<Decimal> = None;
    let mut unit: Option<String> = None;
    let mut unit_price: Option<Decimal> = None;
    let mut line_total: Option<Decimal> = None;

    for zone in &config.zones {
        let raw = caps.name(&zone.capture).map(|m| m.as_str().trim());
        let parsed = match (zone.field, raw) {
            (LineField::Description, Some(v)) if !v.is_empty() => {
                description = Some(v.to_string());
                true
            }
            (LineField::Quantity, Some(v)) => match parse_quantity(v) {
                Some(q) => {
                    quantity = Some(q);
                    true
                }
                None => false,
            },
            (LineField::Unit, Some(v)) if !v.is_empty() => {
                unit = Some(v.to_string());
                true
            }
            (LineField::UnitPrice, Some(v)) => match parse_amount(v) {
                Some(p) => {
                    unit_price = Some(p);
                    true
                }
                None => false,
            },
            (LineField::LineTotal, Some(v)) => match parse_amount(v) {
                Some(t) => {
                    line_total = Some(t);
                    true
                }
                None => false,
            },
            _ => false,
        };

        if zone.required && !parsed {
            return None;
        }
    }

    Some(ExtractedLine {
        description: description?,
        quantity: quantity?,
        unit,
        unit_price: unit_price?,
        line_total: line_total?,
    })
}

/// Default zone configuration for newly learned templates: a numbered item
/// row with quantity, unit price and total as the trailing numeric columns.
pub fn default_zone_config() -> ZoneConfig {
    ZoneConfig {
        line_pattern: r"^\s*\d+\s+(?P<desc>\S.*?\S)\s+(?P<qty>[\d\s]+(?:[.,]\d+)?)\s+(?P<price>[\d\s]+[.,]\d{2})\s+(?P<total>[\d\s]+[.,]\d{2})\s*$".to_string(),
        zones: vec![
            zone(LineField::Description, "desc", true),
            zone(LineField::Quantity, "qty", true),
            zone(LineField::UnitPrice, "price", true),
            zone(LineField::LineTotal, "total", true),
        ],
    }
}

fn zone(field: LineField, capture: &str, required: bool) -> crate::models::Zone {
    crate::models::Zone {
        field,
        capture: capture.to_string(),
        required,
    }
}
