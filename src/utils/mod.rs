use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::str::FromStr;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn rfc3339_ago(seconds: i64) -> String {
    (Utc::now() - Duration::seconds(seconds)).to_rfc3339()
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Parse an amount as it appears on invoices: comma or dot decimal
/// separator, optional thousands spacing.
pub fn parse_amount(value: &str) -> Option<Decimal> {
    let cleaned = value
        .trim()
        .replace([' ', '\u{00a0}'], "")
        .replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

pub fn parse_quantity(value: &str) -> Option<Decimal> {
    parse_amount(value)
}

/// Normalize various date notations to YYYY-MM-DD; unknown formats are kept
/// as-is rather than dropped.
pub fn normalize_date(value: Option<String>) -> Option<String> {
    let raw = value?.trim().to_string();
    if raw.is_empty() {
        return None;
    }

    let formats = ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d", "%Y.%m.%d"];
    for fmt in formats.iter() {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    Some(raw)
}

/// Case- and diacritic-insensitive supplier name key. Used when a supplier
/// has no tax id on file and the matcher has to fall back to the name.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter_map(fold_diacritic)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn fold_diacritic(c: char) -> Option<char> {
    let folded = match c {
        'ą' => 'a',
        'ć' => 'c',
        'ę' => 'e',
        'ł' => 'l',
        'ń' => 'n',
        'ó' | 'ö' | 'ô' | 'ò' => 'o',
        'ś' => 's',
        'ź' | 'ż' => 'z',
        'ä' | 'á' | 'à' | 'â' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ü' | 'ú' | 'ù' | 'û' => 'u',
        'ß' => 's',
        'ç' => 'c',
        c if c.is_alphanumeric() || c.is_whitespace() => c,
        _ => return None,
    };
    Some(folded)
}

/// Tax id comparison key: digits only, so "PL 123-456-78-90" equals
/// "1234567890".
pub fn normalize_tax_id(tax_id: &str) -> String {
    tax_id.chars().filter(|c| c.is_ascii_digit()).collect()
}
