//! AI fallback extraction via the Gemini API.
//!
//! Invoked when no template matched confidently or zone extraction came up
//! short. Overloaded responses are retried in-call with exponential backoff;
//! rate limits and credential problems are surfaced as their own error
//! classes so the retry worker and operators can react differently.

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Settings;
use crate::error::PipelineError;
use crate::models::{ExtractedHeader, ExtractedLine};

#[derive(Debug, Clone)]
pub struct AiExtraction {
    pub header: ExtractedHeader,
    pub lines: Vec<ExtractedLine>,
    pub model: String,
    pub attempts: u32,
}

/// Failure carrying how many provider calls were made before giving up, so
/// the attempt count lands in the metric either way.
#[derive(Debug)]
pub struct AiFailure {
    pub attempts: u32,
    pub error: PipelineError,
}

pub type AiResult = std::result::Result<AiExtraction, AiFailure>;

#[async_trait]
pub trait AiExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> AiResult;
}

pub struct GeminiExtractor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_attempts: u32,
    backoff_ms: u64,
}

impl GeminiExtractor {
    pub fn new(settings: &Settings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.ai_timeout_secs))
            .build()
            .unwrap_or_default();
        GeminiExtractor {
            client,
            endpoint: settings.ai_endpoint.clone(),
            model: settings.ai_model.clone(),
            api_key: settings.ai_api_key.clone(),
            max_attempts: settings.ai_max_attempts.max(1),
            backoff_ms: settings.ai_backoff_ms,
        }
    }

    async fn call_model(&self, api_key: &str, text: &str) -> Result<String, PipelineError> {
        let url = format!("{}/{}:generateContent", self.endpoint, self.model);
        let request = json!({
            "contents": [{ "parts": [{ "text": build_prompt(text) }] }],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json"
            }
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let body: GenerateResponse = response.json().await?;
        let content = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| PipelineError::Validation("empty model response".into()))?;
        Ok(strip_code_fences(&content).to_string())
    }
}

#[async_trait]
impl AiExtractor for GeminiExtractor {
    async fn extract(&self, text: &str) -> AiResult {
        let api_key = match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => key,
            _ => {
                return Err(AiFailure {
                    attempts: 0,
                    error: PipelineError::Configuration("AI API key is not configured".into()),
                })
            }
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.call_model(api_key, text).await {
                Ok(raw) => {
                    return parse_extraction(&raw, &self.model, attempts)
                        .map_err(|error| AiFailure { attempts, error });
                }
                Err(err) => {
                    let retry_in_call = matches!(
                        err,
                        PipelineError::Overloaded(_) | PipelineError::Http(_)
                    );
                    if retry_in_call && attempts < self.max_attempts {
                        let backoff = backoff_delay(self.backoff_ms, attempts);
                        tracing::warn!(attempt = attempts, backoff_ms = backoff, "AI call failed transiently, backing off");
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                    return Err(AiFailure { attempts, error: err });
                }
            }
        }
    }
}

/// Exponential backoff, saturating so huge attempt limits cannot overflow.
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

fn classify_status(status: u16, body: &str) -> PipelineError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        503 => PipelineError::Overloaded(format!("HTTP 503: {snippet}")),
        429 => PipelineError::RateLimited(format!("HTTP 429: {snippet}")),
        400 | 401 | 403 => PipelineError::Configuration(format!("HTTP {status}: {snippet}")),
        500..=599 => PipelineError::Overloaded(format!("HTTP {status}: {snippet}")),
        _ => PipelineError::Other(format!("HTTP {status}: {snippet}")),
    }
}

fn parse_extraction(
    raw: &str,
    model: &str,
    attempts: u32,
) -> Result<AiExtraction, PipelineError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| PipelineError::Validation(format!("model returned invalid JSON: {e}")))?;

    let schema = extraction_schema();
    if !schema.is_valid(&value) {
        return Err(PipelineError::Validation(
            "model response does not match the extraction schema".into(),
        ));
    }

    let payload: ExtractionPayload = serde_json::from_value(value)?;
    if payload.lines.is_empty() {
        return Err(PipelineError::Validation(
            "model found no line items in the document".into(),
        ));
    }

    Ok(AiExtraction {
        header: ExtractedHeader {
            supplier_name: payload.supplier_name,
            supplier_tax_id: payload.supplier_tax_id,
            invoice_number: payload.invoice_number,
            invoice_date: crate::utils::normalize_date(payload.invoice_date),
            net_total: payload.net_total,
            tax_total: payload.tax_total,
            gross_total: payload.gross_total,
        },
        lines: payload.lines,
        model: model.to_string(),
        attempts,
    })
}

fn strip_code_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExtractionPayload {
    supplier_name: Option<String>,
    supplier_tax_id: Option<String>,
    invoice_number: Option<String>,
    invoice_date: Option<String>,
    net_total: Option<rust_decimal::Decimal>,
    tax_total: Option<rust_decimal::Decimal>,
    gross_total: Option<rust_decimal::Decimal>,
    lines: Vec<ExtractedLine>,
}

fn extraction_schema() -> JSONSchema {
    let schema = json!({
        "type": "object",
        "required": ["lines"],
        "properties": {
            "supplier_name": {"type": ["string", "null"]},
            "supplier_tax_id": {"type": ["string", "null"]},
            "invoice_number": {"type": ["string", "null"]},
            "invoice_date": {"type": ["string", "null"]},
            "net_total": {"type": ["number", "null"]},
            "tax_total": {"type": ["number", "null"]},
            "gross_total": {"type": ["number", "null"]},
            "lines": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["description", "quantity", "unit_price", "line_total"],
                    "properties": {
                        "description": {"type": "string"},
                        "quantity": {"type": "number"},
                        "unit": {"type": ["string", "null"]},
                        "unit_price": {"type": "number"},
                        "line_total": {"type": "number"}
                    }
                }
            }
        }
    });

    JSONSchema::compile(&schema).expect("invalid extraction schema")
}

fn build_prompt(text: &str) -> String {
    format!(
        r#"You are an invoice extraction system. Parse the supplier invoice text below and return JSON only, matching exactly:
{{
  "supplier_name": string|null,
  "supplier_tax_id": string|null,
  "invoice_number": string|null,
  "invoice_date": "YYYY-MM-DD"|null,
  "net_total": number|null,
  "tax_total": number|null,
  "gross_total": number|null,
  "lines": [
    {{"description": string, "quantity": number, "unit": string|null, "unit_price": number, "line_total": number}}
  ]
}}
Amounts use a dot as decimal separator. Do not invent line items.

Invoice text:
{text}"#
    )
}
