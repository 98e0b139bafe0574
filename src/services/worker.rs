//! The processing worker: template-first extraction with AI fallback.
//!
//! Each job goes through the same gauntlet: claim the invoice, match a
//! template, run zone extraction, fall back to the AI when the template
//! path is absent or comes up short, reconcile, persist, and hand the
//! invoice to review. Every attempt that actually claims the invoice
//! leaves exactly one `ProcessingMetric` behind, success or failure.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{
    ExtractedHeader, ExtractionMethod, ExtractionOutcome, Invoice, ProcessingMetric,
};
use crate::services::fingerprint::{
    best_match, compute_fingerprint, probe_supplier, probe_totals,
};
use crate::services::learning;
use crate::services::reconcile::reconcile;
use crate::services::state::AppState;
use crate::services::zones::extract_lines;
use crate::utils::now_rfc3339;

pub async fn run_worker(state: AppState) {
    while let Some(job) = state.queue.recv().await {
        let invoice_id = job.invoice_id;
        if let Err(err) = process_invoice(&state, &invoice_id).await {
            error!(invoice_id, error = %err, "processing attempt aborted");
        }
        state.queue.complete(&invoice_id);
    }
}

/// One processing attempt. Settled invoices and invoices claimed by a
/// concurrent worker are skipped without a metric; an attempt that claims
/// the row always records one.
pub async fn process_invoice(state: &AppState, invoice_id: &str) -> Result<()> {
    let Some(invoice) = state.db()?.get_invoice(invoice_id)? else {
        warn!(invoice_id, "job references an unknown invoice, dropping");
        return Ok(());
    };
    if invoice.status.is_settled() {
        debug!(
            invoice_id,
            status = invoice.status.as_str(),
            "invoice already settled, nothing to do"
        );
        return Ok(());
    }
    if !state.db()?.try_mark_processing(invoice_id)? {
        debug!(invoice_id, "invoice claimed elsewhere, skipping");
        return Ok(());
    }

    let started = Instant::now();
    let mut attempt = Attempt::default();

    match extract(state, &invoice, &mut attempt).await {
        Ok((outcome, header)) => {
            let line_count = persist_success(state, &invoice, &outcome, &header)?;
            record_metric(state, invoice_id, outcome.method(), &attempt, started, line_count, true)?;
            info!(
                invoice_id,
                method = outcome.method().as_str(),
                line_count,
                "invoice extracted, awaiting review"
            );
        }
        Err(err) => {
            state
                .db()?
                .mark_error(invoice_id, &err.user_message(), err.code())?;
            record_metric(state, invoice_id, ExtractionMethod::Ai, &attempt, started, 0, false)?;
            warn!(
                invoice_id,
                code = err.code(),
                transient = err.is_transient(),
                error = %err,
                "invoice processing failed"
            );
        }
    }
    Ok(())
}

/// Carries what the attempt learned along the way, so the metric is
/// complete even when the attempt dies halfway.
#[derive(Default)]
struct Attempt {
    template_id: Option<String>,
    match_score: Option<f64>,
    ai_attempts: u32,
    ai_model: Option<String>,
}

async fn extract(
    state: &AppState,
    invoice: &Invoice,
    attempt: &mut Attempt,
) -> Result<(ExtractionOutcome, ExtractedHeader)> {
    let text = invoice
        .ocr_text
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| PipelineError::BadInput("document text is empty".to_string()))?;

    let probe = probe_supplier(text);
    let fingerprint = compute_fingerprint(text);
    let totals = probe_totals(text);

    let candidates = state.db()?.active_templates(&invoice.tenant_id)?;
    let matched = best_match(&probe, &fingerprint, candidates)
        .filter(|m| m.score >= state.settings.match_threshold);

    if let Some(m) = matched {
        attempt.template_id = Some(m.template.id.clone());
        attempt.match_score = Some(m.score);
        learning::record_use(&*state.db()?, &m.template.id)?;

        let extraction = extract_lines(text, &m.template.zones)?;
        let attempted = extraction.lines.len() as f64 + extraction.partial_misses as f64;
        let coverage = if attempted == 0.0 {
            0.0
        } else {
            extraction.lines.len() as f64 / attempted
        };

        if !extraction.lines.is_empty() && coverage >= state.settings.min_zone_coverage {
            debug!(
                invoice_id = %invoice.id,
                template_id = %m.template.id,
                score = m.score,
                coverage,
                "template extraction accepted"
            );
            let header = ExtractedHeader {
                supplier_name: probe.name.clone(),
                supplier_tax_id: probe.tax_id.clone(),
                invoice_number: invoice.invoice_number.clone(),
                invoice_date: invoice.invoice_date.clone(),
                net_total: totals.net,
                tax_total: totals.tax,
                gross_total: totals.gross,
            };
            return Ok((
                ExtractionOutcome::Template {
                    template_id: m.template.id,
                    match_score: m.score,
                    lines: extraction.lines,
                    partial_misses: extraction.partial_misses,
                },
                header,
            ));
        }

        debug!(
            invoice_id = %invoice.id,
            template_id = %m.template.id,
            coverage,
            misses = extraction.partial_misses,
            "zone coverage too low, falling back to AI"
        );
    }

    match state.ai.extract(text).await {
        Ok(ai) => {
            attempt.ai_attempts = ai.attempts;
            attempt.ai_model = Some(ai.model.clone());
            let header = ai.header.clone();
            Ok((
                ExtractionOutcome::Ai {
                    model: ai.model,
                    attempts: ai.attempts,
                    header: ai.header,
                    lines: ai.lines,
                },
                header,
            ))
        }
        Err(failure) => {
            attempt.ai_attempts = failure.attempts;
            Err(failure.error)
        }
    }
}

/// Reconcile, write lines and header, move to `reviewing`. Returns the
/// number of persisted lines.
fn persist_success(
    state: &AppState,
    invoice: &Invoice,
    outcome: &ExtractionOutcome,
    header: &ExtractedHeader,
) -> Result<u32> {
    let report = reconcile(
        &invoice.id,
        outcome.lines(),
        header.net_total,
        state.settings.line_tolerance,
        state.settings.header_tolerance,
    );

    let mut updated = invoice.clone();
    updated.supplier_name = header.supplier_name.clone().or(updated.supplier_name);
    updated.supplier_tax_id = header.supplier_tax_id.clone().or(updated.supplier_tax_id);
    updated.invoice_number = header.invoice_number.clone().or(updated.invoice_number);
    updated.invoice_date = header.invoice_date.clone().or(updated.invoice_date);
    updated.net_total = header.net_total.or(updated.net_total);
    updated.tax_total = header.tax_total.or(updated.tax_total);
    updated.gross_total = header.gross_total.or(updated.gross_total);

    let warnings = if report.warnings.is_empty() {
        None
    } else {
        Some(report.warnings.join("\n"))
    };

    let mut db = state.db()?;
    db.replace_lines(&invoice.id, &report.lines)?;
    db.update_invoice_header(&updated)?;
    db.mark_reviewing(&invoice.id, outcome.method(), warnings.as_deref())?;
    Ok(report.lines.len() as u32)
}

fn record_metric(
    state: &AppState,
    invoice_id: &str,
    method: ExtractionMethod,
    attempt: &Attempt,
    started: Instant,
    line_count: u32,
    success: bool,
) -> Result<()> {
    let metric = ProcessingMetric {
        id: uuid::Uuid::new_v4().to_string(),
        invoice_id: invoice_id.to_string(),
        extraction_method: method,
        template_id: attempt.template_id.clone(),
        match_score: attempt.match_score,
        duration_ms: started.elapsed().as_millis() as u64,
        ai_attempts: attempt.ai_attempts,
        line_count,
        success,
        ai_model: attempt.ai_model.clone(),
        created_at: now_rfc3339(),
    };
    state.db()?.insert_metric(&metric)?;
    Ok(())
}
