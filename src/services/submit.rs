//! Inbound surface: submission, review decisions and manual retry.
//!
//! These are plain library functions so any transport (CLI, HTTP, tests)
//! can drive the pipeline. Submission stores the original file, creates the
//! `pending` row and enqueues; review decisions gate the only transitions a
//! human owns.

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{Invoice, InvoiceStatus};
use crate::services::catalog;
use crate::services::learning;
use crate::services::queue::Job;
use crate::services::state::AppState;
use crate::utils::now_rfc3339;

/// Uploads above this size are rejected outright.
const MAX_FILE_BYTES: usize = 20 * 1024 * 1024;

pub async fn submit_invoice(
    state: &AppState,
    tenant_id: &str,
    uploaded_by: &str,
    filename: &str,
    bytes: &[u8],
    ocr_text: &str,
) -> Result<String> {
    if bytes.is_empty() {
        return Err(PipelineError::BadInput("uploaded file is empty".to_string()));
    }
    if bytes.len() > MAX_FILE_BYTES {
        return Err(PipelineError::BadInput(format!(
            "uploaded file exceeds {} MB",
            MAX_FILE_BYTES / 1024 / 1024
        )));
    }
    if tenant_id.trim().is_empty() {
        return Err(PipelineError::BadInput("tenant id is required".to_string()));
    }
    if !ocr_text.chars().any(|c| c.is_alphanumeric()) {
        return Err(PipelineError::BadInput(
            "document text contains no readable content".to_string(),
        ));
    }

    let file_ref = state.store.put(tenant_id, filename, bytes).await?;
    let now = now_rfc3339();
    let invoice = Invoice {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant_id.to_string(),
        uploaded_by: uploaded_by.to_string(),
        file_ref,
        ocr_text: Some(ocr_text.to_string()),
        supplier_name: None,
        supplier_tax_id: None,
        invoice_number: None,
        invoice_date: None,
        net_total: None,
        tax_total: None,
        gross_total: None,
        status: InvoiceStatus::Pending,
        error_message: None,
        error_code: None,
        review_warnings: None,
        retry_count: 0,
        extraction_method: None,
        processed_at: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.db()?.insert_invoice(&invoice)?;
    state.queue.enqueue(Job::new(invoice.id.clone()));
    info!(
        invoice_id = %invoice.id,
        tenant_id,
        uploaded_by,
        filename,
        "invoice submitted"
    );
    Ok(invoice.id)
}

/// `reviewing → approved`. `corrected` means the reviewer edited the lines
/// before approving, which withholds template success credit and template
/// learning. Catalog propagation failures are logged and never undo the
/// approval.
pub fn approve_invoice(state: &AppState, invoice_id: &str, corrected: bool) -> Result<()> {
    let invoice = expect_status(state, invoice_id, InvoiceStatus::Reviewing)?;
    state.db()?.mark_reviewed(invoice_id, InvoiceStatus::Approved)?;
    let mut approved = invoice;
    approved.status = InvoiceStatus::Approved;

    let template_id = last_template_id(state, invoice_id)?;
    if let Err(err) = learning::record_approval(
        &*state.db()?,
        &approved,
        template_id.as_deref(),
        corrected,
        &state.settings,
    ) {
        warn!(invoice_id, error = %err, "template bookkeeping failed on approval");
    }

    let lines = state.db()?.get_lines(invoice_id)?;
    if let Err(err) = catalog::apply_approval(&mut *state.db()?, &approved, &lines) {
        warn!(invoice_id, error = %err, "catalog propagation failed, approval stands");
    }

    info!(invoice_id, corrected, "invoice approved");
    Ok(())
}

/// `reviewing → rejected`. No learning, no catalog changes.
pub fn reject_invoice(state: &AppState, invoice_id: &str) -> Result<()> {
    expect_status(state, invoice_id, InvoiceStatus::Reviewing)?;
    state.db()?.mark_reviewed(invoice_id, InvoiceStatus::Rejected)?;
    info!(invoice_id, "invoice rejected");
    Ok(())
}

/// Operator-driven retry of a failed invoice: resets the retry budget and
/// re-enqueues regardless of the error code.
pub fn retry_invoice(state: &AppState, invoice_id: &str) -> Result<()> {
    expect_status(state, invoice_id, InvoiceStatus::Error)?;
    let db = state.db()?;
    db.clear_retry_count(invoice_id)?;
    db.reset_to_pending(invoice_id, false)?;
    drop(db);
    state.queue.enqueue(Job::new(invoice_id.to_string()));
    info!(invoice_id, "invoice manually re-queued");
    Ok(())
}

fn expect_status(state: &AppState, invoice_id: &str, expected: InvoiceStatus) -> Result<Invoice> {
    let invoice = state
        .db()?
        .get_invoice(invoice_id)?
        .ok_or_else(|| PipelineError::BadInput(format!("unknown invoice {invoice_id}")))?;
    if invoice.status != expected {
        return Err(PipelineError::Validation(format!(
            "invoice {} is {}, expected {}",
            invoice_id,
            invoice.status.as_str(),
            expected.as_str()
        )));
    }
    Ok(invoice)
}

/// Template that produced the invoice's current extraction, read from the
/// most recent successful metric.
fn last_template_id(state: &AppState, invoice_id: &str) -> Result<Option<String>> {
    let metrics = state.db()?.metrics_for_invoice(invoice_id)?;
    Ok(metrics
        .into_iter()
        .rev()
        .find(|m| m.success)
        .and_then(|m| m.template_id))
}
