//! Automatic retry of transiently failed invoices.
//!
//! Scans for `error` rows whose error code is transient, that have cooled
//! down and still have retry budget, and puts them back on the queue. A
//! permanent failure code or an exhausted budget leaves the row in `error`
//! for a human.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::services::queue::Job;
use crate::services::state::AppState;
use crate::utils::rfc3339_ago;

pub async fn run_retry_worker(state: AppState) {
    let interval = Duration::from_secs(state.settings.retry_interval_secs);
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = retry_sweep(&state) {
            warn!(error = %err, "retry sweep failed");
        }
    }
}

/// One pass. Returns how many invoices were re-queued.
pub fn retry_sweep(state: &AppState) -> Result<u32> {
    let cutoff = rfc3339_ago(state.settings.retry_cooldown_secs);
    let candidates = state.db()?.find_retryable_invoices(
        &cutoff,
        state.settings.max_retries,
        state.settings.recovery_batch,
    )?;

    let mut requeued = 0;
    for invoice in candidates {
        state.db()?.reset_to_pending(&invoice.id, true)?;
        if state.queue.enqueue(Job::new(invoice.id.clone())) {
            requeued += 1;
            info!(
                invoice_id = %invoice.id,
                retry = invoice.retry_count + 1,
                code = invoice.error_code.as_deref().unwrap_or(""),
                "re-queued transiently failed invoice"
            );
        }
    }
    Ok(requeued)
}
