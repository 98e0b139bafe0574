//! Crash recovery for invoices stranded mid-flight.
//!
//! An invoice sitting in `pending` or `processing` past the stuck timeout
//! with no completion timestamp was orphaned by a crash or a lost job. The
//! sweep runs once at startup and then on an interval, resets such rows to
//! `pending` without spending retry budget, and re-queues them. The queue's
//! duplicate suppression keeps a recovered invoice from racing a live
//! attempt for the same id.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::services::queue::Job;
use crate::services::state::AppState;
use crate::utils::rfc3339_ago;

pub async fn run_recovery_worker(state: AppState) {
    sweep_and_log(&state);
    let interval = Duration::from_secs(state.settings.recovery_interval_secs);
    loop {
        tokio::time::sleep(interval).await;
        sweep_and_log(&state);
    }
}

fn sweep_and_log(state: &AppState) {
    match recover_stuck(state) {
        Ok(0) => {}
        Ok(count) => info!(count, "recovered stuck invoices"),
        Err(err) => warn!(error = %err, "recovery sweep failed"),
    }
}

/// One bounded sweep. A failure on one invoice is logged and the sweep
/// moves on; the next interval picks up whatever was left behind.
pub fn recover_stuck(state: &AppState) -> Result<u32> {
    let cutoff = rfc3339_ago(state.settings.stuck_timeout_secs);
    let stuck = state
        .db()?
        .find_stuck_invoices(&cutoff, state.settings.recovery_batch)?;

    let mut recovered = 0;
    for invoice in stuck {
        if let Err(err) = state.db()?.reset_to_pending(&invoice.id, false) {
            warn!(invoice_id = %invoice.id, error = %err, "failed to reset stuck invoice");
            continue;
        }
        if state.queue.enqueue(Job::new(invoice.id.clone())) {
            recovered += 1;
            info!(
                invoice_id = %invoice.id,
                status = invoice.status.as_str(),
                "re-queued stuck invoice"
            );
        }
    }
    Ok(recovered)
}
