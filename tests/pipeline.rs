//! End-to-end pipeline tests with a scripted AI extractor: submission,
//! template-first processing, AI fallback, retry and recovery behavior,
//! review decisions and the catalog cascade.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;

use invox::config::Settings;
use invox::db::Database;
use invox::models::{
    ExtractedHeader, ExtractedLine, ExtractionMethod, Invoice, InvoiceStatus,
};
use invox::services::gemini::{AiExtraction, AiExtractor, AiFailure, AiResult};
use invox::services::queue::{InMemoryQueue, Job};
use invox::services::recovery::recover_stuck;
use invox::services::retry::retry_sweep;
use invox::services::storage::LocalBlobStore;
use invox::services::submit::{approve_invoice, reject_invoice, retry_invoice, submit_invoice};
use invox::services::worker::process_invoice;
use invox::utils::rfc3339_ago;
use invox::{AppState, PipelineError};

const SAMPLE: &str = "\
MŁYN GDAŃSKI Sp. z o.o.
ul. Przemysłowa 4, 80-339 Gdańsk
NIP: 123-456-78-90
Faktura VAT nr FV/2025/08/113

Lp  Nazwa towaru        Ilość  Cena   Wartość
1   Mąka pszenna 25kg   4      89,50  358,00
2   Cukier 10kg         2      41,00  82,00

Razem netto: 440,00
";

enum Step {
    Succeed { attempts: u32 },
    Overloaded { attempts: u32 },
    Invalid,
}

struct ScriptedAi {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

impl ScriptedAi {
    fn new(steps: Vec<Step>) -> Self {
        ScriptedAi {
            script: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiExtractor for ScriptedAi {
    async fn extract(&self, _text: &str) -> AiResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed { attempts: 1 });
        match step {
            Step::Succeed { attempts } => Ok(AiExtraction {
                header: sample_header(),
                lines: sample_lines(),
                model: "stub-model".into(),
                attempts,
            }),
            Step::Overloaded { attempts } => Err(AiFailure {
                attempts,
                error: PipelineError::Overloaded("503 from provider".into()),
            }),
            Step::Invalid => Err(AiFailure {
                attempts: 1,
                error: PipelineError::Validation("model returned no line items".into()),
            }),
        }
    }
}

fn sample_header() -> ExtractedHeader {
    ExtractedHeader {
        supplier_name: Some("MŁYN GDAŃSKI Sp. z o.o.".into()),
        supplier_tax_id: Some("123-456-78-90".into()),
        invoice_number: Some("FV/2025/08/113".into()),
        invoice_date: Some("2025-08-12".into()),
        net_total: Some(Decimal::new(44000, 2)),
        tax_total: None,
        gross_total: None,
    }
}

fn sample_lines() -> Vec<ExtractedLine> {
    vec![
        ExtractedLine {
            description: "Mąka pszenna 25kg".into(),
            quantity: Decimal::new(4, 0),
            unit: None,
            unit_price: Decimal::new(8950, 2),
            line_total: Decimal::new(35800, 2),
        },
        ExtractedLine {
            description: "Cukier 10kg".into(),
            quantity: Decimal::new(2, 0),
            unit: None,
            unit_price: Decimal::new(4100, 2),
            line_total: Decimal::new(8200, 2),
        },
    ]
}

fn test_state(steps: Vec<Step>, dir: &tempfile::TempDir) -> (AppState, Arc<ScriptedAi>) {
    let mut settings = Settings::default();
    settings.retry_cooldown_secs = 0;
    let ai = Arc::new(ScriptedAi::new(steps));
    let state = AppState::with_parts(
        Database::in_memory().unwrap(),
        settings,
        Arc::new(InMemoryQueue::new()),
        Arc::new(LocalBlobStore::new(dir.path())),
        ai.clone(),
    );
    (state, ai)
}

/// Receives the next queued job, processes it and releases it, the way the
/// worker loop does.
async fn work_one(state: &AppState) -> String {
    let job = state.queue.recv().await.expect("queue has a job");
    let id = job.invoice_id.clone();
    process_invoice(state, &id).await.unwrap();
    state.queue.complete(&id);
    id
}

async fn submit_sample(state: &AppState) -> String {
    submit_invoice(state, "t1", "anna", "faktura.pdf", b"%PDF-1.4 stub", SAMPLE)
        .await
        .unwrap()
}

#[tokio::test]
async fn ai_fallback_learns_template_for_next_invoice() {
    let dir = tempfile::tempdir().unwrap();
    let (state, ai) = test_state(vec![Step::Succeed { attempts: 1 }], &dir);

    // No templates exist, so the first invoice goes through the AI.
    let first = submit_sample(&state).await;
    work_one(&state).await;

    let invoice = state.db().unwrap().get_invoice(&first).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Reviewing);
    assert_eq!(invoice.extraction_method, Some(ExtractionMethod::Ai));
    assert_eq!(invoice.net_total, Some(Decimal::new(44000, 2)));
    assert!(invoice.file_ref.starts_with("t1/"));
    assert_eq!(ai.calls(), 1);

    let lines = state.db().unwrap().get_lines(&first).unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].discount_pct, None);

    // Clean approval seeds a template for the supplier.
    approve_invoice(&state, &first, false).unwrap();
    assert_eq!(
        state.db().unwrap().get_invoice(&first).unwrap().unwrap().status,
        InvoiceStatus::Approved
    );
    assert_eq!(state.db().unwrap().active_templates("t1").unwrap().len(), 1);

    // The next identical invoice is handled by the template, no AI call.
    let second = submit_sample(&state).await;
    work_one(&state).await;

    let invoice = state.db().unwrap().get_invoice(&second).unwrap().unwrap();
    assert_eq!(invoice.extraction_method, Some(ExtractionMethod::Template));
    assert_eq!(ai.calls(), 1);

    let metrics = state.db().unwrap().metrics_for_invoice(&second).unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].extraction_method, ExtractionMethod::Template);
    assert!(metrics[0].template_id.is_some());
    assert!(metrics[0].match_score.unwrap() >= 80.0);
    assert_eq!(metrics[0].line_count, 2);
}

#[tokio::test]
async fn ai_attempt_count_lands_in_the_metric() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![Step::Succeed { attempts: 3 }], &dir);

    let id = submit_sample(&state).await;
    work_one(&state).await;

    let metrics = state.db().unwrap().metrics_for_invoice(&id).unwrap();
    assert_eq!(metrics.len(), 1);
    assert!(metrics[0].success);
    assert_eq!(metrics[0].ai_attempts, 3);
    assert_eq!(metrics[0].ai_model.as_deref(), Some("stub-model"));
}

#[tokio::test]
async fn transient_failure_is_retried_automatically() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(
        vec![Step::Overloaded { attempts: 3 }, Step::Succeed { attempts: 1 }],
        &dir,
    );

    let id = submit_sample(&state).await;
    work_one(&state).await;

    let invoice = state.db().unwrap().get_invoice(&id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Error);
    assert_eq!(invoice.error_code.as_deref(), Some("overloaded"));
    assert!(invoice.error_message.unwrap().contains("retried automatically"));

    let metrics = state.db().unwrap().metrics_for_invoice(&id).unwrap();
    assert_eq!(metrics.len(), 1);
    assert!(!metrics[0].success);
    assert_eq!(metrics[0].ai_attempts, 3);

    // Cooldown is zero in tests; let the clock tick past updated_at.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(retry_sweep(&state).unwrap(), 1);

    let invoice = state.db().unwrap().get_invoice(&id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.retry_count, 1);

    work_one(&state).await;
    let invoice = state.db().unwrap().get_invoice(&id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Reviewing);
    assert_eq!(
        state.db().unwrap().metrics_for_invoice(&id).unwrap().len(),
        2
    );
}

#[tokio::test]
async fn permanent_failure_waits_for_a_human() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![Step::Invalid, Step::Succeed { attempts: 1 }], &dir);

    let id = submit_sample(&state).await;
    work_one(&state).await;

    let invoice = state.db().unwrap().get_invoice(&id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Error);
    assert_eq!(invoice.error_code.as_deref(), Some("validation"));

    // Validation failures are not transient; the sweep leaves them alone.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(retry_sweep(&state).unwrap(), 0);

    // A manual retry resets the budget and requeues regardless of code.
    retry_invoice(&state, &id).unwrap();
    let invoice = state.db().unwrap().get_invoice(&id).unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.retry_count, 0);

    work_one(&state).await;
    assert_eq!(
        state.db().unwrap().get_invoice(&id).unwrap().unwrap().status,
        InvoiceStatus::Reviewing
    );
}

#[tokio::test]
async fn redelivered_job_for_settled_invoice_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![Step::Succeed { attempts: 1 }], &dir);

    let id = submit_sample(&state).await;
    work_one(&state).await;
    assert_eq!(
        state.db().unwrap().get_invoice(&id).unwrap().unwrap().status,
        InvoiceStatus::Reviewing
    );

    process_invoice(&state, &id).await.unwrap();
    assert_eq!(state.db().unwrap().metrics_for_invoice(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn recovery_requeues_stuck_invoices_once() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![], &dir);

    // An invoice orphaned mid-processing by a crash an hour ago.
    let stale = rfc3339_ago(3600);
    let invoice = Invoice {
        id: "stuck-1".into(),
        tenant_id: "t1".into(),
        uploaded_by: "anna".into(),
        file_ref: "t1/ab/cd-faktura.pdf".into(),
        ocr_text: Some(SAMPLE.into()),
        supplier_name: None,
        supplier_tax_id: None,
        invoice_number: None,
        invoice_date: None,
        net_total: None,
        tax_total: None,
        gross_total: None,
        status: InvoiceStatus::Processing,
        error_message: None,
        error_code: None,
        review_warnings: None,
        retry_count: 0,
        extraction_method: None,
        processed_at: None,
        created_at: stale.clone(),
        updated_at: stale,
    };
    state.db().unwrap().insert_invoice(&invoice).unwrap();

    assert_eq!(recover_stuck(&state).unwrap(), 1);
    let invoice = state.db().unwrap().get_invoice("stuck-1").unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.retry_count, 0);

    // The reset refreshed updated_at, so the next sweep finds nothing, and
    // the queue suppresses a duplicate while the job is in flight.
    assert_eq!(recover_stuck(&state).unwrap(), 0);
    assert!(!state.queue.enqueue(Job::new("stuck-1")));

    work_one(&state).await;
    assert_eq!(
        state.db().unwrap().get_invoice("stuck-1").unwrap().unwrap().status,
        InvoiceStatus::Reviewing
    );
}

#[tokio::test]
async fn submission_rejects_unusable_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![], &dir);

    let err = submit_invoice(&state, "t1", "anna", "a.pdf", b"", SAMPLE)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_input");

    let err = submit_invoice(&state, "t1", "anna", "a.pdf", b"%PDF", "\n \u{c} \n")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_input");
}

#[tokio::test]
async fn review_decisions_require_the_reviewing_status() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![Step::Succeed { attempts: 1 }], &dir);

    let id = submit_sample(&state).await;
    // Still pending: neither decision is allowed yet.
    assert_eq!(approve_invoice(&state, &id, false).unwrap_err().code(), "validation");
    assert_eq!(reject_invoice(&state, &id).unwrap_err().code(), "validation");

    work_one(&state).await;
    reject_invoice(&state, &id).unwrap();
    assert_eq!(
        state.db().unwrap().get_invoice(&id).unwrap().unwrap().status,
        InvoiceStatus::Rejected
    );
    // Rejection teaches nothing.
    assert!(state.db().unwrap().active_templates("t1").unwrap().is_empty());
}

#[tokio::test]
async fn corrected_approval_withholds_template_learning() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![Step::Succeed { attempts: 1 }], &dir);

    let id = submit_sample(&state).await;
    work_one(&state).await;
    approve_invoice(&state, &id, true).unwrap();

    assert_eq!(
        state.db().unwrap().get_invoice(&id).unwrap().unwrap().status,
        InvoiceStatus::Approved
    );
    assert!(state.db().unwrap().active_templates("t1").unwrap().is_empty());
}

#[tokio::test]
async fn discount_and_header_warnings_reach_the_reviewer() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _ai) = test_state(vec![], &dir);

    // Scripted extraction where line 1's stated total sits well under
    // qty × price and the declared net total disagrees with the line sum.
    struct DiscountAi;
    #[async_trait]
    impl AiExtractor for DiscountAi {
        async fn extract(&self, _text: &str) -> AiResult {
            let mut lines = sample_lines();
            lines[0].line_total = Decimal::new(32220, 2); // 358.00 → 322.20
            let mut header = sample_header();
            header.net_total = Some(Decimal::new(50000, 2));
            Ok(AiExtraction {
                header,
                lines,
                model: "stub-model".into(),
                attempts: 1,
            })
        }
    }

    let state = AppState::with_parts(
        Database::in_memory().unwrap(),
        Settings::default(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(LocalBlobStore::new(dir.path())),
        Arc::new(DiscountAi),
    );

    let id = submit_sample(&state).await;
    work_one(&state).await;

    let invoice = state.db().unwrap().get_invoice(&id).unwrap().unwrap();
    // Warnings never fail the invoice.
    assert_eq!(invoice.status, InvoiceStatus::Reviewing);
    let warnings = invoice.review_warnings.unwrap();
    assert!(warnings.contains("deviates"));
    assert!(warnings.contains("declared net total"));

    let lines = state.db().unwrap().get_lines(&id).unwrap();
    assert_eq!(lines[0].discount_pct, Some(Decimal::new(1111, 2)));
    assert_eq!(lines[0].line_total, Decimal::new(32220, 2));
    assert_eq!(lines[1].discount_pct, None);
}
