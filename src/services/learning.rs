//! Template statistics and lifecycle.
//!
//! Usage is counted at match time, success only when a reviewer approves
//! the invoice without touching its lines. Approval of an AI-extracted
//! invoice seeds a brand-new template from that document's layout. A
//! template that keeps failing is deactivated so the matcher stops
//! proposing it; it is never deleted.

use tracing::info;

use crate::config::Settings;
use crate::db::Database;
use crate::error::Result;
use crate::models::{ExtractionMethod, Invoice, Template};
use crate::services::fingerprint::compute_fingerprint;
use crate::services::zones::default_zone_config;
use crate::utils::now_rfc3339;

/// Counted once per processing attempt that used the template.
pub fn record_use(db: &Database, template_id: &str) -> Result<()> {
    db.record_template_use(template_id)?;
    Ok(())
}

/// Reviewer approved the invoice. `corrected` means the reviewer edited the
/// extracted lines first, which withholds the success credit.
pub fn record_approval(
    db: &Database,
    invoice: &Invoice,
    template_id: Option<&str>,
    corrected: bool,
    settings: &Settings,
) -> Result<()> {
    match invoice.extraction_method {
        Some(ExtractionMethod::Template) => {
            if let Some(id) = template_id {
                if !corrected {
                    db.record_template_success(id)?;
                }
                review_health(db, id, settings)?;
            }
        }
        Some(ExtractionMethod::Ai) => {
            if !corrected {
                learn_template(db, invoice)?;
            }
        }
        Some(ExtractionMethod::Manual) | None => {}
    }
    Ok(())
}

/// Deactivate once the sample is large enough and the success rate sits
/// below the floor.
pub fn review_health(db: &Database, template_id: &str, settings: &Settings) -> Result<()> {
    let Some(template) = db.get_template(template_id)? else {
        return Ok(());
    };
    if template.active
        && template.times_used >= settings.learning_min_samples
        && template.confidence < settings.deactivate_floor
    {
        info!(
            template_id,
            uses = template.times_used,
            confidence = template.confidence,
            "deactivating underperforming template"
        );
        db.deactivate_template(template_id)?;
    }
    Ok(())
}

/// Seed a new template from an approved AI extraction: the invoice's own
/// layout becomes the fingerprint, zones start from the stock line pattern.
fn learn_template(db: &Database, invoice: &Invoice) -> Result<()> {
    let Some(text) = invoice.ocr_text.as_deref() else {
        return Ok(());
    };
    let Some(supplier_name) = invoice.supplier_name.clone() else {
        return Ok(());
    };

    let version = db.latest_template_version(&invoice.tenant_id, &supplier_name)? + 1;
    let now = now_rfc3339();
    let template = Template {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: invoice.tenant_id.clone(),
        supplier_tax_id: invoice.supplier_tax_id.clone(),
        supplier_name,
        fingerprint: compute_fingerprint(text),
        zones: default_zone_config(),
        version,
        times_used: 1,
        times_successful: 1,
        confidence: 100.0,
        active: true,
        created_at: now.clone(),
        updated_at: now,
    };
    info!(
        template_id = %template.id,
        tenant_id = %template.tenant_id,
        supplier = %template.supplier_name,
        version,
        "learned new extraction template from approved invoice"
    );
    db.insert_template(&template)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceStatus;
    use pretty_assertions::assert_eq;

    fn approved_ai_invoice() -> Invoice {
        let now = now_rfc3339();
        Invoice {
            id: "inv1".into(),
            tenant_id: "t1".into(),
            uploaded_by: "u1".into(),
            file_ref: "t1/ab/abcd-x.pdf".into(),
            ocr_text: Some("NOWY DOSTAWCA SA\nNIP: 555-666-77-88\nFaktura 9/2025\n1  Towar  2  10,00  20,00\n".into()),
            supplier_name: Some("Nowy Dostawca SA".into()),
            supplier_tax_id: Some("5556667788".into()),
            invoice_number: Some("9/2025".into()),
            invoice_date: None,
            net_total: None,
            tax_total: None,
            gross_total: None,
            status: InvoiceStatus::Approved,
            error_message: None,
            error_code: None,
            review_warnings: None,
            retry_count: 0,
            extraction_method: Some(ExtractionMethod::Ai),
            processed_at: Some(now.clone()),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn ai_approval_creates_seeded_template() {
        let db = Database::in_memory().unwrap();
        let settings = Settings::default();
        let invoice = approved_ai_invoice();
        db.insert_invoice(&invoice).unwrap();

        record_approval(&db, &invoice, None, false, &settings).unwrap();

        let templates = db.active_templates("t1").unwrap();
        assert_eq!(templates.len(), 1);
        let tpl = &templates[0];
        assert_eq!(tpl.times_used, 1);
        assert_eq!(tpl.times_successful, 1);
        assert_eq!(tpl.confidence, 100.0);
        assert_eq!(tpl.version, 1);
        assert_eq!(tpl.supplier_tax_id.as_deref(), Some("5556667788"));
    }

    #[test]
    fn corrected_ai_approval_learns_nothing() {
        let db = Database::in_memory().unwrap();
        let settings = Settings::default();
        let invoice = approved_ai_invoice();
        db.insert_invoice(&invoice).unwrap();

        record_approval(&db, &invoice, None, true, &settings).unwrap();
        assert!(db.active_templates("t1").unwrap().is_empty());
    }

    #[test]
    fn repeated_learning_bumps_version() {
        let db = Database::in_memory().unwrap();
        let settings = Settings::default();
        let invoice = approved_ai_invoice();
        db.insert_invoice(&invoice).unwrap();

        record_approval(&db, &invoice, None, false, &settings).unwrap();
        record_approval(&db, &invoice, None, false, &settings).unwrap();

        let mut versions: Vec<u32> = db
            .active_templates("t1")
            .unwrap()
            .iter()
            .map(|t| t.version)
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn collapsed_success_rate_deactivates() {
        let db = Database::in_memory().unwrap();
        let settings = Settings::default();
        let invoice = approved_ai_invoice();
        db.insert_invoice(&invoice).unwrap();
        record_approval(&db, &invoice, None, false, &settings).unwrap();
        let template_id = db.active_templates("t1").unwrap()[0].id.clone();

        // One early success, then a long run of failed uses.
        for _ in 0..5 {
            record_use(&db, &template_id).unwrap();
        }
        review_health(&db, &template_id, &settings).unwrap();

        assert!(db.active_templates("t1").unwrap().is_empty());
        let tpl = db.get_template(&template_id).unwrap().unwrap();
        assert!(!tpl.active);
        assert_eq!(tpl.times_successful, 1);
    }

    #[test]
    fn healthy_template_stays_active() {
        let db = Database::in_memory().unwrap();
        let settings = Settings::default();
        let invoice = approved_ai_invoice();
        db.insert_invoice(&invoice).unwrap();
        record_approval(&db, &invoice, None, false, &settings).unwrap();
        let template_id = db.active_templates("t1").unwrap()[0].id.clone();

        for _ in 0..4 {
            record_use(&db, &template_id).unwrap();
            db.record_template_success(&template_id).unwrap();
        }
        review_health(&db, &template_id, &settings).unwrap();
        assert_eq!(db.active_templates("t1").unwrap().len(), 1);
    }
}
