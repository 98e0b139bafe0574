use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;

use crate::models::{
    CatalogEntity, ExtractionMethod, Fingerprint, IntegrationLog, IntegrationLogItem, Invoice,
    InvoiceLine, InvoiceStatus, MenuItem, ProcessingMetric, Product, Recipe, Template, ZoneConfig,
};
use crate::error::PipelineError;
use crate::utils::now_rfc3339;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(db_path: PathBuf) -> SqlResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> SqlResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![
            (
                "001_create_invoices.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/001_create_invoices.sql"
                )),
            ),
            (
                "002_create_templates_and_metrics.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_templates_and_metrics.sql"
                )),
            ),
            (
                "003_create_catalog_and_integration_log.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/003_create_catalog_and_integration_log.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Invoices

    pub fn insert_invoice(&self, invoice: &Invoice) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO invoices (
                id, tenant_id, uploaded_by, file_ref, ocr_text, supplier_name, supplier_tax_id,
                invoice_number, invoice_date, net_total, tax_total, gross_total,
                status, error_message, error_code, review_warnings, retry_count, extraction_method,
                processed_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                invoice.id,
                invoice.tenant_id,
                invoice.uploaded_by,
                invoice.file_ref,
                invoice.ocr_text,
                invoice.supplier_name,
                invoice.supplier_tax_id,
                invoice.invoice_number,
                invoice.invoice_date,
                invoice.net_total.map(|d| d.to_string()),
                invoice.tax_total.map(|d| d.to_string()),
                invoice.gross_total.map(|d| d.to_string()),
                invoice.status.as_str(),
                invoice.error_message,
                invoice.error_code,
                invoice.review_warnings,
                invoice.retry_count,
                invoice.extraction_method.map(|m| m.as_str()),
                invoice.processed_at,
                invoice.created_at,
                invoice.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_invoice(&self, id: &str) -> SqlResult<Option<Invoice>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, uploaded_by, file_ref, ocr_text, supplier_name, supplier_tax_id,
                    invoice_number, invoice_date, net_total, tax_total, gross_total,
                    status, error_message, error_code, review_warnings, retry_count, extraction_method,
                    processed_at, created_at, updated_at
             FROM invoices WHERE id = ?1",
        )?;
        stmt.query_row(params![id], map_invoice).optional()
    }

    /// Header fields learned during extraction, written back in one shot.
    pub fn update_invoice_header(&self, invoice: &Invoice) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE invoices SET
                supplier_name = ?2, supplier_tax_id = ?3, invoice_number = ?4,
                invoice_date = ?5, net_total = ?6, tax_total = ?7, gross_total = ?8,
                updated_at = ?9
             WHERE id = ?1",
            params![
                invoice.id,
                invoice.supplier_name,
                invoice.supplier_tax_id,
                invoice.invoice_number,
                invoice.invoice_date,
                invoice.net_total.map(|d| d.to_string()),
                invoice.tax_total.map(|d| d.to_string()),
                invoice.gross_total.map(|d| d.to_string()),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// `pending → processing`, guarded on the current status so a racing
    /// worker loses cleanly. Returns false when the row was not in `pending`.
    pub fn try_mark_processing(&self, id: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE invoices SET status = 'processing', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_reviewing(
        &self,
        id: &str,
        method: ExtractionMethod,
        warnings: Option<&str>,
    ) -> SqlResult<()> {
        let now = now_rfc3339();
        self.conn.execute(
            "UPDATE invoices SET status = 'reviewing', extraction_method = ?2,
                    error_message = NULL, error_code = NULL, review_warnings = ?3,
                    processed_at = ?4, updated_at = ?4
             WHERE id = ?1",
            params![id, method.as_str(), warnings, now],
        )?;
        Ok(())
    }

    pub fn mark_error(&self, id: &str, message: &str, code: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE invoices SET status = 'error', error_message = ?2, error_code = ?3,
                    updated_at = ?4
             WHERE id = ?1",
            params![id, message, code, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_reviewed(&self, id: &str, status: InvoiceStatus) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE invoices SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_rfc3339()],
        )?;
        Ok(())
    }

    /// Stuck or transiently failed invoice goes back to the queue.
    pub fn reset_to_pending(&self, id: &str, bump_retry: bool) -> SqlResult<()> {
        let bump = if bump_retry { 1 } else { 0 };
        self.conn.execute(
            "UPDATE invoices SET status = 'pending', error_message = NULL, error_code = NULL,
                    retry_count = retry_count + ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, bump, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn clear_retry_count(&self, id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE invoices SET retry_count = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Invoices stuck in `pending`/`processing` past the cutoff with no
    /// completion timestamp. Completed-but-unpersisted work is never picked
    /// up because `processed_at` would be set.
    pub fn find_stuck_invoices(&self, cutoff_rfc3339: &str, limit: u32) -> SqlResult<Vec<Invoice>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, uploaded_by, file_ref, ocr_text, supplier_name, supplier_tax_id,
                    invoice_number, invoice_date, net_total, tax_total, gross_total,
                    status, error_message, error_code, review_warnings, retry_count, extraction_method,
                    processed_at, created_at, updated_at
             FROM invoices
             WHERE status IN ('pending', 'processing')
               AND processed_at IS NULL
               AND updated_at < ?1
             ORDER BY updated_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff_rfc3339, limit], map_invoice)?;
        rows.collect()
    }

    /// Failed invoices eligible for automatic retry: transient error code,
    /// cooled down, attempts left. The code list comes from the error
    /// taxonomy so the query cannot drift from `is_transient`.
    pub fn find_retryable_invoices(
        &self,
        cutoff_rfc3339: &str,
        max_retries: u32,
        limit: u32,
    ) -> SqlResult<Vec<Invoice>> {
        let codes = PipelineError::TRANSIENT_CODES
            .map(|code| format!("'{code}'"))
            .join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, tenant_id, uploaded_by, file_ref, ocr_text, supplier_name, supplier_tax_id,
                    invoice_number, invoice_date, net_total, tax_total, gross_total,
                    status, error_message, error_code, review_warnings, retry_count, extraction_method,
                    processed_at, created_at, updated_at
             FROM invoices
             WHERE status = 'error'
               AND error_code IN ({codes})
               AND retry_count < ?2
               AND updated_at < ?1
             ORDER BY updated_at ASC
             LIMIT ?3",
        ))?;
        let rows = stmt.query_map(params![cutoff_rfc3339, max_retries, limit], map_invoice)?;
        rows.collect()
    }

    // ------------------------------------------------------------------
    // Invoice lines

    pub fn replace_lines(&mut self, invoice_id: &str, lines: &[InvoiceLine]) -> SqlResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM invoice_lines WHERE invoice_id = ?1",
            params![invoice_id],
        )?;
        for line in lines {
            tx.execute(
                "INSERT INTO invoice_lines (
                    id, invoice_id, line_no, description, quantity, unit,
                    unit_price, line_total, discount_pct
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    line.id,
                    line.invoice_id,
                    line.line_no,
                    line.description,
                    line.quantity.to_string(),
                    line.unit,
                    line.unit_price.to_string(),
                    line.line_total.to_string(),
                    line.discount_pct.map(|d| d.to_string()),
                ],
            )?;
        }
        tx.commit()
    }

    pub fn get_lines(&self, invoice_id: &str) -> SqlResult<Vec<InvoiceLine>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, invoice_id, line_no, description, quantity, unit,
                    unit_price, line_total, discount_pct
             FROM invoice_lines WHERE invoice_id = ?1 ORDER BY line_no",
        )?;
        let rows = stmt.query_map(params![invoice_id], |row| {
            Ok(InvoiceLine {
                id: row.get(0)?,
                invoice_id: row.get(1)?,
                line_no: row.get(2)?,
                description: row.get(3)?,
                quantity: decimal_column(row.get::<_, String>(4)?, 4)?,
                unit: row.get(5)?,
                unit_price: decimal_column(row.get::<_, String>(6)?, 6)?,
                line_total: decimal_column(row.get::<_, String>(7)?, 7)?,
                discount_pct: optional_decimal_column(row.get::<_, Option<String>>(8)?, 8)?,
            })
        })?;
        rows.collect()
    }

    // ------------------------------------------------------------------
    // Templates

    pub fn insert_template(&self, template: &Template) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO templates (
                id, tenant_id, supplier_tax_id, supplier_name, fingerprint_json,
                zones_json, version, times_used, times_successful, confidence,
                active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                template.id,
                template.tenant_id,
                template.supplier_tax_id,
                template.supplier_name,
                serde_json::to_string(&template.fingerprint).map_err(json_error)?,
                serde_json::to_string(&template.zones).map_err(json_error)?,
                template.version,
                template.times_used,
                template.times_successful,
                template.confidence,
                template.active,
                template.created_at,
                template.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_template(&self, id: &str) -> SqlResult<Option<Template>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, supplier_tax_id, supplier_name, fingerprint_json,
                    zones_json, version, times_used, times_successful, confidence,
                    active, created_at, updated_at
             FROM templates WHERE id = ?1",
        )?;
        stmt.query_row(params![id], map_template).optional()
    }

    /// All active templates of one tenant; supplier filtering and scoring
    /// happen in the matcher.
    pub fn active_templates(&self, tenant_id: &str) -> SqlResult<Vec<Template>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, supplier_tax_id, supplier_name, fingerprint_json,
                    zones_json, version, times_used, times_successful, confidence,
                    active, created_at, updated_at
             FROM templates WHERE tenant_id = ?1 AND active = 1",
        )?;
        let rows = stmt.query_map(params![tenant_id], map_template)?;
        rows.collect()
    }

    pub fn latest_template_version(
        &self,
        tenant_id: &str,
        supplier_name: &str,
    ) -> SqlResult<u32> {
        let version: Option<u32> = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM templates WHERE tenant_id = ?1 AND supplier_name = ?2",
                params![tenant_id, supplier_name],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(version.unwrap_or(0))
    }

    /// Atomic usage increment; confidence is recomputed in the same
    /// statement so concurrent workers cannot lose an update.
    pub fn record_template_use(&self, id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE templates SET
                times_used = times_used + 1,
                confidence = MIN(100.0, (times_successful * 100.0) / (times_used + 1)),
                updated_at = ?2
             WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Atomic success increment, paired with `record_template_use` at match
    /// time. `times_used` is never zero here by construction.
    pub fn record_template_success(&self, id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE templates SET
                times_successful = times_successful + 1,
                confidence = MIN(100.0, ((times_successful + 1) * 100.0) / MAX(times_used, 1)),
                updated_at = ?2
             WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Deactivated, never deleted: historical runs stay auditable.
    pub fn deactivate_template(&self, id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE templates SET active = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processing metrics

    pub fn insert_metric(&self, metric: &ProcessingMetric) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO processing_metrics (
                id, invoice_id, extraction_method, template_id, match_score,
                duration_ms, ai_attempts, line_count, success, ai_model, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                metric.id,
                metric.invoice_id,
                metric.extraction_method.as_str(),
                metric.template_id,
                metric.match_score,
                metric.duration_ms,
                metric.ai_attempts,
                metric.line_count,
                metric.success,
                metric.ai_model,
                metric.created_at
            ],
        )?;
        Ok(())
    }

    pub fn metrics_for_invoice(&self, invoice_id: &str) -> SqlResult<Vec<ProcessingMetric>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, invoice_id, extraction_method, template_id, match_score,
                    duration_ms, ai_attempts, line_count, success, ai_model, created_at
             FROM processing_metrics WHERE invoice_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![invoice_id], |row| {
            let method: String = row.get(2)?;
            Ok(ProcessingMetric {
                id: row.get(0)?,
                invoice_id: row.get(1)?,
                extraction_method: ExtractionMethod::parse(&method)
                    .unwrap_or(ExtractionMethod::Manual),
                template_id: row.get(3)?,
                match_score: row.get(4)?,
                duration_ms: row.get(5)?,
                ai_attempts: row.get(6)?,
                line_count: row.get(7)?,
                success: row.get(8)?,
                ai_model: row.get(9)?,
                created_at: row.get(10)?,
            })
        })?;
        rows.collect()
    }

    // ------------------------------------------------------------------
    // Integration log

    pub fn insert_integration_log(&mut self, log: &IntegrationLog) -> SqlResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO integration_logs (id, invoice_id, tenant_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![log.id, log.invoice_id, log.tenant_id, log.created_at],
        )?;
        for item in &log.items {
            tx.execute(
                "INSERT INTO integration_log_items (
                    id, log_id, entity_type, entity_id, entity_name, field,
                    old_value, new_value
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.id,
                    item.log_id,
                    item.entity_type.as_str(),
                    item.entity_id,
                    item.entity_name,
                    item.field,
                    item.old_value,
                    item.new_value
                ],
            )?;
        }
        tx.commit()
    }

    pub fn integration_log_for_invoice(
        &self,
        invoice_id: &str,
    ) -> SqlResult<Option<IntegrationLog>> {
        let header = self
            .conn
            .query_row(
                "SELECT id, invoice_id, tenant_id, created_at
                 FROM integration_logs WHERE invoice_id = ?1",
                params![invoice_id],
                |row| {
                    Ok(IntegrationLog {
                        id: row.get(0)?,
                        invoice_id: row.get(1)?,
                        tenant_id: row.get(2)?,
                        created_at: row.get(3)?,
                        items: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut log) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT id, log_id, entity_type, entity_id, entity_name, field,
                    old_value, new_value
             FROM integration_log_items WHERE log_id = ?1",
        )?;
        let rows = stmt.query_map(params![log.id], |row| {
            let entity: String = row.get(2)?;
            Ok(IntegrationLogItem {
                id: row.get(0)?,
                log_id: row.get(1)?,
                entity_type: CatalogEntity::parse(&entity).unwrap_or(CatalogEntity::Product),
                entity_id: row.get(3)?,
                entity_name: row.get(4)?,
                field: row.get(5)?,
                old_value: row.get(6)?,
                new_value: row.get(7)?,
            })
        })?;
        log.items = rows.collect::<SqlResult<Vec<_>>>()?;
        Ok(Some(log))
    }

    // ------------------------------------------------------------------
    // Catalog

    pub fn insert_product(&self, product: &Product) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO products (id, tenant_id, name, unit, cost, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                product.id,
                product.tenant_id,
                product.name,
                product.unit,
                product.cost.to_string(),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn products_for_tenant(&self, tenant_id: &str) -> SqlResult<Vec<Product>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, name, unit, cost FROM products WHERE tenant_id = ?1",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok(Product {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                name: row.get(2)?,
                unit: row.get(3)?,
                cost: decimal_column(row.get::<_, String>(4)?, 4)?,
            })
        })?;
        rows.collect()
    }

    pub fn update_product_cost(&self, id: &str, cost: Decimal) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE products SET cost = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, cost.to_string(), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_recipe(&self, recipe: &Recipe) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO recipes (id, tenant_id, name, cost, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                recipe.id,
                recipe.tenant_id,
                recipe.name,
                recipe.cost.to_string(),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn insert_recipe_item(
        &self,
        recipe_id: &str,
        product_id: &str,
        quantity: Decimal,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO recipe_items (id, recipe_id, product_id, quantity)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                recipe_id,
                product_id,
                quantity.to_string()
            ],
        )?;
        Ok(())
    }

    /// Recipes that contain the given product, with their current cost.
    pub fn recipes_using_product(&self, product_id: &str) -> SqlResult<Vec<Recipe>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT r.id, r.tenant_id, r.name, r.cost
             FROM recipes r JOIN recipe_items ri ON ri.recipe_id = r.id
             WHERE ri.product_id = ?1",
        )?;
        let rows = stmt.query_map(params![product_id], |row| {
            Ok(Recipe {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                name: row.get(2)?,
                cost: decimal_column(row.get::<_, String>(3)?, 3)?,
            })
        })?;
        rows.collect()
    }

    /// Σ(item quantity × product cost) for one recipe.
    pub fn compute_recipe_cost(&self, recipe_id: &str) -> SqlResult<Decimal> {
        let mut stmt = self.conn.prepare(
            "SELECT ri.quantity, p.cost
             FROM recipe_items ri JOIN products p ON p.id = ri.product_id
             WHERE ri.recipe_id = ?1",
        )?;
        let rows = stmt.query_map(params![recipe_id], |row| {
            let quantity = decimal_column(row.get::<_, String>(0)?, 0)?;
            let cost = decimal_column(row.get::<_, String>(1)?, 1)?;
            Ok(quantity * cost)
        })?;
        let mut total = Decimal::ZERO;
        for value in rows {
            total += value?;
        }
        Ok(total)
    }

    pub fn update_recipe_cost(&self, id: &str, cost: Decimal) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE recipes SET cost = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, cost.to_string(), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_menu_item(&self, item: &MenuItem) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO menu_items (id, tenant_id, recipe_id, name, price, margin_pct, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id,
                item.tenant_id,
                item.recipe_id,
                item.name,
                item.price.to_string(),
                item.margin_pct.map(|d| d.to_string()),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn menu_items_for_recipe(&self, recipe_id: &str) -> SqlResult<Vec<MenuItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, recipe_id, name, price, margin_pct
             FROM menu_items WHERE recipe_id = ?1",
        )?;
        let rows = stmt.query_map(params![recipe_id], |row| {
            Ok(MenuItem {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                recipe_id: row.get(2)?,
                name: row.get(3)?,
                price: decimal_column(row.get::<_, String>(4)?, 4)?,
                margin_pct: optional_decimal_column(row.get::<_, Option<String>>(5)?, 5)?,
            })
        })?;
        rows.collect()
    }

    pub fn update_menu_item_margin(&self, id: &str, margin_pct: Decimal) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE menu_items SET margin_pct = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, margin_pct.to_string(), now_rfc3339()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings

    pub fn set_setting(&self, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> SqlResult<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        stmt.query_row(params![key], |row| row.get(0)).optional()
    }
}

fn map_invoice(row: &rusqlite::Row<'_>) -> SqlResult<Invoice> {
    let status: String = row.get(12)?;
    let method: Option<String> = row.get(17)?;
    Ok(Invoice {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        uploaded_by: row.get(2)?,
        file_ref: row.get(3)?,
        ocr_text: row.get(4)?,
        supplier_name: row.get(5)?,
        supplier_tax_id: row.get(6)?,
        invoice_number: row.get(7)?,
        invoice_date: row.get(8)?,
        net_total: optional_decimal_column(row.get::<_, Option<String>>(9)?, 9)?,
        tax_total: optional_decimal_column(row.get::<_, Option<String>>(10)?, 10)?,
        gross_total: optional_decimal_column(row.get::<_, Option<String>>(11)?, 11)?,
        status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Error),
        error_message: row.get(13)?,
        error_code: row.get(14)?,
        review_warnings: row.get(15)?,
        retry_count: row.get(16)?,
        extraction_method: method.as_deref().and_then(ExtractionMethod::parse),
        processed_at: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn map_template(row: &rusqlite::Row<'_>) -> SqlResult<Template> {
    let fingerprint_json: String = row.get(4)?;
    let zones_json: String = row.get(5)?;
    let fingerprint: Fingerprint = serde_json::from_str(&fingerprint_json)
        .map_err(|e| conversion_error(4, e))?;
    let zones: ZoneConfig =
        serde_json::from_str(&zones_json).map_err(|e| conversion_error(5, e))?;
    Ok(Template {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        supplier_tax_id: row.get(2)?,
        supplier_name: row.get(3)?,
        fingerprint,
        zones,
        version: row.get(6)?,
        times_used: row.get(7)?,
        times_successful: row.get(8)?,
        confidence: row.get(9)?,
        active: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn decimal_column(value: String, idx: usize) -> SqlResult<Decimal> {
    Decimal::from_str(&value).map_err(|e| conversion_error(idx, e))
}

fn optional_decimal_column(value: Option<String>, idx: usize) -> SqlResult<Option<Decimal>> {
    value.map(|v| decimal_column(v, idx)).transpose()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
}
