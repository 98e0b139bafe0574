//! Catalog propagation after approval.
//!
//! An approved invoice carries fresh purchase prices. Matching products get
//! their cost updated, recipes using those products get recosted, and menu
//! items on those recipes get their margin recomputed. Every field change is
//! captured in an integration log so the kitchen can see exactly what an
//! invoice did to their numbers.

use std::collections::HashSet;

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::Result;
use crate::models::{CatalogEntity, IntegrationLog, IntegrationLogItem, Invoice, InvoiceLine};
use crate::utils::{normalize_name, now_rfc3339};

/// Applies one approved invoice to the catalog. Returns the persisted
/// integration log when at least one field changed.
pub fn apply_approval(
    db: &mut Database,
    invoice: &Invoice,
    lines: &[InvoiceLine],
) -> Result<Option<IntegrationLog>> {
    let log_id = uuid::Uuid::new_v4().to_string();
    let mut items = Vec::new();
    let mut touched_products = Vec::new();

    let products = db.products_for_tenant(&invoice.tenant_id)?;
    for line in lines {
        let wanted = normalize_name(&line.description);
        let Some(product) = products
            .iter()
            .find(|p| normalize_name(&p.name) == wanted)
        else {
            debug!(
                invoice_id = %invoice.id,
                description = %line.description,
                "no catalog product for invoice line"
            );
            continue;
        };
        if product.cost == line.unit_price {
            continue;
        }
        db.update_product_cost(&product.id, line.unit_price)?;
        items.push(log_item(
            &log_id,
            CatalogEntity::Product,
            &product.id,
            &product.name,
            "cost",
            &product.cost,
            &line.unit_price,
        ));
        touched_products.push(product.id.clone());
    }

    let mut seen_recipes = HashSet::new();
    for product_id in &touched_products {
        for recipe in db.recipes_using_product(product_id)? {
            if !seen_recipes.insert(recipe.id.clone()) {
                continue;
            }
            let new_cost = db.compute_recipe_cost(&recipe.id)?.round_dp(2);
            if new_cost == recipe.cost {
                continue;
            }
            db.update_recipe_cost(&recipe.id, new_cost)?;
            items.push(log_item(
                &log_id,
                CatalogEntity::Recipe,
                &recipe.id,
                &recipe.name,
                "cost",
                &recipe.cost,
                &new_cost,
            ));

            for menu_item in db.menu_items_for_recipe(&recipe.id)? {
                let new_margin = margin_pct(menu_item.price, new_cost);
                if menu_item.margin_pct == new_margin {
                    continue;
                }
                if let Some(margin) = new_margin {
                    db.update_menu_item_margin(&menu_item.id, margin)?;
                    items.push(log_item(
                        &log_id,
                        CatalogEntity::MenuItem,
                        &menu_item.id,
                        &menu_item.name,
                        "margin_pct",
                        &menu_item
                            .margin_pct
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        &margin,
                    ));
                }
            }
        }
    }

    if items.is_empty() {
        return Ok(None);
    }

    let log = IntegrationLog {
        id: log_id,
        invoice_id: invoice.id.clone(),
        tenant_id: invoice.tenant_id.clone(),
        created_at: now_rfc3339(),
        items,
    };
    db.insert_integration_log(&log)?;
    info!(
        invoice_id = %invoice.id,
        changes = log.items.len(),
        "catalog updated from approved invoice"
    );
    Ok(Some(log))
}

/// `(price − cost) / price`, as a percentage rounded to two places. A free
/// menu item has no meaningful margin.
fn margin_pct(price: Decimal, cost: Decimal) -> Option<Decimal> {
    if price == Decimal::ZERO {
        return None;
    }
    Some(((price - cost) / price * Decimal::ONE_HUNDRED).round_dp(2))
}

fn log_item(
    log_id: &str,
    entity_type: CatalogEntity,
    entity_id: &str,
    entity_name: &str,
    field: &str,
    old_value: &dyn std::fmt::Display,
    new_value: &dyn std::fmt::Display,
) -> IntegrationLogItem {
    IntegrationLogItem {
        id: uuid::Uuid::new_v4().to_string(),
        log_id: log_id.to_string(),
        entity_type,
        entity_id: entity_id.to_string(),
        entity_name: entity_name.to_string(),
        field: field.to_string(),
        old_value: old_value.to_string(),
        new_value: new_value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceStatus, MenuItem, Product, Recipe};
    use pretty_assertions::assert_eq;

    fn seed_invoice() -> Invoice {
        let now = now_rfc3339();
        Invoice {
            id: "inv-1".into(),
            tenant_id: "t1".into(),
            uploaded_by: "anna".into(),
            file_ref: "t1/ab/cdef-faktura.pdf".into(),
            ocr_text: None,
            supplier_name: Some("Młyn Gdański".into()),
            supplier_tax_id: Some("1234567890".into()),
            invoice_number: Some("FV/2025/08/113".into()),
            invoice_date: Some("2025-08-12".into()),
            net_total: Some(Decimal::new(44000, 2)),
            tax_total: None,
            gross_total: None,
            status: InvoiceStatus::Approved,
            error_message: None,
            error_code: None,
            review_warnings: None,
            retry_count: 0,
            extraction_method: Some(crate::models::ExtractionMethod::Template),
            processed_at: Some(now.clone()),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn line(description: &str, unit_price: Decimal) -> InvoiceLine {
        InvoiceLine {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: "inv-1".into(),
            line_no: 1,
            description: description.into(),
            quantity: Decimal::ONE,
            unit: Some("kg".into()),
            unit_price,
            line_total: unit_price,
            discount_pct: None,
        }
    }

    fn seed_catalog(db: &Database) {
        db.insert_product(&Product {
            id: "p-flour".into(),
            tenant_id: "t1".into(),
            name: "Mąka pszenna 25kg".into(),
            unit: Some("szt".into()),
            cost: Decimal::new(8000, 2),
        })
        .unwrap();
        db.insert_recipe(&Recipe {
            id: "r-bread".into(),
            tenant_id: "t1".into(),
            name: "Chleb wiejski".into(),
            cost: Decimal::new(1600, 2),
        })
        .unwrap();
        // 0.2 units of flour per loaf.
        db.insert_recipe_item("r-bread", "p-flour", Decimal::new(2, 1))
            .unwrap();
        db.insert_menu_item(&MenuItem {
            id: "m-bread".into(),
            tenant_id: "t1".into(),
            recipe_id: "r-bread".into(),
            name: "Chleb wiejski".into(),
            price: Decimal::new(3200, 2),
            margin_pct: Some(Decimal::new(5000, 2)),
        })
        .unwrap();
    }

    #[test]
    fn price_change_cascades_to_recipe_and_menu() {
        let mut db = Database::in_memory().unwrap();
        seed_catalog(&db);
        let invoice = seed_invoice();
        db.insert_invoice(&invoice).unwrap();
        let lines = vec![line("MĄKA PSZENNA 25KG", Decimal::new(8950, 2))];

        let log = apply_approval(&mut db, &invoice, &lines).unwrap().unwrap();
        let kinds: Vec<CatalogEntity> = log.items.iter().map(|i| i.entity_type).collect();
        assert_eq!(
            kinds,
            vec![
                CatalogEntity::Product,
                CatalogEntity::Recipe,
                CatalogEntity::MenuItem
            ]
        );
        // 0.2 × 89.50 = 17.90 recipe cost.
        let recipe_change = &log.items[1];
        assert_eq!(recipe_change.new_value, "17.90");
        // (32.00 − 17.90) / 32.00 = 44.06%.
        let margin_change = &log.items[2];
        assert_eq!(margin_change.new_value, "44.06");

        let reloaded = db.integration_log_for_invoice("inv-1").unwrap().unwrap();
        assert_eq!(reloaded.items.len(), 3);
    }

    #[test]
    fn unchanged_price_writes_no_log() {
        let mut db = Database::in_memory().unwrap();
        seed_catalog(&db);
        let invoice = seed_invoice();
        let lines = vec![line("Mąka pszenna 25kg", Decimal::new(8000, 2))];
        assert!(apply_approval(&mut db, &invoice, &lines).unwrap().is_none());
    }

    #[test]
    fn unknown_product_is_skipped() {
        let mut db = Database::in_memory().unwrap();
        seed_catalog(&db);
        let invoice = seed_invoice();
        let lines = vec![line("Drożdże 500g", Decimal::new(450, 2))];
        assert!(apply_approval(&mut db, &invoice, &lines).unwrap().is_none());
    }
}
