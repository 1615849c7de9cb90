//! Mobile order import.
//!
//! Field reps capture orders offline; the devices push them into the
//! `mobile_orders` / `mobile_order_items` collections with loosely typed
//! references. [`run_import`] reconciles every unimported record:
//!
//! 1. records whose source id already produced an order or visit are only
//!    marked imported (duplicates are never written twice),
//! 2. references are sanitised: anything that is not a hyphenated UUID is
//!    dropped, and with `check_references` so are ids of missing records,
//! 3. cancelled or zero-value records become visits, the rest orders with
//!    their items; a failed item insert deletes what was written for that
//!    order,
//! 4. the mobile record is flagged imported only after its target exists.
//!
//! Per-record failures are collected into the [`ImportReport`] and never
//! abort the batch. A dry run goes through the same steps without writing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    round_money, timestamp, Entity, ImportedAs, MobileOrder, MobileOrderItem, Order, OrderItem,
    OrderOrigin, OrderStatus, PaymentMethod, Product, RecordMeta, Visit, VisitReason,
};
use crate::orders::write_order_with_items;
use crate::products;
use crate::reports::{self, ImportReport, ReportBuilder};
use crate::repository::{Repositories, Repository};
use crate::store::{Collection, Filter, SortDirection};

/// Upper bound on ids per `In` condition.
const LOOKUP_CHUNK: usize = 200;

// ---------------------------------------------------------------------------
// Reference sanitising
// ---------------------------------------------------------------------------

/// Accept only canonical hyphenated UUIDs (8-4-4-4-12 hex), returned in
/// lowercase. Numbers, blanks, braced or URN forms are rejected.
pub fn strict_uuid(raw: Option<&Value>) -> Option<String> {
    let text = raw?.as_str()?.trim();
    if text.len() != 36 {
        return None;
    }
    let hyphens_ok = text
        .char_indices()
        .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-'));
    if !hyphens_ok {
        return None;
    }
    Uuid::parse_str(text).ok().map(|u| u.to_string())
}

fn has_value(raw: Option<&Value>) -> bool {
    match raw {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Sanitises references for one import run, remembering which ids exist.
struct ReferenceChecker<'a> {
    repos: &'a Repositories,
    check_existing: bool,
    known: HashMap<(Collection, String), bool>,
}

impl<'a> ReferenceChecker<'a> {
    fn new(repos: &'a Repositories, check_existing: bool) -> Self {
        Self {
            repos,
            check_existing,
            known: HashMap::new(),
        }
    }

    fn exists(&mut self, collection: Collection, id: &str) -> bool {
        let key = (collection, id.to_string());
        if let Some(found) = self.known.get(&key) {
            return *found;
        }
        let found = match self.repos.store().get(collection, id) {
            Ok(doc) => doc.is_some(),
            Err(e) => {
                // Keep the reference when the lookup itself fails.
                warn!(collection = %collection, id, error = %e, "Reference lookup failed");
                true
            }
        };
        self.known.insert(key, found);
        found
    }

    /// Returns the cleaned id and whether a supplied value was dropped.
    fn clean(&mut self, collection: Collection, raw: Option<&Value>) -> (Option<String>, bool) {
        let supplied = has_value(raw);
        let Some(id) = strict_uuid(raw) else {
            if supplied {
                debug!(collection = %collection, raw = ?raw, "Dropping malformed reference");
            }
            return (None, supplied);
        };
        if self.check_existing && !self.exists(collection, &id) {
            debug!(collection = %collection, id = %id, "Dropping dangling reference");
            return (None, true);
        }
        (Some(id), false)
    }
}

// ---------------------------------------------------------------------------
// Import run
// ---------------------------------------------------------------------------

enum Outcome {
    Order,
    Visit,
    Duplicate,
}

struct Importer<'a> {
    repos: &'a Repositories,
    dry_run: bool,
    refs: ReferenceChecker<'a>,
    report: ReportBuilder,
    products: HashMap<String, Option<Product>>,
    existing: HashMap<String, (String, ImportedAs)>,
}

/// Import every pending mobile order. The report is stored unless this is
/// a dry run.
pub fn run_import(repos: &Repositories, config: &ImportConfig) -> AppResult<ImportReport> {
    run_import_with(repos, config, config.dry_run)
}

pub fn run_import_with(
    repos: &Repositories,
    config: &ImportConfig,
    dry_run: bool,
) -> AppResult<ImportReport> {
    let pending = pending_orders(repos)?;
    let ids: Vec<String> = pending.iter().map(|m| m.meta.id.clone()).collect();
    info!(pending = pending.len(), dry_run, "Starting mobile order import");

    let mut items = items_by_order(repos, &ids)?;
    let existing = existing_targets(repos, &ids)?;

    let mut importer = Importer {
        repos,
        dry_run,
        refs: ReferenceChecker::new(repos, config.check_references),
        report: ReportBuilder::new(repos.store().backend_name(), dry_run),
        products: HashMap::new(),
        existing,
    };
    importer.report.fetched(pending.len());

    for mobile in pending {
        let lines = items.remove(&mobile.meta.id).unwrap_or_default();
        let id = mobile.meta.id.clone();
        let number = mobile.number.clone();
        match importer.import_one(mobile, lines) {
            Ok(Outcome::Order) => debug!(mobile_order_id = %id, "Imported as order"),
            Ok(Outcome::Visit) => debug!(mobile_order_id = %id, "Imported as visit"),
            Ok(Outcome::Duplicate) => debug!(mobile_order_id = %id, "Already imported"),
            Err(e) => {
                warn!(mobile_order_id = %id, error = %e, "Mobile order import failed");
                importer
                    .report
                    .failure(&id, number.as_deref(), e.to_string());
            }
        }
    }

    let report = importer.report.finish(repos, config.top_products);
    info!(
        fetched = report.fetched,
        orders = report.imported_orders,
        visits = report.imported_visits,
        duplicates = report.duplicates,
        failed = report.failed,
        total = report.total_value,
        dry_run,
        "Mobile order import finished"
    );
    if dry_run {
        return Ok(report);
    }
    reports::save(repos, report)
}

/// Unimported, non-deleted mobile orders in capture order.
pub fn pending_orders(repos: &Repositories) -> AppResult<Vec<MobileOrder>> {
    repos.mobile_orders.list(
        Filter::new()
            .eq("imported", false)
            .order_by("code", SortDirection::Asc),
    )
}

fn id_values(chunk: &[String]) -> Vec<Value> {
    chunk.iter().map(|id| Value::String(id.clone())).collect()
}

fn items_by_order(
    repos: &Repositories,
    ids: &[String],
) -> AppResult<HashMap<String, Vec<MobileOrderItem>>> {
    let mut grouped: HashMap<String, Vec<MobileOrderItem>> = HashMap::new();
    for chunk in ids.chunks(LOOKUP_CHUNK) {
        let filter = Filter::new()
            .is_in("mobileOrderId", id_values(chunk))
            .order_by("code", SortDirection::Asc);
        for item in repos.mobile_order_items.list(filter)? {
            grouped
                .entry(item.mobile_order_id.clone())
                .or_default()
                .push(item);
        }
    }
    Ok(grouped)
}

/// Orders and visits already created from these mobile ids, soft-deleted
/// ones included.
fn existing_targets(
    repos: &Repositories,
    ids: &[String],
) -> AppResult<HashMap<String, (String, ImportedAs)>> {
    let mut found = HashMap::new();
    for chunk in ids.chunks(LOOKUP_CHUNK) {
        let filter = Filter::new().is_in("sourceMobileOrderId", id_values(chunk));
        for order in repos.orders.list_with(filter.clone(), true)? {
            if let Some(source) = order.source_mobile_order_id {
                found.insert(source, (order.meta.id, ImportedAs::Order));
            }
        }
        for visit in repos.visits.list_with(filter, true)? {
            found
                .entry(visit.source_mobile_order_id)
                .or_insert((visit.meta.id, ImportedAs::Visit));
        }
    }
    Ok(found)
}

impl<'a> Importer<'a> {
    fn import_one(&mut self, mobile: MobileOrder, lines: Vec<MobileOrderItem>) -> AppResult<Outcome> {
        if !mobile.total.is_finite() || mobile.total < 0.0 {
            return Err(AppError::validation(format!(
                "invalid total {}",
                mobile.total
            )));
        }

        if let Some((target_id, kind)) = self.existing.get(&mobile.meta.id).cloned() {
            if !self.dry_run {
                mark_imported(&self.repos.mobile_orders, mobile, &target_id, kind)?;
            }
            self.report.duplicate();
            return Ok(Outcome::Duplicate);
        }

        let (customer_id, c) = self
            .refs
            .clean(Collection::Customers, mobile.customer_id.as_ref());
        let (sales_rep_id, r) = self
            .refs
            .clean(Collection::SalesReps, mobile.sales_rep_id.as_ref());
        let (payment_table_id, p) = self
            .refs
            .clean(Collection::PaymentTables, mobile.payment_table_id.as_ref());
        let mut sanitized = u32::from(c) + u32::from(r) + u32::from(p);

        let is_visit = mobile.is_cancelled() || round_money(mobile.total) == 0.0;
        if is_visit {
            self.report.sanitized(sanitized);
            let reason = if mobile.is_cancelled() {
                VisitReason::Cancelled
            } else {
                VisitReason::ZeroValue
            };
            let visit = Visit {
                meta: RecordMeta::default(),
                customer_id,
                sales_rep_id: sales_rep_id.clone(),
                source_mobile_order_id: mobile.meta.id.clone(),
                reason,
                notes: mobile.notes.clone(),
                visited_at: mobile.captured_at.unwrap_or_else(timestamp::now),
            };
            visit.validate()?;
            if !self.dry_run {
                let visit = self.repos.visits.create(visit)?;
                self.remember(&mobile.meta.id, &visit.meta.id, ImportedAs::Visit);
                mark_imported(
                    &self.repos.mobile_orders,
                    mobile,
                    &visit.meta.id,
                    ImportedAs::Visit,
                )?;
            }
            self.report.visit(sales_rep_id.as_deref());
            return Ok(Outcome::Visit);
        }

        let mut items = Vec::with_capacity(lines.len());
        let mut sold = Vec::with_capacity(lines.len());
        for (n, line) in lines.iter().enumerate() {
            let (product_id, dropped) = self
                .refs
                .clean(Collection::Products, line.product_id.as_ref());
            sanitized += u32::from(dropped);
            let product = match &product_id {
                Some(id) => self.product(id)?,
                None => None,
            };

            let description = line
                .description
                .clone()
                .filter(|d| !d.trim().is_empty())
                .or_else(|| product.as_ref().map(|p| p.description.clone()))
                .unwrap_or_else(|| format!("Item {}", n + 1));
            let unit = line
                .unit
                .clone()
                .filter(|u| !u.trim().is_empty())
                .or_else(|| product.as_ref().map(|p| p.unit.clone()))
                .unwrap_or_default();

            let mut item = OrderItem {
                product_id: product_id.clone(),
                description: description.clone(),
                unit: unit.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                discount_percent: line.discount_percent,
                order_id: mobile.meta.id.clone(),
                ..OrderItem::default()
            };
            item.total = item.compute_total();
            item.validate()
                .map_err(|e| AppError::validation(format!("item {}: {e}", n + 1)))?;

            let base_quantity = match &product {
                Some(p) => products::to_base_quantity(p, line.quantity, &unit).unwrap_or_else(|e| {
                    warn!(product_id = %p.meta.id, error = %e, "Counting quantity as base units");
                    line.quantity
                }),
                None => line.quantity,
            };
            sold.push((product_id, description, base_quantity, item.total));
            items.push(item);
        }
        self.report.sanitized(sanitized);

        let subtotal = if items.is_empty() {
            round_money(mobile.total + mobile.discount)
        } else {
            round_money(items.iter().map(|i| i.total).sum())
        };
        let order = Order {
            meta: RecordMeta::default(),
            customer_id,
            sales_rep_id: sales_rep_id.clone(),
            payment_table_id,
            payment_method: mobile
                .payment_method
                .as_deref()
                .and_then(PaymentMethod::parse_loose),
            status: OrderStatus::Pending,
            origin: OrderOrigin::Mobile,
            source_mobile_order_id: Some(mobile.meta.id.clone()),
            delivery_route_id: None,
            item_count: items.len() as u32,
            subtotal,
            discount: round_money(mobile.discount),
            total: round_money(mobile.total),
            notes: mobile.notes.clone(),
            issued_at: mobile.captured_at.unwrap_or_else(timestamp::now),
        };
        order.validate()?;

        if !self.dry_run {
            let written = write_order_with_items(self.repos, order.clone(), items)?;
            let target_id = written.order.meta.id;
            self.remember(&mobile.meta.id, &target_id, ImportedAs::Order);
            mark_imported(
                &self.repos.mobile_orders,
                mobile,
                &target_id,
                ImportedAs::Order,
            )?;
        }

        self.report.order(sales_rep_id.as_deref(), order.total);
        for (product_id, description, quantity, value) in sold {
            self.report
                .product(product_id.as_deref(), &description, quantity, value);
        }
        Ok(Outcome::Order)
    }

    fn product(&mut self, id: &str) -> AppResult<Option<Product>> {
        if let Some(cached) = self.products.get(id) {
            return Ok(cached.clone());
        }
        let product = self.repos.products.find(id)?;
        self.products.insert(id.to_string(), product.clone());
        Ok(product)
    }

    /// Guard against two pending records sharing one id in the same run.
    fn remember(&mut self, source_id: &str, target_id: &str, kind: ImportedAs) {
        self.existing
            .insert(source_id.to_string(), (target_id.to_string(), kind));
    }
}

fn mark_imported(
    mobile_orders: &Repository<MobileOrder>,
    mut mobile: MobileOrder,
    target_id: &str,
    kind: ImportedAs,
) -> AppResult<()> {
    mobile.imported = true;
    mobile.imported_at = Some(timestamp::now());
    mobile.imported_target_id = Some(target_id.to_string());
    mobile.imported_as = Some(kind);
    mobile_orders.update(mobile)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Loading device batches
// ---------------------------------------------------------------------------

/// Mobile orders and items as exported by the field devices.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MobileBatch {
    #[serde(default)]
    pub orders: Vec<MobileOrder>,
    #[serde(default)]
    pub items: Vec<MobileOrderItem>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub orders: usize,
    pub items: usize,
    pub skipped: usize,
}

/// Store a batch. Records whose id is already present are skipped, so the
/// same export can be loaded twice.
pub fn load_batch(repos: &Repositories, batch: MobileBatch) -> AppResult<LoadSummary> {
    let mut summary = LoadSummary::default();
    for mut order in batch.orders {
        if order.meta.id.trim().is_empty() {
            order.meta.id = Uuid::new_v4().to_string();
        } else if repos.mobile_orders.find(&order.meta.id)?.is_some() {
            summary.skipped += 1;
            continue;
        }
        repos.mobile_orders.create(order)?;
        summary.orders += 1;
    }
    for item in batch.items {
        if !item.meta.id.trim().is_empty() && repos.mobile_order_items.find(&item.meta.id)?.is_some()
        {
            summary.skipped += 1;
            continue;
        }
        if item.mobile_order_id.trim().is_empty() {
            return Err(AppError::validation("mobile order item without mobileOrderId"));
        }
        repos.mobile_order_items.create(item)?;
        summary.items += 1;
    }
    info!(
        orders = summary.orders,
        items = summary.items,
        skipped = summary.skipped,
        "Mobile batch loaded"
    );
    Ok(summary)
}

pub fn load_file(repos: &Repositories, path: &Path) -> AppResult<LoadSummary> {
    let raw = fs::read_to_string(path)?;
    let batch: MobileBatch = serde_json::from_str(&raw)?;
    load_batch(repos, batch)
}
