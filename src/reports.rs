//! Import reports.
//!
//! One [`ImportReport`] is produced per run of the mobile order import and
//! stored in the `import_reports` collection, so past runs can be audited.
//! Totals are accumulated while the run progresses through [`ReportBuilder`]
//! and frozen by [`ReportBuilder::finish`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::models::{round_money, timestamp, Entity, RecordMeta};
use crate::repository::Repositories;
use crate::store::{Collection, Filter, SortDirection};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesRepSummary {
    pub sales_rep_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub orders: u32,
    pub visits: u32,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub product_id: Option<String>,
    pub description: String,
    /// Quantity in the product's base unit.
    pub quantity: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub mobile_order_id: String,
    #[serde(default)]
    pub number: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    #[serde(default)]
    pub backend: String,
    pub fetched: u32,
    pub imported_orders: u32,
    pub imported_visits: u32,
    pub duplicates: u32,
    pub failed: u32,
    pub sanitized_references: u32,
    pub total_value: f64,
    #[serde(default)]
    pub by_sales_rep: Vec<SalesRepSummary>,
    #[serde(default)]
    pub top_products: Vec<ProductSummary>,
    #[serde(default)]
    pub issues: Vec<ImportIssue>,
}

impl Entity for ImportReport {
    const COLLECTION: Collection = Collection::ImportReports;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
}

impl ImportReport {
    /// Records that reached a terminal state in this run.
    pub fn processed(&self) -> u32 {
        self.imported_orders + self.imported_visits + self.duplicates + self.failed
    }
}

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ReportBuilder {
    started_at: DateTime<Utc>,
    dry_run: bool,
    backend: String,
    fetched: u32,
    orders: u32,
    visits: u32,
    duplicates: u32,
    failed: u32,
    sanitized: u32,
    total_value: f64,
    reps: HashMap<Option<String>, SalesRepSummary>,
    products: HashMap<String, ProductSummary>,
    issues: Vec<ImportIssue>,
}

impl ReportBuilder {
    pub fn new(backend: &str, dry_run: bool) -> Self {
        Self {
            started_at: timestamp::now(),
            dry_run,
            backend: backend.to_string(),
            fetched: 0,
            orders: 0,
            visits: 0,
            duplicates: 0,
            failed: 0,
            sanitized: 0,
            total_value: 0.0,
            reps: HashMap::new(),
            products: HashMap::new(),
            issues: Vec::new(),
        }
    }

    pub fn fetched(&mut self, count: usize) {
        self.fetched = count as u32;
    }

    fn rep(&mut self, sales_rep_id: Option<&str>) -> &mut SalesRepSummary {
        let key = sales_rep_id.map(str::to_string);
        self.reps
            .entry(key.clone())
            .or_insert_with(|| SalesRepSummary {
                sales_rep_id: key,
                ..SalesRepSummary::default()
            })
    }

    pub fn order(&mut self, sales_rep_id: Option<&str>, value: f64) {
        self.orders += 1;
        self.total_value += value;
        let rep = self.rep(sales_rep_id);
        rep.orders += 1;
        rep.value += value;
    }

    pub fn visit(&mut self, sales_rep_id: Option<&str>) {
        self.visits += 1;
        self.rep(sales_rep_id).visits += 1;
    }

    /// Add one sold line. `quantity` must already be in base units.
    pub fn product(
        &mut self,
        product_id: Option<&str>,
        description: &str,
        quantity: f64,
        value: f64,
    ) {
        let key = product_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("desc:{}", description.trim().to_lowercase()));
        let entry = self
            .products
            .entry(key)
            .or_insert_with(|| ProductSummary {
                product_id: product_id.map(str::to_string),
                description: description.to_string(),
                ..ProductSummary::default()
            });
        entry.quantity += quantity;
        entry.value += value;
    }

    pub fn duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn sanitized(&mut self, count: u32) {
        self.sanitized += count;
    }

    pub fn failure(&mut self, mobile_order_id: &str, number: Option<&str>, message: String) {
        self.failed += 1;
        self.issues.push(ImportIssue {
            mobile_order_id: mobile_order_id.to_string(),
            number: number.map(str::to_string),
            message,
        });
    }

    /// Freeze the totals. Sales rep names are looked up in `repos`; reps
    /// are ordered by value, products by value with ties on description.
    pub fn finish(self, repos: &Repositories, top_products: usize) -> ImportReport {
        let mut by_sales_rep: Vec<SalesRepSummary> = self
            .reps
            .into_values()
            .map(|mut rep| {
                rep.value = round_money(rep.value);
                rep.name = rep
                    .sales_rep_id
                    .as_deref()
                    .and_then(|id| repos.sales_reps.find(id).ok().flatten())
                    .map(|r| r.name);
                rep
            })
            .collect();
        by_sales_rep.sort_by(|a, b| {
            b.value
                .total_cmp(&a.value)
                .then_with(|| b.orders.cmp(&a.orders))
                .then_with(|| a.sales_rep_id.cmp(&b.sales_rep_id))
        });

        let mut products: Vec<ProductSummary> = self
            .products
            .into_values()
            .map(|mut p| {
                p.value = round_money(p.value);
                p.quantity = (p.quantity * 1000.0).round() / 1000.0;
                p
            })
            .collect();
        products.sort_by(|a, b| {
            b.value
                .total_cmp(&a.value)
                .then_with(|| a.description.cmp(&b.description))
        });
        products.truncate(top_products);

        ImportReport {
            meta: RecordMeta::default(),
            started_at: self.started_at,
            finished_at: timestamp::now(),
            dry_run: self.dry_run,
            backend: self.backend,
            fetched: self.fetched,
            imported_orders: self.orders,
            imported_visits: self.visits,
            duplicates: self.duplicates,
            failed: self.failed,
            sanitized_references: self.sanitized,
            total_value: round_money(self.total_value),
            by_sales_rep,
            top_products: products,
            issues: self.issues,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Store a finished report, assigning its id and code.
pub fn save(repos: &Repositories, report: ImportReport) -> AppResult<ImportReport> {
    let saved = repos.import_reports.create(report)?;
    info!(
        report_id = %saved.meta.id,
        code = saved.meta.code,
        orders = saved.imported_orders,
        visits = saved.imported_visits,
        failed = saved.failed,
        "Import report saved"
    );
    if saved.failed > 0 {
        warn!(failed = saved.failed, "Import finished with failures");
    }
    Ok(saved)
}

/// Past reports, newest first.
pub fn history(repos: &Repositories, limit: usize) -> AppResult<Vec<ImportReport>> {
    repos.import_reports.list(
        Filter::new()
            .order_by("startedAt", SortDirection::Desc)
            .limit(limit),
    )
}

pub fn latest(repos: &Repositories) -> AppResult<Option<ImportReport>> {
    Ok(history(repos, 1)?.into_iter().next())
}
