//! Order placement, status workflow and queries.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    round_money, timestamp, Entity, Order, OrderItem, OrderOrigin, OrderStatus, OrderWithItems,
    PaymentMethod, RecordMeta,
};
use crate::payment_tables;
use crate::products;
use crate::repository::Repositories;
use crate::store::{Filter, SortDirection};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    pub customer_id: String,
    #[serde(default)]
    pub sales_rep_id: Option<String>,
    #[serde(default)]
    pub payment_table_id: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub notes: Option<String>,
    pub items: Vec<ItemDraft>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDraft {
    pub product_id: String,
    pub quantity: f64,
    /// Sales unit; empty means the product's unit.
    #[serde(default)]
    pub unit: String,
    /// Overrides the catalog price when set.
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub discount_percent: f64,
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Validate a desk order against the catalog, price it and persist it.
pub fn place_order(repos: &Repositories, draft: OrderDraft) -> AppResult<OrderWithItems> {
    if draft.items.is_empty() {
        return Err(AppError::validation("an order needs at least one item"));
    }

    let customer = repos.customers.get(&draft.customer_id)?;
    if customer.meta.is_deleted() || !customer.active {
        return Err(AppError::validation(format!(
            "customer {} is not active",
            customer.name
        )));
    }
    if let Some(rep_id) = &draft.sales_rep_id {
        repos.sales_reps.get(rep_id)?;
    }

    let mut items = Vec::with_capacity(draft.items.len());
    for line in &draft.items {
        let product = repos.products.get(&line.product_id)?;
        if product.meta.is_deleted() || !product.active {
            return Err(AppError::validation(format!(
                "product {} is not available",
                product.description
            )));
        }
        let unit_price = match line.unit_price {
            Some(price) => price,
            None => products::price_for(&product, &line.unit)?,
        };
        let unit = if line.unit.trim().is_empty() {
            product.unit.clone()
        } else {
            line.unit.trim().to_uppercase()
        };
        let mut item = OrderItem {
            product_id: Some(product.meta.id.clone()),
            description: product.description.clone(),
            unit,
            quantity: line.quantity,
            unit_price,
            discount_percent: line.discount_percent,
            // Placeholder until the order id is known.
            order_id: "pending".into(),
            ..OrderItem::default()
        };
        item.total = item.compute_total();
        item.validate()?;
        items.push(item);
    }

    let subtotal = round_money(items.iter().map(|i| i.total).sum());
    let total = round_money(subtotal - draft.discount);

    let payment_table_id = draft
        .payment_table_id
        .clone()
        .or_else(|| customer.payment_table_id.clone());
    let mut payment_method = draft.payment_method;
    if let Some(table_id) = &payment_table_id {
        let table = repos.payment_tables.get(table_id)?;
        if !payment_tables::applies_to(&table, total) {
            return Err(AppError::validation(format!(
                "payment table {:?} does not apply to a total of {total:.2}",
                table.name
            )));
        }
        payment_method = payment_method.or(table.payment_method);
    }

    let order = Order {
        meta: RecordMeta::default(),
        customer_id: Some(customer.meta.id.clone()),
        sales_rep_id: draft.sales_rep_id.or(customer.sales_rep_id.clone()),
        payment_table_id,
        payment_method,
        status: OrderStatus::Pending,
        origin: OrderOrigin::Desk,
        source_mobile_order_id: None,
        delivery_route_id: None,
        item_count: items.len() as u32,
        subtotal,
        discount: round_money(draft.discount),
        total,
        notes: draft.notes,
        issued_at: timestamp::now(),
    };
    order.validate()?;

    let placed = write_order_with_items(repos, order, items)?;
    info!(
        order_id = %placed.order.meta.id,
        code = placed.order.meta.code,
        total = placed.order.total,
        "Order placed"
    );
    Ok(placed)
}

/// Insert the order, then each item. When an item insert fails the items
/// already written, the failed item and the order are deleted again before
/// the error is returned.
pub fn write_order_with_items(
    repos: &Repositories,
    order: Order,
    items: Vec<OrderItem>,
) -> AppResult<OrderWithItems> {
    let order = repos.orders.create(order)?;
    let order_id = order.meta.id.clone();

    let mut written: Vec<OrderItem> = Vec::with_capacity(items.len());
    for mut item in items {
        item.order_id = order_id.clone();
        if item.meta.id.trim().is_empty() {
            item.meta.id = Uuid::new_v4().to_string();
        }
        let item_id = item.meta.id.clone();
        match repos.order_items.create(item) {
            Ok(saved) => written.push(saved),
            Err(e) => {
                warn!(
                    order_id = %order_id,
                    written = written.len(),
                    error = %e,
                    "Item insert failed, rolling back order"
                );
                compensate(repos, &order_id, &written, &item_id);
                return Err(e);
            }
        }
    }

    Ok(OrderWithItems {
        order,
        items: written,
    })
}

/// The failed item is purged too: a caching store may hold a copy of it.
fn compensate(repos: &Repositories, order_id: &str, written: &[OrderItem], failed_id: &str) {
    let ids = written.iter().map(|item| item.meta.id.as_str());
    for item_id in ids.chain(std::iter::once(failed_id)) {
        if let Err(e) = repos.order_items.purge(item_id) {
            error!(order_id, item_id, "Compensating item delete failed: {e}");
        }
    }
    if let Err(e) = repos.orders.purge(order_id) {
        error!(order_id, "Compensating order delete failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Status workflow
// ---------------------------------------------------------------------------

/// Whether `from -> to` is an allowed status change.
pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed) | (Confirmed, Invoiced) | (Invoiced, Delivered)
    ) || (to == Cancelled && !matches!(from, Delivered | Cancelled))
}

pub fn transition(repos: &Repositories, order_id: &str, to: OrderStatus) -> AppResult<Order> {
    let mut order = repos.orders.get(order_id)?;
    if order.meta.is_deleted() {
        return Err(AppError::not_found(Order::COLLECTION.as_str(), order_id));
    }
    let from = order.status;
    if !can_transition(from, to) {
        return Err(AppError::Conflict(format!(
            "order {} cannot go from {} to {}",
            order.meta.code,
            from.as_str(),
            to.as_str()
        )));
    }
    order.status = to;
    let order = repos.orders.update(order)?;
    info!(order_id, from = from.as_str(), to = to.as_str(), "Order status changed");
    Ok(order)
}

pub fn confirm(repos: &Repositories, order_id: &str) -> AppResult<Order> {
    transition(repos, order_id, OrderStatus::Confirmed)
}

pub fn invoice(repos: &Repositories, order_id: &str) -> AppResult<Order> {
    transition(repos, order_id, OrderStatus::Invoiced)
}

pub fn deliver(repos: &Repositories, order_id: &str) -> AppResult<Order> {
    transition(repos, order_id, OrderStatus::Delivered)
}

pub fn cancel(repos: &Repositories, order_id: &str) -> AppResult<Order> {
    transition(repos, order_id, OrderStatus::Cancelled)
}

/// Put an order on a delivery route.
pub fn assign_to_route(repos: &Repositories, order_id: &str, route_id: &str) -> AppResult<Order> {
    let route = repos.routes.get(route_id)?;
    if route.meta.is_deleted() || !route.active {
        return Err(AppError::validation(format!(
            "route {} is not active",
            route.name
        )));
    }
    let mut order = repos.orders.get(order_id)?;
    if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Delivered) {
        return Err(AppError::Conflict(format!(
            "order {} is {} and cannot be routed",
            order.meta.code,
            order.status.as_str()
        )));
    }
    order.delivery_route_id = Some(route.meta.id);
    repos.orders.update(order)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn newest_first(filter: Filter) -> Filter {
    filter.order_by("issuedAt", SortDirection::Desc)
}

pub fn by_customer(repos: &Repositories, customer_id: &str) -> AppResult<Vec<Order>> {
    repos
        .orders
        .list(newest_first(Filter::new().eq("customerId", customer_id)))
}

pub fn by_sales_rep(repos: &Repositories, sales_rep_id: &str) -> AppResult<Vec<Order>> {
    repos
        .orders
        .list(newest_first(Filter::new().eq("salesRepId", sales_rep_id)))
}

pub fn by_status(repos: &Repositories, status: OrderStatus) -> AppResult<Vec<Order>> {
    repos
        .orders
        .list(newest_first(Filter::new().eq("status", status.as_str())))
}

pub fn by_route(repos: &Repositories, route_id: &str) -> AppResult<Vec<Order>> {
    repos
        .orders
        .list(newest_first(Filter::new().eq("deliveryRouteId", route_id)))
}

/// Orders issued in `[from, to)`.
pub fn in_range(
    repos: &Repositories,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> AppResult<Vec<Order>> {
    let filter = Filter::new()
        .gte("issuedAt", timestamp::format(&from))
        .lt("issuedAt", timestamp::format(&to));
    repos.orders.list(newest_first(filter))
}

pub fn items_of(repos: &Repositories, order_id: &str) -> AppResult<Vec<OrderItem>> {
    repos
        .order_items
        .list(Filter::new().eq("orderId", order_id).order_by("code", SortDirection::Asc))
}

pub fn get_with_items(repos: &Repositories, order_id: &str) -> AppResult<OrderWithItems> {
    let order = repos.orders.get(order_id)?;
    let items = items_of(repos, order_id)?;
    Ok(OrderWithItems { order, items })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Customer, DeliveryRoute, PaymentTable, PaymentTerm, Product};
    use crate::store::{Collection, DocumentStore, FallbackStore, SqliteStore, Store};
    use chrono::Duration;
    use serde_json::Value;
    use std::sync::Arc;

    /// Store wrapper that rejects inserts into one collection after a number
    /// of successful ones.
    pub(crate) struct FailingInserts {
        pub inner: Arc<dyn Store>,
        pub collection: Collection,
        pub allow: std::sync::atomic::AtomicUsize,
    }

    impl Store for FailingInserts {
        fn backend_name(&self) -> &'static str {
            "failing"
        }
        fn insert(&self, c: Collection, doc: &Value) -> AppResult<()> {
            use std::sync::atomic::Ordering;
            if c == self.collection {
                let left = self.allow.load(Ordering::SeqCst);
                if left == 0 {
                    return Err(AppError::Store("disk full".into()));
                }
                self.allow.store(left - 1, Ordering::SeqCst);
            }
            self.inner.insert(c, doc)
        }
        fn update(&self, c: Collection, doc: &Value) -> AppResult<()> {
            self.inner.update(c, doc)
        }
        fn get(&self, c: Collection, id: &str) -> AppResult<Option<Value>> {
            self.inner.get(c, id)
        }
        fn list(&self, c: Collection, f: &Filter) -> AppResult<Vec<Value>> {
            self.inner.list(c, f)
        }
        fn delete(&self, c: Collection, id: &str) -> AppResult<bool> {
            self.inner.delete(c, id)
        }
        fn next_code(&self, c: Collection) -> AppResult<i64> {
            self.inner.next_code(c)
        }
    }

    struct Fixture {
        repos: Repositories,
        customer: Customer,
        water: Product,
        juice: Product,
    }

    fn fixture(store: Arc<dyn Store>) -> Fixture {
        let repos = Repositories::new(store);
        let customer = repos
            .customers
            .create(Customer {
                name: "Padaria Sol".into(),
                ..Customer::default()
            })
            .unwrap();
        let water = repos
            .products
            .create(Product {
                description: "Mineral water 500ml".into(),
                unit: "CX".into(),
                subunit: Some("UN".into()),
                conversion_factor: 12.0,
                price: 18.0,
                ..Product::default()
            })
            .unwrap();
        let juice = repos
            .products
            .create(Product {
                description: "Orange juice 1L".into(),
                unit: "UN".into(),
                conversion_factor: 1.0,
                price: 7.5,
                ..Product::default()
            })
            .unwrap();
        Fixture {
            repos,
            customer,
            water,
            juice,
        }
    }

    fn draft(f: &Fixture) -> OrderDraft {
        OrderDraft {
            customer_id: f.customer.meta.id.clone(),
            discount: 1.0,
            items: vec![
                ItemDraft {
                    product_id: f.water.meta.id.clone(),
                    quantity: 2.0,
                    ..ItemDraft::default()
                },
                ItemDraft {
                    product_id: f.water.meta.id.clone(),
                    quantity: 6.0,
                    unit: "un".into(),
                    ..ItemDraft::default()
                },
                ItemDraft {
                    product_id: f.juice.meta.id.clone(),
                    quantity: 4.0,
                    discount_percent: 10.0,
                    ..ItemDraft::default()
                },
            ],
            ..OrderDraft::default()
        }
    }

    #[test]
    fn test_place_order_prices_and_persists() {
        let stores: Vec<Arc<dyn Store>> = vec![
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(DocumentStore::in_memory()),
        ];
        for store in stores {
            let f = fixture(store);
            let placed = place_order(&f.repos, draft(&f)).unwrap();

            // 2 x 18 + 6 x 1.5 + 4 x 7.5 x 0.9
            assert_eq!(placed.order.subtotal, 72.0);
            assert_eq!(placed.order.total, 71.0);
            assert_eq!(placed.order.item_count, 3);
            assert_eq!(placed.order.status, OrderStatus::Pending);
            assert_eq!(placed.order.origin, OrderOrigin::Desk);
            assert_eq!(placed.order.meta.code, 1);
            assert_eq!(placed.items[1].unit, "UN");

            let loaded = get_with_items(&f.repos, &placed.order.meta.id).unwrap();
            assert_eq!(loaded.items.len(), 3);
            assert!(loaded
                .items
                .iter()
                .all(|i| i.order_id == placed.order.meta.id));
        }
    }

    #[test]
    fn test_place_order_rejects_bad_references() {
        let f = fixture(Arc::new(DocumentStore::in_memory()));

        let mut d = draft(&f);
        d.customer_id = "missing".into();
        assert!(matches!(
            place_order(&f.repos, d).unwrap_err(),
            AppError::NotFound { .. }
        ));

        let mut d = draft(&f);
        d.items[0].product_id = "missing".into();
        assert!(place_order(&f.repos, d).is_err());

        let mut d = draft(&f);
        d.items[0].unit = "KG".into();
        assert!(matches!(
            place_order(&f.repos, d).unwrap_err(),
            AppError::Validation(_)
        ));

        let mut d = draft(&f);
        d.items.clear();
        assert!(place_order(&f.repos, d).is_err());

        assert!(f.repos.orders.all().unwrap().is_empty());
    }

    #[test]
    fn test_place_order_checks_payment_table_minimum() {
        let f = fixture(Arc::new(DocumentStore::in_memory()));
        let table = f
            .repos
            .payment_tables
            .create(PaymentTable {
                name: "Boleto 30".into(),
                payment_method: Some(PaymentMethod::BankSlip),
                terms: vec![PaymentTerm {
                    days: 30,
                    percent: 100.0,
                }],
                min_order_value: 500.0,
                active: true,
                ..PaymentTable::default()
            })
            .unwrap();

        let mut d = draft(&f);
        d.payment_table_id = Some(table.meta.id.clone());
        assert!(place_order(&f.repos, d).is_err());

        let mut cheap = table.clone();
        cheap.min_order_value = 10.0;
        f.repos.payment_tables.update(cheap).unwrap();
        let mut d = draft(&f);
        d.payment_table_id = Some(table.meta.id.clone());
        let placed = place_order(&f.repos, d).unwrap();
        assert_eq!(placed.order.payment_method, Some(PaymentMethod::BankSlip));
    }

    #[test]
    fn test_item_failure_rolls_back_order() {
        let inner: Arc<dyn Store> = Arc::new(DocumentStore::in_memory());
        let f = fixture(inner.clone());
        let failing: Arc<dyn Store> = Arc::new(FailingInserts {
            inner: inner.clone(),
            collection: Collection::OrderItems,
            allow: std::sync::atomic::AtomicUsize::new(2),
        });
        let repos = Repositories::new(failing);

        let err = place_order(&repos, draft(&f)).unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert!(repos.orders.list_with(Filter::new(), true).unwrap().is_empty());
        assert!(repos
            .order_items
            .list_with(Filter::new(), true)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_item_failure_leaves_nothing_in_local_cache() {
        let inner: Arc<dyn Store> = Arc::new(DocumentStore::in_memory());
        let f = fixture(inner.clone());
        let failing: Arc<dyn Store> = Arc::new(FailingInserts {
            inner: inner.clone(),
            collection: Collection::OrderItems,
            allow: std::sync::atomic::AtomicUsize::new(1),
        });
        let cached = Arc::new(FallbackStore::new(failing, DocumentStore::in_memory()));
        let repos = Repositories::new(cached.clone());

        assert!(place_order(&repos, draft(&f)).is_err());
        let cache = cached.cache();
        assert!(cache.list(Collection::OrderItems, &Filter::new()).unwrap().is_empty());
        assert!(cache.list(Collection::Orders, &Filter::new()).unwrap().is_empty());
        assert!(inner.list(Collection::OrderItems, &Filter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(can_transition(Pending, Confirmed));
        assert!(can_transition(Confirmed, Invoiced));
        assert!(can_transition(Invoiced, Delivered));
        assert!(can_transition(Pending, Cancelled));
        assert!(can_transition(Invoiced, Cancelled));
        assert!(!can_transition(Pending, Invoiced));
        assert!(!can_transition(Delivered, Cancelled));
        assert!(!can_transition(Cancelled, Pending));
        assert!(!can_transition(Cancelled, Cancelled));

        let f = fixture(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let id = place_order(&f.repos, draft(&f)).unwrap().order.meta.id;
        assert!(matches!(
            deliver(&f.repos, &id).unwrap_err(),
            AppError::Conflict(_)
        ));
        confirm(&f.repos, &id).unwrap();
        invoice(&f.repos, &id).unwrap();
        assert_eq!(deliver(&f.repos, &id).unwrap().status, Delivered);
        assert!(cancel(&f.repos, &id).is_err());
        assert_eq!(by_status(&f.repos, Delivered).unwrap().len(), 1);
    }

    #[test]
    fn test_queries_and_route_assignment() {
        let f = fixture(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let first = place_order(&f.repos, draft(&f)).unwrap().order;
        let second = place_order(&f.repos, draft(&f)).unwrap().order;

        let mine = by_customer(&f.repos, &f.customer.meta.id).unwrap();
        assert_eq!(mine.len(), 2);
        assert!(by_customer(&f.repos, "other").unwrap().is_empty());

        let now = Utc::now();
        let window = in_range(&f.repos, now - Duration::hours(1), now + Duration::hours(1)).unwrap();
        assert_eq!(window.len(), 2);
        assert!(in_range(&f.repos, now + Duration::hours(1), now + Duration::hours(2))
            .unwrap()
            .is_empty());

        let route = f
            .repos
            .routes
            .create(DeliveryRoute {
                name: "North".into(),
                active: true,
                ..DeliveryRoute::default()
            })
            .unwrap();
        assign_to_route(&f.repos, &first.meta.id, &route.meta.id).unwrap();
        cancel(&f.repos, &second.meta.id).unwrap();
        assert!(assign_to_route(&f.repos, &second.meta.id, &route.meta.id).is_err());
        let routed = by_route(&f.repos, &route.meta.id).unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].meta.id, first.meta.id);
    }
}
