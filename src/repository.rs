//! Generic CRUD over the storage seam.
//!
//! A [`Repository`] owns the bookkeeping every record shares: id and code
//! assignment, timestamps, validation and soft delete. Domain modules build
//! on top of it instead of talking to the [`Store`] directly.

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    timestamp, Customer, DeliveryRoute, Entity, MobileOrder, MobileOrderItem, Order, OrderItem,
    PaymentTable, Product, SalesRep, Vehicle, Visit,
};
use crate::reports::ImportReport;
use crate::store::{Filter, Store};

pub struct Repository<E: Entity> {
    store: Arc<dyn Store>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self::new(self.store.clone())
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate and insert a new record, assigning id, code and timestamps.
    pub fn create(&self, mut entity: E) -> AppResult<E> {
        entity.validate()?;
        let collection = E::COLLECTION;
        let now = timestamp::now();
        let meta = entity.meta_mut();
        if meta.id.trim().is_empty() {
            meta.id = Uuid::new_v4().to_string();
        }
        meta.code = self.store.next_code(collection)?;
        meta.created_at = Some(now);
        meta.updated_at = Some(now);
        meta.deleted_at = None;

        self.store.insert(collection, &entity.to_document()?)?;
        debug!(
            collection = %collection,
            id = %entity.id(),
            code = entity.meta().code,
            "Record created"
        );
        Ok(entity)
    }

    /// Validate and replace an existing record.
    pub fn update(&self, mut entity: E) -> AppResult<E> {
        entity.validate()?;
        if entity.id().trim().is_empty() {
            return Err(AppError::validation("cannot update a record without an id"));
        }
        entity.before_update();
        entity.meta_mut().updated_at = Some(timestamp::now());
        self.store.update(E::COLLECTION, &entity.to_document()?)?;
        debug!(collection = %E::COLLECTION, id = %entity.id(), "Record updated");
        Ok(entity)
    }

    /// Fetch a record by id, soft-deleted ones included.
    pub fn find(&self, id: &str) -> AppResult<Option<E>> {
        self.store
            .get(E::COLLECTION, id)?
            .map(E::from_document)
            .transpose()
    }

    pub fn get(&self, id: &str) -> AppResult<E> {
        self.find(id)?
            .ok_or_else(|| AppError::not_found(E::COLLECTION.as_str(), id))
    }

    /// Records matching `filter`, excluding soft-deleted ones.
    pub fn list(&self, filter: Filter) -> AppResult<Vec<E>> {
        self.list_with(filter, false)
    }

    pub fn list_with(&self, filter: Filter, include_deleted: bool) -> AppResult<Vec<E>> {
        let filter = if include_deleted {
            filter
        } else {
            filter.is_null("deletedAt")
        };
        self.store
            .list(E::COLLECTION, &filter)?
            .into_iter()
            .map(E::from_document)
            .collect()
    }

    pub fn all(&self) -> AppResult<Vec<E>> {
        self.list(Filter::new())
    }

    pub fn count(&self, filter: Filter) -> AppResult<usize> {
        self.store
            .count(E::COLLECTION, &filter.is_null("deletedAt"))
    }

    pub fn find_by_code(&self, code: i64) -> AppResult<Option<E>> {
        Ok(self
            .list(Filter::new().eq("code", code).limit(1))?
            .into_iter()
            .next())
    }

    /// Mark a record deleted. Already-deleted records keep their original
    /// deletion time.
    pub fn soft_delete(&self, id: &str) -> AppResult<E> {
        let mut entity = self.get(id)?;
        if entity.meta().is_deleted() {
            return Ok(entity);
        }
        let now = timestamp::now();
        let meta = entity.meta_mut();
        meta.deleted_at = Some(now);
        meta.updated_at = Some(now);
        self.store.update(E::COLLECTION, &entity.to_document()?)?;
        info!(collection = %E::COLLECTION, id, "Record soft-deleted");
        Ok(entity)
    }

    pub fn restore(&self, id: &str) -> AppResult<E> {
        let mut entity = self.get(id)?;
        if !entity.meta().is_deleted() {
            return Ok(entity);
        }
        let meta = entity.meta_mut();
        meta.deleted_at = None;
        meta.updated_at = Some(timestamp::now());
        self.store.update(E::COLLECTION, &entity.to_document()?)?;
        info!(collection = %E::COLLECTION, id, "Record restored");
        Ok(entity)
    }

    /// Remove a record for good. Returns whether anything was deleted.
    pub fn purge(&self, id: &str) -> AppResult<bool> {
        let removed = self.store.delete(E::COLLECTION, id)?;
        if removed {
            info!(collection = %E::COLLECTION, id, "Record purged");
        }
        Ok(removed)
    }
}

/// One repository per entity, sharing a store.
#[derive(Clone)]
pub struct Repositories {
    pub customers: Repository<Customer>,
    pub products: Repository<Product>,
    pub orders: Repository<Order>,
    pub order_items: Repository<OrderItem>,
    pub payment_tables: Repository<PaymentTable>,
    pub sales_reps: Repository<SalesRep>,
    pub vehicles: Repository<Vehicle>,
    pub routes: Repository<DeliveryRoute>,
    pub mobile_orders: Repository<MobileOrder>,
    pub mobile_order_items: Repository<MobileOrderItem>,
    pub visits: Repository<Visit>,
    pub import_reports: Repository<ImportReport>,
}

impl Repositories {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            customers: Repository::new(store.clone()),
            products: Repository::new(store.clone()),
            orders: Repository::new(store.clone()),
            order_items: Repository::new(store.clone()),
            payment_tables: Repository::new(store.clone()),
            sales_reps: Repository::new(store.clone()),
            vehicles: Repository::new(store.clone()),
            routes: Repository::new(store.clone()),
            mobile_orders: Repository::new(store.clone()),
            mobile_order_items: Repository::new(store.clone()),
            visits: Repository::new(store.clone()),
            import_reports: Repository::new(store),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.customers.store()
    }
}
