//! Business records stored through the [`crate::store::Store`] seam.
//!
//! Every record flattens a [`RecordMeta`] (id, numeric code, timestamps) next
//! to its own fields and serialises with camelCase keys, so the same JSON
//! body is used by every backend.

use chrono::{DateTime, Utc, Weekday};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::store::Collection;

/// Round a money amount to cents.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Timestamps are written as fixed-width RFC 3339 with milliseconds so that
/// string comparison in every backend matches chronological order.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Current time at the precision records are stored with.
    pub fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => s.serialize_str(&super::format(v)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => super::parse(&raw).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid timestamp: {raw}"))
                }),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entity plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub code: i64,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RecordMeta {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
    const COLLECTION: Collection;

    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn validate(&self) -> AppResult<()> {
        Ok(())
    }

    /// Hook run by the repository before an update is written.
    fn before_update(&mut self) {}

    fn id(&self) -> &str {
        &self.meta().id
    }

    fn to_document(&self) -> AppResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_document(doc: Value) -> AppResult<Self> {
        Ok(serde_json::from_value(doc)?)
    }
}

macro_rules! entity {
    ($ty:ty, $collection:expr) => {
        entity!($ty, $collection, |_this: &$ty| Ok(()));
    };
    ($ty:ty, $collection:expr, $validate:expr) => {
        impl Entity for $ty {
            const COLLECTION: Collection = $collection;

            fn meta(&self) -> &RecordMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut RecordMeta {
                &mut self.meta
            }

            fn validate(&self) -> AppResult<()> {
                let check: fn(&$ty) -> AppResult<()> = $validate;
                check(self)
            }
        }
    };
}

fn require_text(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} is required")));
    }
    Ok(())
}

fn require_non_negative(value: f64, field: &str) -> AppResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(AppError::validation(format!(
            "{field} must be zero or positive (got {value})"
        )));
    }
    Ok(())
}

fn require_percent(value: f64, field: &str) -> AppResult<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(AppError::validation(format!(
            "{field} must be between 0 and 100 (got {value})"
        )));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_one() -> f64 {
    1.0
}

fn default_version() -> i64 {
    1
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Invoiced,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Invoiced => "invoiced",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOrigin {
    #[default]
    Desk,
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankSlip,
    BankTransfer,
    Check,
    StoreCredit,
}

impl PaymentMethod {
    /// Map the free-text method typed on the mobile devices.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "cash" | "money" | "dinheiro" => Some(Self::Cash),
            "card" | "creditcard" | "debitcard" | "cartao" => Some(Self::Card),
            "bankslip" | "slip" | "boleto" => Some(Self::BankSlip),
            "banktransfer" | "transfer" | "pix" | "wire" => Some(Self::BankTransfer),
            "check" | "cheque" => Some(Self::Check),
            "storecredit" | "credit" | "account" => Some(Self::StoreCredit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitReason {
    ZeroValue,
    Cancelled,
}

/// What a mobile order became once imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportedAs {
    Order,
    Visit,
}

// ---------------------------------------------------------------------------
// Master data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    #[serde(default)]
    pub trade_name: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub sales_rep_id: Option<String>,
    #[serde(default)]
    pub payment_table_id: Option<String>,
    #[serde(default)]
    pub credit_limit: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Bumped on every update; not checked against concurrent writers.
    #[serde(default = "default_version")]
    pub version: i64,
}

impl Default for Customer {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            name: String::new(),
            trade_name: None,
            document: None,
            phone: None,
            email: None,
            address: None,
            city: None,
            state: None,
            sales_rep_id: None,
            payment_table_id: None,
            credit_limit: 0.0,
            notes: None,
            active: true,
            version: default_version(),
        }
    }
}

impl Entity for Customer {
    const COLLECTION: Collection = Collection::Customers;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn validate(&self) -> AppResult<()> {
        require_text(&self.name, "customer name")?;
        require_non_negative(self.credit_limit, "credit limit")
    }

    fn before_update(&mut self) {
        self.version += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub description: String,
    #[serde(default)]
    pub reference: Option<String>,
    pub unit: String,
    #[serde(default)]
    pub subunit: Option<String>,
    /// Number of subunits in one unit.
    #[serde(default = "default_one")]
    pub conversion_factor: f64,
    /// Price of one unit.
    pub price: f64,
    #[serde(default)]
    pub stock: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for Product {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            description: String::new(),
            reference: None,
            unit: String::new(),
            subunit: None,
            conversion_factor: default_one(),
            price: 0.0,
            stock: 0.0,
            active: true,
        }
    }
}

entity!(Product, Collection::Products, |p: &Product| {
    require_text(&p.description, "product description")?;
    require_text(&p.unit, "product unit")?;
    require_non_negative(p.price, "price")?;
    if !p.conversion_factor.is_finite() || p.conversion_factor < 1.0 {
        return Err(AppError::validation(format!(
            "conversion factor must be at least 1 (got {})",
            p.conversion_factor
        )));
    }
    if let Some(sub) = &p.subunit {
        if sub.trim().eq_ignore_ascii_case(p.unit.trim()) {
            return Err(AppError::validation("subunit must differ from unit"));
        }
    }
    Ok(())
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesRep {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub commission_percent: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for SalesRep {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            name: String::new(),
            email: None,
            phone: None,
            commission_percent: 0.0,
            active: true,
        }
    }
}

entity!(SalesRep, Collection::SalesReps, |r: &SalesRep| {
    require_text(&r.name, "sales rep name")?;
    require_percent(r.commission_percent, "commission percent")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub plate: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capacity_kg: Option<f64>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for Vehicle {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            plate: String::new(),
            description: None,
            capacity_kg: None,
            active: true,
        }
    }
}

entity!(Vehicle, Collection::Vehicles, |v: &Vehicle| {
    require_text(&v.plate, "vehicle plate")?;
    if let Some(capacity) = v.capacity_kg {
        require_non_negative(capacity, "capacity")?;
    }
    Ok(())
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRoute {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub weekday: Option<Weekday>,
    /// Customer ids in visiting order.
    #[serde(default)]
    pub stops: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for DeliveryRoute {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            name: String::new(),
            vehicle_id: None,
            weekday: None,
            stops: Vec::new(),
            active: true,
        }
    }
}

entity!(DeliveryRoute, Collection::DeliveryRoutes, |r: &DeliveryRoute| {
    require_text(&r.name, "route name")?;
    let mut seen = std::collections::HashSet::new();
    for stop in &r.stops {
        if !seen.insert(stop.as_str()) {
            return Err(AppError::validation(format!("duplicate stop: {stop}")));
        }
    }
    Ok(())
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTerm {
    /// Days after the order is issued.
    pub days: u32,
    /// Share of the order total, in percent.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTable {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    pub terms: Vec<PaymentTerm>,
    #[serde(default)]
    pub min_order_value: f64,
    #[serde(default)]
    pub surcharge_percent: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for PaymentTable {
    fn default() -> Self {
        Self {
            meta: RecordMeta::default(),
            name: String::new(),
            payment_method: None,
            terms: Vec::new(),
            min_order_value: 0.0,
            surcharge_percent: 0.0,
            active: true,
        }
    }
}

entity!(PaymentTable, Collection::PaymentTables, |t: &PaymentTable| {
    require_text(&t.name, "payment table name")?;
    require_non_negative(t.min_order_value, "minimum order value")?;
    require_percent(t.surcharge_percent, "surcharge percent")?;
    crate::payment_tables::validate_terms(&t.terms)
});

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub sales_rep_id: Option<String>,
    #[serde(default)]
    pub payment_table_id: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub origin: OrderOrigin,
    #[serde(default)]
    pub source_mobile_order_id: Option<String>,
    #[serde(default)]
    pub delivery_route_id: Option<String>,
    #[serde(default)]
    pub item_count: u32,
    #[serde(default)]
    pub subtotal: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(with = "timestamp")]
    pub issued_at: DateTime<Utc>,
}

entity!(Order, Collection::Orders, |o: &Order| {
    require_non_negative(o.subtotal, "subtotal")?;
    require_non_negative(o.discount, "discount")?;
    require_non_negative(o.total, "total")?;
    if o.discount > o.subtotal + 0.001 {
        return Err(AppError::validation(format!(
            "discount {:.2} exceeds subtotal {:.2}",
            o.discount, o.subtotal
        )));
    }
    Ok(())
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub order_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub discount_percent: f64,
    #[serde(default)]
    pub total: f64,
}

impl OrderItem {
    pub fn compute_total(&self) -> f64 {
        round_money(self.quantity * self.unit_price * (1.0 - self.discount_percent / 100.0))
    }
}

entity!(OrderItem, Collection::OrderItems, |i: &OrderItem| {
    require_text(&i.order_id, "order id")?;
    if !i.quantity.is_finite() || i.quantity <= 0.0 {
        return Err(AppError::validation(format!(
            "quantity must be positive (got {})",
            i.quantity
        )));
    }
    require_non_negative(i.unit_price, "unit price")?;
    require_percent(i.discount_percent, "discount percent")
});

/// An order together with its line items.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

// ---------------------------------------------------------------------------
// Mobile capture
// ---------------------------------------------------------------------------

/// Order captured offline on a field device. Reference fields keep whatever
/// the device sent (strings, numbers, garbage) until the import sanitises them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileOrder {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub customer_id: Option<Value>,
    #[serde(default)]
    pub sales_rep_id: Option<Value>,
    #[serde(default)]
    pub payment_table_id: Option<Value>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub imported: bool,
    #[serde(default, with = "timestamp::option")]
    pub imported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub imported_target_id: Option<String>,
    #[serde(default)]
    pub imported_as: Option<ImportedAs>,
}

impl MobileOrder {
    pub fn is_cancelled(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| {
                matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "cancelled" | "canceled" | "cancelado"
                )
            })
            .unwrap_or(false)
    }
}

entity!(MobileOrder, Collection::MobileOrders);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileOrderItem {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub mobile_order_id: String,
    #[serde(default)]
    pub product_id: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default)]
    pub discount_percent: f64,
}

entity!(MobileOrderItem, Collection::MobileOrderItems);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub sales_rep_id: Option<String>,
    pub source_mobile_order_id: String,
    pub reason: VisitReason,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(with = "timestamp")]
    pub visited_at: DateTime<Utc>,
}

entity!(Visit, Collection::Visits, |v: &Visit| {
    require_text(&v.source_mobile_order_id, "source mobile order id")
});
