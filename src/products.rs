//! Product catalog helpers: unit/subunit conversion, pricing and search.
//!
//! A product is priced per `unit` (e.g. a box, "CX"). When it has a
//! `subunit` (e.g. "UN"), `conversion_factor` subunits make one unit.
//! Quantities in base units are always expressed in `unit`.

use crate::error::{AppError, AppResult};
use crate::models::{round_money, Product};
use crate::repository::Repository;
use crate::store::Filter;

fn same_unit(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn is_subunit(product: &Product, unit: &str) -> bool {
    product
        .subunit
        .as_deref()
        .is_some_and(|sub| same_unit(sub, unit))
}

/// Convert a quantity sold in `unit` to the product's base unit.
///
/// An empty unit is read as the base unit.
pub fn to_base_quantity(product: &Product, quantity: f64, unit: &str) -> AppResult<f64> {
    if unit.trim().is_empty() || same_unit(&product.unit, unit) {
        return Ok(quantity);
    }
    if is_subunit(product, unit) {
        return Ok(quantity / product.conversion_factor);
    }
    Err(unknown_unit(product, unit))
}

/// Price of one subunit, if the product has one.
pub fn subunit_price(product: &Product) -> Option<f64> {
    product.subunit.as_ref()?;
    Some(round_money(product.price / product.conversion_factor))
}

/// Price of one `unit` of the product.
pub fn price_for(product: &Product, unit: &str) -> AppResult<f64> {
    if unit.trim().is_empty() || same_unit(&product.unit, unit) {
        return Ok(product.price);
    }
    if is_subunit(product, unit) {
        return Ok(round_money(product.price / product.conversion_factor));
    }
    Err(unknown_unit(product, unit))
}

fn unknown_unit(product: &Product, unit: &str) -> AppError {
    AppError::validation(format!(
        "unit {unit:?} is not valid for product {:?} (expected {}{})",
        product.description,
        product.unit,
        product
            .subunit
            .as_deref()
            .map(|s| format!(" or {s}"))
            .unwrap_or_default()
    ))
}

/// Case-insensitive substring search over description and reference.
/// Inactive products are skipped unless `include_inactive` is set.
pub fn search(
    products: &Repository<Product>,
    term: &str,
    include_inactive: bool,
) -> AppResult<Vec<Product>> {
    let needle = term.trim().to_lowercase();
    let mut found: Vec<Product> = products
        .list(Filter::new())?
        .into_iter()
        .filter(|p| include_inactive || p.active)
        .filter(|p| {
            needle.is_empty()
                || p.description.to_lowercase().contains(&needle)
                || p.reference
                    .as_deref()
                    .is_some_and(|r| r.to_lowercase().contains(&needle))
        })
        .collect();
    found.sort_by(|a, b| a.description.to_lowercase().cmp(&b.description.to_lowercase()));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;
    use std::sync::Arc;

    fn water() -> Product {
        Product {
            description: "Mineral water 500ml".into(),
            reference: Some("AGU-500".into()),
            unit: "CX".into(),
            subunit: Some("UN".into()),
            conversion_factor: 12.0,
            price: 18.0,
            ..Product::default()
        }
    }

    #[test]
    fn test_to_base_quantity() {
        let p = water();
        assert_eq!(to_base_quantity(&p, 2.0, "CX").unwrap(), 2.0);
        assert_eq!(to_base_quantity(&p, 2.0, "cx").unwrap(), 2.0);
        assert_eq!(to_base_quantity(&p, 6.0, "UN").unwrap(), 0.5);
        assert_eq!(to_base_quantity(&p, 3.0, "").unwrap(), 3.0);
        assert!(matches!(
            to_base_quantity(&p, 1.0, "KG").unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[test]
    fn test_prices() {
        let p = water();
        assert_eq!(subunit_price(&p), Some(1.5));
        assert_eq!(price_for(&p, "CX").unwrap(), 18.0);
        assert_eq!(price_for(&p, "UN").unwrap(), 1.5);
        assert!(price_for(&p, "PCT").is_err());

        let plain = Product {
            subunit: None,
            conversion_factor: 1.0,
            ..water()
        };
        assert_eq!(subunit_price(&plain), None);
        assert!(price_for(&plain, "UN").is_err());
    }

    #[test]
    fn test_search() {
        let repo: Repository<Product> = Repository::new(Arc::new(DocumentStore::in_memory()));
        repo.create(water()).unwrap();
        repo.create(Product {
            description: "Orange juice 1L".into(),
            reference: Some("SUC-1000".into()),
            unit: "UN".into(),
            subunit: None,
            conversion_factor: 1.0,
            price: 7.5,
            ..Product::default()
        })
        .unwrap();
        repo.create(Product {
            description: "Water gallon 20L".into(),
            active: false,
            ..water()
        })
        .unwrap();

        let hits = search(&repo, "WATER", false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].description, "Mineral water 500ml");

        assert_eq!(search(&repo, "water", true).unwrap().len(), 2);
        assert_eq!(search(&repo, "suc-", false).unwrap()[0].price, 7.5);
        assert_eq!(search(&repo, "", false).unwrap().len(), 2);
    }
}
