//! Delivery routes: ordered customer stops and the vehicle that runs them.

use chrono::Weekday;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::DeliveryRoute;
use crate::repository::Repositories;
use crate::store::{Filter, SortDirection};

fn active_route(repos: &Repositories, route_id: &str) -> AppResult<DeliveryRoute> {
    let route = repos.routes.get(route_id)?;
    if route.meta.is_deleted() {
        return Err(AppError::not_found("delivery_routes", route_id));
    }
    Ok(route)
}

/// Append a customer to the route, or insert it at `position` (0-based).
pub fn add_stop(
    repos: &Repositories,
    route_id: &str,
    customer_id: &str,
    position: Option<usize>,
) -> AppResult<DeliveryRoute> {
    let mut route = active_route(repos, route_id)?;
    let customer = repos.customers.get(customer_id)?;
    if customer.meta.is_deleted() {
        return Err(AppError::not_found("customers", customer_id));
    }
    if route.stops.iter().any(|s| s == customer_id) {
        return Err(AppError::Conflict(format!(
            "customer {} is already a stop on route {}",
            customer.name, route.name
        )));
    }
    let at = position.unwrap_or(route.stops.len()).min(route.stops.len());
    route.stops.insert(at, customer_id.to_string());
    let route = repos.routes.update(route)?;
    info!(route_id, customer_id, position = at, "Stop added");
    Ok(route)
}

pub fn remove_stop(
    repos: &Repositories,
    route_id: &str,
    customer_id: &str,
) -> AppResult<DeliveryRoute> {
    let mut route = active_route(repos, route_id)?;
    let before = route.stops.len();
    route.stops.retain(|s| s != customer_id);
    if route.stops.len() == before {
        return Err(AppError::not_found("route stop", customer_id));
    }
    repos.routes.update(route)
}

/// Move an existing stop to `position`, clamped to the end of the list.
pub fn move_stop(
    repos: &Repositories,
    route_id: &str,
    customer_id: &str,
    position: usize,
) -> AppResult<DeliveryRoute> {
    let mut route = active_route(repos, route_id)?;
    let from = route
        .stops
        .iter()
        .position(|s| s == customer_id)
        .ok_or_else(|| AppError::not_found("route stop", customer_id))?;
    let stop = route.stops.remove(from);
    let to = position.min(route.stops.len());
    route.stops.insert(to, stop);
    repos.routes.update(route)
}

pub fn assign_vehicle(
    repos: &Repositories,
    route_id: &str,
    vehicle_id: &str,
) -> AppResult<DeliveryRoute> {
    let mut route = active_route(repos, route_id)?;
    let vehicle = repos.vehicles.get(vehicle_id)?;
    if vehicle.meta.is_deleted() || !vehicle.active {
        return Err(AppError::validation(format!(
            "vehicle {} is not active",
            vehicle.plate
        )));
    }
    route.vehicle_id = Some(vehicle.meta.id);
    let route = repos.routes.update(route)?;
    info!(route_id, vehicle_id, "Vehicle assigned to route");
    Ok(route)
}

/// Active routes running on `weekday`, by code.
pub fn for_weekday(repos: &Repositories, weekday: Weekday) -> AppResult<Vec<DeliveryRoute>> {
    let routes = repos
        .routes
        .list(Filter::new().eq("active", true).order_by("code", SortDirection::Asc))?;
    Ok(routes
        .into_iter()
        .filter(|r| r.weekday == Some(weekday))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Vehicle};
    use crate::store::{DocumentStore, SqliteStore, Store};
    use std::sync::Arc;

    fn setup(store: Arc<dyn Store>) -> (Repositories, DeliveryRoute, Vec<String>) {
        let repos = Repositories::new(store);
        let route = repos
            .routes
            .create(DeliveryRoute {
                name: "North".into(),
                weekday: Some(Weekday::Tue),
                ..DeliveryRoute::default()
            })
            .unwrap();
        let customers = ["Padaria Sol", "Mercado Lua", "Bar Estrela"]
            .iter()
            .map(|name| {
                repos
                    .customers
                    .create(Customer {
                        name: name.to_string(),
                        ..Customer::default()
                    })
                    .unwrap()
                    .meta
                    .id
            })
            .collect();
        (repos, route, customers)
    }

    #[test]
    fn test_add_move_remove_stops() {
        let (repos, route, c) = setup(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let id = route.meta.id.as_str();

        add_stop(&repos, id, &c[0], None).unwrap();
        add_stop(&repos, id, &c[1], None).unwrap();
        let r = add_stop(&repos, id, &c[2], Some(0)).unwrap();
        assert_eq!(r.stops, vec![c[2].clone(), c[0].clone(), c[1].clone()]);

        assert!(matches!(
            add_stop(&repos, id, &c[0], None).unwrap_err(),
            AppError::Conflict(_)
        ));
        assert!(add_stop(&repos, id, "missing", None).is_err());

        let r = move_stop(&repos, id, &c[2], 99).unwrap();
        assert_eq!(r.stops, vec![c[0].clone(), c[1].clone(), c[2].clone()]);

        let r = remove_stop(&repos, id, &c[1]).unwrap();
        assert_eq!(r.stops, vec![c[0].clone(), c[2].clone()]);
        assert!(remove_stop(&repos, id, &c[1]).is_err());
        assert_eq!(repos.routes.get(id).unwrap().stops.len(), 2);
    }

    #[test]
    fn test_assign_vehicle_requires_active_vehicle() {
        let (repos, route, _) = setup(Arc::new(DocumentStore::in_memory()));
        let truck = repos
            .vehicles
            .create(Vehicle {
                plate: "ABC-1234".into(),
                ..Vehicle::default()
            })
            .unwrap();
        let parked = repos
            .vehicles
            .create(Vehicle {
                plate: "XYZ-9876".into(),
                active: false,
                ..Vehicle::default()
            })
            .unwrap();

        assert!(assign_vehicle(&repos, &route.meta.id, &parked.meta.id).is_err());
        let r = assign_vehicle(&repos, &route.meta.id, &truck.meta.id).unwrap();
        assert_eq!(r.vehicle_id.as_deref(), Some(truck.meta.id.as_str()));
        assert!(assign_vehicle(&repos, &route.meta.id, "missing").is_err());
    }

    #[test]
    fn test_for_weekday() {
        let (repos, _, _) = setup(Arc::new(SqliteStore::open_in_memory().unwrap()));
        repos
            .routes
            .create(DeliveryRoute {
                name: "South".into(),
                weekday: Some(Weekday::Fri),
                ..DeliveryRoute::default()
            })
            .unwrap();
        repos
            .routes
            .create(DeliveryRoute {
                name: "Retired".into(),
                weekday: Some(Weekday::Tue),
                active: false,
                ..DeliveryRoute::default()
            })
            .unwrap();

        let tuesday = for_weekday(&repos, Weekday::Tue).unwrap();
        assert_eq!(tuesday.len(), 1);
        assert_eq!(tuesday[0].name, "North");
        assert!(for_weekday(&repos, Weekday::Mon).unwrap().is_empty());
    }
}
