//! Command-line surface.

use anyhow::{bail, Context as _};
use chrono::{Utc, Weekday};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::{AppConfig, BackendKind};
use crate::diagnostics;
use crate::error::AppError;
use crate::mobile_import;
use crate::models::OrderStatus;
use crate::orders::{self, OrderDraft};
use crate::payment_tables;
use crate::products;
use crate::reports;
use crate::repository::Repositories;
use crate::routes;
use crate::store::{Collection, Filter, SortDirection};

/// Sales Desk: orders, catalog and mobile order import.
#[derive(Parser, Debug)]
#[command(name = "sales-desk", version, about = "Sales-order management and mobile order import")]
pub struct Cli {
    /// Path to the config file (default: <config dir>/sales-desk/config.toml).
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Storage backend: sqlite, document or rest.
    #[arg(long = "backend", global = true, env = "SALES_DESK_BACKEND")]
    pub backend: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import pending mobile orders.
    Import {
        /// Classify and report without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show past import reports, newest first.
    Reports {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// List records of a collection (e.g. customers, mobile-orders).
    List {
        collection: String,
        /// Include soft-deleted records.
        #[arg(long)]
        include_deleted: bool,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one record.
    Get { collection: String, id: String },

    /// Load a JSON export of mobile orders (`{"orders": [...], "items": [...]}`).
    LoadMobile { file: PathBuf },

    /// Installment plan of a payment table for an order total.
    Schedule { payment_table_id: String, total: f64 },

    /// Order operations.
    Order {
        #[command(subcommand)]
        action: OrderAction,
    },

    /// Delivery route operations.
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },

    /// Search products by description or reference.
    Search {
        term: String,
        #[arg(long)]
        include_inactive: bool,
    },

    /// Version and environment.
    About,

    /// Record counts and import backlog.
    Health,

    /// Print the effective configuration (secrets redacted).
    Config,
}

#[derive(Subcommand, Debug)]
pub enum OrderAction {
    /// Place an order from a JSON draft file.
    Place { file: PathBuf },
    /// Show an order with its items.
    Show { id: String },
    /// Move an order to a new status (confirmed, invoiced, delivered, cancelled).
    Status { id: String, status: String },
    /// Put an order on a delivery route.
    Route { id: String, route_id: String },
}

#[derive(Subcommand, Debug)]
pub enum RouteAction {
    /// Add a customer stop, optionally at a 0-based position.
    AddStop {
        route_id: String,
        customer_id: String,
        #[arg(long)]
        position: Option<usize>,
    },
    RemoveStop { route_id: String, customer_id: String },
    MoveStop {
        route_id: String,
        customer_id: String,
        position: usize,
    },
    /// Assign an active vehicle to the route.
    Vehicle { route_id: String, vehicle_id: String },
    /// Active routes running on a weekday (mon, tue, ...).
    Day { weekday: String },
}

/// Apply command-line overrides on top of the loaded configuration.
pub fn apply_overrides(cli: &Cli, config: &mut AppConfig) -> anyhow::Result<()> {
    if let Some(raw) = &cli.backend {
        config.store.backend = raw.parse::<BackendKind>()?;
    }
    Ok(())
}

/// Whether the command needs an open store.
pub fn needs_store(command: &Commands) -> bool {
    !matches!(command, Commands::About | Commands::Config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_collection(raw: &str) -> anyhow::Result<Collection> {
    match Collection::parse(raw) {
        Some(c) => Ok(c),
        None => {
            let known: Vec<&str> = Collection::ALL.iter().map(|c| c.as_str()).collect();
            bail!("unknown collection '{raw}' (expected one of: {})", known.join(", "))
        }
    }
}

fn parse_status(raw: &str) -> anyhow::Result<OrderStatus> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase()))
        .with_context(|| format!("unknown order status '{raw}'"))
}

pub fn execute_offline(command: &Commands, config: &AppConfig) -> anyhow::Result<()> {
    match command {
        Commands::About => print_json(&diagnostics::about(config)),
        Commands::Config => print_json(&diagnostics::redacted_config(config)?),
        other => bail!("command {other:?} needs a store"),
    }
}

pub fn execute(command: Commands, config: &AppConfig, repos: &Repositories) -> anyhow::Result<()> {
    match command {
        Commands::Import { dry_run } => {
            let report =
                mobile_import::run_import_with(repos, &config.import, dry_run || config.import.dry_run)?;
            print_json(&report)
        }
        Commands::Reports { limit } => print_json(&reports::history(repos, limit)?),
        Commands::List {
            collection,
            include_deleted,
            limit,
        } => {
            let collection = parse_collection(&collection)?;
            let mut filter = Filter::new().order_by("code", SortDirection::Asc);
            if !include_deleted {
                filter = filter.is_null("deletedAt");
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            print_json(&repos.store().list(collection, &filter)?)
        }
        Commands::Get { collection, id } => {
            let collection = parse_collection(&collection)?;
            let doc = repos
                .store()
                .get(collection, &id)?
                .ok_or_else(|| AppError::not_found(collection.as_str(), id))?;
            print_json(&doc)
        }
        Commands::LoadMobile { file } => {
            let summary = mobile_import::load_file(repos, &file)
                .with_context(|| format!("loading {}", file.display()))?;
            print_json(&summary)
        }
        Commands::Schedule {
            payment_table_id,
            total,
        } => {
            let table = repos.payment_tables.get(&payment_table_id)?;
            print_json(&payment_tables::schedule(&table, total, Utc::now())?)
        }
        Commands::Order { action } => match action {
            OrderAction::Place { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let draft: OrderDraft = serde_json::from_str(&raw)?;
                print_json(&orders::place_order(repos, draft)?)
            }
            OrderAction::Show { id } => print_json(&orders::get_with_items(repos, &id)?),
            OrderAction::Status { id, status } => {
                let status = parse_status(&status)?;
                print_json(&orders::transition(repos, &id, status)?)
            }
            OrderAction::Route { id, route_id } => {
                print_json(&orders::assign_to_route(repos, &id, &route_id)?)
            }
        },
        Commands::Route { action } => match action {
            RouteAction::AddStop {
                route_id,
                customer_id,
                position,
            } => print_json(&routes::add_stop(repos, &route_id, &customer_id, position)?),
            RouteAction::RemoveStop {
                route_id,
                customer_id,
            } => print_json(&routes::remove_stop(repos, &route_id, &customer_id)?),
            RouteAction::MoveStop {
                route_id,
                customer_id,
                position,
            } => print_json(&routes::move_stop(repos, &route_id, &customer_id, position)?),
            RouteAction::Vehicle {
                route_id,
                vehicle_id,
            } => print_json(&routes::assign_vehicle(repos, &route_id, &vehicle_id)?),
            RouteAction::Day { weekday } => {
                let day: Weekday = weekday
                    .parse()
                    .map_err(|_| anyhow::anyhow!("unknown weekday '{weekday}'"))?;
                print_json(&routes::for_weekday(repos, day)?)
            }
        },
        Commands::Search {
            term,
            include_inactive,
        } => print_json(&products::search(&repos.products, &term, include_inactive)?),
        Commands::Health => print_json(&diagnostics::health(repos)?),
        Commands::About => print_json(&diagnostics::about(config)),
        Commands::Config => print_json(&diagnostics::redacted_config(config)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;
    use std::sync::Arc;

    #[test]
    fn test_parse_import_dry_run() {
        let cli = Cli::try_parse_from(["sales-desk", "--backend", "document", "import", "--dry-run"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Import { dry_run: true }));
        let mut config = AppConfig::default();
        apply_overrides(&cli, &mut config).unwrap();
        assert_eq!(config.store.backend, BackendKind::Document);
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let cli = Cli::try_parse_from(["sales-desk", "--backend", "oracle", "health"]).unwrap();
        assert!(apply_overrides(&cli, &mut AppConfig::default()).is_err());
    }

    #[test]
    fn test_parse_order_and_list_commands() {
        let cli = Cli::try_parse_from(["sales-desk", "order", "status", "o-1", "confirmed"]).unwrap();
        match cli.command {
            Commands::Order {
                action: OrderAction::Status { id, status },
            } => {
                assert_eq!(id, "o-1");
                assert_eq!(parse_status(&status).unwrap(), OrderStatus::Confirmed);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(parse_status("shipped").is_err());

        let cli = Cli::try_parse_from(["sales-desk", "list", "mobile-orders", "--include-deleted"])
            .unwrap();
        assert!(needs_store(&cli.command));
        assert!(!needs_store(&Commands::About));
        assert!(parse_collection("mobile-orders").is_ok());
        assert!(parse_collection("widgets").is_err());
    }

    #[test]
    fn test_execute_against_document_store() {
        let repos = Repositories::new(Arc::new(DocumentStore::in_memory()));
        let config = AppConfig::default();
        execute(Commands::Import { dry_run: false }, &config, &repos).unwrap();
        assert_eq!(reports::history(&repos, 5).unwrap().len(), 1);

        let err = execute(
            Commands::Get {
                collection: "customers".into(),
                id: "missing".into(),
            },
            &config,
            &repos,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
