use axum::{routing::get, Router};

use crate::state::AppState;

pub mod billing_records;
pub mod expenses;
pub mod health;
pub mod identity;
pub mod leases;
pub mod maintenance;
pub mod mortgages;
pub mod organizations;
pub mod properties;
pub mod rent_payments;
pub mod reports;
pub mod tenants;
pub mod vendors;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/me", get(identity::me))
        .merge(organizations::router())
        .merge(properties::router())
        .merge(tenants::router())
        .merge(leases::router())
        .merge(vendors::router())
        .merge(expenses::router())
        .merge(mortgages::router())
        .merge(maintenance::router())
        .merge(billing_records::router())
        .merge(rent_payments::router())
        .merge(reports::router())
}
