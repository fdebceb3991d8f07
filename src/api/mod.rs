//! HTTP surface: JSON over axum, one engine per tenant.

pub mod dto;
mod error;
mod events;
mod extract;
mod handlers;

pub use error::ApiError;
pub use extract::TENANT_HEADER;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, patch, post};
use tower_http::trace::TraceLayer;

use crate::observability;
use crate::tenant::TenantManager;

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantManager>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/services", get(handlers::list_services))
        .route(
            "/services/{id}",
            get(handlers::get_service)
                .put(handlers::register_service)
                .delete(handlers::remove_service),
        )
        .route("/services/{id}/calendar", get(handlers::calendar))
        .route("/services/{id}/availability", post(handlers::check_availability))
        .route("/services/{id}/reservations", get(handlers::list_reservations))
        .route("/services/{id}/events", get(events::stream))
        .route("/reservations", post(handlers::create_reservation))
        .route(
            "/reservations/{id}",
            get(handlers::get_reservation)
                .put(handlers::update_reservation)
                .delete(handlers::cancel_reservation),
        )
        .route("/reservations/{id}/status", patch(handlers::set_status))
        .route("/reservations/{id}/start", post(handlers::start_rental))
        .route("/reservations/{id}/complete", post(handlers::complete_rental))
        .route("/reservations/{id}/no-show", post(handlers::mark_no_show))
        .route("/holds", post(handlers::place_hold))
        .route("/bookings/{booking_id}/confirm", post(handlers::confirm_booking))
        .layer(middleware::from_fn(observability::track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
