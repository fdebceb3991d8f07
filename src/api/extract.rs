use std::sync::Arc;

use axum::extract::{FromRequest, FromRequestParts};
use axum::http::request::Parts;

use crate::engine::Engine;
use crate::tenant::DEFAULT_TENANT;

use super::{ApiError, AppState};

pub const TENANT_HEADER: &str = "x-tenant-id";

/// `axum::Json` whose rejection renders as an [`ApiError`].
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// The engine of the tenant named by `x-tenant-id`.
pub struct Tenant(pub Arc<Engine>);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let name = match parts.headers.get(TENANT_HEADER) {
            None => DEFAULT_TENANT,
            Some(value) => value
                .to_str()
                .map_err(|_| ApiError::bad_request("InvalidTenant", "tenant header is not ASCII"))?,
        };
        state
            .tenants
            .get_or_create(name)
            .map(Tenant)
            .map_err(ApiError::tenant)
    }
}
