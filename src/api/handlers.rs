use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use ulid::Ulid;

use crate::model::ReservationStatus;

use super::ApiError;
use super::dto::*;
use super::extract::{ApiJson, ApiPath, ApiQuery, Tenant};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Services ─────────────────────────────────────────────────────

pub async fn list_services(Tenant(engine): Tenant) -> Result<impl IntoResponse, ApiError> {
    let services: Vec<ServiceDto> = engine
        .list_services()
        .await?
        .into_iter()
        .map(ServiceDto::from)
        .collect();
    Ok(Json(services))
}

pub async fn get_service(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ServiceDto::from(engine.get_service(id).await?)))
}

pub async fn register_service(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(body): ApiJson<ServiceBody>,
) -> Result<impl IntoResponse, ApiError> {
    engine.register_service(body.into_config(id)).await?;
    Ok(Json(ServiceDto::from(engine.get_service(id).await?)))
}

pub async fn remove_service(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    engine.remove_service(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn calendar(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
    ApiQuery(q): ApiQuery<CalendarQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let granularity = q.granularity.0;
    let calendar = engine
        .availability_calendar(id, to_ms(q.range_start), to_ms(q.range_end), granularity)
        .await?;
    Ok(Json(CalendarDto {
        service_id: id,
        range_start: q.range_start,
        range_end: q.range_end,
        granularity,
        slots: calendar.map(SlotDto::from).collect(),
    }))
}

pub async fn check_availability(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(body): ApiJson<AvailabilityBody>,
) -> Result<impl IntoResponse, ApiError> {
    let check = engine
        .check_availability(
            id,
            to_ms(body.start_date),
            to_ms(body.end_date),
            body.quantity,
            body.exclude_reservation_id,
        )
        .await?;
    Ok(Json(AvailabilityDto::from(check)))
}

/// Overlap query when both range bounds are given, full listing otherwise.
pub async fn list_reservations(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
    ApiQuery(q): ApiQuery<ReservationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let statuses = q
        .statuses()
        .map_err(|s| ApiError::bad_request("InvalidQuery", format!("unknown status {s:?}")))?;
    let statuses: Option<&[ReservationStatus]> = statuses.as_deref();
    let reservations = match (q.range_start, q.range_end) {
        (Some(start), Some(end)) => {
            engine
                .query_overlapping(id, to_ms(start), to_ms(end), statuses)
                .await?
        }
        (None, None) => engine.list_reservations(id, statuses).await?,
        _ => {
            return Err(ApiError::bad_request(
                "InvalidQuery",
                "rangeStart and rangeEnd go together",
            ));
        }
    };
    Ok(Json(reservation_list(&reservations)))
}

// ── Reservations ─────────────────────────────────────────────────

pub async fn create_reservation(
    Tenant(engine): Tenant,
    ApiJson(body): ApiJson<CreateReservationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let created = engine.create_reservation(body.into()).await?;
    Ok((StatusCode::CREATED, Json(ReservationDto::from(created))))
}

pub async fn get_reservation(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ReservationDto::from(engine.get_reservation(id).await?)))
}

pub async fn update_reservation(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(body): ApiJson<UpdateReservationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = engine.update_reservation(id, body.into()).await?;
    Ok(Json(ReservationDto::from(updated)))
}

pub async fn set_status(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(body): ApiJson<StatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = engine.set_status(id, body.status).await?;
    Ok(Json(ReservationDto::from(updated)))
}

pub async fn cancel_reservation(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ReservationDto::from(engine.cancel(id).await?)))
}

pub async fn start_rental(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ReservationDto::from(engine.start_rental(id).await?)))
}

pub async fn complete_rental(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ReservationDto::from(engine.complete(id).await?)))
}

pub async fn mark_no_show(
    Tenant(engine): Tenant,
    ApiPath(id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(ReservationDto::from(engine.mark_no_show(id).await?)))
}

// ── Checkout ─────────────────────────────────────────────────────

pub async fn place_hold(
    Tenant(engine): Tenant,
    ApiJson(body): ApiJson<HoldBody>,
) -> Result<impl IntoResponse, ApiError> {
    let hold = engine.place_soft_hold(body.into()).await?;
    Ok((StatusCode::CREATED, Json(ReservationDto::from(hold))))
}

pub async fn confirm_booking(
    Tenant(engine): Tenant,
    ApiPath(booking_id): ApiPath<Ulid>,
) -> Result<impl IntoResponse, ApiError> {
    let confirmed = engine.confirm_booking(booking_id).await?;
    Ok(Json(BookingConfirmedDto {
        booking_id,
        reservations: reservation_list(&confirmed),
    }))
}
