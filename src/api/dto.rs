//! JSON shapes of the HTTP surface. Timestamps are ISO-8601 UTC on the wire
//! and `Ms` inside the engine; conversion happens here and nowhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{NewReservation, ReservationPatch, SoftHoldRequest};
use crate::model::*;
use crate::notify::Change;

pub fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

/// Stored instants are validated on the way in, so the fallback is unreachable.
pub fn from_ms(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ── Services ─────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_period_unit() -> PeriodUnit {
    PeriodUnit::Day
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBody {
    #[serde(default)]
    pub name: Option<String>,
    pub capacity: u32,
    #[serde(default = "default_period_unit")]
    pub period_unit: PeriodUnit,
    #[serde(default)]
    pub min_rental_periods: u32,
    #[serde(default)]
    pub buffer_before_ms: Ms,
    #[serde(default)]
    pub buffer_after_ms: Ms,
    #[serde(default = "default_true")]
    pub allow_simultaneous_bookings: bool,
}

impl ServiceBody {
    pub fn into_config(self, id: Ulid) -> ServiceConfig {
        ServiceConfig {
            id,
            name: self.name,
            capacity: self.capacity,
            period_unit: self.period_unit,
            min_rental_periods: self.min_rental_periods,
            buffer_before: self.buffer_before_ms,
            buffer_after: self.buffer_after_ms,
            allow_simultaneous_bookings: self.allow_simultaneous_bookings,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDto {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub period_unit: PeriodUnit,
    pub min_rental_periods: u32,
    pub buffer_before_ms: Ms,
    pub buffer_after_ms: Ms,
    pub allow_simultaneous_bookings: bool,
}

impl From<ServiceConfig> for ServiceDto {
    fn from(c: ServiceConfig) -> Self {
        Self {
            id: c.id,
            name: c.name,
            capacity: c.capacity,
            period_unit: c.period_unit,
            min_rental_periods: c.min_rental_periods,
            buffer_before_ms: c.buffer_before,
            buffer_after_ms: c.buffer_after,
            allow_simultaneous_bookings: c.allow_simultaneous_bookings,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDto {
    pub id: Ulid,
    pub service_id: Ulid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity_reserved: u32,
    pub status: ReservationStatus,
    #[serde(rename = "type")]
    pub kind: ReservationType,
    pub booking_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationDto {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            service_id: r.service_id,
            start_date: from_ms(r.span.start),
            end_date: from_ms(r.span.end),
            quantity_reserved: r.quantity,
            status: r.status,
            kind: r.kind,
            booking_id: r.booking_id,
            customer_id: r.customer_id,
            expires_at: r.expires_at.map(from_ms),
            notes: r.notes.clone(),
            created_at: from_ms(r.created_at),
            updated_at: from_ms(r.updated_at),
        }
    }
}

impl From<Reservation> for ReservationDto {
    fn from(r: Reservation) -> Self {
        Self::from(&r)
    }
}

pub fn reservation_list(rs: &[Reservation]) -> Vec<ReservationDto> {
    rs.iter().map(ReservationDto::from).collect()
}

fn default_kind() -> ReservationType {
    ReservationType::Booking
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationBody {
    #[serde(default)]
    pub id: Option<Ulid>,
    pub service_id: Ulid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity: u32,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ReservationType,
    #[serde(default)]
    pub status: Option<ReservationStatus>,
    #[serde(default)]
    pub booking_id: Option<Ulid>,
    #[serde(default)]
    pub customer_id: Option<Ulid>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<CreateReservationBody> for NewReservation {
    fn from(b: CreateReservationBody) -> Self {
        NewReservation {
            id: b.id,
            service_id: b.service_id,
            start: to_ms(b.start_date),
            end: to_ms(b.end_date),
            quantity: b.quantity,
            kind: b.kind,
            status: b.status,
            booking_id: b.booking_id,
            customer_id: b.customer_id,
            expires_at: b.expires_at.map(to_ms),
            notes: b.notes,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReservationBody {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<UpdateReservationBody> for ReservationPatch {
    fn from(b: UpdateReservationBody) -> Self {
        ReservationPatch {
            start: b.start_date.map(to_ms),
            end: b.end_date.map(to_ms),
            quantity: b.quantity,
            notes: b.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: ReservationStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldBody {
    pub service_id: Ulid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity: u32,
    pub ttl_seconds: i64,
    #[serde(default)]
    pub booking_id: Option<Ulid>,
    #[serde(default)]
    pub customer_id: Option<Ulid>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<HoldBody> for SoftHoldRequest {
    fn from(b: HoldBody) -> Self {
        SoftHoldRequest {
            service_id: b.service_id,
            start: to_ms(b.start_date),
            end: to_ms(b.end_date),
            quantity: b.quantity,
            ttl_ms: b.ttl_seconds.saturating_mul(1000),
            booking_id: b.booking_id,
            customer_id: b.customer_id,
            notes: b.notes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmedDto {
    pub booking_id: Ulid,
    pub reservations: Vec<ReservationDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationsQuery {
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    /// Comma-separated status names.
    pub status: Option<String>,
}

impl ReservationsQuery {
    /// `Ok(None)` when no filter was given; `Err` names the first unknown status.
    pub fn statuses(&self) -> Result<Option<Vec<ReservationStatus>>, String> {
        let Some(raw) = self.status.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        raw.split(',')
            .map(|tok| ReservationStatus::parse(tok).ok_or_else(|| tok.trim().to_owned()))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityBody {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity: u32,
    #[serde(default)]
    pub exclude_reservation_id: Option<Ulid>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityDto {
    pub is_available: bool,
    pub available_quantity: u32,
    pub conflicts: Vec<ReservationDto>,
    pub has_more: bool,
}

impl From<AvailabilityCheck> for AvailabilityDto {
    fn from(c: AvailabilityCheck) -> Self {
        Self {
            is_available: c.is_available,
            available_quantity: c.available_quantity,
            conflicts: reservation_list(&c.conflicts),
            has_more: c.has_more,
        }
    }
}

/// Accepts `hour`, `Hour`, `HOUR` and so on.
#[derive(Debug, Clone, Copy, Default)]
pub struct GranularityParam(pub Granularity);

impl<'de> Deserialize<'de> for GranularityParam {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.to_ascii_lowercase().as_str() {
            "hour" => Ok(Self(Granularity::Hour)),
            "day" => Ok(Self(Granularity::Day)),
            "week" => Ok(Self(Granularity::Week)),
            _ => Err(serde::de::Error::unknown_variant(&raw, &["hour", "day", "week"])),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarQuery {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    #[serde(default)]
    pub granularity: GranularityParam,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotDto {
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub total_quantity: u32,
    pub reserved_quantity: u32,
    pub available_quantity: u32,
    pub is_fully_booked: bool,
}

impl From<AvailabilitySlot> for SlotDto {
    fn from(s: AvailabilitySlot) -> Self {
        Self {
            slot_start: from_ms(s.span.start),
            slot_end: from_ms(s.span.end),
            total_quantity: s.total_quantity,
            reserved_quantity: s.reserved_quantity,
            available_quantity: s.available_quantity,
            is_fully_booked: s.is_fully_booked,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDto {
    pub service_id: Ulid,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub granularity: Granularity,
    pub slots: Vec<SlotDto>,
}

// ── Change stream ────────────────────────────────────────────────

/// Payload of one server-sent event; clients refetch what they render.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDto {
    pub service_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
}

impl From<&Change> for ChangeDto {
    fn from(change: &Change) -> Self {
        Self {
            service_id: change.service_id,
            reservation_id: change.reservation_id,
            status: change.status,
        }
    }
}
