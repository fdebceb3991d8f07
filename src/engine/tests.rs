use super::*;
use super::conflict::{check_capacity, now_ms};
use crate::limits::*;
use crate::notify::{ChangeKind, NotifyHub};

use proptest::prelude::*;

const D: Ms = DAY_MS;
/// 2027-06-01T00:00:00Z
const JUN1: Ms = 1_811_808_000_000;

fn jun(day: i64) -> Ms {
    JUN1 + (day - 1) * D
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("holdfast_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

async fn service(engine: &Engine, capacity: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .register_service(ServiceConfig::new(id, capacity))
        .await
        .unwrap();
    id
}

async fn book(engine: &Engine, sid: Ulid, start: Ms, end: Ms, qty: u32) -> Result<Reservation, EngineError> {
    engine
        .create_reservation(NewReservation::new(sid, start, end, qty, ReservationType::Booking))
        .await
}

fn hold_req(sid: Ulid, start: Ms, end: Ms, qty: u32, ttl_ms: Ms) -> SoftHoldRequest {
    SoftHoldRequest {
        service_id: sid,
        start,
        end,
        quantity: qty,
        ttl_ms,
        booking_id: None,
        customer_id: None,
        notes: None,
    }
}

// ── Services ─────────────────────────────────────────────

#[tokio::test]
async fn register_and_get_service() {
    let engine = new_engine("register_get.wal");
    let id = Ulid::new();
    let mut config = ServiceConfig::new(id, 3);
    config.name = Some("Kayak".into());
    config.buffer_after = D;
    engine.register_service(config.clone()).await.unwrap();

    assert_eq!(engine.get_service(id).await.unwrap(), config);
    assert_eq!(engine.list_services().await.unwrap(), vec![config]);
    assert!(matches!(
        engine.get_service(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn register_rejects_zero_capacity() {
    let engine = new_engine("register_zero.wal");
    let r = engine.register_service(ServiceConfig::new(Ulid::new(), 0)).await;
    assert!(matches!(r, Err(EngineError::InvalidQuantity { .. })));
}

#[tokio::test]
async fn capacity_reduction_below_peak_rejected() {
    let engine = new_engine("capacity_reduce.wal");
    let sid = service(&engine, 5).await;
    let a = book(&engine, sid, jun(1), jun(5), 2).await.unwrap();
    let b = book(&engine, sid, jun(3), jun(8), 2).await.unwrap();
    book(&engine, sid, jun(10), jun(12), 1).await.unwrap();

    match engine.register_service(ServiceConfig::new(sid, 3)).await {
        Err(EngineError::CapacityExceeded {
            requested,
            conflicts,
            has_more,
            ..
        }) => {
            assert_eq!(requested, 4);
            let ids: Vec<Ulid> = conflicts.iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![a.id, b.id]);
            assert!(!has_more);
        }
        other => panic!("unexpected {other:?}"),
    }

    engine.register_service(ServiceConfig::new(sid, 4)).await.unwrap();
    assert_eq!(engine.get_service(sid).await.unwrap().capacity, 4);
}

#[tokio::test]
async fn exclusive_switch_keeps_unit_capacity() {
    let engine = new_engine("exclusive_switch_units.wal");
    let sid = service(&engine, 5).await;
    let big = book(&engine, sid, jun(1), jun(3), 3).await.unwrap();

    let mut config = ServiceConfig::new(sid, 1);
    config.allow_simultaneous_bookings = false;
    match engine.register_service(config).await {
        Err(EngineError::CapacityExceeded { requested, conflicts, .. }) => {
            assert_eq!(requested, 3);
            assert_eq!(conflicts[0].id, big.id);
        }
        other => panic!("unexpected {other:?}"),
    }
    let kept = engine.get_service(sid).await.unwrap();
    assert_eq!(kept.capacity, 5);
    assert!(kept.allow_simultaneous_bookings);
}

#[tokio::test]
async fn exclusive_switch_rejects_overlapping_reservations() {
    let engine = new_engine("exclusive_switch_overlap.wal");
    let sid = service(&engine, 5).await;
    let first = book(&engine, sid, jun(1), jun(4), 1).await.unwrap();
    let second = book(&engine, sid, jun(2), jun(5), 1).await.unwrap();

    let mut config = ServiceConfig::new(sid, 5);
    config.allow_simultaneous_bookings = false;
    match engine.register_service(config.clone()).await {
        Err(EngineError::CapacityExceeded { conflicts, .. }) => {
            let ids: Vec<Ulid> = conflicts.iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![first.id, second.id]);
        }
        other => panic!("unexpected {other:?}"),
    }

    engine.cancel(second.id).await.unwrap();
    engine.register_service(config).await.unwrap();
    assert!(!engine.get_service(sid).await.unwrap().allow_simultaneous_bookings);
}

#[tokio::test]
async fn remove_service_requires_no_active_reservations() {
    let engine = new_engine("remove_service.wal");
    let sid = service(&engine, 1).await;
    let r = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();

    assert!(matches!(
        engine.remove_service(sid).await,
        Err(EngineError::InvalidState { .. })
    ));

    engine.cancel(r.id).await.unwrap();
    engine.remove_service(sid).await.unwrap();
    assert!(matches!(engine.get_service(sid).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_reservation(r.id).await, Err(EngineError::NotFound(_))));
}

// ── Capacity ─────────────────────────────────────────────

#[tokio::test]
async fn adjacent_reservations_at_full_capacity() {
    let engine = new_engine("half_open.wal");
    let sid = service(&engine, 2).await;
    // [Jan 1, Jan 3) and [Jan 3, Jan 5) do not overlap.
    let jan1 = 1_798_761_600_000;
    book(&engine, sid, jan1, jan1 + 2 * D, 2).await.unwrap();
    book(&engine, sid, jan1 + 2 * D, jan1 + 4 * D, 2).await.unwrap();
}

#[tokio::test]
async fn buffer_after_extends_occupancy() {
    let engine = new_engine("buffer_after.wal");
    let sid = Ulid::new();
    let mut config = ServiceConfig::new(sid, 1);
    config.buffer_after = D;
    engine.register_service(config).await.unwrap();

    book(&engine, sid, jun(1), jun(3), 1).await.unwrap();
    let same_day = book(&engine, sid, jun(3), jun(5), 1).await;
    assert!(matches!(same_day, Err(EngineError::CapacityExceeded { .. })));
    book(&engine, sid, jun(4), jun(6), 1).await.unwrap();
}

#[tokio::test]
async fn buffer_before_reaches_back() {
    let engine = new_engine("buffer_before.wal");
    let sid = Ulid::new();
    let mut config = ServiceConfig::new(sid, 1);
    config.buffer_before = D;
    engine.register_service(config).await.unwrap();

    book(&engine, sid, jun(5), jun(7), 1).await.unwrap();
    assert!(book(&engine, sid, jun(3), jun(5), 1).await.is_err());
    book(&engine, sid, jun(2), jun(4), 1).await.unwrap();
}

#[tokio::test]
async fn capacity_exceeded_lists_conflicts() {
    let engine = new_engine("conflicts.wal");
    let sid = service(&engine, 3).await;
    let a = book(&engine, sid, jun(1), jun(4), 2).await.unwrap();
    let b = book(&engine, sid, jun(3), jun(6), 1).await.unwrap();

    match book(&engine, sid, jun(2), jun(5), 1).await {
        Err(EngineError::CapacityExceeded {
            capacity,
            requested,
            available,
            conflicts,
            has_more,
        }) => {
            assert_eq!((capacity, requested, available), (3, 1, 0));
            let ids: Vec<Ulid> = conflicts.iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![a.id, b.id]);
            assert!(!has_more);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn june_scenario_check_cancel_check() {
    let engine = new_engine("june_scenario.wal");
    let sid = service(&engine, 5).await;
    let booking = book(&engine, sid, jun(1), jun(10), 5).await.unwrap();

    let check = engine.check_availability(sid, jun(5), jun(8), 1, None).await.unwrap();
    assert!(!check.is_available);
    assert_eq!(check.available_quantity, 0);
    assert_eq!(check.conflicts.len(), 1);
    assert_eq!(check.conflicts[0].id, booking.id);

    engine.cancel(booking.id).await.unwrap();

    let check = engine.check_availability(sid, jun(5), jun(8), 1, None).await.unwrap();
    assert!(check.is_available);
    assert_eq!(check.available_quantity, 5);
    assert!(check.conflicts.is_empty());
}

#[tokio::test]
async fn check_availability_validates_input() {
    let engine = new_engine("check_validation.wal");
    let sid = service(&engine, 2).await;
    assert!(matches!(
        engine.check_availability(sid, jun(3), jun(3), 1, None).await,
        Err(EngineError::InvalidRange { .. })
    ));
    assert!(matches!(
        engine.check_availability(sid, jun(3), jun(1), 1, None).await,
        Err(EngineError::InvalidRange { .. })
    ));
    assert!(matches!(
        engine.check_availability(sid, jun(1), jun(3), 0, None).await,
        Err(EngineError::InvalidQuantity { .. })
    ));
    assert!(matches!(
        engine.check_availability(sid, jun(1), jun(3), 3, None).await,
        Err(EngineError::InvalidQuantity { .. })
    ));
    assert!(matches!(
        engine.check_availability(Ulid::new(), jun(1), jun(3), 1, None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn exclusive_service_allows_one_reservation_at_a_time() {
    let engine = new_engine("exclusive.wal");
    let sid = Ulid::new();
    let mut config = ServiceConfig::new(sid, 4);
    config.allow_simultaneous_bookings = false;
    engine.register_service(config).await.unwrap();

    book(&engine, sid, jun(1), jun(3), 2).await.unwrap();
    assert!(matches!(
        book(&engine, sid, jun(2), jun(4), 1).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
    book(&engine, sid, jun(3), jun(4), 4).await.unwrap();
}

#[tokio::test]
async fn minimum_rental_period_enforced() {
    let engine = new_engine("min_period.wal");
    let sid = Ulid::new();
    let mut config = ServiceConfig::new(sid, 1);
    config.period_unit = PeriodUnit::Week;
    config.min_rental_periods = 1;
    engine.register_service(config).await.unwrap();

    assert!(matches!(
        book(&engine, sid, jun(1), jun(3), 1).await,
        Err(EngineError::InvalidRange { .. })
    ));
    book(&engine, sid, jun(1), jun(8), 1).await.unwrap();
}

#[tokio::test]
async fn maintenance_blocks_capacity_without_buffers() {
    let engine = new_engine("maintenance.wal");
    let sid = Ulid::new();
    let mut config = ServiceConfig::new(sid, 1);
    config.buffer_after = D;
    engine.register_service(config).await.unwrap();

    let m = engine
        .create_reservation(NewReservation::new(sid, jun(1), jun(3), 1, ReservationType::Maintenance))
        .await
        .unwrap();
    assert_eq!(m.status, ReservationStatus::Confirmed);
    assert_eq!(m.expires_at, None);

    assert!(book(&engine, sid, jun(2), jun(4), 1).await.is_err());
    // Maintenance is not padded, but the candidate booking is: its buffer
    // only reaches forward.
    book(&engine, sid, jun(3), jun(4), 1).await.unwrap();
}

#[tokio::test]
async fn duplicate_reservation_id_rejected() {
    let engine = new_engine("duplicate_id.wal");
    let sid = service(&engine, 5).await;
    let mut req = NewReservation::new(sid, jun(1), jun(2), 1, ReservationType::Booking);
    req.id = Some(Ulid::new());
    engine.create_reservation(req.clone()).await.unwrap();
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn notes_are_bounded() {
    let engine = new_engine("notes_limit.wal");
    let sid = service(&engine, 1).await;
    let mut req = NewReservation::new(sid, jun(1), jun(2), 1, ReservationType::Booking);
    req.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Update ───────────────────────────────────────────────

#[tokio::test]
async fn update_rechecks_capacity_excluding_self() {
    let engine = new_engine("update_self.wal");
    let sid = service(&engine, 3).await;
    let r = book(&engine, sid, jun(1), jun(5), 3).await.unwrap();

    // Extending its own range only competes with others.
    let patch = ReservationPatch {
        end: Some(jun(7)),
        notes: Some("extended".into()),
        ..Default::default()
    };
    let updated = engine.update_reservation(r.id, patch).await.unwrap();
    assert_eq!(updated.span, Span::new(jun(1), jun(7)));
    assert_eq!(updated.notes.as_deref(), Some("extended"));

    book(&engine, sid, jun(7), jun(9), 1).await.unwrap();
    let grow = ReservationPatch {
        end: Some(jun(8)),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_reservation(r.id, grow).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
}

#[tokio::test]
async fn update_rejected_once_in_use() {
    let engine = new_engine("update_in_use.wal");
    let sid = service(&engine, 1).await;
    let r = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
    engine.confirm_reservation(r.id).await.unwrap();
    engine.start_rental(r.id).await.unwrap();

    let patch = ReservationPatch {
        quantity: Some(1),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_reservation(r.id, patch).await,
        Err(EngineError::InvalidState { status: ReservationStatus::InUse, .. })
    ));
}

// ── Status machine ───────────────────────────────────────

#[tokio::test]
async fn lifecycle_happy_path() {
    let engine = new_engine("lifecycle.wal");
    let sid = service(&engine, 1).await;
    let r = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);

    let r = engine.confirm_reservation(r.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    let r = engine.start_rental(r.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::InUse);
    let r = engine.complete(r.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);

    // Terminal: capacity is free again.
    book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
}

#[tokio::test]
async fn disallowed_transitions() {
    let engine = new_engine("transitions.wal");
    let sid = service(&engine, 2).await;
    let r = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();

    assert!(matches!(
        engine.start_rental(r.id).await,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::Pending,
            to: ReservationStatus::InUse,
            ..
        })
    ));
    assert!(matches!(
        engine.mark_no_show(r.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    engine.confirm_reservation(r.id).await.unwrap();
    engine.mark_no_show(r.id).await.unwrap();
    assert!(matches!(
        engine.cancel(r.id).await,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::NoShow,
            ..
        })
    ));
    assert!(matches!(
        engine.set_status(Ulid::new(), ReservationStatus::Cancelled).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Soft holds ───────────────────────────────────────────

#[tokio::test]
async fn soft_hold_counts_until_expiry() {
    let engine = new_engine("hold_counts.wal");
    let sid = service(&engine, 1).await;
    let hold = engine
        .place_soft_hold(hold_req(sid, jun(1), jun(3), 1, 60_000))
        .await
        .unwrap();
    assert_eq!(hold.kind, ReservationType::SoftHold);
    assert_eq!(hold.status, ReservationStatus::Pending);
    assert!(hold.expires_at.is_some());

    assert!(matches!(
        book(&engine, sid, jun(2), jun(4), 1).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
}

#[tokio::test]
async fn soft_hold_requires_expiry() {
    let engine = new_engine("hold_no_expiry.wal");
    let sid = service(&engine, 1).await;
    let req = NewReservation::new(sid, jun(1), jun(2), 1, ReservationType::SoftHold);
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::InvalidRange { .. })
    ));
    assert!(engine.place_soft_hold(hold_req(sid, jun(1), jun(2), 1, 0)).await.is_err());
}

#[tokio::test]
async fn expiry_sweep_cancels_lapsed_holds() {
    let engine = new_engine("expiry_sweep.wal");
    let sid = service(&engine, 1).await;
    let hold = engine
        .place_soft_hold(hold_req(sid, jun(1), jun(3), 1, 60_000))
        .await
        .unwrap();
    let exp = hold.expires_at.unwrap();

    // Not yet due.
    assert!(engine.expire_soft_holds(exp - 1).await.unwrap().is_empty());

    let swept = engine.expire_soft_holds(exp + 1_000).await.unwrap();
    assert_eq!(swept, vec![hold.id]);
    assert_eq!(
        engine.get_reservation(hold.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );

    let check = engine.check_availability(sid, jun(1), jun(3), 1, None).await.unwrap();
    assert!(check.is_available);

    // Idempotent.
    assert!(engine.expire_soft_holds(exp + 2_000).await.unwrap().is_empty());
}

#[tokio::test]
async fn lapsed_hold_stops_counting_before_sweep() {
    let engine = new_engine("hold_lapsed.wal");
    let sid = service(&engine, 1).await;
    engine
        .place_soft_hold(hold_req(sid, jun(1), jun(3), 1, 20))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let check = engine.check_availability(sid, jun(1), jun(3), 1, None).await.unwrap();
    assert!(check.is_available);
    book(&engine, sid, jun(1), jun(3), 1).await.unwrap();
}

#[tokio::test]
async fn confirming_hold_promotes_to_booking() {
    let engine = new_engine("hold_promote.wal");
    let sid = service(&engine, 1).await;
    let hold = engine
        .place_soft_hold(hold_req(sid, jun(1), jun(3), 1, 60_000))
        .await
        .unwrap();

    let r = engine.confirm_reservation(hold.id).await.unwrap();
    assert_eq!(r.kind, ReservationType::Booking);
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.expires_at, None);

    // The sweep never touches a promoted hold.
    let far_future = now_ms() + 365 * D;
    assert!(engine.expire_soft_holds(far_future).await.unwrap().is_empty());
}

#[tokio::test]
async fn lapsed_hold_confirms_only_if_capacity_is_free() {
    let engine = new_engine("hold_lapsed_confirm.wal");
    let sid = service(&engine, 1).await;
    let free = engine
        .place_soft_hold(hold_req(sid, jun(1), jun(3), 1, 20))
        .await
        .unwrap();
    let taken = engine
        .place_soft_hold(hold_req(sid, jun(5), jun(7), 1, 20))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    book(&engine, sid, jun(6), jun(8), 1).await.unwrap();

    engine.confirm_reservation(free.id).await.unwrap();
    assert!(matches!(
        engine.confirm_reservation(taken.id).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
    assert_eq!(
        engine.get_reservation(taken.id).await.unwrap().status,
        ReservationStatus::Pending
    );
}

// ── Booking confirmation ─────────────────────────────────

#[tokio::test]
async fn confirm_booking_is_idempotent() {
    let engine = new_engine("confirm_idempotent.wal");
    let kayak = service(&engine, 2).await;
    let paddle = service(&engine, 4).await;
    let bid = Ulid::new();

    let mut a = hold_req(kayak, jun(1), jun(3), 1, 60_000);
    a.booking_id = Some(bid);
    let mut b = hold_req(paddle, jun(1), jun(3), 2, 60_000);
    b.booking_id = Some(bid);
    engine.place_soft_hold(a).await.unwrap();
    engine.place_soft_hold(b).await.unwrap();

    let first = engine.confirm_booking(bid).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|r| r.status == ReservationStatus::Confirmed
        && r.kind == ReservationType::Booking));
    let appends = engine.wal_appends_since_compact().await;

    let second = engine.confirm_booking(bid).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.wal_appends_since_compact().await, appends);

    // Still one unit reserved on the kayak, not two.
    let check = engine.check_availability(kayak, jun(1), jun(3), 1, None).await.unwrap();
    assert_eq!(check.available_quantity, 1);
}

#[tokio::test]
async fn confirm_booking_is_all_or_nothing() {
    let engine = new_engine("confirm_atomic.wal");
    let kayak = service(&engine, 1).await;
    let tent = service(&engine, 1).await;
    let bid = Ulid::new();

    let mut a = hold_req(kayak, jun(1), jun(3), 1, 60_000);
    a.booking_id = Some(bid);
    let mut b = hold_req(tent, jun(1), jun(3), 1, 20);
    b.booking_id = Some(bid);
    let a = engine.place_soft_hold(a).await.unwrap();
    let b = engine.place_soft_hold(b).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    // Someone else takes the tent after our hold lapsed.
    book(&engine, tent, jun(2), jun(4), 1).await.unwrap();

    assert!(matches!(
        engine.confirm_booking(bid).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
    assert_eq!(
        engine.get_reservation(a.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(
        engine.get_reservation(b.id).await.unwrap().status,
        ReservationStatus::Pending
    );
}

#[tokio::test]
async fn confirm_booking_after_sweep_is_invalid() {
    let engine = new_engine("confirm_after_sweep.wal");
    let sid = service(&engine, 1).await;
    let bid = Ulid::new();
    let mut req = hold_req(sid, jun(1), jun(3), 1, 60_000);
    req.booking_id = Some(bid);
    let hold = engine.place_soft_hold(req).await.unwrap();
    engine
        .expire_soft_holds(hold.expires_at.unwrap() + 1)
        .await
        .unwrap();

    assert!(matches!(
        engine.confirm_booking(bid).await,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::Cancelled,
            ..
        })
    ));
    assert!(matches!(
        engine.confirm_booking(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn query_overlapping_filters_by_status() {
    let engine = new_engine("query_overlapping.wal");
    let sid = service(&engine, 5).await;
    let a = book(&engine, sid, jun(1), jun(3), 1).await.unwrap();
    let b = book(&engine, sid, jun(2), jun(6), 1).await.unwrap();
    let c = book(&engine, sid, jun(6), jun(9), 1).await.unwrap();
    engine.cancel(b.id).await.unwrap();

    let all = engine.query_overlapping(sid, jun(2), jun(6), None).await.unwrap();
    let ids: Vec<Ulid> = all.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);

    let active = [ReservationStatus::Pending, ReservationStatus::Confirmed];
    let live = engine
        .query_overlapping(sid, jun(2), jun(7), Some(&active))
        .await
        .unwrap();
    let ids: Vec<Ulid> = live.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a.id, c.id]);

    assert_eq!(engine.list_reservations(sid, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn calendar_for_june() {
    let engine = new_engine("calendar_june.wal");
    let sid = service(&engine, 5).await;
    book(&engine, sid, jun(3), jun(6), 2).await.unwrap();
    book(&engine, sid, jun(10), jun(15), 3).await.unwrap();

    let calendar = engine
        .availability_calendar(sid, jun(1), jun(31), Granularity::Day)
        .await
        .unwrap();
    let slots: Vec<AvailabilitySlot> = calendar.clone().collect();
    assert_eq!(slots.len(), 30);

    for (i, slot) in slots.iter().enumerate() {
        let day = i as i64 + 1;
        let expected = match day {
            3..=5 => 2,
            10..=14 => 3,
            _ => 0,
        };
        assert_eq!(slot.span, Span::new(jun(day), jun(day + 1)));
        assert_eq!(slot.total_quantity, 5);
        assert_eq!(slot.reserved_quantity, expected, "day {day}");
        assert_eq!(slot.available_quantity, 5 - expected, "day {day}");
        assert_eq!(slot.is_fully_booked, expected == 5);
    }

    // Restartable.
    assert_eq!(calendar.collect::<Vec<_>>(), slots);
}

#[tokio::test]
async fn calendar_limits() {
    let engine = new_engine("calendar_limits.wal");
    let sid = service(&engine, 1).await;
    assert!(matches!(
        engine
            .availability_calendar(sid, jun(1), jun(1) + MAX_QUERY_WINDOW_MS + D, Granularity::Day)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine
            .availability_calendar(sid, jun(1), jun(1) + 400 * HOUR_MS * 30, Granularity::Hour)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.availability_calendar(sid, jun(5), jun(1), Granularity::Day).await,
        Err(EngineError::InvalidRange { .. })
    ));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay_restores.wal");
    let notify = Arc::new(NotifyHub::new());
    let sid;
    let bid = Ulid::new();
    let kept;
    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        sid = service(&engine, 2).await;
        let mut req = hold_req(sid, jun(1), jun(3), 1, 60_000);
        req.booking_id = Some(bid);
        kept = engine.place_soft_hold(req).await.unwrap();
        let gone = book(&engine, sid, jun(4), jun(5), 2).await.unwrap();
        engine.cancel(gone.id).await.unwrap();
    }

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.get_service(sid).await.unwrap().capacity, 2);
    assert_eq!(engine.list_reservations(sid, None).await.unwrap().len(), 2);
    assert_eq!(engine.get_reservation(kept.id).await.unwrap(), kept);

    // Booking index is rebuilt too.
    let confirmed = engine.confirm_booking(bid).await.unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn compaction_preserves_state_across_restart() {
    let path = test_wal_path("compaction_restart.wal");
    let notify = Arc::new(NotifyHub::new());
    let sid;
    let live;
    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        sid = service(&engine, 3).await;
        for day in 1..10 {
            let r = book(&engine, sid, jun(day), jun(day + 1), 1).await.unwrap();
            engine.cancel(r.id).await.unwrap();
        }
        live = book(&engine, sid, jun(1), jun(5), 3).await.unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        engine.gc_terminal_reservations(jun(40), 0).await.unwrap();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
    }

    let engine = Engine::new(path, notify).unwrap();
    let all = engine.list_reservations(sid, None).await.unwrap();
    assert_eq!(all, vec![live]);
    assert!(book(&engine, sid, jun(2), jun(3), 1).await.is_err());
}

#[tokio::test]
async fn gc_keeps_recent_and_active() {
    let engine = new_engine("gc_retention.wal");
    let sid = service(&engine, 5).await;
    let old = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
    let recent = book(&engine, sid, jun(20), jun(21), 1).await.unwrap();
    let active = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
    engine.cancel(old.id).await.unwrap();
    engine.cancel(recent.id).await.unwrap();

    let purged = engine.gc_terminal_reservations(jun(25), 10 * D).await.unwrap();
    assert_eq!(purged, 1);
    assert!(matches!(engine.get_reservation(old.id).await, Err(EngineError::NotFound(_))));
    assert!(engine.get_reservation(recent.id).await.is_ok());
    assert!(engine.get_reservation(active.id).await.is_ok());
}

#[tokio::test]
async fn replay_survives_torn_tail() {
    use std::io::Write;
    let path = test_wal_path("torn_tail.wal");
    let notify = Arc::new(NotifyHub::new());
    let sid;
    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        sid = service(&engine, 1).await;
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xFF, 0x00, 0x00]).unwrap();
    }
    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
    }

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.list_reservations(sid, None).await.unwrap().len(), 1);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_never_overbook() {
    let engine = Arc::new(new_engine("concurrent_creates.wal"));
    let sid = service(&engine, 3).await;

    let mut handles = Vec::new();
    for _ in 0..40 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            book(&eng, sid, jun(1), jun(4), 1).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::CapacityExceeded { .. }) => {}
            Err(e) => panic!("unexpected {e:?}"),
        }
    }
    assert_eq!(ok, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn caller_chosen_id_is_taken_once_across_services() {
    let engine = Arc::new(new_engine("duplicate_id_race.wal"));
    let left = service(&engine, 10).await;
    let right = service(&engine, 10).await;

    for round in 0..100 {
        let id = Ulid::new();
        let start = jun(1) + round * HOUR_MS;
        let attempt = |sid: Ulid| {
            let eng = engine.clone();
            tokio::spawn(async move {
                let mut req = NewReservation::new(sid, start, start + HOUR_MS, 1, ReservationType::Booking);
                req.id = Some(id);
                eng.create_reservation(req).await
            })
        };
        let (a, b) = (attempt(left), attempt(right));
        let results = [a.await.unwrap(), b.await.unwrap()];

        let winners: Vec<&Reservation> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "round {round}: {results:?}");
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(EngineError::AlreadyExists(dup)) if *dup == id))
        );
        let stored = engine.get_reservation(id).await.unwrap();
        assert_eq!(stored.service_id, winners[0].service_id);
        engine.cancel(id).await.unwrap();
    }
}

#[tokio::test]
async fn failed_create_releases_its_id() {
    let engine = new_engine("id_release.wal");
    let sid = service(&engine, 1).await;
    book(&engine, sid, jun(1), jun(3), 1).await.unwrap();

    let id = Ulid::new();
    let mut req = NewReservation::new(sid, jun(2), jun(4), 1, ReservationType::Booking);
    req.id = Some(id);
    assert!(matches!(
        engine.create_reservation(req.clone()).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
    assert!(matches!(engine.get_reservation(id).await, Err(EngineError::NotFound(_))));

    req.start = jun(3);
    let created = engine.create_reservation(req.clone()).await.unwrap();
    assert_eq!(created.id, id);
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn expiry_sweep_skips_locked_service_only() {
    let engine = Engine::with_timeout(
        test_wal_path("expiry_locked.wal"),
        Arc::new(NotifyHub::new()),
        std::time::Duration::from_millis(20),
    )
    .unwrap();
    let stuck = service(&engine, 1).await;
    let free = service(&engine, 1).await;
    let stuck_hold = engine
        .place_soft_hold(hold_req(stuck, jun(1), jun(2), 1, 60_000))
        .await
        .unwrap();
    let free_hold = engine
        .place_soft_hold(hold_req(free, jun(1), jun(2), 1, 60_000))
        .await
        .unwrap();
    let later = stuck_hold.expires_at.unwrap().max(free_hold.expires_at.unwrap()) + 1;

    let rs = engine.store.get_service(&stuck).unwrap();
    let held = rs.write().await;
    let swept = engine.expire_soft_holds(later).await.unwrap();
    assert_eq!(swept, vec![free_hold.id]);
    drop(held);

    let swept = engine.expire_soft_holds(later).await.unwrap();
    assert_eq!(swept, vec![stuck_hold.id]);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path.clone(), notify.clone()).unwrap());
    let sid = service(&engine, 100).await;

    let n = 20;
    let mut handles = Vec::new();
    for day in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            book(&eng, sid, jun(1) + day * D, jun(2) + day * D, 1).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.wal_appends_since_compact().await, n as u64 + 1);

    let engine2 = Engine::new(path, notify).unwrap();
    assert_eq!(engine2.list_reservations(sid, None).await.unwrap().len(), n as usize);
}

#[tokio::test]
async fn lock_timeout_surfaces_store_unavailable() {
    let engine = Engine::with_timeout(
        test_wal_path("lock_timeout.wal"),
        Arc::new(NotifyHub::new()),
        std::time::Duration::from_millis(20),
    )
    .unwrap();
    let sid = service(&engine, 1).await;

    let rs = engine.store.get_service(&sid).unwrap();
    let _held = rs.write().await;

    let write = book(&engine, sid, jun(1), jun(2), 1).await;
    assert!(matches!(write, Err(EngineError::StoreUnavailable(_))));
    let read = engine.check_availability(sid, jun(1), jun(2), 1, None).await;
    assert!(matches!(&read, Err(e) if e.is_retryable()));
}

#[tokio::test]
async fn mutations_are_published() {
    let engine = new_engine("notify_publish.wal");
    let sid = service(&engine, 1).await;
    let mut rx = engine.notify.subscribe(sid);

    let r = book(&engine, sid, jun(1), jun(2), 1).await.unwrap();
    engine.cancel(r.id).await.unwrap();

    let created = rx.recv().await.unwrap();
    assert_eq!(created.kind, ChangeKind::ReservationCreated);
    assert_eq!(created.reservation_id, Some(r.id));
    let cancelled = rx.recv().await.unwrap();
    assert_eq!(cancelled.kind, ChangeKind::StatusChanged);
    assert_eq!(cancelled.reservation_id, Some(r.id));
    assert_eq!(cancelled.status, Some(ReservationStatus::Cancelled));
}

// ── Capacity invariant (property) ────────────────────────

#[derive(Debug, Clone)]
struct Attempt {
    start: Ms,
    len: Ms,
    quantity: u32,
    kind: ReservationType,
}

fn attempt() -> impl Strategy<Value = Attempt> {
    (
        0..200i64,
        1..40i64,
        1..4u32,
        prop_oneof![
            Just(ReservationType::Booking),
            Just(ReservationType::SoftHold),
            Just(ReservationType::Maintenance),
            Just(ReservationType::Blocked),
        ],
    )
        .prop_map(|(start, len, quantity, kind)| Attempt {
            start: start * HOUR_MS,
            len: len * HOUR_MS,
            quantity,
            kind,
        })
}

proptest! {
    #[test]
    fn accepted_reservations_never_exceed_capacity(
        capacity in 1..5u32,
        before in 0..6i64,
        after in 0..6i64,
        simultaneous in any::<bool>(),
        attempts in prop::collection::vec(attempt(), 1..60),
    ) {
        let mut config = ServiceConfig::new(Ulid::new(), capacity);
        config.buffer_before = before * HOUR_MS;
        config.buffer_after = after * HOUR_MS;
        config.allow_simultaneous_bookings = simultaneous;
        let mut ss = ServiceState::new(config);

        for a in attempts {
            let span = Span::new(a.start, a.start + a.len);
            let quantity = a.quantity.min(capacity);
            if check_capacity(&ss, a.kind, &span, quantity, 0, None, &[]).is_ok() {
                ss.insert(Reservation {
                    id: Ulid::new(),
                    service_id: ss.id(),
                    span,
                    quantity,
                    status: ReservationStatus::Confirmed,
                    kind: a.kind,
                    booking_id: None,
                    customer_id: None,
                    expires_at: None,
                    notes: None,
                    created_at: 0,
                    updated_at: 0,
                });
            }
        }

        let footprints: Vec<(Span, u32)> = ss
            .reservations
            .iter()
            .map(|r| (r.footprint(&ss.config), r.quantity))
            .collect();
        for segment in load_profile(&footprints) {
            prop_assert!(segment.load <= capacity, "load {} over {}", segment.load, capacity);
        }
        if !simultaneous {
            for (i, (a, _)) in footprints.iter().enumerate() {
                for (b, _) in &footprints[i + 1..] {
                    prop_assert!(!a.overlaps(b));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Create(Attempt),
    /// Cancel the n-th accepted reservation, modulo how many exist.
    Cancel(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => attempt().prop_map(Op::Create),
        1 => any::<usize>().prop_map(Op::Cancel),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn engine_never_overbooks_under_create_and_cancel(
        capacity in 1..4u32,
        after in 0..4i64,
        ops in prop::collection::vec(op(), 1..40),
    ) {
        let path = test_wal_path(&format!("prop_{}.wal", Ulid::new()));
        let peak = tokio_test::block_on(async {
            let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
            let sid = Ulid::new();
            let mut config = ServiceConfig::new(sid, capacity);
            config.buffer_after = after * HOUR_MS;
            engine.register_service(config.clone()).await.unwrap();

            let mut accepted: Vec<Ulid> = Vec::new();
            for op in ops {
                match op {
                    Op::Create(a) => {
                        let start = JUN1 + a.start;
                        let kind = if a.kind == ReservationType::SoftHold {
                            ReservationType::Booking
                        } else {
                            a.kind
                        };
                        let req = NewReservation::new(sid, start, start + a.len, a.quantity.min(capacity), kind);
                        match engine.create_reservation(req).await {
                            Ok(r) => accepted.push(r.id),
                            Err(EngineError::CapacityExceeded { .. }) => {}
                            Err(e) => panic!("unexpected {e}"),
                        }
                    }
                    Op::Cancel(n) if !accepted.is_empty() => {
                        let id = accepted.remove(n % accepted.len());
                        engine.cancel(id).await.unwrap();
                    }
                    Op::Cancel(_) => {}
                }
            }

            let now = now_ms();
            let footprints: Vec<(Span, u32)> = engine
                .list_reservations(sid, None)
                .await
                .unwrap()
                .iter()
                .filter(|r| r.holds_capacity(now))
                .map(|r| (r.footprint(&config), r.quantity))
                .collect();
            load_profile(&footprints).iter().map(|s| s.load).max().unwrap_or(0)
        });
        let _ = std::fs::remove_file(&path);
        prop_assert!(peak <= capacity, "peak {} over {}", peak, capacity);
    }
}
