#![allow(unused_imports)]

use anyhow::Context;
use async_trait::async_trait;
use ride_negotiation::{
    config::{FareSchedule, FlowConfig},
    context::{RideEventKind, RideStatus},
    error::FlowError,
    flow::{DriverFlow, RiderFlow, Step, StepFlow},
    handoff,
    ledger::{RideLedger, SledLedger},
    matching::{DriverPool, DriverProfile, DriverStatus, MatchingService},
    payment::{BlockHeight, LegKind, PaymentService, TransferError, TransferRequest},
    ride::{GeoPoint, Route},
    session::{MemorySessionStore, Role, SessionStore},
    utils,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir; // Use for test db cleanup.

/// Payment double that records every attempt and can be told to reject
/// transfers to particular recipients.
struct RecordingPayment {
    log: Mutex<Vec<TransferRequest>>,
    fail_to: Mutex<HashSet<String>>,
    next_height: Mutex<BlockHeight>,
}

impl RecordingPayment {
    fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            fail_to: Mutex::new(HashSet::new()),
            next_height: Mutex::new(1),
        }
    }

    fn fail_transfers_to(&self, to: &str) {
        self.fail_to.lock().unwrap().insert(to.to_string());
    }

    fn heal(&self, to: &str) {
        self.fail_to.lock().unwrap().remove(to);
    }

    fn attempts_to(&self, to: &str) -> Vec<TransferRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.to == to)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PaymentService for RecordingPayment {
    async fn transfer(&self, request: TransferRequest) -> Result<BlockHeight, TransferError> {
        let rejected = self.fail_to.lock().unwrap().contains(&request.to);
        self.log.lock().unwrap().push(request.clone());
        if rejected {
            return Err(TransferError("insufficient liquidity".to_string()));
        }
        let mut height = self.next_height.lock().unwrap();
        *height += 1;
        Ok(*height)
    }
}

/// Payment double that never settles inside the configured call timeout.
struct StalledPayment;

#[async_trait]
impl PaymentService for StalledPayment {
    async fn transfer(&self, _request: TransferRequest) -> Result<BlockHeight, TransferError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0)
    }
}

fn test_config(platform_account: &str) -> FlowConfig {
    let mut config = FlowConfig::new(platform_account);
    config.poll_interval = Duration::from_millis(10);
    config.poll_max_wait = Duration::from_millis(500);
    config
}

fn profile(name: &str, address: &str, lat: f64, lng: f64) -> DriverProfile {
    DriverProfile {
        name: name.to_string(),
        contact: "555-0100".to_string(),
        car_no: "ABC123".to_string(),
        rating: 4.5,
        address: address.to_string(),
        seats: 2,
        latitude: lat,
        longitude: lng,
        status: DriverStatus::Active,
    }
}

fn sample_route() -> Route {
    Route {
        pickup: GeoPoint::new(37.0, -122.0, "1 Main St"),
        dropoff: GeoPoint::new(37.1, -122.1, "99 Elm St"),
        distance_miles: 5.0,
    }
}

struct Harness {
    // Sled uses file-based locking to prevent concurrent access, so only one
    // test can hold the lock at a time. As is good practice in testing create
    // separate databases for each test, on temp for simplified cleanup.
    _temp_dir: tempfile::TempDir,
    ledger: Arc<SledLedger>,
    pool: Arc<DriverPool>,
    payments: Arc<RecordingPayment>,
    config: FlowConfig,
    rider: String,
    platform: String,
}

impl Harness {
    fn new(db_name: &str) -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join(db_name))?);
        db.clear()?;

        let rider = utils::new_uuid_to_bech32("user_")?;
        let platform = utils::new_uuid_to_bech32("user_")?;
        Ok(Self {
            _temp_dir: temp_dir,
            ledger: Arc::new(SledLedger::new(db, FareSchedule::default())),
            pool: Arc::new(DriverPool::new(FareSchedule::default())),
            payments: Arc::new(RecordingPayment::new()),
            config: test_config(&platform),
            rider,
            platform,
        })
    }

    fn rider_flow(&self) -> anyhow::Result<RiderFlow> {
        Ok(RiderFlow::new(
            &self.rider,
            self.ledger.clone(),
            self.pool.clone(),
            self.payments.clone(),
            Arc::new(MemorySessionStore::new()),
            self.config.clone(),
        )?)
    }

    fn driver_flow(&self, account: &str) -> anyhow::Result<DriverFlow> {
        Ok(DriverFlow::new(
            account,
            self.ledger.clone(),
            Arc::new(MemorySessionStore::new()),
            self.config.clone(),
        )?)
    }

    /// Walk a fresh rider flow up to the driver-selection step.
    async fn rider_at_selection(&self) -> anyhow::Result<RiderFlow> {
        let mut rider = self.rider_flow()?;
        rider.set_route(sample_route())?;
        rider.advance().await.context("ride failed on location: ")?;
        rider.set_seats(1)?;
        rider.advance().await.context("ride failed on seats: ")?;
        assert_eq!(rider.current_step(), Step::AwaitingDriverSelection);
        Ok(rider)
    }
}

#[tokio::test]
async fn rider_and_driver_complete_a_ride() -> anyhow::Result<()> {
    let harness = Harness::new("complete_a_ride.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("Kelsey", &driver_addr, 37.01, -122.01));

    let mut rider = harness.rider_at_selection().await?;
    let candidates = rider.request_drivers().await?;
    assert_eq!(candidates.len(), 1);
    rider.choose_candidate(0)?;
    rider.advance().await.context("ride failed on selection: ")?;
    assert_eq!(rider.current_step(), Step::AwaitingPickupConfirmation);

    let ride_id = rider.session().ride_id.clone().unwrap();

    // the driver sees the assignment in their inbox and takes it
    let mut driver = harness.driver_flow(&driver_addr)?;
    let requests = driver.load_requests().await?;
    assert!(requests.iter().any(|r| r.ride_id == ride_id));
    driver.choose_request(&ride_id)?;
    driver.advance().await.context("ride failed on acceptance: ")?;
    assert_eq!(driver.current_step(), Step::AwaitingPickupHandoff);
    let code = driver.handoff_code()?;
    driver.advance().await.context("ride failed on handoff: ")?;
    assert_eq!(driver.current_step(), Step::AwaitingDropoffConfirmation);

    // rider observes the confirmation, pays both legs, verifies the scan
    rider.poll_driver_confirmation().await?;
    rider.make_payments().await?;
    rider.verify_handoff(&code)?;
    rider.advance().await.context("ride failed on pickup: ")?;
    assert_eq!(rider.current_step(), Step::AwaitingDropoffConfirmation);

    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(info.status(), RideStatus::PickupConfirmed);
    assert!(info.rider_confirmed() && info.driver_confirmed());

    // whoever finishes first records completion, the other observes it
    rider.advance().await.context("ride failed on dropoff: ")?;
    assert_eq!(rider.current_step(), Step::Completed);
    driver.advance().await.context("driver failed on dropoff: ")?;
    assert_eq!(driver.current_step(), Step::Completed);

    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(info.status(), RideStatus::Completed);

    // exactly one transfer per leg
    let driver_attempts = harness.payments.attempts_to(&driver_addr);
    let platform_attempts = harness.payments.attempts_to(&harness.platform);
    assert_eq!(driver_attempts.len(), 1);
    assert_eq!(platform_attempts.len(), 1);
    assert_eq!(
        driver_attempts[0].amount + platform_attempts[0].amount,
        info.price
    );

    Ok(())
}

#[tokio::test]
async fn second_driver_accept_conflicts_and_changes_nothing() -> anyhow::Result<()> {
    let harness = Harness::new("second_accept_conflicts.db")?;
    let near = utils::new_uuid_to_bech32("user_")?;
    let far = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("near", &near, 37.01, -122.01));
    harness.pool.register_driver(profile("far", &far, 38.0, -121.0));

    let mut rider = harness.rider_at_selection().await?;
    let candidates = rider.request_drivers().await?;
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].address, near);

    rider.choose_candidate(0)?;
    rider.advance().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();

    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(info.assigned_driver(), Some(near.as_str()));

    // a second accept with the other candidate is a conflict, not an overwrite
    let err = harness
        .ledger
        .accept_driver(&ride_id, &harness.rider, &far)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));

    // and the losing driver's own claim fails the same way
    let err = harness.ledger.accept_ride(&ride_id, &far).await.unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));

    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(info.assigned_driver(), Some(near.as_str()));
    assert_eq!(
        info.events
            .iter()
            .filter(|e| matches!(e.kind, RideEventKind::DriverAssigned { .. }))
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn concurrent_claims_resolve_to_one_winner() -> anyhow::Result<()> {
    let harness = Harness::new("concurrent_claims.db")?;
    let driver_a = utils::new_uuid_to_bech32("user_")?;
    let driver_b = utils::new_uuid_to_bech32("user_")?;

    let rider = harness.rider_at_selection().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();

    let (a, b) = tokio::join!(
        harness.ledger.accept_ride(&ride_id, &driver_a),
        harness.ledger.accept_ride(&ride_id, &driver_b),
    );
    assert!(a.is_ok() != b.is_ok(), "exactly one claim must win");

    let winner = if a.is_ok() { &driver_a } else { &driver_b };
    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(info.assigned_driver(), Some(winner.as_str()));

    Ok(())
}

#[tokio::test]
async fn partial_payment_retries_the_failed_leg_only() -> anyhow::Result<()> {
    let harness = Harness::new("partial_payment.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("Kelsey", &driver_addr, 37.01, -122.01));

    let mut rider = harness.rider_at_selection().await?;
    rider.request_drivers().await?;
    rider.choose_candidate(0)?;
    rider.advance().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();
    harness
        .ledger
        .update_driver_confirmation(&ride_id, &driver_addr)
        .await?;
    rider.poll_driver_confirmation().await?;

    // platform leg bounces, driver leg lands
    harness.payments.fail_transfers_to(&harness.platform);
    let err = rider.make_payments().await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::PaymentLegFailed(LegKind::PlatformFee)
    ));

    // partially paid: the flow stays put and refuses to finalize
    assert_eq!(rider.current_step(), Step::AwaitingPickupConfirmation);
    let err = rider.advance().await.unwrap_err();
    assert!(matches!(err, FlowError::NotReady(_)));
    let info = harness.ledger.ride_info(&ride_id).await?;
    assert!(!info.rider_confirmed());

    // retry settles the platform leg under a fresh memo, driver leg untouched
    harness.payments.heal(&harness.platform);
    rider.make_payments().await?;

    let driver_attempts = harness.payments.attempts_to(&driver_addr);
    let platform_attempts = harness.payments.attempts_to(&harness.platform);
    assert_eq!(driver_attempts.len(), 1, "driver fee must not be resent");
    assert_eq!(platform_attempts.len(), 2);
    assert_ne!(platform_attempts[0].memo, platform_attempts[1].memo);

    Ok(())
}

#[tokio::test]
async fn mismatched_scan_blocks_finalization() -> anyhow::Result<()> {
    let harness = Harness::new("mismatched_scan.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("Kelsey", &driver_addr, 37.01, -122.01));

    let mut rider = harness.rider_at_selection().await?;
    rider.request_drivers().await?;
    rider.choose_candidate(0)?;
    rider.advance().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();
    harness
        .ledger
        .update_driver_confirmation(&ride_id, &driver_addr)
        .await?;
    rider.poll_driver_confirmation().await?;
    rider.make_payments().await?;

    // a code for some other ride does not verify and nothing moves
    let stray = handoff::encode(&utils::new_ride_id())?;
    let err = rider.verify_handoff(&stray).unwrap_err();
    assert!(matches!(err, FlowError::VerificationFailed));
    let err = rider.advance().await.unwrap_err();
    assert!(matches!(err, FlowError::NotReady(_)));
    assert!(!harness.ledger.ride_info(&ride_id).await?.rider_confirmed());

    // the real code verifies and the single confirmation write goes through
    rider.verify_handoff(&handoff::encode(&ride_id)?)?;
    rider.advance().await?;
    let info = harness.ledger.ride_info(&ride_id).await?;
    assert!(info.rider_confirmed());
    assert_eq!(
        info.events
            .iter()
            .filter(|e| matches!(e.kind, RideEventKind::RiderConfirmed))
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn no_drivers_available_is_surfaced_without_a_ledger_write() -> anyhow::Result<()> {
    let harness = Harness::new("no_drivers.db")?;
    // pool left empty on purpose

    let mut rider = harness.rider_at_selection().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();

    let err = rider.request_drivers().await.unwrap_err();
    assert!(matches!(err, FlowError::Unavailable));
    assert_eq!(rider.current_step(), Step::AwaitingDriverSelection);

    // the ride record still only carries its request event
    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(info.status(), RideStatus::Requested);
    assert_eq!(info.events.len(), 1);

    Ok(())
}

#[tokio::test]
async fn back_and_readvance_does_not_duplicate_ledger_effects() -> anyhow::Result<()> {
    let harness = Harness::new("back_and_readvance.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("Kelsey", &driver_addr, 37.01, -122.01));

    let mut rider = harness.rider_at_selection().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();

    // back over the registration step and forward again: same ride, no twin
    rider.back()?;
    assert_eq!(rider.current_step(), Step::AwaitingSeatCount);
    rider.advance().await?;
    assert_eq!(rider.session().ride_id.as_deref(), Some(ride_id.as_str()));

    rider.request_drivers().await?;
    rider.choose_candidate(0)?;
    rider.advance().await?;

    // back over the acceptance step and forward again: no double-assign
    rider.back()?;
    rider.advance().await?;

    let info = harness.ledger.ride_info(&ride_id).await?;
    assert_eq!(
        info.events
            .iter()
            .filter(|e| matches!(e.kind, RideEventKind::DriverAssigned { .. }))
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn cancellation_is_absorbing() -> anyhow::Result<()> {
    let harness = Harness::new("cancellation.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;

    let mut rider = harness.rider_at_selection().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();

    rider.cancel().await?;
    assert_eq!(rider.current_step(), Step::Cancelled);
    assert_eq!(
        harness.ledger.ride_info(&ride_id).await?.status(),
        RideStatus::Cancelled
    );

    // nothing moves after cancellation, locally or on the ledger
    let err = rider.advance().await.unwrap_err();
    assert!(matches!(err, FlowError::NotReady(_)));
    let err = harness
        .ledger
        .accept_ride(&ride_id, &driver_addr)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));

    // and the cancelled ride no longer shows up in driver inboxes
    let mut driver = harness.driver_flow(&driver_addr)?;
    let requests = driver.load_requests().await?;
    assert!(requests.iter().all(|r| r.ride_id != ride_id));

    Ok(())
}

#[tokio::test]
async fn stalled_payment_surfaces_a_timeout_and_leaves_the_step_alone() -> anyhow::Result<()> {
    let harness = Harness::new("stalled_payment.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("Kelsey", &driver_addr, 37.01, -122.01));

    let mut config = test_config(&harness.platform);
    config.call_timeout = Duration::from_millis(50);
    let mut rider = RiderFlow::new(
        &harness.rider,
        harness.ledger.clone(),
        harness.pool.clone(),
        Arc::new(StalledPayment),
        Arc::new(MemorySessionStore::new()),
        config,
    )?;

    rider.set_route(sample_route())?;
    rider.advance().await?;
    rider.set_seats(1)?;
    rider.advance().await?;
    rider.request_drivers().await?;
    rider.choose_candidate(0)?;
    rider.advance().await?;
    let ride_id = rider.session().ride_id.clone().unwrap();
    harness
        .ledger
        .update_driver_confirmation(&ride_id, &driver_addr)
        .await?;
    rider.poll_driver_confirmation().await?;

    let err = rider.make_payments().await.unwrap_err();
    assert!(matches!(err, FlowError::Timeout(_)));
    // the step is unchanged and a retry is just another call
    assert_eq!(rider.current_step(), Step::AwaitingPickupConfirmation);

    Ok(())
}

#[tokio::test]
async fn resumed_session_continues_where_it_stopped() -> anyhow::Result<()> {
    let harness = Harness::new("resumed_session.db")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    harness
        .pool
        .register_driver(profile("Kelsey", &driver_addr, 37.01, -122.01));

    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let mut rider = RiderFlow::new(
        &harness.rider,
        harness.ledger.clone(),
        harness.pool.clone(),
        harness.payments.clone(),
        store.clone(),
        harness.config.clone(),
    )?;
    rider.set_route(sample_route())?;
    rider.advance().await?;
    rider.set_seats(2)?;
    rider.advance().await?;
    let ride_id = rider.session().ride_id.clone();
    drop(rider);

    let resumed = RiderFlow::resume(
        &harness.rider,
        harness.ledger.clone(),
        harness.pool.clone(),
        harness.payments.clone(),
        store,
        harness.config.clone(),
    )?;
    assert_eq!(resumed.current_step(), Step::AwaitingDriverSelection);
    assert_eq!(resumed.session().ride_id, ride_id);
    assert_eq!(resumed.session().seats, 2);

    Ok(())
}
