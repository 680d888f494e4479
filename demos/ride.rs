//! End-to-end walkthrough: one rider and one driver negotiating a ride
//! against a shared sled-backed ledger.
//!
//! Run with `cargo run --example ride`.

use async_trait::async_trait;
use ride_negotiation::{
    config::{FareSchedule, FlowConfig},
    flow::{DriverFlow, RiderFlow, StepFlow},
    ledger::{RideLedger, SledLedger},
    matching::{DriverPool, DriverProfile, DriverStatus},
    payment::{BlockHeight, PaymentService, TransferError, TransferRequest},
    ride::{GeoPoint, Route},
    session::SledSessionStore,
    utils,
};
use std::sync::{Arc, Mutex};

/// Demo settlement rail: every transfer lands at the next block height.
#[derive(Default)]
struct DemoPayment {
    height: Mutex<BlockHeight>,
}

#[async_trait]
impl PaymentService for DemoPayment {
    async fn transfer(&self, request: TransferRequest) -> Result<BlockHeight, TransferError> {
        let mut height = self.height.lock().unwrap();
        *height += 1;
        println!(
            "  transfer {} -> {} (memo {})",
            request.amount, request.to, request.memo
        );
        Ok(*height)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let db = Arc::new(sled::open("ride-db")?);
    if !db.is_empty() {
        db.clear()?;
    }

    let ledger = Arc::new(SledLedger::new(db.clone(), FareSchedule::default()));
    let pool = Arc::new(DriverPool::new(FareSchedule::default()));
    let payments = Arc::new(DemoPayment::default());

    let rider_addr = utils::new_uuid_to_bech32("user_")?;
    let driver_addr = utils::new_uuid_to_bech32("user_")?;
    let platform_addr = utils::new_uuid_to_bech32("user_")?;

    pool.register_driver(DriverProfile {
        name: "Kelsey".to_string(),
        contact: "555-0100".to_string(),
        car_no: "ABC123".to_string(),
        rating: 4.5,
        address: driver_addr.clone(),
        seats: 2,
        latitude: 37.01,
        longitude: -122.01,
        status: DriverStatus::Active,
    });

    let config = FlowConfig::new(platform_addr);
    let mut rider = RiderFlow::new(
        &rider_addr,
        ledger.clone(),
        pool.clone(),
        payments.clone(),
        Arc::new(SledSessionStore::new(db.clone())),
        config.clone(),
    )?;
    let mut driver = DriverFlow::new(
        &driver_addr,
        ledger.clone(),
        Arc::new(SledSessionStore::new(db.clone())),
        config,
    )?;

    println!("rider chooses the route and books a seat");
    rider.set_route(Route {
        pickup: GeoPoint::new(37.0, -122.0, "1 Main St"),
        dropoff: GeoPoint::new(37.1, -122.1, "99 Elm St"),
        distance_miles: 5.0,
    })?;
    rider.advance().await?;
    rider.set_seats(1)?;
    rider.advance().await?;

    println!("matching offers candidates, rider takes the nearest");
    let candidates = rider.request_drivers().await?;
    for candidate in &candidates {
        println!(
            "  {} ({}) rated {} quoting {}",
            candidate.name, candidate.car_no, candidate.rating, candidate.quote
        );
    }
    rider.choose_candidate(0)?;
    rider.advance().await?;
    let ride_id = rider.session().ride_id.clone().expect("ride registered");

    println!("driver finds the assignment and confirms the pickup");
    driver.load_requests().await?;
    driver.choose_request(&ride_id)?;
    driver.advance().await?;
    let code = driver.handoff_code()?;
    driver.advance().await?;

    println!("rider observes the confirmation, pays, scans the code");
    rider.poll_driver_confirmation().await?;
    rider.make_payments().await?;
    rider.verify_handoff(&code)?;
    rider.advance().await?;

    println!("both sides wrap up");
    rider.advance().await?;
    driver.advance().await?;

    let info = ledger.ride_info(&ride_id).await?;
    println!(
        "ride {} finished as {} at price {}",
        info.ride_id,
        info.status(),
        info.price
    );
    for event in &info.events {
        println!("  {:?} by {}", event.kind, event.user_addr);
    }

    Ok(())
}
