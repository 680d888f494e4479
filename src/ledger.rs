//! Service layer over the canonical ride store.
//!
//! The ledger is the source of truth for every ride and the sole arbiter of
//! conflicting writes: assignment races are settled here with a
//! compare-and-swap on the encoded record, never in the clients.
use crate::config::FareSchedule;
use crate::context::{Receipt, RideContext, RideEvent, RideEventKind, RideStatus};
use crate::error::{FlowError, ValidationError};
use crate::ride::{RideDetails, TimeStamp};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait RideLedger: Send + Sync {
    /// Create the canonical record for a client-minted ride id. The ledger
    /// computes the authoritative price; registering an id twice conflicts.
    async fn register_ride(
        &self,
        ride_id: &str,
        details: RideDetails,
    ) -> Result<RideContext, FlowError>;

    async fn ride_info(&self, ride_id: &str) -> Result<RideContext, FlowError>;

    /// Rider-side assignment of a chosen candidate. At most one driver is
    /// ever assigned; a later call with a different driver conflicts and
    /// leaves the assignment unchanged.
    async fn accept_driver(
        &self,
        ride_id: &str,
        rider: &str,
        driver_addr: &str,
    ) -> Result<Receipt, FlowError>;

    /// Driver-side claim, arbitrated identically. Re-accepting a ride that
    /// is already yours is a no-op; one that is someone else's conflicts.
    async fn accept_ride(&self, ride_id: &str, driver_addr: &str) -> Result<Receipt, FlowError>;

    /// Rides a driver could act on: assigned to them but unconfirmed, or
    /// still unassigned.
    async fn open_rides_for(&self, driver_addr: &str) -> Result<Vec<RideContext>, FlowError>;

    async fn update_rider_confirmation(
        &self,
        ride_id: &str,
        rider: &str,
    ) -> Result<Receipt, FlowError>;

    async fn update_driver_confirmation(
        &self,
        ride_id: &str,
        driver_addr: &str,
    ) -> Result<Receipt, FlowError>;

    /// Final transition, recorded by whichever participant gets there
    /// first; the other observes. Requires a confirmed pickup.
    async fn complete_ride(&self, ride_id: &str, user_addr: &str) -> Result<Receipt, FlowError>;

    async fn cancel_ride(&self, ride_id: &str, user_addr: &str) -> Result<Receipt, FlowError>;
}

pub struct SledLedger {
    instance: Arc<sled::Db>,
    fares: FareSchedule,
}

impl SledLedger {
    pub fn new(instance: Arc<sled::Db>, fares: FareSchedule) -> Self {
        Self { instance, fares }
    }

    fn load(&self, ride_id: &str) -> Result<(sled::IVec, RideContext), FlowError> {
        let raw = self
            .instance
            .get(ride_id.as_bytes())?
            .ok_or_else(|| FlowError::NotFound(ride_id.to_string()))?;
        let ctx: RideContext = minicbor::decode(raw.as_ref())?;
        Ok((raw, ctx))
    }

    /// Load-guard-append-swap loop. The guard inspects the current record
    /// and either rejects, asks for events to append, or (empty vec)
    /// declares the write already done. Losing a swap race re-runs the
    /// guard against the winner's record.
    fn mutate(
        &self,
        ride_id: &str,
        caller: &str,
        guard: impl Fn(&RideContext) -> Result<Vec<RideEventKind>, FlowError>,
    ) -> Result<Receipt, FlowError> {
        loop {
            let (raw, mut ctx) = self.load(ride_id)?;
            let kinds = guard(&ctx)?;

            if kinds.is_empty() {
                // nothing to do, hand back a receipt for the latest event
                let last = ctx.events.last().ok_or(FlowError::NotFound(
                    ride_id.to_string(),
                ))?;
                let (event_hash, _) = last.build()?;
                return Ok(Receipt {
                    ride_id: ride_id.to_string(),
                    event_hash,
                });
            }

            let mut appended = None;
            for kind in kinds {
                let event = RideEvent::new(
                    ride_id.to_string(),
                    caller.to_string(),
                    TimeStamp::new(),
                    kind,
                );
                appended = Some(event.clone());
                ctx.insert_event(event);
            }
            let next = minicbor::to_vec(&ctx)?;

            match self
                .instance
                .compare_and_swap(ride_id.as_bytes(), Some(raw), Some(next))?
            {
                Ok(()) => {
                    let last = appended.expect("guard returned at least one event");
                    let (event_hash, _) = last.build()?;
                    return Ok(Receipt {
                        ride_id: ride_id.to_string(),
                        event_hash,
                    });
                }
                // lost the race, re-read and run the guard again
                Err(_) => continue,
            }
        }
    }
}

#[async_trait]
impl RideLedger for SledLedger {
    async fn register_ride(
        &self,
        ride_id: &str,
        details: RideDetails,
    ) -> Result<RideContext, FlowError> {
        let (details_hash, details_cbor) = details.validate_and_finalise()?;
        let rider = details
            .rider()
            .ok_or(ValidationError::MissingRider)?
            .to_string();
        let pickup = details
            .pickup()
            .cloned()
            .ok_or(ValidationError::MissingRoute)?;
        let dropoff = details
            .dropoff()
            .cloned()
            .ok_or(ValidationError::MissingRoute)?;

        let mut ctx = RideContext {
            ride_id: ride_id.to_string(),
            rider: rider.clone(),
            details_hash: details_hash.clone(),
            pickup,
            dropoff,
            distance_miles: details.distance_miles(),
            seats: details.seats(),
            price: self.fares.price_for(details.distance_miles()),
            events: vec![],
        };
        ctx.insert_event(RideEvent::new(
            ride_id.to_string(),
            rider,
            TimeStamp::new(),
            RideEventKind::Requested {
                details_hash: details_hash.clone(),
            },
        ));
        let encoded = minicbor::to_vec(&ctx)?;

        // request details are content-addressed, re-inserting is harmless
        self.instance.insert(details_hash.as_bytes(), details_cbor)?;

        // the record itself is created at most once
        match self
            .instance
            .compare_and_swap(ride_id.as_bytes(), None::<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                info!(ride_id, price = ctx.price, "ride registered");
                Ok(ctx)
            }
            Err(_) => {
                warn!(ride_id, "duplicate ride registration rejected");
                Err(FlowError::Conflict("ride id is already registered"))
            }
        }
    }

    async fn ride_info(&self, ride_id: &str) -> Result<RideContext, FlowError> {
        let (_, ctx) = self.load(ride_id)?;
        debug!(ride_id, status = %ctx.status(), "ride info read");
        Ok(ctx)
    }

    async fn accept_driver(
        &self,
        ride_id: &str,
        rider: &str,
        driver_addr: &str,
    ) -> Result<Receipt, FlowError> {
        let receipt = self.mutate(ride_id, rider, |ctx| {
            if ctx.rider != rider {
                return Err(FlowError::Conflict("caller is not the rider on this ride"));
            }
            if ctx.is_terminal() {
                return Err(FlowError::Conflict("ride is closed"));
            }
            match ctx.assigned_driver() {
                // re-accepting the same driver is a no-op, not a double-assign
                Some(current) if current == driver_addr => Ok(vec![]),
                Some(_) => Err(FlowError::Conflict("ride already has an assigned driver")),
                None => Ok(vec![RideEventKind::DriverAssigned {
                    driver_addr: driver_addr.to_string(),
                }]),
            }
        })?;
        info!(ride_id, driver_addr, "driver accepted by rider");
        Ok(receipt)
    }

    async fn accept_ride(&self, ride_id: &str, driver_addr: &str) -> Result<Receipt, FlowError> {
        let receipt = self.mutate(ride_id, driver_addr, |ctx| {
            if ctx.is_terminal() {
                return Err(FlowError::Conflict("ride is no longer available"));
            }
            match ctx.assigned_driver() {
                Some(current) if current == driver_addr => Ok(vec![]),
                Some(_) => Err(FlowError::Conflict("ride is no longer available")),
                None => Ok(vec![RideEventKind::DriverAssigned {
                    driver_addr: driver_addr.to_string(),
                }]),
            }
        })?;
        info!(ride_id, driver_addr, "ride accepted by driver");
        Ok(receipt)
    }

    async fn open_rides_for(&self, driver_addr: &str) -> Result<Vec<RideContext>, FlowError> {
        let mut open = Vec::new();
        for item in self.instance.scan_prefix("ride_") {
            let (_, value) = item?;
            let ctx: RideContext = minicbor::decode(value.as_ref())?;
            if ctx.is_terminal() {
                continue;
            }
            let assigned_to_me =
                ctx.assigned_driver() == Some(driver_addr) && !ctx.driver_confirmed();
            if assigned_to_me || ctx.assigned_driver().is_none() {
                open.push(ctx);
            }
        }
        debug!(driver_addr, count = open.len(), "open rides scanned");
        Ok(open)
    }

    async fn update_rider_confirmation(
        &self,
        ride_id: &str,
        rider: &str,
    ) -> Result<Receipt, FlowError> {
        let receipt = self.mutate(ride_id, rider, |ctx| {
            if ctx.rider != rider {
                return Err(FlowError::Conflict("caller is not the rider on this ride"));
            }
            if ctx.is_terminal() {
                return Err(FlowError::Conflict("ride is closed"));
            }
            if ctx.assigned_driver().is_none() {
                return Err(FlowError::NotReady("no driver assigned yet"));
            }
            if ctx.rider_confirmed() {
                return Ok(vec![]);
            }
            Ok(vec![RideEventKind::RiderConfirmed])
        })?;
        info!(ride_id, "rider confirmation recorded");
        Ok(receipt)
    }

    async fn update_driver_confirmation(
        &self,
        ride_id: &str,
        driver_addr: &str,
    ) -> Result<Receipt, FlowError> {
        let receipt = self.mutate(ride_id, driver_addr, |ctx| {
            if ctx.is_terminal() {
                return Err(FlowError::Conflict("ride is closed"));
            }
            match ctx.assigned_driver() {
                None => Err(FlowError::NotReady("no driver assigned yet")),
                Some(current) if current != driver_addr => {
                    Err(FlowError::Conflict("ride is assigned to another driver"))
                }
                Some(_) if ctx.driver_confirmed() => Ok(vec![]),
                Some(_) => Ok(vec![RideEventKind::DriverConfirmed]),
            }
        })?;
        info!(ride_id, "driver confirmation recorded");
        Ok(receipt)
    }

    async fn complete_ride(&self, ride_id: &str, user_addr: &str) -> Result<Receipt, FlowError> {
        let receipt = self.mutate(ride_id, user_addr, |ctx| {
            let participant =
                ctx.rider == user_addr || ctx.assigned_driver() == Some(user_addr);
            if !participant {
                return Err(FlowError::Conflict("caller is not a participant on this ride"));
            }
            match ctx.status() {
                RideStatus::Cancelled => Err(FlowError::Conflict("ride was cancelled")),
                // the other participant observing completion, nothing to write
                RideStatus::Completed => Ok(vec![]),
                RideStatus::DropoffConfirmed => Ok(vec![RideEventKind::Completed]),
                RideStatus::PickupConfirmed => Ok(vec![
                    RideEventKind::DropoffConfirmed,
                    RideEventKind::Completed,
                ]),
                _ => Err(FlowError::NotReady("pickup is not confirmed yet")),
            }
        })?;
        info!(ride_id, "ride completed");
        Ok(receipt)
    }

    async fn cancel_ride(&self, ride_id: &str, user_addr: &str) -> Result<Receipt, FlowError> {
        let receipt = self.mutate(ride_id, user_addr, |ctx| {
            let participant =
                ctx.rider == user_addr || ctx.assigned_driver() == Some(user_addr);
            if !participant {
                return Err(FlowError::Conflict("caller is not a participant on this ride"));
            }
            match ctx.status() {
                // cancellation is absorbing
                RideStatus::Cancelled => Ok(vec![]),
                RideStatus::Completed => Err(FlowError::Conflict("ride already completed")),
                _ => Ok(vec![RideEventKind::Cancelled]),
            }
        })?;
        warn!(ride_id, by = user_addr, "ride cancelled");
        Ok(receipt)
    }
}
