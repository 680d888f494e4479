//! Canonical ride record: an append-only event log owned by the ledger.
//! Status, driver assignment and the confirmation flags are all derived
//! from the log rather than stored as mutable columns.
use super::ride::{GeoPoint, TimeStamp};
use chrono::Utc;
use std::fmt;

/// Ride lifecycle as seen by both participants. Transitions are monotonic,
/// the only permitted regression target is `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RideStatus {
    Requested,
    DriverSelected,
    PickupConfirmed,
    DropoffConfirmed,
    Completed,
    Cancelled,
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RideStatus::Requested => write!(f, "Requested"),
            RideStatus::DriverSelected => write!(f, "DriverSelected"),
            RideStatus::PickupConfirmed => write!(f, "PickupConfirmed"),
            RideStatus::DropoffConfirmed => write!(f, "DropoffConfirmed"),
            RideStatus::Completed => write!(f, "Completed"),
            RideStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct RideContext {
    #[n(0)]
    pub ride_id: String, // bech32 over uuid7, minted client-side
    #[n(1)]
    pub rider: String,
    #[n(2)]
    pub details_hash: String, // hash refering to the stored request details
    #[n(3)]
    pub pickup: GeoPoint,
    #[n(4)]
    pub dropoff: GeoPoint,
    #[n(5)]
    pub distance_miles: f64,
    #[n(6)]
    pub seats: u8,
    #[n(7)]
    pub price: u64, // ledger-computed, the only authoritative fare
    #[n(8)]
    pub events: Vec<RideEvent>,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct RideEvent {
    #[n(0)]
    pub ride_id: String, // a unique string that is a reference to [`RideContext`]
    #[n(1)]
    pub user_addr: String,
    #[n(2)]
    pub user_timestamp: TimeStamp<Utc>, // issued when the event is appended
    #[n(3)]
    pub kind: RideEventKind,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum RideEventKind {
    #[n(0)]
    Requested {
        #[n(0)]
        details_hash: String, // hash of a ride-details object
    },
    #[n(1)]
    DriverAssigned {
        #[n(0)]
        driver_addr: String,
    },
    #[n(2)]
    DriverConfirmed,
    #[n(3)]
    RiderConfirmed,
    #[n(4)]
    DropoffConfirmed,
    #[n(5)]
    Completed,
    #[n(6)]
    Cancelled,
}

/// Returned by every ledger write: the ride plus a digest of the event
/// that was appended on the caller's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub ride_id: String,
    pub event_hash: String,
}

impl RideEvent {
    pub fn new(
        ride_id: String,
        user_addr: String,
        user_timestamp: TimeStamp<Utc>,
        kind: RideEventKind,
    ) -> Self {
        Self {
            ride_id,
            user_addr,
            user_timestamp,
            kind,
        }
    }
    pub fn build(&self) -> Result<(String, Vec<u8>), crate::error::FlowError> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

impl RideContext {
    pub fn insert_event(&mut self, event: RideEvent) {
        self.events.push(event);
    }

    /// The assigned driver, if any. Assignment happens exactly once; the
    /// ledger rejects later attempts, so the first event wins here.
    pub fn assigned_driver(&self) -> Option<&str> {
        self.events.iter().find_map(|ev| match &ev.kind {
            RideEventKind::DriverAssigned { driver_addr } => Some(driver_addr.as_str()),
            _ => None,
        })
    }

    pub fn rider_confirmed(&self) -> bool {
        self.has_event(|k| matches!(k, RideEventKind::RiderConfirmed))
    }

    pub fn driver_confirmed(&self) -> bool {
        self.has_event(|k| matches!(k, RideEventKind::DriverConfirmed))
    }

    /// Derive the current status from the event log.
    pub fn status(&self) -> RideStatus {
        if self.has_event(|k| matches!(k, RideEventKind::Cancelled)) {
            return RideStatus::Cancelled;
        }
        if self.has_event(|k| matches!(k, RideEventKind::Completed)) {
            return RideStatus::Completed;
        }
        if self.has_event(|k| matches!(k, RideEventKind::DropoffConfirmed)) {
            return RideStatus::DropoffConfirmed;
        }
        if self.rider_confirmed() && self.driver_confirmed() {
            return RideStatus::PickupConfirmed;
        }
        if self.assigned_driver().is_some() {
            return RideStatus::DriverSelected;
        }
        RideStatus::Requested
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            RideStatus::Completed | RideStatus::Cancelled
        )
    }

    fn has_event(&self, pred: impl Fn(&RideEventKind) -> bool) -> bool {
        self.events.iter().any(|ev| pred(&ev.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;

    fn sample_context() -> RideContext {
        RideContext {
            ride_id: utils::new_ride_id(),
            rider: "user_1rider".to_string(),
            details_hash: "00".repeat(32),
            pickup: GeoPoint::new(37.0, -122.0, "1 Main St"),
            dropoff: GeoPoint::new(37.1, -122.1, "99 Elm St"),
            distance_miles: 5.0,
            seats: 1,
            price: 2_250_000_000,
            events: vec![],
        }
    }

    fn event(ride_id: &str, user: &str, kind: RideEventKind) -> RideEvent {
        RideEvent::new(
            ride_id.to_string(),
            user.to_string(),
            crate::ride::TimeStamp::new(),
            kind,
        )
    }

    #[test]
    fn status_is_derived_from_the_log() {
        let mut ctx = sample_context();
        let hash = ctx.details_hash.clone();
        ctx.insert_event(event(
            &ctx.ride_id.clone(),
            "user_1rider",
            RideEventKind::Requested { details_hash: hash },
        ));
        assert_eq!(ctx.status(), RideStatus::Requested);
        assert_eq!(ctx.assigned_driver(), None);

        ctx.insert_event(event(
            &ctx.ride_id.clone(),
            "user_1rider",
            RideEventKind::DriverAssigned {
                driver_addr: "user_1driver".to_string(),
            },
        ));
        assert_eq!(ctx.status(), RideStatus::DriverSelected);
        assert_eq!(ctx.assigned_driver(), Some("user_1driver"));

        // one confirmation alone is not a pickup
        ctx.insert_event(event(&ctx.ride_id.clone(), "user_1driver", RideEventKind::DriverConfirmed));
        assert_eq!(ctx.status(), RideStatus::DriverSelected);

        ctx.insert_event(event(&ctx.ride_id.clone(), "user_1rider", RideEventKind::RiderConfirmed));
        assert_eq!(ctx.status(), RideStatus::PickupConfirmed);
    }

    #[test]
    fn cancel_wins_over_everything_else() {
        let mut ctx = sample_context();
        let hash = ctx.details_hash.clone();
        ctx.insert_event(event(
            &ctx.ride_id.clone(),
            "user_1rider",
            RideEventKind::Requested { details_hash: hash },
        ));
        ctx.insert_event(event(&ctx.ride_id.clone(), "user_1rider", RideEventKind::Cancelled));
        assert_eq!(ctx.status(), RideStatus::Cancelled);
        assert!(ctx.is_terminal());
    }

    #[test]
    fn record_roundtrips_through_cbor() {
        let mut ctx = sample_context();
        let hash = ctx.details_hash.clone();
        ctx.insert_event(event(
            &ctx.ride_id.clone(),
            "user_1rider",
            RideEventKind::Requested { details_hash: hash },
        ));

        let encoded = minicbor::to_vec(&ctx).unwrap();
        let decoded: RideContext = minicbor::decode(&encoded).unwrap();
        assert_eq!(ctx, decoded);
    }
}
