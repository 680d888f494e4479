//! Driver matching: the lookup a rider hits to find candidate drivers
//! near their pickup point.

use crate::config::FareSchedule;
use crate::error::FlowError;
use async_trait::async_trait;
use std::fmt;
use std::sync::RwLock;
use tracing::debug;

/// What the rider sends: who they are and where they are.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    pub account: String,
    pub latitude: f64,
    pub longitude: f64,
    pub seats: u8,
}

/// A driver offered to the rider for the duration of the selection step.
/// The quote is a display estimate only; the ledger price is authoritative.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DriverCandidate {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub contact: String,
    #[n(2)]
    pub car_no: String,
    #[n(3)]
    pub rating: f64,
    #[n(4)]
    pub address: String, // Wallet Address
    #[n(5)]
    pub quote: u64,
}

#[async_trait]
pub trait MatchingService: Send + Sync {
    /// Candidates for the query, in the order the service ranks them.
    /// Callers must not re-sort. An empty result is a valid outcome.
    async fn request_drivers(&self, query: &MatchQuery)
    -> Result<Vec<DriverCandidate>, FlowError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Active,
    Inactive,
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverStatus::Active => write!(f, "Active"),
            DriverStatus::Inactive => write!(f, "Inactive"),
        }
    }
}

/// A registered driver as the matching side knows them.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverProfile {
    pub name: String,
    pub contact: String,
    pub car_no: String,
    pub rating: f64,
    pub address: String,
    pub seats: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub status: DriverStatus,
}

/// In-memory driver registry, ranked by distance to the rider.
pub struct DriverPool {
    drivers: RwLock<Vec<DriverProfile>>,
    fares: FareSchedule,
}

impl DriverPool {
    pub fn new(fares: FareSchedule) -> Self {
        Self {
            drivers: RwLock::new(Vec::new()),
            fares,
        }
    }

    pub fn register_driver(&self, profile: DriverProfile) {
        debug!(address = %profile.address, "driver registered");
        self.drivers
            .write()
            .expect("driver pool lock poisoned")
            .push(profile);
    }

    pub fn set_status(&self, address: &str, status: DriverStatus) {
        let mut drivers = self.drivers.write().expect("driver pool lock poisoned");
        for driver in drivers.iter_mut().filter(|d| d.address == address) {
            driver.status = status;
        }
    }
}

#[async_trait]
impl MatchingService for DriverPool {
    async fn request_drivers(
        &self,
        query: &MatchQuery,
    ) -> Result<Vec<DriverCandidate>, FlowError> {
        let drivers = self.drivers.read().expect("driver pool lock poisoned");

        let mut nearby: Vec<(f64, DriverCandidate)> = drivers
            .iter()
            .filter(|d| d.status == DriverStatus::Active && d.seats >= query.seats)
            .map(|d| {
                let dist2 = (d.latitude - query.latitude).powi(2)
                    + (d.longitude - query.longitude).powi(2);
                let candidate = DriverCandidate {
                    name: d.name.clone(),
                    contact: d.contact.clone(),
                    car_no: d.car_no.clone(),
                    rating: d.rating,
                    address: d.address.clone(),
                    // flat estimate shown in the selection table
                    quote: self.fares.base_fare,
                };
                (dist2, candidate)
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

        debug!(account = %query.account, candidates = nearby.len(), "matching query served");
        Ok(nearby.into_iter().map(|(_, c)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn candidates_come_back_nearest_first() {
        let pool = DriverPool::new(FareSchedule::default());
        pool.register_driver(profile("far", "user_1far", 40.0, -120.0));
        pool.register_driver(profile("near", "user_1near", 37.01, -122.01));

        let query = MatchQuery {
            account: "user_1rider".to_string(),
            latitude: 37.0,
            longitude: -122.0,
            seats: 1,
        };
        let candidates = pool.request_drivers(&query).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].address, "user_1near");
    }

    #[tokio::test]
    async fn inactive_and_undersized_drivers_are_skipped() {
        let pool = DriverPool::new(FareSchedule::default());
        pool.register_driver(profile("off", "user_1off", 37.0, -122.0));
        pool.set_status("user_1off", DriverStatus::Inactive);

        let mut small = profile("small", "user_1small", 37.0, -122.0);
        small.seats = 1;
        pool.register_driver(small);

        let query = MatchQuery {
            account: "user_1rider".to_string(),
            latitude: 37.0,
            longitude: -122.0,
            seats: 2,
        };
        let candidates = pool.request_drivers(&query).await.unwrap();
        assert!(candidates.is_empty());
    }
}
