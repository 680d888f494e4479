//! Tunables for the negotiation flow and the ledger fare computation.
use std::time::Duration;

/// Knobs a deployment sets once and shares across controllers.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Account credited with the platform's cut of every fare.
    pub platform_account: String,
    /// Platform share of the price, in basis points.
    pub platform_fee_bps: u16,
    /// Flat network fee charged per transfer leg.
    pub transfer_fee: u64,
    /// Bound on any single ledger/matching/payment call.
    pub call_timeout: Duration,
    /// Cadence of the driver-confirmation poll.
    pub poll_interval: Duration,
    /// How long to keep polling before surfacing a timeout.
    pub poll_max_wait: Duration,
}

impl FlowConfig {
    pub fn new(platform_account: impl Into<String>) -> Self {
        Self {
            platform_account: platform_account.into(),
            platform_fee_bps: 500,
            transfer_fee: 10_000,
            call_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            poll_max_wait: Duration::from_secs(60),
        }
    }
}

/// Fare schedule in integer token units (e8s). The ledger applies this at
/// registration time; anything the client shows beforehand is an estimate.
#[derive(Debug, Clone, Copy)]
pub struct FareSchedule {
    pub base_fare: u64,
    pub per_mile: u64,
}

impl FareSchedule {
    pub fn price_for(&self, distance_miles: f64) -> u64 {
        self.base_fare + (self.per_mile as f64 * distance_miles).round() as u64
    }
}

impl Default for FareSchedule {
    // 20 tokens flat plus half a token per mile
    fn default() -> Self {
        Self {
            base_fare: 2_000_000_000,
            per_mile: 50_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fare_is_base_plus_distance() {
        let fares = FareSchedule::default();
        assert_eq!(fares.price_for(5.0), 2_250_000_000);
        assert_eq!(fares.price_for(0.5), 2_025_000_000);
    }
}
