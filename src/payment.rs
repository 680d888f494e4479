//! Two-leg ride payment coordination.
//!
//! A ride fare settles as two independent transfers, the driver fee and the
//! platform fee. Each leg is tracked on its own so a retry re-issues only
//! the leg that failed, under a fresh memo. The ride is paid only when both
//! legs report success.

use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::utils;
use async_trait::async_trait;
use std::fmt;
use tracing::{info, warn};

pub type BlockHeight = u64;

/// One value transfer on whatever settlement rail backs the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    pub memo: String,
}

#[derive(thiserror::Error, Debug)]
#[error("transfer rejected: {0}")]
pub struct TransferError(pub String);

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Execute a single transfer. Memos are unique per attempt; a service
    /// that sees the same memo twice may treat the second as a duplicate.
    async fn transfer(&self, request: TransferRequest) -> Result<BlockHeight, TransferError>;
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegKind {
    #[n(0)]
    DriverFee,
    #[n(1)]
    PlatformFee,
}

impl fmt::Display for LegKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LegKind::DriverFee => write!(f, "driver fee"),
            LegKind::PlatformFee => write!(f, "platform fee"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum LegStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Succeeded {
        #[n(0)]
        height: BlockHeight,
        #[n(1)]
        memo: String,
    },
    #[n(2)]
    Failed {
        #[n(0)]
        memo: String,
        #[n(1)]
        reason: String,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PaymentLeg {
    #[n(0)]
    pub kind: LegKind,
    #[n(1)]
    pub to: String,
    #[n(2)]
    pub amount: u64,
    #[n(3)]
    pub status: LegStatus,
}

impl PaymentLeg {
    fn new(kind: LegKind, to: String, amount: u64) -> Self {
        Self {
            kind,
            to,
            amount,
            status: LegStatus::Pending,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, LegStatus::Succeeded { .. })
    }
}

/// The pair of transfers that settles one ride.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct RidePayment {
    #[n(0)]
    pub ride_id: String,
    #[n(1)]
    pub driver_leg: PaymentLeg,
    #[n(2)]
    pub platform_leg: PaymentLeg,
    #[n(3)]
    transfer_fee: u64,
}

impl RidePayment {
    /// Split the ledger price between the assigned driver and the platform.
    /// The split is integer-exact: the platform takes its basis points, the
    /// driver gets the remainder.
    pub fn for_ride(ride_id: &str, price: u64, driver_addr: &str, config: &FlowConfig) -> Self {
        let platform_cut =
            (price as u128 * config.platform_fee_bps as u128 / 10_000) as u64;

        Self {
            ride_id: ride_id.to_string(),
            driver_leg: PaymentLeg::new(
                LegKind::DriverFee,
                driver_addr.to_string(),
                price - platform_cut,
            ),
            platform_leg: PaymentLeg::new(
                LegKind::PlatformFee,
                config.platform_account.clone(),
                platform_cut,
            ),
            transfer_fee: config.transfer_fee,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.driver_leg.succeeded() && self.platform_leg.succeeded()
    }

    /// Issue every leg that has not already succeeded. A succeeded leg is
    /// never re-sent; a failed leg gets a fresh memo on the next call.
    pub async fn settle(&mut self, service: &dyn PaymentService) -> Result<(), FlowError> {
        let ride_id = self.ride_id.clone();
        let fee = self.transfer_fee;
        let mut first_failed = None;

        for leg in [&mut self.driver_leg, &mut self.platform_leg] {
            if leg.succeeded() {
                continue;
            }
            let memo = utils::new_memo();
            let request = TransferRequest {
                to: leg.to.clone(),
                amount: leg.amount,
                fee,
                memo: memo.clone(),
            };
            match service.transfer(request).await {
                Ok(height) => {
                    info!(ride_id = %ride_id, kind = %leg.kind, height, "transfer leg settled");
                    leg.status = LegStatus::Succeeded { height, memo };
                }
                Err(err) => {
                    warn!(ride_id = %ride_id, kind = %leg.kind, %err, "transfer leg failed");
                    leg.status = LegStatus::Failed {
                        memo,
                        reason: err.to_string(),
                    };
                    first_failed.get_or_insert(leg.kind);
                }
            }
        }

        match first_failed {
            Some(kind) => Err(FlowError::PaymentLegFailed(kind)),
            None => Ok(()),
        }
    }
}
