//! Step controllers driving a participant through the ride handshake.
//!
//! One controller instance per participant session; the rider and the
//! driver each run their own against the shared ledger. `advance` is the
//! only transition trigger, performs at most one externally observable side
//! effect, and moves forward only when that effect succeeds. `back` is a
//! view-only regression: it never undoes anything already committed to the
//! ledger, and re-advancing is idempotent with respect to it.
use crate::config::FlowConfig;
use crate::context::{RideContext, RideStatus};
use crate::error::{FlowError, ValidationError};
use crate::handoff;
use crate::ledger::RideLedger;
use crate::matching::{DriverCandidate, MatchQuery, MatchingService};
use crate::payment::{PaymentService, RidePayment};
use crate::ride::{RideDetails, Route, TimeStamp};
use crate::session::{Role, Session, SessionStore};
use crate::utils;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    // rider path
    #[n(0)]
    AwaitingLocation,
    #[n(1)]
    AwaitingSeatCount,
    #[n(2)]
    AwaitingDriverSelection,
    #[n(3)]
    AwaitingPickupConfirmation,
    // shared tail
    #[n(4)]
    AwaitingDropoffConfirmation,
    #[n(5)]
    Completed,
    // driver path
    #[n(6)]
    AwaitingRideAcceptance,
    #[n(7)]
    AwaitingPickupHandoff,
    // absorbing, reachable from any non-terminal step
    #[n(8)]
    Cancelled,
}

impl Step {
    pub fn initial_for(role: Role) -> Self {
        match role {
            Role::Rider => Step::AwaitingLocation,
            Role::Driver => Step::AwaitingRideAcceptance,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Completed | Step::Cancelled)
    }
}

/// Read-only projection of what the current step needs on screen.
#[derive(Debug, Clone, PartialEq)]
pub enum StepContent {
    ChooseRoute {
        route: Option<Route>,
    },
    ChooseSeats {
        seats: u8,
    },
    SelectDriver {
        candidates: Vec<DriverCandidate>,
        chosen: Option<DriverCandidate>,
    },
    ConfirmPickup {
        driver_confirmed: bool,
        paid: bool,
        handoff_verified: bool,
    },
    AwaitDropoff {
        ride_id: Option<String>,
    },
    RideInbox {
        requests: Vec<RideContext>,
        chosen: Option<String>,
    },
    ShowHandoff {
        code: Option<String>,
    },
    Done,
    Cancelled,
}

/// The capability set both flows expose to whatever renders them.
#[async_trait]
pub trait StepFlow: Send {
    fn role(&self) -> Role;
    fn current_step(&self) -> Step;
    fn step_content(&self) -> StepContent;
    async fn advance(&mut self) -> Result<Step, FlowError>;
    fn back(&mut self) -> Result<Step, FlowError>;
    async fn cancel(&mut self) -> Result<Step, FlowError>;
}

async fn with_timeout<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T, FlowError>>,
) -> Result<T, FlowError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(what, "call timed out");
            Err(FlowError::Timeout(what))
        }
    }
}

/// Shared tail of both paths: record completion, or just observe it when
/// the other participant got there first.
async fn complete_or_observe(
    ledger: &dyn RideLedger,
    config: &FlowConfig,
    ride_id: &str,
    user_addr: &str,
) -> Result<(), FlowError> {
    let info = with_timeout(config.call_timeout, "ride info", ledger.ride_info(ride_id)).await?;
    if info.status() == RideStatus::Completed {
        debug!(ride_id, "ride already completed, observing");
        return Ok(());
    }
    with_timeout(
        config.call_timeout,
        "ride completion",
        ledger.complete_ride(ride_id, user_addr),
    )
    .await?;
    Ok(())
}

pub struct RiderFlow {
    session: Session,
    ledger: Arc<dyn RideLedger>,
    matching: Arc<dyn MatchingService>,
    payments: Arc<dyn PaymentService>,
    store: Arc<dyn SessionStore>,
    config: FlowConfig,
    in_flight: bool,
}

impl RiderFlow {
    pub fn new(
        account: &str,
        ledger: Arc<dyn RideLedger>,
        matching: Arc<dyn MatchingService>,
        payments: Arc<dyn PaymentService>,
        store: Arc<dyn SessionStore>,
        config: FlowConfig,
    ) -> Result<Self, FlowError> {
        let session = Session::new(account.to_string(), Role::Rider);
        store.save(&session)?;
        Ok(Self {
            session,
            ledger,
            matching,
            payments,
            store,
            config,
            in_flight: false,
        })
    }

    /// Pick up a stored session for this account, or start fresh.
    pub fn resume(
        account: &str,
        ledger: Arc<dyn RideLedger>,
        matching: Arc<dyn MatchingService>,
        payments: Arc<dyn PaymentService>,
        store: Arc<dyn SessionStore>,
        config: FlowConfig,
    ) -> Result<Self, FlowError> {
        let session = store
            .load(account)?
            .filter(|s| s.role == Role::Rider)
            .unwrap_or_else(|| Session::new(account.to_string(), Role::Rider));
        store.save(&session)?;
        Ok(Self {
            session,
            ledger,
            matching,
            payments,
            store,
            config,
            in_flight: false,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn set_route(&mut self, route: Route) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingLocation {
            return Err(FlowError::NotReady(
                "the route can only change while choosing locations",
            ));
        }
        self.session.route = Some(route);
        self.persist()
    }

    pub fn set_seats(&mut self, seats: u8) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingSeatCount {
            return Err(FlowError::NotReady(
                "the seat count can only change at the seat step",
            ));
        }
        if seats == 0 || seats > 2 {
            return Err(ValidationError::InvalidSeats.into());
        }
        self.session.seats = seats;
        self.persist()
    }

    /// Query matching for candidates near the pickup. An empty result is
    /// surfaced as `Unavailable` and nothing is written to the ledger; the
    /// rider re-prompts, the controller never auto-retries.
    pub async fn request_drivers(&mut self) -> Result<Vec<DriverCandidate>, FlowError> {
        if self.session.step != Step::AwaitingDriverSelection {
            return Err(FlowError::NotReady(
                "drivers are requested at the selection step",
            ));
        }
        let route = self
            .session
            .route
            .clone()
            .ok_or(FlowError::NotReady("pickup and dropoff are not chosen yet"))?;
        let query = MatchQuery {
            account: self.session.account.clone(),
            latitude: route.pickup.lat,
            longitude: route.pickup.lng,
            seats: self.session.seats,
        };
        let candidates = with_timeout(
            self.config.call_timeout,
            "driver matching",
            self.matching.request_drivers(&query),
        )
        .await?;

        if candidates.is_empty() {
            self.session.candidates.clear();
            self.persist()?;
            return Err(FlowError::Unavailable);
        }
        self.session.candidates = candidates.clone();
        self.persist()?;
        Ok(candidates)
    }

    pub fn choose_candidate(&mut self, index: usize) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingDriverSelection {
            return Err(FlowError::NotReady(
                "drivers are chosen at the selection step",
            ));
        }
        let candidate = self
            .session
            .candidates
            .get(index)
            .cloned()
            .ok_or(FlowError::NotReady("no such candidate"))?;
        self.session.chosen = Some(candidate);
        self.persist()
    }

    /// Side-effect-free read loop watching for the driver's confirmation,
    /// bounded by the configured maximum wait.
    pub async fn poll_driver_confirmation(&mut self) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingPickupConfirmation {
            return Err(FlowError::NotReady(
                "confirmation is polled at the pickup step",
            ));
        }
        let ride_id = self.ride_id()?;
        let started = Instant::now();
        loop {
            let info = with_timeout(
                self.config.call_timeout,
                "ride info",
                self.ledger.ride_info(&ride_id),
            )
            .await?;
            if info.status() == RideStatus::Cancelled {
                return Err(FlowError::Conflict("ride was cancelled"));
            }
            if info.driver_confirmed() {
                info!(%ride_id, "driver confirmation observed");
                self.session.driver_confirmed_seen = true;
                return self.persist();
            }
            if started.elapsed() >= self.config.poll_max_wait {
                return Err(FlowError::Timeout("driver confirmation"));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Settle the two fare legs. Retrying after `PaymentLegFailed` re-issues
    /// only the failed leg; the succeeded one is never sent again.
    pub async fn make_payments(&mut self) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingPickupConfirmation {
            return Err(FlowError::NotReady("payment happens at the pickup step"));
        }
        if !self.session.driver_confirmed_seen {
            return Err(FlowError::NotReady(
                "driver has not confirmed the pickup yet",
            ));
        }
        let ride_id = self.ride_id()?;

        if self.session.payment.is_none() {
            let info = with_timeout(
                self.config.call_timeout,
                "ride info",
                self.ledger.ride_info(&ride_id),
            )
            .await?;
            let driver = info
                .assigned_driver()
                .ok_or(FlowError::NotReady("no driver assigned yet"))?;
            self.session.payment = Some(RidePayment::for_ride(
                &ride_id,
                info.price,
                driver,
                &self.config,
            ));
        }

        let mut payment = self
            .session
            .payment
            .clone()
            .ok_or(FlowError::NotReady("no payment prepared"))?;
        let result = with_timeout(
            self.config.call_timeout,
            "payment settlement",
            payment.settle(self.payments.as_ref()),
        )
        .await;
        // keep whatever leg state we reached, success or not
        self.session.payment = Some(payment);
        self.persist()?;
        result
    }

    /// Check the code scanned off the driver's screen against this ride.
    pub fn verify_handoff(&mut self, scanned: &str) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingPickupConfirmation {
            return Err(FlowError::NotReady(
                "the handoff is verified at the pickup step",
            ));
        }
        let ride_id = self.ride_id()?;
        handoff::verify(&ride_id, scanned)?;
        info!(%ride_id, "handoff code verified");
        self.session.handoff_verified = true;
        self.persist()
    }

    fn ride_id(&self) -> Result<String, FlowError> {
        self.session
            .ride_id
            .clone()
            .ok_or(FlowError::NotReady("no ride registered yet"))
    }

    fn persist(&self) -> Result<(), FlowError> {
        self.store.save(&self.session)
    }

    fn transition(&mut self, next: Step) -> Result<Step, FlowError> {
        debug!(role = %Role::Rider, step = ?next, "step advanced");
        self.session.step = next;
        self.persist()?;
        Ok(next)
    }

    async fn advance_inner(&mut self) -> Result<Step, FlowError> {
        match self.session.step {
            Step::AwaitingLocation => {
                if self.session.route.is_none() {
                    return Err(FlowError::NotReady("pickup and dropoff are not chosen yet"));
                }
                self.transition(Step::AwaitingSeatCount)
            }
            Step::AwaitingSeatCount => {
                // a ride id in the session means the request is already on
                // the ledger; re-entering this step must not duplicate it
                if self.session.ride_id.is_none() {
                    let route = self
                        .session
                        .route
                        .clone()
                        .ok_or(FlowError::NotReady("pickup and dropoff are not chosen yet"))?;
                    let details = RideDetails::new()
                        .set_rider(&self.session.account)
                        .set_route(route)
                        .set_seats(self.session.seats)
                        .set_requested_at(TimeStamp::new());
                    let ride_id = utils::new_ride_id();
                    let ctx = with_timeout(
                        self.config.call_timeout,
                        "ride registration",
                        self.ledger.register_ride(&ride_id, details),
                    )
                    .await?;
                    self.session.ride_id = Some(ctx.ride_id);
                }
                self.transition(Step::AwaitingDriverSelection)
            }
            Step::AwaitingDriverSelection => {
                let chosen = self
                    .session
                    .chosen
                    .clone()
                    .ok_or(FlowError::NotReady("no driver selected yet"))?;
                let ride_id = self.ride_id()?;
                with_timeout(
                    self.config.call_timeout,
                    "driver acceptance",
                    self.ledger
                        .accept_driver(&ride_id, &self.session.account, &chosen.address),
                )
                .await?;
                self.transition(Step::AwaitingPickupConfirmation)
            }
            Step::AwaitingPickupConfirmation => {
                if !self.session.driver_confirmed_seen {
                    return Err(FlowError::NotReady(
                        "driver has not confirmed the pickup yet",
                    ));
                }
                let paid = self
                    .session
                    .payment
                    .as_ref()
                    .is_some_and(|p| p.is_paid());
                if !paid {
                    return Err(FlowError::NotReady("payment has not settled yet"));
                }
                if !self.session.handoff_verified {
                    return Err(FlowError::NotReady(
                        "handoff code has not been verified yet",
                    ));
                }
                let ride_id = self.ride_id()?;
                // the single write that flips the rider confirmation
                with_timeout(
                    self.config.call_timeout,
                    "rider confirmation",
                    self.ledger
                        .update_rider_confirmation(&ride_id, &self.session.account),
                )
                .await?;
                self.transition(Step::AwaitingDropoffConfirmation)
            }
            Step::AwaitingDropoffConfirmation => {
                let ride_id = self.ride_id()?;
                complete_or_observe(
                    self.ledger.as_ref(),
                    &self.config,
                    &ride_id,
                    &self.session.account,
                )
                .await?;
                self.transition(Step::Completed)
            }
            Step::Completed | Step::Cancelled => {
                Err(FlowError::NotReady("the booking session is finished"))
            }
            _ => Err(FlowError::NotReady("not a rider step")),
        }
    }
}

#[async_trait]
impl StepFlow for RiderFlow {
    fn role(&self) -> Role {
        Role::Rider
    }

    fn current_step(&self) -> Step {
        self.session.step
    }

    fn step_content(&self) -> StepContent {
        match self.session.step {
            Step::AwaitingLocation => StepContent::ChooseRoute {
                route: self.session.route.clone(),
            },
            Step::AwaitingSeatCount => StepContent::ChooseSeats {
                seats: self.session.seats,
            },
            Step::AwaitingDriverSelection => StepContent::SelectDriver {
                candidates: self.session.candidates.clone(),
                chosen: self.session.chosen.clone(),
            },
            Step::AwaitingPickupConfirmation => StepContent::ConfirmPickup {
                driver_confirmed: self.session.driver_confirmed_seen,
                paid: self
                    .session
                    .payment
                    .as_ref()
                    .is_some_and(|p| p.is_paid()),
                handoff_verified: self.session.handoff_verified,
            },
            Step::AwaitingDropoffConfirmation => StepContent::AwaitDropoff {
                ride_id: self.session.ride_id.clone(),
            },
            Step::Cancelled => StepContent::Cancelled,
            // driver steps cannot occur in a rider session
            _ => StepContent::Done,
        }
    }

    /// Only transition trigger. Steps strictly serialize: a second call
    /// while one is pending is rejected without touching anything.
    async fn advance(&mut self) -> Result<Step, FlowError> {
        if self.in_flight {
            return Err(FlowError::NotReady("an advance is already in flight"));
        }
        self.in_flight = true;
        let result = self.advance_inner().await;
        self.in_flight = false;
        result
    }

    /// View-only regression; committed ledger effects stay committed.
    fn back(&mut self) -> Result<Step, FlowError> {
        let previous = match self.session.step {
            Step::AwaitingSeatCount => Step::AwaitingLocation,
            Step::AwaitingDriverSelection => Step::AwaitingSeatCount,
            Step::AwaitingPickupConfirmation => Step::AwaitingDriverSelection,
            Step::AwaitingDropoffConfirmation => Step::AwaitingPickupConfirmation,
            _ => return Err(FlowError::NotReady("cannot step back from here")),
        };
        self.session.step = previous;
        self.persist()?;
        Ok(previous)
    }

    async fn cancel(&mut self) -> Result<Step, FlowError> {
        if self.session.step.is_terminal() {
            return Err(FlowError::NotReady("the booking session is finished"));
        }
        if let Some(ride_id) = self.session.ride_id.clone() {
            with_timeout(
                self.config.call_timeout,
                "ride cancellation",
                self.ledger.cancel_ride(&ride_id, &self.session.account),
            )
            .await?;
        }
        self.session.step = Step::Cancelled;
        self.persist()?;
        Ok(Step::Cancelled)
    }
}

pub struct DriverFlow {
    session: Session,
    ledger: Arc<dyn RideLedger>,
    store: Arc<dyn SessionStore>,
    config: FlowConfig,
    // transient inbox cache, rebuilt by load_requests
    requests: Vec<RideContext>,
    in_flight: bool,
}

impl DriverFlow {
    pub fn new(
        account: &str,
        ledger: Arc<dyn RideLedger>,
        store: Arc<dyn SessionStore>,
        config: FlowConfig,
    ) -> Result<Self, FlowError> {
        let session = Session::new(account.to_string(), Role::Driver);
        store.save(&session)?;
        Ok(Self {
            session,
            ledger,
            store,
            config,
            requests: Vec::new(),
            in_flight: false,
        })
    }

    pub fn resume(
        account: &str,
        ledger: Arc<dyn RideLedger>,
        store: Arc<dyn SessionStore>,
        config: FlowConfig,
    ) -> Result<Self, FlowError> {
        let session = store
            .load(account)?
            .filter(|s| s.role == Role::Driver)
            .unwrap_or_else(|| Session::new(account.to_string(), Role::Driver));
        store.save(&session)?;
        Ok(Self {
            session,
            ledger,
            store,
            config,
            requests: Vec::new(),
            in_flight: false,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Refresh the inbox of rides this driver could take. Empty is a valid
    /// outcome, the table just shows nothing yet.
    pub async fn load_requests(&mut self) -> Result<Vec<RideContext>, FlowError> {
        if self.session.step != Step::AwaitingRideAcceptance {
            return Err(FlowError::NotReady(
                "requests are loaded at the acceptance step",
            ));
        }
        let requests = with_timeout(
            self.config.call_timeout,
            "open ride lookup",
            self.ledger.open_rides_for(&self.session.account),
        )
        .await?;
        self.requests = requests.clone();
        Ok(requests)
    }

    pub fn choose_request(&mut self, ride_id: &str) -> Result<(), FlowError> {
        if self.session.step != Step::AwaitingRideAcceptance {
            return Err(FlowError::NotReady(
                "rides are chosen at the acceptance step",
            ));
        }
        if !self.requests.iter().any(|r| r.ride_id == ride_id) {
            return Err(FlowError::NotReady("that ride is not in the request list"));
        }
        self.session.ride_id = Some(ride_id.to_string());
        self.persist()
    }

    /// The code shown on the driver's screen for the rider to scan.
    pub fn handoff_code(&self) -> Result<String, FlowError> {
        let ride_id = self.ride_id()?;
        handoff::encode(&ride_id)
    }

    fn ride_id(&self) -> Result<String, FlowError> {
        self.session
            .ride_id
            .clone()
            .ok_or(FlowError::NotReady("no ride selected yet"))
    }

    fn persist(&self) -> Result<(), FlowError> {
        self.store.save(&self.session)
    }

    fn transition(&mut self, next: Step) -> Result<Step, FlowError> {
        debug!(role = %Role::Driver, step = ?next, "step advanced");
        self.session.step = next;
        self.persist()?;
        Ok(next)
    }

    async fn advance_inner(&mut self) -> Result<Step, FlowError> {
        match self.session.step {
            Step::AwaitingRideAcceptance => {
                let ride_id = self.ride_id()?;
                // the ledger arbitrates; losing the race surfaces as
                // "ride is no longer available", never a silent success
                with_timeout(
                    self.config.call_timeout,
                    "ride acceptance",
                    self.ledger.accept_ride(&ride_id, &self.session.account),
                )
                .await?;
                self.transition(Step::AwaitingPickupHandoff)
            }
            Step::AwaitingPickupHandoff => {
                let ride_id = self.ride_id()?;
                with_timeout(
                    self.config.call_timeout,
                    "driver confirmation",
                    self.ledger
                        .update_driver_confirmation(&ride_id, &self.session.account),
                )
                .await?;
                self.transition(Step::AwaitingDropoffConfirmation)
            }
            Step::AwaitingDropoffConfirmation => {
                let ride_id = self.ride_id()?;
                complete_or_observe(
                    self.ledger.as_ref(),
                    &self.config,
                    &ride_id,
                    &self.session.account,
                )
                .await?;
                self.transition(Step::Completed)
            }
            Step::Completed | Step::Cancelled => {
                Err(FlowError::NotReady("the booking session is finished"))
            }
            _ => Err(FlowError::NotReady("not a driver step")),
        }
    }
}

#[async_trait]
impl StepFlow for DriverFlow {
    fn role(&self) -> Role {
        Role::Driver
    }

    fn current_step(&self) -> Step {
        self.session.step
    }

    fn step_content(&self) -> StepContent {
        match self.session.step {
            Step::AwaitingRideAcceptance => StepContent::RideInbox {
                requests: self.requests.clone(),
                chosen: self.session.ride_id.clone(),
            },
            Step::AwaitingPickupHandoff => StepContent::ShowHandoff {
                code: self.handoff_code().ok(),
            },
            Step::AwaitingDropoffConfirmation => StepContent::AwaitDropoff {
                ride_id: self.session.ride_id.clone(),
            },
            Step::Cancelled => StepContent::Cancelled,
            // rider steps cannot occur in a driver session
            _ => StepContent::Done,
        }
    }

    async fn advance(&mut self) -> Result<Step, FlowError> {
        if self.in_flight {
            return Err(FlowError::NotReady("an advance is already in flight"));
        }
        self.in_flight = true;
        let result = self.advance_inner().await;
        self.in_flight = false;
        result
    }

    fn back(&mut self) -> Result<Step, FlowError> {
        let previous = match self.session.step {
            Step::AwaitingPickupHandoff => Step::AwaitingRideAcceptance,
            Step::AwaitingDropoffConfirmation => Step::AwaitingPickupHandoff,
            _ => return Err(FlowError::NotReady("cannot step back from here")),
        };
        self.session.step = previous;
        self.persist()?;
        Ok(previous)
    }

    async fn cancel(&mut self) -> Result<Step, FlowError> {
        if self.session.step.is_terminal() {
            return Err(FlowError::NotReady("the booking session is finished"));
        }
        if let Some(ride_id) = self.session.ride_id.clone() {
            with_timeout(
                self.config.call_timeout,
                "ride cancellation",
                self.ledger.cancel_ride(&ride_id, &self.session.account),
            )
            .await?;
        }
        self.session.step = Step::Cancelled;
        self.persist()?;
        Ok(Step::Cancelled)
    }
}
