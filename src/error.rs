use crate::payment::LegKind;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Ride request is missing the rider account")]
    MissingRider,
    #[error("Pickup and dropoff locations are not both set")]
    MissingRoute,
    #[error("Ride distance must be a positive number of miles")]
    InvalidDistance,
    #[error("Seat count must be between 1 and 2")]
    InvalidSeats,
    #[error("Ride request is missing its request timestamp")]
    MissingTimestamp,
}

/// Failure taxonomy for the negotiation flow. `NotReady` and `Unavailable`
/// recover locally; `Conflict`, `PaymentLegFailed` and `Timeout` are surfaced
/// to the participant with an explicit retry.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("not ready: {0}")]
    NotReady(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("no drivers available")]
    Unavailable,
    #[error("{0} transfer failed, ride left partially paid")]
    PaymentLegFailed(LegKind),
    #[error("timed out waiting on {0}")]
    Timeout(&'static str),
    #[error("scanned code does not verify against this ride")]
    VerificationFailed,
    #[error("unknown ride: {0}")]
    NotFound(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("ride store failure")]
    Store(#[from] sled::Error),
    #[error("failed to encode record to cbor")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("failed to decode record from cbor")]
    Decode(#[from] minicbor::decode::Error),
}
