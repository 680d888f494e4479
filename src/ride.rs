//! Core ride request details and location types
use super::error::ValidationError;
use chrono::{DateTime, TimeZone, Utc};

/// A point on the map plus the free-text address the geocoder resolved it to.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct GeoPoint {
    #[n(0)]
    pub lat: f64,
    #[n(1)]
    pub lng: f64,
    #[n(2)]
    pub address_text: String,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64, address_text: &str) -> Self {
        Self {
            lat,
            lng,
            address_text: address_text.to_string(),
        }
    }

    fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

/// Pickup, dropoff and the distance between them as quoted by the map layer.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Route {
    #[n(0)]
    pub pickup: GeoPoint,
    #[n(1)]
    pub dropoff: GeoPoint,
    #[n(2)]
    pub distance_miles: f64,
}

// Also used for constructing drafts
// Key is the hash of this struct encoded into CBOR
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, PartialEq)]
pub struct RideDetails {
    // No ID field, the ride id is minted separately at request time
    #[n(0)]
    rider: Option<String>, // Wallet Address
    #[n(1)]
    pickup: Option<GeoPoint>,
    #[n(2)]
    dropoff: Option<GeoPoint>,
    #[n(3)]
    distance_miles: f64,
    #[n(4)]
    seats: u8,
    #[n(5)]
    requested_at: Option<TimeStamp<Utc>>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl RideDetails {
    /// Construct a new builder object, this becomes the basis for a request
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_rider(mut self, rider: &str) -> Self {
        self.rider = Some(rider.to_string());
        self
    }
    pub fn set_pickup(mut self, pickup: GeoPoint) -> Self {
        self.pickup = Some(pickup);
        self
    }
    pub fn set_dropoff(mut self, dropoff: GeoPoint) -> Self {
        self.dropoff = Some(dropoff);
        self
    }
    pub fn set_route(self, route: Route) -> Self {
        self.set_pickup(route.pickup)
            .set_dropoff(route.dropoff)
            .set_distance_miles(route.distance_miles)
    }
    pub fn set_distance_miles(mut self, distance_miles: f64) -> Self {
        self.distance_miles = distance_miles;
        self
    }
    pub fn set_seats(mut self, seats: u8) -> Self {
        self.seats = seats;
        self
    }
    pub fn set_requested_at(mut self, at: TimeStamp<Utc>) -> Self {
        self.requested_at = Some(at);
        self
    }

    pub fn rider(&self) -> Option<&str> {
        self.rider.as_deref()
    }
    pub fn pickup(&self) -> Option<&GeoPoint> {
        self.pickup.as_ref()
    }
    pub fn dropoff(&self) -> Option<&GeoPoint> {
        self.dropoff.as_ref()
    }
    pub fn distance_miles(&self) -> f64 {
        self.distance_miles
    }
    pub fn seats(&self) -> u8 {
        self.seats
    }

    /// Checks the request is bookable: both locations chosen, a sane
    /// distance, and a seat count the vehicle classes we match can carry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rider.is_none() {
            return Err(ValidationError::MissingRider);
        }
        let bookable = match (&self.pickup, &self.dropoff) {
            (Some(p), Some(d)) => p.is_finite() && d.is_finite(),
            _ => false,
        };
        if !bookable {
            return Err(ValidationError::MissingRoute);
        }
        if !self.distance_miles.is_finite() || self.distance_miles <= 0.0 {
            return Err(ValidationError::InvalidDistance);
        }
        // co-passengers share pickup and drop, so two seats is the ceiling
        if self.seats == 0 || self.seats > 2 {
            return Err(ValidationError::InvalidSeats);
        }
        if self.requested_at.is_none() {
            return Err(ValidationError::MissingTimestamp);
        }
        Ok(())
    }

    // Checks fields, then returns a hash of the request and its contents serialised into cbor
    pub fn validate_and_finalise(&self) -> Result<(String, Vec<u8>), crate::error::FlowError> {
        self.validate()?;

        let contents = minicbor::to_vec(self)?;
        let hash = sha256::digest(&contents);

        Ok((hash, contents))
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}
impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}
impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
