//! Explicit booking-session context.
//!
//! Everything a participant's client needs to resume mid-negotiation lives
//! in one value handed to the step controller at construction and persisted
//! behind `SessionStore`. It is a local cache for resuming the UI, never
//! the source of truth. That is the ledger's job.
use crate::error::FlowError;
use crate::flow::Step;
use crate::matching::DriverCandidate;
use crate::payment::RidePayment;
use crate::ride::Route;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[n(0)]
    Rider,
    #[n(1)]
    Driver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Rider => write!(f, "Rider"),
            Role::Driver => write!(f, "Driver"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Session {
    #[n(0)]
    pub account: String, // Wallet Address, fixed at registration
    #[n(1)]
    pub role: Role,
    #[n(2)]
    pub step: Step,
    #[n(3)]
    pub route: Option<Route>,
    #[n(4)]
    pub seats: u8,
    #[n(5)]
    pub ride_id: Option<String>,
    #[n(6)]
    pub candidates: Vec<DriverCandidate>,
    #[n(7)]
    pub chosen: Option<DriverCandidate>,
    #[n(8)]
    pub driver_confirmed_seen: bool,
    #[n(9)]
    pub payment: Option<RidePayment>,
    #[n(10)]
    pub handoff_verified: bool,
}

impl Session {
    pub fn new(account: String, role: Role) -> Self {
        Self {
            step: Step::initial_for(role),
            account,
            role,
            route: None,
            seats: 1,
            ride_id: None,
            candidates: Vec::new(),
            chosen: None,
            driver_confirmed_seen: false,
            payment: None,
            handoff_verified: false,
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<(), FlowError>;
    fn load(&self, account: &str) -> Result<Option<Session>, FlowError>;
    fn clear(&self, account: &str) -> Result<(), FlowError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> Result<(), FlowError> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .insert(session.account.clone(), session.clone());
        Ok(())
    }

    fn load(&self, account: &str) -> Result<Option<Session>, FlowError> {
        Ok(self
            .inner
            .lock()
            .expect("session store lock poisoned")
            .get(account)
            .cloned())
    }

    fn clear(&self, account: &str) -> Result<(), FlowError> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .remove(account);
        Ok(())
    }
}

/// Durable variant for clients that resume across restarts. Keys carry a
/// `session_` prefix so they never collide with ride records in a shared db.
pub struct SledSessionStore {
    instance: Arc<sled::Db>,
}

impl SledSessionStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    fn key(account: &str) -> String {
        format!("session_{account}")
    }
}

impl SessionStore for SledSessionStore {
    fn save(&self, session: &Session) -> Result<(), FlowError> {
        let encoded = minicbor::to_vec(session)?;
        self.instance
            .insert(Self::key(&session.account).as_bytes(), encoded)?;
        Ok(())
    }

    fn load(&self, account: &str) -> Result<Option<Session>, FlowError> {
        match self.instance.get(Self::key(account).as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(raw.as_ref())?)),
            None => Ok(None),
        }
    }

    fn clear(&self, account: &str) -> Result<(), FlowError> {
        self.instance.remove(Self::key(account).as_bytes())?;
        Ok(())
    }
}
