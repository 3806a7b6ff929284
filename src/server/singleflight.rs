//! Per-fingerprint request coalescing.
//!
//! At most one underlying generation call is in flight per tile fingerprint.
//! The first caller becomes the leader and runs the work; everyone arriving
//! while the ticket exists attaches and awaits the same result. The ticket is
//! removed before the result is broadcast, so a caller arriving afterwards
//! starts a fresh flight rather than racing a lost wakeup.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use tokio::sync::broadcast;

use crate::generate::{GenerateError, GenerateOutcome};

pub type FlightResult = Result<GenerateOutcome, GenerateError>;

pub struct SingleFlight {
    tickets: Arc<Mutex<HashMap<u64, broadcast::Sender<FlightResult>>>>,
}

/// What `join` made of the caller.
pub enum Flight {
    /// First caller for this fingerprint; must call [`Ticket::complete`].
    Leader(Ticket),
    /// Another caller is already generating; await its result.
    Follower(broadcast::Receiver<FlightResult>),
}

pub struct Ticket {
    fingerprint: u64,
    tickets: Arc<Mutex<HashMap<u64, broadcast::Sender<FlightResult>>>>,
    tx: Option<broadcast::Sender<FlightResult>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn join(&self, fingerprint: u64) -> Flight {
        let mut tickets = self.tickets.lock().unwrap();
        if let Some(tx) = tickets.get(&fingerprint) {
            return Flight::Follower(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        tickets.insert(fingerprint, tx.clone());
        Flight::Leader(Ticket {
            fingerprint,
            tickets: self.tickets.clone(),
            tx: Some(tx),
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tickets.lock().unwrap().len()
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticket {
    /// A receiver for the flight's result. The leader subscribes before it
    /// hands the ticket to the generation task, so it cannot miss the send.
    pub fn subscribe(&self) -> broadcast::Receiver<FlightResult> {
        self.tx
            .as_ref()
            .expect("ticket already completed")
            .subscribe()
    }

    /// Resolve the flight for every attached waiter, leader included.
    pub fn complete(mut self, result: FlightResult) {
        self.tickets.lock().unwrap().remove(&self.fingerprint);
        if let Some(tx) = self.tx.take() {
            // No receivers just means nobody attached; that is fine.
            let _ = tx.send(result);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        // A ticket dropped without completing (leader task died) must not
        // leave the fingerprint stuck; followers see the channel close.
        if self.tx.is_some() {
            self.tickets.lock().unwrap().remove(&self.fingerprint);
        }
    }
}
