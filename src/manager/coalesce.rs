//! Request coalescing for store loads.
//!
//! At most one load per `(key, iov)` is in flight. The first caller runs the load;
//! callers arriving while it runs park on a channel and receive a copy of its
//! outcome. The leader must publish its result to the cache *before* the flight is
//! retired, so a caller that misses the flight always finds the cache populated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::condition::{Condition, ConditionKey};
use crate::error::{CondError, CondResult, ResolutionError};
use crate::iov::Iov;

type FlightKey = (ConditionKey, Iov);

/// Outcome of one coalesced load, shared by every caller of the flight.
#[derive(Debug, Clone)]
pub(crate) enum FlightOutcome {
    /// Another caller cached the value before this flight started.
    Cached(Arc<Condition>),
    /// Loaded from the store.
    Loaded(Arc<Condition>),
    /// The store has no value for this IOV.
    NotFound,
    /// The load failed. `connection_lost` tells callers to stop querying the store.
    Failed {
        error: ResolutionError,
        connection_lost: bool,
    },
}

impl FlightOutcome {
    pub(crate) const fn failed(error: ResolutionError) -> Self {
        Self::Failed {
            error,
            connection_lost: false,
        }
    }
}

/// Whether the caller ran the load or waited for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Leader,
    Follower,
}

#[derive(Debug, Default)]
pub(crate) struct LoadCoalescer {
    flights: Mutex<HashMap<FlightKey, Vec<Sender<FlightOutcome>>>>,
}

/// Retires a flight if the leader unwinds before finishing, so followers are
/// released (with a disconnect) instead of waiting forever.
struct FlightGuard<'a> {
    coalescer: &'a LoadCoalescer,
    key: FlightKey,
    done: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.coalescer.retire(&self.key);
        }
    }
}

impl LoadCoalescer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Runs `load` for `(key, iov)` unless an identical load is already in flight, in
    /// which case waits for it until `deadline`.
    pub(crate) fn run<F>(
        &self,
        key: ConditionKey,
        iov: Iov,
        deadline: Option<Instant>,
        load: F,
    ) -> CondResult<(FlightOutcome, Role)>
    where
        F: FnOnce() -> FlightOutcome,
    {
        let flight_key = (key, iov);
        if let Some(rx) = self.join_or_lead(flight_key)? {
            return Ok((Self::wait(&rx, deadline), Role::Follower));
        }

        let mut guard = FlightGuard {
            coalescer: self,
            key: flight_key,
            done: false,
        };
        let outcome = load();
        let waiters = self.retire(&flight_key)?;
        guard.done = true;
        for tx in waiters {
            // A follower that timed out has dropped its receiver.
            let _ = tx.send(outcome.clone());
        }
        Ok((outcome, Role::Leader))
    }

    /// Number of loads currently in flight.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> CondResult<usize> {
        let flights = self.flights.lock().map_err(|_| lock_err("coalescer.in_flight"))?;
        Ok(flights.len())
    }

    fn join_or_lead(&self, flight_key: FlightKey) -> CondResult<Option<Receiver<FlightOutcome>>> {
        let mut flights = self.flights.lock().map_err(|_| lock_err("coalescer.join"))?;
        if let Some(waiters) = flights.get_mut(&flight_key) {
            let (tx, rx) = bounded(1);
            waiters.push(tx);
            return Ok(Some(rx));
        }
        flights.insert(flight_key, Vec::new());
        Ok(None)
    }

    fn retire(&self, flight_key: &FlightKey) -> CondResult<Vec<Sender<FlightOutcome>>> {
        let mut flights = self.flights.lock().map_err(|_| lock_err("coalescer.retire"))?;
        Ok(flights.remove(flight_key).unwrap_or_default())
    }

    fn wait(rx: &Receiver<FlightOutcome>, deadline: Option<Instant>) -> FlightOutcome {
        let received = match deadline {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => FlightOutcome::failed(ResolutionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => FlightOutcome::failed(ResolutionError::StoreUnavailable {
                attempts: 0,
                reason: "in-flight load was abandoned".to_string(),
            }),
        }
    }
}

fn lock_err(context: &'static str) -> CondError {
    CondError::internal(format!("poisoned lock: {context}"))
}
