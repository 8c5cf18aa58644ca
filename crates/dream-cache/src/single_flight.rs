//! Single-flight build coalescing
//!
//! At most one upstream build runs per fingerprint. Concurrent misses for
//! the same fingerprint wait on the leader's result instead of dispatching
//! their own builds. If a leader is cancelled before publishing, waiters
//! race for the lease and exactly one becomes the new leader.

use crate::fingerprint::Fingerprint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

type FlightMap<T> = Arc<Mutex<HashMap<Fingerprint, watch::Receiver<Option<T>>>>>;

/// Role assigned to a caller entering the flight for a fingerprint
pub enum Flight<T: Clone> {
    /// Caller must build and publish (or drop the lease on failure)
    Leader(FlightLease<T>),
    /// Another caller built the value
    Completed(T),
}

/// Per-fingerprint single-flight table
pub struct SingleFlight<T: Clone> {
    inflight: FlightMap<T>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of builds currently in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Join the flight for `fingerprint`: become the leader, or wait for
    /// the current leader's result. Returns when the caller holds the
    /// lease or a published value is available.
    pub async fn join(&self, fingerprint: &Fingerprint) -> Flight<T> {
        loop {
            let mut receiver = {
                let mut inflight = self.inflight.lock();
                match inflight.get(fingerprint) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(fingerprint.clone(), rx);
                        return Flight::Leader(FlightLease {
                            fingerprint: fingerprint.clone(),
                            sender: tx,
                            inflight: Arc::clone(&self.inflight),
                            published: false,
                        });
                    }
                }
            };

            loop {
                if let Some(value) = receiver.borrow().clone() {
                    return Flight::Completed(value);
                }
                if receiver.changed().await.is_err() {
                    // Leader dropped without publishing; race for the lease
                    debug!(%fingerprint, "flight leader vanished, retrying for lease");
                    break;
                }
            }
        }
    }
}

/// Leadership lease for one fingerprint.
///
/// Dropping the lease without publishing removes the flight entry and
/// wakes waiters so one of them can take over.
pub struct FlightLease<T: Clone> {
    fingerprint: Fingerprint,
    sender: watch::Sender<Option<T>>,
    inflight: FlightMap<T>,
    published: bool,
}

impl<T: Clone> FlightLease<T> {
    /// Publish the build result to all waiters and retire the flight
    pub fn publish(mut self, value: T) {
        self.published = true;
        let _ = self.sender.send(Some(value));
        self.inflight.lock().remove(&self.fingerprint);
    }
}

impl<T: Clone> Drop for FlightLease<T> {
    fn drop(&mut self) {
        if !self.published {
            self.inflight.lock().remove(&self.fingerprint);
            // Sender drops with self; waiters observe the closed channel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dream_common::types::{DreamStyle, GenerateOptions};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::compute(text, DreamStyle::Ethereal, &GenerateOptions::default())
    }

    #[tokio::test]
    async fn leader_builds_and_waiters_share_the_result() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let builds = Arc::new(AtomicU32::new(0));
        let fingerprint = fp("shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let builds = Arc::clone(&builds);
            let fingerprint = fingerprint.clone();
            handles.push(tokio::spawn(async move {
                match flight.join(&fingerprint).await {
                    Flight::Leader(lease) => {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        lease.publish("built".to_string());
                        "built".to_string()
                    }
                    Flight::Completed(value) => value,
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "built");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_fingerprints_fly_independently() {
        let flight = SingleFlight::<u32>::new();
        let a = flight.join(&fp("one")).await;
        let b = flight.join(&fp("two")).await;
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
        assert_eq!(flight.in_flight(), 2);
    }

    #[tokio::test]
    async fn dropped_lease_hands_off_to_a_waiter() {
        let flight = Arc::new(SingleFlight::<String>::new());
        let fingerprint = fp("handoff");

        let lease = match flight.join(&fingerprint).await {
            Flight::Leader(lease) => lease,
            _ => panic!("expected leadership"),
        };

        let waiter = {
            let flight = Arc::clone(&flight);
            let fingerprint = fingerprint.clone();
            tokio::spawn(async move {
                match flight.join(&fingerprint).await {
                    Flight::Leader(lease) => {
                        lease.publish("second leader".to_string());
                        "became leader".to_string()
                    }
                    Flight::Completed(value) => value,
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(lease);

        assert_eq!(waiter.await.unwrap(), "became leader");
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_flights_for_one_fingerprint_are_fresh() {
        let flight = SingleFlight::<u32>::new();
        let fingerprint = fp("fresh");

        match flight.join(&fingerprint).await {
            Flight::Leader(lease) => lease.publish(1),
            _ => panic!("expected leadership"),
        }
        // The retired flight does not serve stale values
        match flight.join(&fingerprint).await {
            Flight::Leader(lease) => lease.publish(2),
            Flight::Completed(_) => panic!("expected fresh leadership"),
        }
    }
}
