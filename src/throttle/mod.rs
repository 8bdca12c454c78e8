//! Admission Control
//!
//! A bounded-concurrency FIFO with explicit over-queue shedding. Requests
//! enter before any real work happens; at most `concurrency` run at once,
//! at most `queue_tolerance` wait, and anything beyond that is shed with a
//! `Throttled` error carrying the queue state for audit logging.
//!
//! A background reaper compensates for handlers that commit a response but
//! never signal completion: any slot marked responded and still held at
//! reap time is released on the handler's behalf.

use crate::config::ThrottleConfig;
use crate::error::MuskieError;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// One in-flight request's slot
#[derive(Debug)]
struct Slot {
    admitted_at: Instant,
    /// Set once the response has been committed to the network
    responded: bool,
}

#[derive(Debug, Default)]
struct State {
    in_flight: HashMap<String, Slot>,
    queue: VecDeque<(String, oneshot::Sender<()>)>,
}

/// Bounded-concurrency admission controller
#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    state: Mutex<State>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
        })
    }

    /// Whether admission control is active
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Admit a request, suspending while the queue drains. Fails fast with
    /// `Throttled` once the wait queue is at tolerance.
    pub async fn enter(self: &Arc<Self>, req_id: &str) -> Result<Permit, MuskieError> {
        if !self.config.enabled {
            return Ok(Permit {
                throttle: Arc::clone(self),
                req_id: req_id.to_string(),
                active: false,
            });
        }

        let rx = {
            let mut state = self.state.lock();
            if state.in_flight.len() < self.config.concurrency {
                state.in_flight.insert(
                    req_id.to_string(),
                    Slot {
                        admitted_at: Instant::now(),
                        responded: false,
                    },
                );
                None
            } else if state.queue.len() >= self.config.queue_tolerance {
                return Err(MuskieError::Throttled {
                    queued: state.queue.len(),
                    in_flight: state.in_flight.len(),
                    concurrency: self.config.concurrency,
                });
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back((req_id.to_string(), tx));
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            // The waker moves this request into the in-flight set before
            // signalling, so a successful recv means the slot is ours.
            rx.await.map_err(|_| MuskieError::ServiceUnavailable("throttle shut down".into()))?;
        }

        Ok(Permit {
            throttle: Arc::clone(self),
            req_id: req_id.to_string(),
            active: true,
        })
    }

    /// Release a slot. Safe to call for requests that were never admitted
    /// or have already been released.
    pub fn leave(&self, req_id: &str) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock();
        if state.in_flight.remove(req_id).is_none() {
            return;
        }
        Self::wake_next(&mut state);
    }

    /// Record that the response for `req_id` has been committed. The reaper
    /// releases any slot still held after this point.
    pub fn mark_responded(&self, req_id: &str) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock();
        if let Some(slot) = state.in_flight.get_mut(req_id) {
            slot.responded = true;
        }
    }

    /// Move the next live waiter into the in-flight set, skipping waiters
    /// that gave up while queued.
    fn wake_next(state: &mut State) {
        while let Some((req_id, tx)) = state.queue.pop_front() {
            state.in_flight.insert(
                req_id.clone(),
                Slot {
                    admitted_at: Instant::now(),
                    responded: false,
                },
            );
            if tx.send(()).is_ok() {
                return;
            }
            // Waiter abandoned the queue; reclaim the slot and try the next.
            state.in_flight.remove(&req_id);
        }
    }

    /// One reaper sweep: release responded-but-never-left slots.
    pub fn reap(&self) {
        if !self.config.enabled {
            return;
        }
        let stale: Vec<(String, Instant)> = {
            let state = self.state.lock();
            state
                .in_flight
                .iter()
                .filter(|(_, slot)| slot.responded)
                .map(|(id, slot)| (id.clone(), slot.admitted_at))
                .collect()
        };
        for (req_id, admitted_at) in stale {
            tracing::warn!(
                req_id = %req_id,
                held_ms = admitted_at.elapsed().as_millis() as u64,
                "reaped admission slot that was never released"
            );
            metrics::THROTTLE_REAPED.inc();
            self.leave(&req_id);
        }
    }

    /// Spawn the periodic reaper
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let throttle = Arc::clone(self);
        let period = self.config.reap_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                throttle.reap();
            }
        })
    }

    /// Current (queued, in_flight) counts
    pub fn depth(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.queue.len(), state.in_flight.len())
    }
}

/// An admitted request's slot. Dropping the permit releases the slot, so a
/// handler that errors out on an early return still frees its place.
#[derive(Debug)]
pub struct Permit {
    throttle: Arc<Throttle>,
    req_id: String,
    active: bool,
}

impl Permit {
    pub fn req_id(&self) -> &str {
        &self.req_id
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.active {
            self.throttle.leave(&self.req_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(concurrency: usize, queue_tolerance: usize) -> ThrottleConfig {
        ThrottleConfig {
            enabled: true,
            concurrency,
            queue_tolerance,
            reap_interval_ms: 5_000,
        }
    }

    #[tokio::test]
    async fn test_disabled_admits_everything() {
        let throttle = Throttle::new(ThrottleConfig {
            enabled: false,
            concurrency: 1,
            queue_tolerance: 0,
            reap_interval_ms: 5_000,
        });
        for i in 0..100 {
            let permit = throttle.enter(&format!("req-{i}")).await.unwrap();
            // keep them all alive; no shedding should occur
            std::mem::forget(permit);
        }
    }

    #[tokio::test]
    async fn test_sheds_over_tolerance() {
        let throttle = Throttle::new(config(1, 1));

        let _first = throttle.enter("first").await.unwrap();

        let t2 = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.enter("second").await })
        };
        // let the second request reach the queue
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(throttle.depth(), (1, 1));

        let third = throttle.enter("third").await;
        match third {
            Err(MuskieError::Throttled {
                queued,
                in_flight,
                concurrency,
            }) => {
                assert_eq!(queued, 1);
                assert_eq!(in_flight, 1);
                assert_eq!(concurrency, 1);
            }
            other => panic!("expected Throttled, got {other:?}"),
        }

        drop(_first);
        let permit = t2.await.unwrap().unwrap();
        assert_eq!(permit.req_id(), "second");
    }

    #[tokio::test]
    async fn test_fifo_wakeup_order() {
        let throttle = Throttle::new(config(1, 3));
        let first = throttle.enter("first").await.unwrap();

        let mut waiters = Vec::new();
        for name in ["a", "b", "c"] {
            let throttle = Arc::clone(&throttle);
            let name = name.to_string();
            waiters.push(tokio::spawn(async move {
                let permit = throttle.enter(&name).await.unwrap();
                let admitted = std::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
                (name, admitted)
            }));
            // force deterministic queue order
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        let mut order = Vec::new();
        for waiter in waiters {
            order.push(waiter.await.unwrap());
        }
        order.sort_by_key(|(_, at)| *at);
        let names: Vec<_> = order.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let throttle = Throttle::new(config(2, 2));
        let permit = throttle.enter("req").await.unwrap();
        throttle.leave("req");
        throttle.leave("req");
        throttle.leave("never-admitted");
        drop(permit); // third release of "req"
        assert_eq!(throttle.depth(), (0, 0));
    }

    #[tokio::test]
    async fn test_reaper_releases_responded_slot() {
        let throttle = Throttle::new(config(1, 1));
        let permit = throttle.enter("stuck").await.unwrap();
        throttle.mark_responded("stuck");
        // simulate a handler that never calls leave
        std::mem::forget(permit);

        let waiter = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.enter("next").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        throttle.reap();
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(permit.req_id(), "next");
    }

    #[tokio::test]
    async fn test_reaper_skips_unresponded_slots() {
        let throttle = Throttle::new(config(1, 1));
        let _permit = throttle.enter("active").await.unwrap();
        throttle.reap();
        assert_eq!(throttle.depth(), (0, 1));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let throttle = Throttle::new(config(1, 2));
        let first = throttle.enter("first").await.unwrap();

        let abandoned = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.enter("gone").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        let survivor = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.enter("kept").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        let permit = survivor.await.unwrap().unwrap();
        assert_eq!(permit.req_id(), "kept");
    }
}
