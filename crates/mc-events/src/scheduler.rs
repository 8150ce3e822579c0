// scheduler.rs — Polling fallback for conditions without discrete events.
//
// Some conditions (altitude above a threshold, resource quantity) change
// continuously and never raise an event. Instead of every node keeping its
// own "last checked" timestamps, nodes register a poll interval here once.
//
// Each registration has an optional wall-clock period and an optional
// simulated-time period. A registration is due when *either* elapses; once
// reported due, both clocks restart from the current instant.
//
// Two min-heaps (one per clock) hold (due_at, generation, key). Re-arming
// bumps the generation, and stale heap entries are skipped when popped
// instead of being searched for and removed.
//
// One-shot deadlines on simulated time (used by wait timers) live in a
// third heap.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};

use crate::error::EventError;
use crate::event::SimTime;

/// How often a subscriber wants to be re-checked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollInterval {
    pub wall: Option<Duration>,
    /// Simulated seconds.
    pub sim: Option<f64>,
}

impl PollInterval {
    pub fn new(wall: Option<Duration>, sim: Option<f64>) -> Self {
        Self { wall, sim }
    }

    /// Build from configuration units (wall milliseconds, simulated
    /// seconds), rejecting periods that cannot be scheduled.
    pub fn from_units(wall_ms: Option<u64>, sim_secs: Option<f64>) -> Result<Self, EventError> {
        let wall = match wall_ms {
            Some(ms) => Some(
                i64::try_from(ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .ok_or_else(|| EventError::InvalidPeriod(format!("wall period of {} ms is out of range", ms)))?,
            ),
            None => None,
        };
        let interval = Self::new(wall, sim_secs);
        interval.check()?;
        Ok(interval)
    }

    /// Both periods, when set, must be positive and finite.
    pub fn check(&self) -> Result<(), EventError> {
        if let Some(wall) = self.wall {
            if wall <= Duration::zero() {
                return Err(EventError::InvalidPeriod(format!(
                    "wall period must be positive, got {} ms",
                    wall.num_milliseconds()
                )));
            }
        }
        if let Some(sim) = self.sim {
            if !sim.is_finite() || sim <= 0.0 {
                return Err(EventError::InvalidPeriod(format!(
                    "simulated period must be a positive number of seconds, got {}",
                    sim
                )));
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.wall.is_none() && self.sim.is_none()
    }
}

#[derive(Debug, Clone)]
struct Registration {
    interval: PollInterval,
    generation: u64,
}

/// Priority-queue scheduler over wall-clock and simulated time.
#[derive(Debug)]
pub struct PollScheduler<K> {
    registrations: BTreeMap<K, Registration>,
    wall_queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, K)>>,
    sim_queue: BinaryHeap<Reverse<(SimTime, u64, K)>>,
    deadlines: BTreeMap<K, SimTime>,
    deadline_queue: BinaryHeap<Reverse<(SimTime, K)>>,
}

impl<K: Ord + Clone + Debug> PollScheduler<K> {
    pub fn new() -> Self {
        Self {
            registrations: BTreeMap::new(),
            wall_queue: BinaryHeap::new(),
            sim_queue: BinaryHeap::new(),
            deadlines: BTreeMap::new(),
            deadline_queue: BinaryHeap::new(),
        }
    }

    /// Register (or re-register) a recurring poll.
    pub fn register(
        &mut self,
        key: K,
        interval: PollInterval,
        wall_now: DateTime<Utc>,
        sim_now: SimTime,
    ) -> Result<(), EventError> {
        if interval.is_empty() {
            return Err(EventError::EmptyInterval {
                subscriber: format!("{:?}", key),
            });
        }
        interval.check()?;
        if let Some(period) = interval.wall {
            if wall_now.checked_add_signed(period).is_none() {
                return Err(EventError::InvalidPeriod(format!(
                    "wall period of {} ms for {:?} overflows the clock",
                    period.num_milliseconds(),
                    key
                )));
            }
        }
        let generation = self
            .registrations
            .get(&key)
            .map(|r| r.generation + 1)
            .unwrap_or(0);
        self.registrations.insert(
            key.clone(),
            Registration {
                interval,
                generation,
            },
        );
        self.arm(&key, wall_now, sim_now);
        Ok(())
    }

    /// Stop polling `key` and drop any pending deadline for it.
    pub fn unregister(&mut self, key: &K) {
        self.registrations.remove(key);
        self.deadlines.remove(key);
    }

    pub fn is_registered(&self, key: &K) -> bool {
        self.registrations.contains_key(key)
    }

    /// Number of recurring registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.deadlines.is_empty()
    }

    /// Schedule a one-shot wake-up at simulated time `at`.
    ///
    /// Replaces any earlier deadline for the same key.
    pub fn schedule_deadline(&mut self, key: K, at: SimTime) {
        if self.deadlines.get(&key) == Some(&at) {
            return;
        }
        self.deadlines.insert(key.clone(), at);
        self.deadline_queue.push(Reverse((at, key)));
    }

    pub fn cancel_deadline(&mut self, key: &K) {
        self.deadlines.remove(key);
    }

    pub fn deadline(&self, key: &K) -> Option<SimTime> {
        self.deadlines.get(key).copied()
    }

    /// Pop everything due at (`wall_now`, `sim_now`), re-arming recurring
    /// registrations. Each key is reported at most once.
    pub fn due(&mut self, wall_now: DateTime<Utc>, sim_now: SimTime) -> Vec<K> {
        let mut due = BTreeSet::new();

        while let Some(Reverse((at, generation, key))) = self.wall_queue.peek().cloned() {
            if at > wall_now {
                break;
            }
            self.wall_queue.pop();
            if self.is_current(&key, generation) {
                due.insert(key);
            }
        }

        while let Some(Reverse((at, generation, key))) = self.sim_queue.peek().cloned() {
            if at > sim_now {
                break;
            }
            self.sim_queue.pop();
            if self.is_current(&key, generation) {
                due.insert(key);
            }
        }

        while let Some(Reverse((at, key))) = self.deadline_queue.peek().cloned() {
            if at > sim_now {
                break;
            }
            self.deadline_queue.pop();
            if self.deadlines.get(&key) == Some(&at) {
                self.deadlines.remove(&key);
                due.insert(key);
            }
        }

        for key in &due {
            if let Some(registration) = self.registrations.get_mut(key) {
                registration.generation += 1;
                self.arm(key, wall_now, sim_now);
            }
        }

        due.into_iter().collect()
    }

    fn is_current(&self, key: &K, generation: u64) -> bool {
        self.registrations
            .get(key)
            .is_some_and(|r| r.generation == generation)
    }

    fn arm(&mut self, key: &K, wall_now: DateTime<Utc>, sim_now: SimTime) {
        let Some(registration) = self.registrations.get(key) else {
            return;
        };
        let generation = registration.generation;
        if let Some(period) = registration.interval.wall {
            match wall_now.checked_add_signed(period) {
                Some(at) => self.wall_queue.push(Reverse((at, generation, key.clone()))),
                None => tracing::warn!(subscriber = ?key, "wall poll overflows the clock; not re-armed"),
            }
        }
        if let Some(period) = registration.interval.sim {
            self.sim_queue
                .push(Reverse((sim_now + period, generation, key.clone())));
        }
    }
}

impl<K: Ord + Clone + Debug> Default for PollScheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}
