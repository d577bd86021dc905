//! Single-threaded millisecond scheduler.
//!
//! An ordered map from deadline to event, polled from the same loop that
//! polls the reactor. One-shot events fire once; recurring events re-arm at
//! `previous_deadline + period` while their predicate keeps returning
//! `true`, so a slow poll cadence does not drift the schedule.
//!
//! Deadlines come from a monotonic clock anchored at construction; wall
//! clock changes do not affect pending events.

use std::{collections::BTreeMap, time::Instant};

enum Event {
    Once(Box<dyn FnOnce()>),
    Recurring {
        period: u64,
        tick: Box<dyn FnMut() -> bool>,
    },
}

pub struct Scheduler {
    start: Instant,
    seq: u64,
    events: BTreeMap<(u64, u64), Event>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            seq: 0,
            events: BTreeMap::new(),
        }
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn insert(&mut self, at: u64, ev: Event) {
        // the sequence number keeps same-deadline events distinct and in
        // insertion order
        self.seq += 1;
        self.events.insert((at, self.seq), ev);
    }

    /// Runs `f` once, `delay_ms` from now.
    pub fn timeout(&mut self, delay_ms: u64, f: impl FnOnce() + 'static) {
        let at = self.now() + delay_ms;
        self.insert(at, Event::Once(Box::new(f)));
    }

    /// Runs `tick` every `period_ms`, first after `delay_ms`, until it
    /// returns `false`.
    pub fn interval(&mut self, delay_ms: u64, period_ms: u64, tick: impl FnMut() -> bool + 'static) {
        let at = self.now() + delay_ms;
        self.insert(
            at,
            Event::Recurring {
                period: period_ms,
                tick: Box::new(tick),
            },
        );
    }

    /// Fires every event whose deadline has passed.
    pub fn poll(&mut self) {
        self.poll_at(self.now());
    }

    fn poll_at(&mut self, now: u64) {
        while let Some((&(deadline, _), _)) = self.events.iter().next() {
            if deadline > now {
                break;
            }
            let ((deadline, _), ev) = self.events.pop_first().unwrap();
            match ev {
                Event::Once(f) => f(),
                Event::Recurring { period, mut tick } => {
                    if tick() {
                        self.insert(
                            deadline + period,
                            Event::Recurring { period, tick },
                        );
                    }
                }
            }
        }
    }

    /// Number of scheduled events still pending.
    pub fn pending(&self) -> usize {
        self.events.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
