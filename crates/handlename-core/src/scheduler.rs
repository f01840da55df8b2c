//! When to run a reconciliation pass.
//!
//! A pure state machine over [`Instant`]s. The host reports triggers with
//! [`TriggerScheduler::note`], sleeps until [`TriggerScheduler::next_deadline`]
//! and asks [`TriggerScheduler::take_due`] whether to run its single
//! idempotent callback. Several due deadlines collapse into one run.

use tokio::time::{Duration, Instant};

use crate::config::SchedulerConfig;

/// Something that may have changed the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// DOM nodes were added or changed. Debounced.
    Mutation,
    /// The page scrolled. Throttled.
    Scroll,
    /// Content entered the viewport. Runs on the next check.
    Viewport,
    /// Fallback timer tick. Runs on the next check.
    Periodic,
}

#[derive(Debug, Clone)]
pub struct TriggerScheduler {
    mutation_debounce: Duration,
    scroll_throttle: Duration,
    fallback_interval: Duration,

    mutation_due: Option<Instant>,
    scroll_due: Option<Instant>,
    immediate_due: Option<Instant>,
    periodic_due: Instant,
}

impl TriggerScheduler {
    #[must_use]
    pub fn new(config: &SchedulerConfig, now: Instant) -> Self {
        let fallback_interval = Duration::from_millis(config.fallback_interval_ms.max(1));
        Self {
            mutation_debounce: Duration::from_millis(config.mutation_debounce_ms),
            scroll_throttle: Duration::from_millis(config.scroll_throttle_ms),
            fallback_interval,
            mutation_due: None,
            scroll_due: None,
            immediate_due: None,
            periodic_due: now + fallback_interval,
        }
    }

    /// Record a trigger observed at `now`.
    pub fn note(&mut self, trigger: Trigger, now: Instant) {
        match trigger {
            Trigger::Mutation => self.mutation_due = Some(now + self.mutation_debounce),
            Trigger::Scroll => {
                // One pass per throttle window; later scrolls ride along.
                if self.scroll_due.is_none() {
                    self.scroll_due = Some(now + self.scroll_throttle);
                }
            }
            Trigger::Viewport | Trigger::Periodic => {
                if self.immediate_due.is_none() {
                    self.immediate_due = Some(now);
                }
            }
        }
    }

    /// Earliest pending deadline. The fallback timer means there always is one.
    #[must_use]
    pub fn next_deadline(&self) -> Instant {
        [self.mutation_due, self.scroll_due, self.immediate_due]
            .into_iter()
            .flatten()
            .fold(self.periodic_due, Instant::min)
    }

    /// Consume every deadline at or before `now`. Returns whether a pass
    /// should run.
    pub fn take_due(&mut self, now: Instant) -> bool {
        let mut due = false;
        for slot in [
            &mut self.mutation_due,
            &mut self.scroll_due,
            &mut self.immediate_due,
        ] {
            if slot.is_some_and(|at| at <= now) {
                *slot = None;
                due = true;
            }
        }
        if self.periodic_due <= now {
            while self.periodic_due <= now {
                self.periodic_due += self.fallback_interval;
            }
            due = true;
        }
        due
    }
}
