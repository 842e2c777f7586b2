use std::time::{Duration, Instant};

pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base: base.max(Duration::from_secs(1)),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next cycle: `base * 2^(failures - 1)`, capped at 60s but never below base.
    pub fn delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return self.base;
        }
        let cap = MAX_BACKOFF.max(self.base);
        let factor = 1u32 << (self.consecutive_failures - 1).min(16);
        self.base.saturating_mul(factor).min(cap)
    }

    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.delay()
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Ticket {
    epoch: u64,
}

#[derive(Debug, Clone)]
pub struct PollSchedule {
    epoch: u64,
    in_flight: bool,
    next_due: Instant,
    backoff: Backoff,
}

impl PollSchedule {
    pub fn new(base: Duration, now: Instant) -> Self {
        Self {
            epoch: 0,
            in_flight: false,
            next_due: now,
            backoff: Backoff::new(base),
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.in_flight && now >= self.next_due
    }

    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.next_due.saturating_duration_since(now)
    }

    pub fn begin(&mut self, now: Instant) -> Option<Ticket> {
        if !self.is_due(now) {
            return None;
        }
        self.in_flight = true;
        Some(Ticket { epoch: self.epoch })
    }

    pub fn finish(&mut self, ticket: Ticket, success: bool, now: Instant) -> bool {
        self.in_flight = false;
        if ticket.epoch != self.epoch {
            return false;
        }
        if success {
            self.backoff.reset();
        } else {
            self.backoff.record_failure();
        }
        self.next_due = now + self.backoff.delay();
        true
    }

    pub fn refresh(&mut self, now: Instant) {
        self.epoch += 1;
        self.backoff.reset();
        self.next_due = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);

    #[test]
    fn backoff_doubles_then_caps_at_a_minute() {
        let mut backoff = Backoff::new(BASE);
        assert_eq!(backoff.delay(), BASE);
        let delays: Vec<u64> = (0..6).map(|_| backoff.record_failure().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.delay(), BASE);
    }

    #[test]
    fn backoff_cap_never_drops_below_base() {
        let mut backoff = Backoff::new(Duration::from_secs(90));
        assert_eq!(backoff.record_failure(), Duration::from_secs(90));
        assert_eq!(backoff.record_failure(), Duration::from_secs(90));
    }

    #[test]
    fn base_is_floored_at_one_second() {
        assert_eq!(Backoff::new(Duration::ZERO).base, Duration::from_secs(1));
    }

    #[test]
    fn only_one_cycle_in_flight() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new(BASE, now);
        let ticket = schedule.begin(now).expect("first cycle");
        assert!(schedule.begin(now).is_none());
        assert!(schedule.finish(ticket, true, now));
        assert!(schedule.begin(now).is_none());
        assert!(schedule.begin(now + BASE).is_some());
    }

    #[test]
    fn failures_push_the_next_cycle_out() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new(BASE, now);
        let ticket = schedule.begin(now).expect("cycle");
        schedule.finish(ticket, false, now);
        let ticket = schedule.begin(now + BASE).expect("retry");
        schedule.finish(ticket, false, now + BASE);
        assert_eq!(schedule.time_until_due(now + BASE), Duration::from_secs(10));
        assert_eq!(schedule.backoff().consecutive_failures(), 2);
    }

    #[test]
    fn superseded_cycle_does_not_rearm() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new(BASE, now);
        let ticket = schedule.begin(now).expect("cycle");
        schedule.refresh(now);
        assert!(!schedule.finish(ticket, false, now));
        assert!(!schedule.in_flight);
        assert_eq!(schedule.backoff().consecutive_failures(), 0);
        assert!(schedule.is_due(now));
    }

    #[test]
    fn refresh_clears_backoff() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new(BASE, now);
        for _ in 0..3 {
            let ticket = schedule.begin(now + Duration::from_secs(600)).expect("cycle");
            schedule.finish(ticket, false, now);
        }
        assert!(!schedule.is_due(now));
        schedule.refresh(now);
        assert!(schedule.is_due(now));
        assert_eq!(schedule.backoff().delay(), BASE);
    }
}
