use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::debug;

use crate::monitor::{DisplayState, Monitor, PollError};
use crate::rpc::{CancelToken, Endpoint};
use crate::schedule::{PollSchedule, Ticket};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PollReport {
    pub state: DisplayState,
    pub endpoint: Option<Endpoint>,
    pub error: Option<String>,
    pub finished_at: DateTime<Local>,
    pub consecutive_failures: u32,
    pub next_delay: Duration,
}

struct CycleOutcome {
    result: Result<DisplayState, PollError>,
    endpoint: Option<Endpoint>,
}

struct InFlight {
    ticket: Ticket,
    outcome: Receiver<CycleOutcome>,
}

pub struct Driver {
    monitor: Arc<Mutex<Monitor>>,
    schedule: PollSchedule,
    in_flight: Option<InFlight>,
    pending_invalidate: bool,
    cancel: CancelToken,
}

impl Driver {
    pub fn new(monitor: Monitor, interval: Duration, cancel: CancelToken) -> Self {
        Self {
            monitor: Arc::new(Mutex::new(monitor)),
            schedule: PollSchedule::new(interval, Instant::now()),
            in_flight: None,
            pending_invalidate: false,
            cancel,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn time_until_next(&self, now: Instant) -> Duration {
        self.schedule.time_until_due(now)
    }

    pub fn tick(&mut self, now: Instant) -> Option<PollReport> {
        let report = self.collect(now);
        if !self.cancel.is_cancelled()
            && let Some(ticket) = self.schedule.begin(now)
        {
            self.start(ticket);
        }
        report
    }

    pub fn refresh(&mut self, now: Instant) {
        self.schedule.refresh(now);
        if self.in_flight.is_some() {
            self.pending_invalidate = true;
        } else {
            lock(&self.monitor).invalidate();
        }
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(in_flight) = self.in_flight.take() {
            match in_flight.outcome.recv_timeout(SHUTDOWN_GRACE) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => debug!("poll cycle still running at shutdown"),
            }
        }
    }

    fn start(&mut self, ticket: Ticket) {
        let (tx, rx) = mpsc::channel();
        let monitor = Arc::clone(&self.monitor);
        let cancel = self.cancel.clone();
        thread::spawn(move || {
            let mut monitor = lock(&monitor);
            let result = monitor.poll(&cancel);
            let endpoint = monitor.endpoint().cloned();
            drop(monitor);
            let _ = tx.send(CycleOutcome { result, endpoint });
        });
        self.in_flight = Some(InFlight {
            ticket,
            outcome: rx,
        });
    }

    fn collect(&mut self, now: Instant) -> Option<PollReport> {
        let in_flight = self.in_flight.take()?;
        let outcome = match in_flight.outcome.try_recv() {
            Ok(outcome) => Ok(outcome),
            Err(TryRecvError::Empty) => {
                self.in_flight = Some(in_flight);
                return None;
            }
            Err(TryRecvError::Disconnected) => Err("poll worker stopped unexpectedly".to_string()),
        };

        if self.pending_invalidate {
            self.pending_invalidate = false;
            lock(&self.monitor).invalidate();
        }

        let (state, endpoint, error) = match outcome {
            Ok(CycleOutcome {
                result: Ok(state),
                endpoint,
            }) => (state, endpoint, None),
            Ok(CycleOutcome {
                result: Err(err),
                endpoint,
            }) => (DisplayState::Disconnected, endpoint, Some(err.to_string())),
            Err(message) => (DisplayState::Disconnected, None, Some(message)),
        };

        if !self.schedule.finish(in_flight.ticket, error.is_none(), now) {
            debug!("poll cycle superseded; result discarded");
            return None;
        }

        Some(PollReport {
            state,
            endpoint,
            error,
            finished_at: Local::now(),
            consecutive_failures: self.schedule.backoff().consecutive_failures(),
            next_delay: self.schedule.time_until_due(now),
        })
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock(monitor: &Mutex<Monitor>) -> MutexGuard<'_, Monitor> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}
