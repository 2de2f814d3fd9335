use std::sync::mpsc::TryRecvError;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use log::{debug, error, info};

use crate::control::{RestartReceiver, StopToken};
use crate::core::GenericResult;
use crate::report::Outcome;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScheduleState {
    Idle,
    Waiting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timing {
    pub start_time: NaiveTime,
    pub interval: TimeDelta,
}

impl Timing {
    /// The configured time of day today, or tomorrow if it has already passed.
    pub fn first_run(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.start_time);
        if today < now {
            today + TimeDelta::days(1)
        } else {
            today
        }
    }
}

/// One unit of scheduled work: cleanup followed by backup.
pub trait Cycle {
    /// Reads up to date schedule settings.
    fn timing(&mut self) -> GenericResult<Timing>;
    fn run(&mut self, stop: &StopToken) -> Outcome;
}

pub struct Scheduler<C: Cycle> {
    cycle: C,
    state: ScheduleState,
    stop: StopToken,
    restart: RestartReceiver,
    tick: Duration,
    clock: Box<dyn Fn() -> NaiveDateTime>,

    next_run: Option<NaiveDateTime>,
    last_outcome: Option<Outcome>,
}

impl<C: Cycle> Scheduler<C> {
    pub fn new(cycle: C, stop: StopToken, restart: RestartReceiver, tick: Duration) -> Scheduler<C> {
        Scheduler {
            cycle, stop, restart, tick,
            state: ScheduleState::Idle,
            clock: Box::new(|| Local::now().naive_local()),
            next_run: None,
            last_outcome: None,
        }
    }

    #[cfg(test)]
    pub fn with_clock<F: Fn() -> NaiveDateTime + 'static>(mut self, clock: F) -> Scheduler<C> {
        self.clock = Box::new(clock);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> ScheduleState {
        self.state
    }

    #[cfg(test)]
    pub fn next_run(&self) -> Option<NaiveDateTime> {
        self.next_run
    }

    #[cfg(test)]
    pub fn last_outcome(&self) -> Option<Outcome> {
        self.last_outcome
    }

    /// Runs until stopped. Returns outcome of the last cycle.
    pub fn run(mut self) -> Option<Outcome> {
        while self.step() != ScheduleState::Stopped {
            self.stop.sleep(self.tick);
        }
        self.last_outcome
    }

    /// Performs one poll tick.
    pub fn step(&mut self) -> ScheduleState {
        if self.stop.is_stopped() {
            if self.state != ScheduleState::Stopped {
                info!("The scheduler has stopped.");
            }
            self.state = ScheduleState::Stopped;
            return self.state;
        }

        match self.state {
            ScheduleState::Idle => {
                self.schedule_first_run();
                self.state = ScheduleState::Waiting;
            },

            ScheduleState::Waiting => {
                if self.restart_requested() {
                    info!("Configuration has changed. Rescheduling...");
                    self.schedule_first_run();
                } else if self.next_run.is_some_and(|next_run| (self.clock)() >= next_run) {
                    self.run_cycle();
                }
            },

            ScheduleState::Running | ScheduleState::Stopping => {
                self.state = ScheduleState::Stopped;
            },

            ScheduleState::Stopped => {},
        }

        self.state
    }

    fn run_cycle(&mut self) {
        self.state = ScheduleState::Running;
        info!("Starting scheduled cycle...");

        let outcome = self.cycle.run(&self.stop);
        self.last_outcome.replace(outcome);

        if outcome == Outcome::Stopped || self.stop.is_stopped() {
            info!("The cycle has been interrupted.");
            self.state = ScheduleState::Stopping;
            return;
        }

        // The cycle has read fresh configuration, so pending restarts are already satisfied
        self.restart_requested();

        self.next_run = match self.cycle.timing() {
            Ok(timing) => Some((self.clock)() + timing.interval),
            Err(err) => {
                error!("Unable to schedule the next run: {}.", err);
                None
            },
        };
        self.log_next_run();

        self.state = ScheduleState::Waiting;
    }

    fn schedule_first_run(&mut self) {
        self.next_run = match self.cycle.timing() {
            Ok(timing) => Some(timing.first_run((self.clock)())),
            Err(err) => {
                error!("Unable to schedule the next run: {}. Waiting for configuration change.", err);
                None
            },
        };
        self.log_next_run();
    }

    fn log_next_run(&self) {
        if let Some(next_run) = self.next_run {
            info!("Next run is scheduled at {}.", next_run.format("%Y-%m-%d %H:%M"));
        }
    }

    fn restart_requested(&mut self) -> bool {
        let mut requested = false;

        loop {
            match self.restart.try_recv() {
                Ok(()) => requested = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Restart channel has been closed.");
                    break;
                },
            }
        }

        requested
    }
}
