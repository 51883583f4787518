use std::time::Instant;

/// The three timer slots a connection can hold.
///
/// The reactor owns the clock: it reads `next_deadline` and calls back into
/// the connection at or after it. Expiry order favors the write timeout,
/// which indicates a dead peer regardless of what else is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Write,
    Graceful,
    Idle,
}

#[derive(Debug, Default)]
pub struct Timers {
    write: Option<Instant>,
    graceful: Option<Instant>,
    idle: Option<Instant>,
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    pub fn set(&mut self, timer: Timer, at: Instant) {
        *self.slot(timer) = Some(at);
    }

    pub fn cancel(&mut self, timer: Timer) {
        *self.slot(timer) = None;
    }

    pub fn is_set(&self, timer: Timer) -> bool {
        match timer {
            Timer::Write => self.write.is_some(),
            Timer::Graceful => self.graceful.is_some(),
            Timer::Idle => self.idle.is_some(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.write, self.graceful, self.idle]
            .iter()
            .filter_map(|t| *t)
            .min()
    }

    /// Pop one expired timer, clearing its slot.
    pub fn take_expired(&mut self, now: Instant) -> Option<Timer> {
        for timer in [Timer::Write, Timer::Graceful, Timer::Idle].iter() {
            let slot = self.slot(*timer);
            if slot.map_or(false, |at| at <= now) {
                *slot = None;
                return Some(*timer);
            }
        }
        None
    }

    fn slot(&mut self, timer: Timer) -> &mut Option<Instant> {
        match timer {
            Timer::Write => &mut self.write,
            Timer::Graceful => &mut self.graceful,
            Timer::Idle => &mut self.idle,
        }
    }
}
