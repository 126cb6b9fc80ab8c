use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    datapoint::{Datapoint, now_micros},
    store::DatapointStore,
};

pub mod backend;
pub mod probe;

pub use backend::{ReactorBackend, ThreadBackend, TimerBackend};
pub use probe::{TimerProbe, default_probes, select_backend};

pub const DEFAULT_PREFIX: &str = "timer";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimerError {
    #[error("invalid timer {0}")]
    InvalidTimer(usize),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("failed to start timer: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimerBackendKind {
    /// Probe the reactor at startup and fall back to threads on anomalies
    #[default]
    Auto,
    Reactor,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Forever,
    /// total number of expiries
    Count(u32),
}

impl Repeat {
    /// Negative counts repeat forever, zero is rejected
    pub fn from_count(n: i64) -> Result<Self, TimerError> {
        match n {
            n if n < 0 => Ok(Self::Forever),
            0 => Err(TimerError::InvalidArgument(
                "repeat count must not be zero".to_string(),
            )),
            n => Ok(Self::Count(u32::try_from(n).unwrap_or(u32::MAX))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start_ms: i64,
    /// 0 for one-shot
    pub interval_ms: u64,
    pub repeat: Repeat,
}

/// Called with the timer id after every expiry has been published
pub type ExpiryHook = Box<dyn Fn(usize) + Send + Sync>;

struct TimerShared {
    store: Arc<DatapointStore>,
    backend: Arc<dyn TimerBackend>,
    prefix: RwLock<String>,
    on_expire: ExpiryHook,
}

#[derive(Default)]
struct TimerState {
    schedule: Option<Schedule>,
    armed: bool,
    fired: u64,
    /// bumped on every cancel so ticks from an old schedule are ignored
    generation: u64,
    running: Option<Box<dyn backend::ScheduledTick>>,
}

impl TimerState {
    fn cancel(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.cancel();
        }
        self.generation += 1;
    }
}

pub struct Timer {
    id: usize,
    state: Mutex<TimerState>,
    shared: Arc<TimerShared>,
}

impl Timer {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Replaces any previous schedule and marks the timer armed
    pub fn arm(&self, schedule: Schedule) {
        let mut st = self.lock();
        st.cancel();
        st.schedule = Some(schedule);
        st.armed = true;
        st.fired = 0;
    }

    /// Starts the armed schedule. A start delay of zero or less expires
    /// right away on the calling thread.
    pub fn fire(self: &Arc<Self>) -> Result<(), TimerError> {
        let (schedule, generation) = {
            let st = self.lock();
            match (st.armed, st.schedule) {
                (true, Some(schedule)) => (schedule, st.generation),
                _ => return Ok(()),
            }
        };

        let interval = (schedule.interval_ms > 0).then(|| Duration::from_millis(schedule.interval_ms));
        let delay = if schedule.start_ms <= 0 {
            if !self.expire(generation) {
                return Ok(());
            }
            match interval {
                Some(interval) => interval,
                None => return Ok(()),
            }
        } else {
            Duration::from_millis(schedule.start_ms as u64)
        };

        let timer = self.clone();
        let mut running = self.shared.backend.schedule(
            delay,
            interval,
            Box::new(move || timer.expire(generation)),
        )?;

        let mut st = self.lock();
        if st.generation == generation {
            st.running = Some(running);
        } else {
            running.cancel();
        }
        Ok(())
    }

    /// Cancels a pending expiry. No-op when idle.
    pub fn reset(&self) {
        let mut st = self.lock();
        if !st.armed {
            return;
        }
        st.cancel();
        st.armed = false;
    }

    pub fn expired(&self) -> bool {
        !self.lock().armed
    }

    pub fn fired(&self) -> u64 {
        self.lock().fired
    }

    /// Handles one expiry. Returns whether the schedule continues.
    fn expire(&self, generation: u64) -> bool {
        let keep_going = {
            let mut st = self.lock();
            if st.generation != generation || !st.armed {
                return false;
            }
            let Some(schedule) = st.schedule else {
                return false;
            };
            st.fired += 1;
            let done = schedule.interval_ms == 0
                || matches!(schedule.repeat, Repeat::Count(n) if st.fired >= n as u64);
            if done {
                st.armed = false;
            }
            !done
        };

        let name = format!("{}/{}", self.shared.prefix(), self.id);
        if let Err(e) = self.shared.store.set(Datapoint::empty(name, now_micros())) {
            warn!(timer = self.id, "failed to publish expiry: {e}");
        }
        (self.shared.on_expire)(self.id);
        keep_going
    }
}

impl TimerShared {
    fn prefix(&self) -> String {
        self.prefix
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Fixed set of timers allocated at startup
pub struct TimerPool {
    timers: Vec<Arc<Timer>>,
    shared: Arc<TimerShared>,
}

impl TimerPool {
    pub fn new(
        count: usize,
        prefix: &str,
        backend: Arc<dyn TimerBackend>,
        store: Arc<DatapointStore>,
        on_expire: ExpiryHook,
    ) -> Self {
        debug!(count, backend = backend.name(), "creating timers");
        let shared = Arc::new(TimerShared {
            store,
            backend,
            prefix: RwLock::new(prefix.to_string()),
            on_expire,
        });
        let timers = (0..count)
            .map(|id| {
                Arc::new(Timer {
                    id,
                    state: Mutex::new(TimerState::default()),
                    shared: shared.clone(),
                })
            })
            .collect();
        Self { timers, shared }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn get(&self, id: usize) -> Result<&Arc<Timer>, TimerError> {
        self.timers.get(id).ok_or(TimerError::InvalidTimer(id))
    }

    /// One-shot expiry after `ms`
    pub fn tick(&self, id: usize, ms: i64) -> Result<(), TimerError> {
        let timer = self.get(id)?;
        timer.arm(Schedule {
            start_ms: ms,
            interval_ms: 0,
            repeat: Repeat::Count(1),
        });
        timer.fire()
    }

    pub fn tick_interval(
        &self,
        id: usize,
        start_ms: i64,
        interval_ms: i64,
        repeat: Repeat,
    ) -> Result<(), TimerError> {
        let timer = self.get(id)?;
        let interval_ms = u64::try_from(interval_ms).map_err(|_| {
            TimerError::InvalidArgument(format!("invalid interval {interval_ms}"))
        })?;
        timer.arm(Schedule {
            start_ms,
            interval_ms,
            repeat,
        });
        timer.fire()
    }

    pub fn expired(&self, id: usize) -> Result<bool, TimerError> {
        Ok(self.get(id)?.expired())
    }

    pub fn reset(&self, id: usize) -> Result<(), TimerError> {
        self.get(id)?.reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        for timer in &self.timers {
            timer.reset();
        }
    }

    /// Expired flag of every timer, in id order
    pub fn status(&self) -> Vec<bool> {
        self.timers.iter().map(|t| t.expired()).collect()
    }

    pub fn prefix(&self) -> String {
        self.shared.prefix()
    }

    pub fn set_prefix(&self, prefix: &str) {
        *self
            .shared
            .prefix
            .write()
            .unwrap_or_else(PoisonError::into_inner) = prefix.to_string();
    }
}
