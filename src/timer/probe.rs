use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::runtime::Handle;
use tracing::{info, warn};

use super::{ReactorBackend, ThreadBackend, TimerBackend, TimerBackendKind};

/// A startup check of the reactor's timing behaviour.
/// `Err` describes the anomaly that rules the reactor out.
pub trait TimerProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, runtime: &Handle) -> Result<(), String>;
}

/// Sleeps a few times on the reactor and checks the wakeups land
/// neither early nor far past the deadline
pub struct SleepAccuracyProbe {
    pub samples: u32,
    pub delay: Duration,
    pub tolerance: Duration,
}

impl Default for SleepAccuracyProbe {
    fn default() -> Self {
        Self {
            samples: 5,
            delay: Duration::from_millis(2),
            tolerance: Duration::from_millis(50),
        }
    }
}

impl TimerProbe for SleepAccuracyProbe {
    fn name(&self) -> &'static str {
        "sleep-accuracy"
    }

    fn check(&self, runtime: &Handle) -> Result<(), String> {
        for _ in 0..self.samples {
            let elapsed = runtime.block_on(async {
                let start = Instant::now();
                tokio::time::sleep(self.delay).await;
                start.elapsed()
            });
            if elapsed < self.delay {
                return Err(format!("woke after {elapsed:?}, before the {:?} deadline", self.delay));
            }
            if elapsed > self.delay + self.tolerance {
                return Err(format!("woke after {elapsed:?}, expected about {:?}", self.delay));
            }
        }
        Ok(())
    }
}

/// Checks the wall clock moves forward alongside the monotonic clock
pub struct WallClockProbe {
    pub delay: Duration,
}

impl Default for WallClockProbe {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(5),
        }
    }
}

impl TimerProbe for WallClockProbe {
    fn name(&self) -> &'static str {
        "wall-clock"
    }

    fn check(&self, runtime: &Handle) -> Result<(), String> {
        let before = jiff::Timestamp::now();
        runtime.block_on(tokio::time::sleep(self.delay));
        let after = jiff::Timestamp::now();
        if after < before {
            return Err(format!("wall clock went backwards from {before} to {after}"));
        }
        Ok(())
    }
}

pub fn default_probes() -> Vec<Box<dyn TimerProbe>> {
    vec![
        Box::new(SleepAccuracyProbe::default()),
        Box::new(WallClockProbe::default()),
    ]
}

/// Picks the timer backend. Must be called off the runtime's worker
/// threads (probes block on the runtime).
pub fn select_backend(
    kind: TimerBackendKind,
    runtime: Handle,
    probes: &[Box<dyn TimerProbe>],
) -> Arc<dyn TimerBackend> {
    let backend: Arc<dyn TimerBackend> = match kind {
        TimerBackendKind::Reactor => Arc::new(ReactorBackend::new(runtime)),
        TimerBackendKind::Thread => Arc::new(ThreadBackend),
        TimerBackendKind::Auto => {
            let anomaly = probes
                .iter()
                .find_map(|probe| probe.check(&runtime).err().map(|e| (probe.name(), e)));
            match anomaly {
                Some((probe, reason)) => {
                    warn!(probe, "reactor timers unreliable ({reason}), using thread timers");
                    Arc::new(ThreadBackend)
                }
                None => Arc::new(ReactorBackend::new(runtime)),
            }
        }
    };
    info!(backend = backend.name(), "timer backend selected");
    backend
}
