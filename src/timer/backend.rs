use std::{
    sync::mpsc::{self, RecvTimeoutError},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::debug;

use super::TimerError;

/// Callback run on every expiry; returning `false` ends the schedule
pub type Tick = Box<dyn FnMut() -> bool + Send + 'static>;

/// A running schedule that can be cancelled
pub trait ScheduledTick: Send {
    fn cancel(&mut self);
}

/// Scheduling primitive the timer pool runs on
pub trait TimerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs `tick` after `delay`, then every `interval` (if any) until it
    /// returns `false` or the schedule is cancelled. Deadlines are absolute
    /// so a slow tick does not shift later expiries.
    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        tick: Tick,
    ) -> Result<Box<dyn ScheduledTick>, TimerError>;
}

/// Timers as tasks on the tokio runtime
pub struct ReactorBackend {
    runtime: Handle,
}

impl ReactorBackend {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

struct ReactorTick(JoinHandle<()>);

impl ScheduledTick for ReactorTick {
    fn cancel(&mut self) {
        self.0.abort();
    }
}

impl TimerBackend for ReactorBackend {
    fn name(&self) -> &'static str {
        "reactor"
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        mut tick: Tick,
    ) -> Result<Box<dyn ScheduledTick>, TimerError> {
        let handle = self.runtime.spawn(async move {
            let mut deadline = tokio::time::Instant::now() + delay;
            loop {
                tokio::time::sleep_until(deadline).await;
                if !tick() {
                    break;
                }
                match interval {
                    Some(interval) => deadline += interval,
                    None => break,
                }
            }
        });
        Ok(Box::new(ReactorTick(handle)))
    }
}

/// One OS thread per running schedule, waiting on a cancel channel
#[derive(Default)]
pub struct ThreadBackend;

struct ThreadTick(Option<mpsc::Sender<()>>);

impl ScheduledTick for ThreadTick {
    fn cancel(&mut self) {
        // dropping the sender wakes the thread with `Disconnected`
        self.0.take();
    }
}

impl TimerBackend for ThreadBackend {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        mut tick: Tick,
    ) -> Result<Box<dyn ScheduledTick>, TimerError> {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || {
                let mut deadline = std::time::Instant::now() + delay;
                loop {
                    let wait = deadline.saturating_duration_since(std::time::Instant::now());
                    match cancel_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => {
                            debug!("timer thread cancelled");
                            break;
                        }
                    }
                    if !tick() {
                        break;
                    }
                    match interval {
                        Some(interval) => deadline += interval,
                        None => break,
                    }
                }
            })
            .map_err(|e| TimerError::Spawn(e.to_string()))?;
        Ok(Box::new(ThreadTick(Some(cancel_tx))))
    }
}
