//! The command engine: one thread that executes every command and script,
//! so side effects on the store and timers are totally ordered.

use std::{collections::HashMap, io, sync::Arc, thread::JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, span, warn, Level};
use uuid::Uuid;

use crate::{
    cli::{
        error::DispatchError,
        model::Command,
        script::{split_commands, strip_group},
    },
    datapoint::{render_values, Datapoint, FormatCell},
    event::{EventNames, EVENT_DPOINT, META_EVENT},
    store::{ClientId, DatapointStore, DeliveryError, DeliverySink},
    timer::{ExpiryHook, TimerPool},
};

/// Nested `eval` limit
const MAX_DEPTH: usize = 32;

#[derive(Debug)]
pub enum EngineRequest {
    Shutdown,

    /// Run one line (possibly several commands) and reply with the last result
    Execute {
        caller: Caller,
        line: String,
        reply: oneshot::Sender<Result<String, DispatchError>>,
    },

    /// A binary datapoint received from a client
    Publish(Datapoint),

    /// Timer `id` expired; runs its script if one is set
    TimerExpired(usize),

    /// A datapoint matched a trigger script's pattern
    Trigger { pattern: String, dp: Arc<Datapoint> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Store, event and timer verbs
    Store,
    /// Everything
    Full,
}

#[derive(Debug, Clone)]
pub struct SessionRef {
    pub id: ClientId,
    pub format: Arc<FormatCell>,
}

/// Who a command runs on behalf of
#[derive(Debug, Clone)]
pub struct Caller {
    pub scope: Scope,
    pub session: Option<SessionRef>,
}

impl Caller {
    pub fn store() -> Self {
        Self {
            scope: Scope::Store,
            session: None,
        }
    }

    pub fn full() -> Self {
        Self {
            scope: Scope::Full,
            session: None,
        }
    }

    pub fn session(id: ClientId, format: Arc<FormatCell>) -> Self {
        Self {
            scope: Scope::Full,
            session: Some(SessionRef { id, format }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

pub fn channel(capacity: usize) -> (EngineHandle, mpsc::Receiver<EngineRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EngineHandle { tx }, rx)
}

fn stopped() -> DispatchError {
    DispatchError::Execution("engine stopped".to_string())
}

impl EngineHandle {
    pub async fn execute(
        &self,
        caller: Caller,
        line: impl Into<String>,
    ) -> Result<String, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Execute {
                caller,
                line: line.into(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn publish(&self, dp: Datapoint) -> Result<(), DispatchError> {
        self.tx
            .send(EngineRequest::Publish(dp))
            .await
            .map_err(|_| stopped())
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown).await;
    }

    /// Non-blocking send for callers that cannot wait (store sinks, timers)
    pub fn notify(&self, req: EngineRequest) -> Result<(), DeliveryError> {
        self.tx.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn expiry_hook(&self) -> ExpiryHook {
        let handle = self.clone();
        Box::new(move |id| {
            if handle.notify(EngineRequest::TimerExpired(id)) == Err(DeliveryError::Full) {
                warn!(timer = id, "engine queue full, timer script skipped");
            }
        })
    }
}

/// Store client that hands matching datapoints back to the engine
struct TriggerSink {
    pattern: String,
    engine: EngineHandle,
}

impl DeliverySink for TriggerSink {
    fn deliver(&self, dp: Arc<Datapoint>) -> Result<(), DeliveryError> {
        self.engine.notify(EngineRequest::Trigger {
            pattern: self.pattern.clone(),
            dp,
        })
    }
}

struct TriggerScript {
    client: ClientId,
    script: String,
}

pub struct Engine {
    pub(crate) store: Arc<DatapointStore>,
    pub(crate) timers: Arc<TimerPool>,
    pub(crate) events: Arc<EventNames>,
    handle: EngineHandle,
    rx: mpsc::Receiver<EngineRequest>,
    triggers: HashMap<String, TriggerScript>,
    timer_scripts: HashMap<usize, String>,
    depth: usize,
}

impl Engine {
    pub fn new(
        store: Arc<DatapointStore>,
        timers: Arc<TimerPool>,
        events: Arc<EventNames>,
        handle: EngineHandle,
        rx: mpsc::Receiver<EngineRequest>,
    ) -> Self {
        Self {
            store,
            timers,
            events,
            handle,
            rx,
            triggers: HashMap::new(),
            timer_scripts: HashMap::new(),
            depth: 0,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("engine".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        let span = span!(Level::INFO, "Engine");
        let _enter = span.enter();
        info!("started");

        while let Some(req) = self.rx.blocking_recv() {
            if let EngineRequest::Shutdown = req {
                info!("shutting down");
                break;
            }
            self.handle_request(req);
        }

        for (_, trigger) in self.triggers.drain() {
            self.store.unregister_client(&trigger.client);
        }
    }

    fn handle_request(&mut self, req: EngineRequest) {
        use EngineRequest::*;
        match req {
            Shutdown => {}
            Execute {
                caller,
                line,
                reply,
            } => {
                let result = self.run_script(&line, &caller);
                if let Err(e) = &result {
                    debug!(tag = e.tag(), "command failed: {e}");
                }
                // the requester may have gone away
                let _ = reply.send(result);
            }
            Publish(dp) => {
                if let Err(e) = self.publish(dp) {
                    warn!("dropped published datapoint: {e}");
                }
            }
            TimerExpired(id) => {
                let Some(script) = self.timer_scripts.get(&id).cloned() else {
                    return;
                };
                let script = script.replace("$timer", &id.to_string());
                if let Err(e) = self.run_script(strip_group(&script), &Caller::full()) {
                    error!(timer = id, "timer script failed: {} {e}", e.tag());
                }
            }
            Trigger { pattern, dp } => {
                let Some(script) = self.triggers.get(&pattern).map(|t| t.script.clone()) else {
                    return;
                };
                let script = script
                    .replace("$name", &dp.name)
                    .replace("$timestamp", &dp.timestamp.to_string())
                    .replace("$data", &render_values(&dp));
                if let Err(e) = self.run_script(strip_group(&script), &Caller::full()) {
                    error!(pattern, name = %dp.name, "trigger script failed: {} {e}", e.tag());
                }
            }
        }
    }

    /// Runs every command of `script` in order, stopping at the first
    /// error. Returns the result of the last command.
    pub(crate) fn run_script(&mut self, script: &str, caller: &Caller) -> Result<String, DispatchError> {
        if self.depth >= MAX_DEPTH {
            return Err(DispatchError::Execution("scripts nested too deeply".to_string()));
        }
        self.depth += 1;
        let result = self.run_commands(script, caller);
        self.depth -= 1;
        result
    }

    fn run_commands(&mut self, script: &str, caller: &Caller) -> Result<String, DispatchError> {
        let mut last = String::new();
        for line in split_commands(script)? {
            last = Command::parse(line)?.dispatch(self, caller)?;
        }
        Ok(last)
    }

    /// Stores `dp`, applying meta events to the name table first
    pub(crate) fn publish(&mut self, dp: Datapoint) -> Result<(), DispatchError> {
        if dp.name == EVENT_DPOINT {
            if let Some(info) = dp.event_info() {
                if info.e_type == META_EVENT {
                    self.events.to_datapoint(
                        info.e_type,
                        info.e_subtype,
                        dp.timestamp,
                        None,
                        dp.payload.clone(),
                    )?;
                }
            }
        }
        self.store.set(dp)?;
        Ok(())
    }

    /// Registers (or replaces) the script run for datapoints matching `pattern`
    pub(crate) fn set_trigger(&mut self, pattern: &str, every: i64, script: String) -> Result<(), DispatchError> {
        let client = Uuid::now_v7();
        self.store.register_client(
            client,
            Arc::new(TriggerSink {
                pattern: pattern.to_string(),
                engine: self.handle.clone(),
            }),
        );
        if let Err(e) = self.store.subscribe(&client, pattern, every) {
            self.store.unregister_client(&client);
            return Err(e.into());
        }

        if let Some(old) = self
            .triggers
            .insert(pattern.to_string(), TriggerScript { client, script })
        {
            self.store.unregister_client(&old.client);
        }
        debug!(pattern, every, "trigger script set");
        Ok(())
    }

    pub(crate) fn remove_trigger(&mut self, pattern: &str) -> bool {
        match self.triggers.remove(pattern) {
            Some(trigger) => {
                self.store.unregister_client(&trigger.client);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_all_triggers(&mut self) {
        for (_, trigger) in self.triggers.drain() {
            self.store.unregister_client(&trigger.client);
        }
    }

    pub(crate) fn set_timer_script(&mut self, id: usize, script: String) -> Result<(), DispatchError> {
        self.timers.get(id)?;
        self.timer_scripts.insert(id, script);
        Ok(())
    }

    pub(crate) fn remove_timer_script(&mut self, id: usize) -> bool {
        self.timer_scripts.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datapoint::{DataType, WireFormat},
        timer::ThreadBackend,
    };
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Running {
        handle: EngineHandle,
        store: Arc<DatapointStore>,
        events: Arc<EventNames>,
        join: JoinHandle<()>,
    }

    fn start() -> Running {
        let store = Arc::new(DatapointStore::new());
        let (handle, rx) = channel(64);
        let timers = Arc::new(TimerPool::new(
            4,
            "timer",
            Arc::new(ThreadBackend),
            store.clone(),
            handle.expiry_hook(),
        ));
        let events = Arc::new(EventNames::default());
        let engine = Engine::new(store.clone(), timers, events.clone(), handle.clone(), rx);
        let join = engine.spawn().unwrap();
        Running {
            handle,
            store,
            events,
            join,
        }
    }

    impl Running {
        async fn stop(self) {
            self.handle.shutdown().await;
            tokio::task::spawn_blocking(move || self.join.join().unwrap())
                .await
                .unwrap();
        }
    }

    async fn wait_for(store: &DatapointStore, name: &str) -> Arc<Datapoint> {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(dp) = store.get(name) {
                    return dp;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("`{name}` never set"))
    }

    #[tokio::test]
    async fn test_execute_set_get() {
        let rt = start();
        let h = &rt.handle;
        assert_eq!(h.execute(Caller::full(), "set s 1 7 5 {hello}").await.unwrap(), "");
        assert_eq!(h.execute(Caller::full(), "get s").await.unwrap(), "s 1 7 5 {hello}");
        assert_eq!(h.execute(Caller::full(), "exists s; exists t").await.unwrap(), "0");
        assert_eq!(
            h.execute(Caller::full(), "get t").await.unwrap_err().tag(),
            "NOT_FOUND"
        );
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_eval_error_does_not_poison_engine() {
        let rt = start();
        let h = &rt.handle;
        let err = h
            .execute(Caller::full(), "eval \"badcommand\"")
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "EXECUTION_ERROR");
        assert!(!h.execute(Caller::full(), "eval {now}").await.unwrap().is_empty());
        assert_eq!(
            h.execute(Caller::full(), "badcommand").await.unwrap_err().tag(),
            "PARSE_ERROR"
        );
        assert_eq!(h.execute(Caller::full(), "version").await.unwrap(), crate::VERSION);
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_script_stops_at_first_error() {
        let rt = start();
        let result = rt
            .handle
            .execute(Caller::full(), "set a 1 1 1 {a}; get missing; set b 1 1 1 {b}")
            .await;
        assert_eq!(result.unwrap_err().tag(), "NOT_FOUND");
        assert!(rt.store.exists("a"));
        assert!(!rt.store.exists("b"));
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_store_scope_rejects_client_verbs() {
        let rt = start();
        let h = &rt.handle;
        let err = h.execute(Caller::store(), "addmatch a*").await.unwrap_err();
        assert_eq!(err.tag(), "EXECUTION_ERROR");
        let err = h.execute(Caller::full(), "matches").await.unwrap_err();
        assert_eq!(err.tag(), "EXECUTION_ERROR");
        assert_eq!(h.execute(Caller::store(), "timer.status").await.unwrap(), "1 1 1 1");
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_session_format_applies_to_get() {
        let rt = start();
        let id = Uuid::now_v7();
        let (tx, _rx) = mpsc::channel::<Arc<Datapoint>>(4);
        rt.store.register_client(id, Arc::new(tx));
        let format = Arc::new(FormatCell::new(WireFormat::Text));
        let caller = Caller::session(id, format.clone());

        rt.handle
            .execute(caller.clone(), "set v 4 1 4 {AQACAA==}")
            .await
            .unwrap();
        rt.handle.execute(caller.clone(), "format json").await.unwrap();
        assert_eq!(format.get(), WireFormat::Json);
        let json = rt.handle.execute(caller.clone(), "get v").await.unwrap();
        assert!(json.contains("\"data\":[1,2]"), "{json}");

        rt.handle.execute(caller.clone(), "addmatch v* 2").await.unwrap();
        assert_eq!(rt.handle.execute(caller, "matches").await.unwrap(), "v* 2");
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_script() {
        let rt = start();
        let h = &rt.handle;
        h.execute(Caller::full(), "dpoint.setScript ain/* copy $name last")
            .await
            .unwrap();
        h.execute(Caller::full(), "set ain/0 1 1 1 {x}").await.unwrap();
        let last = wait_for(&rt.store, "last").await;
        assert_eq!(last.payload.as_ref(), b"x");

        h.execute(Caller::full(), "dpoint.removeScript ain/*").await.unwrap();
        h.execute(Caller::full(), "clear last").await.unwrap();
        h.execute(Caller::full(), "set ain/0 1 1 1 {y}").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!rt.store.exists("last"));
        assert_eq!(
            h.execute(Caller::full(), "dpoint.removeScript ain/*")
                .await
                .unwrap_err()
                .tag(),
            "NOT_FOUND"
        );
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_timer_script() {
        let rt = start();
        let h = &rt.handle;
        h.execute(Caller::full(), "timer.setScript 2 \"set fired 1 0 6 {$timer}\"")
            .await
            .unwrap();
        assert_eq!(h.execute(Caller::full(), "timer.tick 2 5").await.unwrap(), "2");
        let fired = wait_for(&rt.store, "fired").await;
        assert_eq!(fired.payload.as_ref(), b"2");
        assert_eq!(fired.dtype, DataType::String);
        assert!(rt.store.exists("timer/2"));
        assert_eq!(h.execute(Caller::full(), "timer.expired 2").await.unwrap(), "1");
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_binary_publish_applies_meta_event() {
        let rt = start();
        let dp = EventNames::empty()
            .name_event(40, "TrialEnd", crate::event::PutType::Long)
            .unwrap();
        rt.handle.publish(dp).await.unwrap();
        rt.handle
            .execute(Caller::full(), "evtput 40 0 5 long 7")
            .await
            .unwrap();
        assert_eq!(rt.events.display_name(40), "TrialEnd");
        assert_eq!(rt.events.put_type(40), crate::event::PutType::Long);

        let dp = rt.store.get(EVENT_DPOINT).unwrap();
        let info = dp.event_info().unwrap();
        assert_eq!(info.e_type, 40);
        assert_eq!(dp.timestamp, 5);
        assert_eq!(dp.payload.as_ref(), &7i32.to_le_bytes());
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_evtput_meta_event_layout() {
        let rt = start();
        let h = &rt.handle;
        let err = h
            .execute(Caller::full(), "evtput 1 40 0 string TrialStart")
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "INVALID_ARGUMENT");
        assert_eq!(rt.events.put_type(40), EventNames::default().put_type(40));

        // 0x0463: time encoding `c`, put type 4 (long)
        h.execute(Caller::full(), "evtput 1 40 1123 string TrialStart")
            .await
            .unwrap();
        assert_eq!(rt.events.display_name(40), "TrialStart");
        assert_eq!(rt.events.put_type(40), crate::event::PutType::Long);

        let err = h
            .execute(Caller::full(), "evtput 19 0 5 short 70000")
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "INVALID_ARGUMENT");
        rt.stop().await;
    }
}
