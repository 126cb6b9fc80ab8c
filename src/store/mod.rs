use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use globset::{GlobBuilder, GlobMatcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::datapoint::{DataType, Datapoint, MAX_NAME_LEN, now_micros};

/// Datapoint holding the space separated list of all names, refreshed
/// whenever a new name appears
pub const KEYS_DPOINT: &str = "@keys";

pub type ClientId = Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("datapoint `{0}` not found")]
    NotFound(String),
    #[error("invalid datapoint name `{0}`")]
    InvalidName(String),
    #[error("invalid pattern `{0}`: {1}")]
    InvalidPattern(String, String),
    #[error("stride must be positive, got {0}")]
    InvalidStride(i64),
    #[error("unknown client `{0}`")]
    UnknownClient(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    Full,
    Closed,
}

/// Where a client's matching datapoints are handed off.
/// Implementations must not block.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, dp: Arc<Datapoint>) -> Result<(), DeliveryError>;
}

impl DeliverySink for mpsc::Sender<Arc<Datapoint>> {
    fn deliver(&self, dp: Arc<Datapoint>) -> Result<(), DeliveryError> {
        self.try_send(dp).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    pattern: String,
    /// `*` and `?` match any character, `/` included
    matcher: GlobMatcher,
    stride: u32,
    count: u32,
    primed: bool,
}

impl Subscription {
    /// Counts one matching update and reports whether it is delivered.
    /// The first update after subscribing and the first value of a new
    /// name are always delivered without resetting the counter.
    fn advance(&mut self, new_name: bool) -> bool {
        self.count += 1;
        let due = self.count >= self.stride;
        if due {
            self.count = 0;
        }
        let first = !self.primed;
        self.primed = true;
        due || first || new_name
    }
}

struct Client {
    sink: Arc<dyn DeliverySink>,
    subs: Vec<Subscription>,
}

#[derive(Default)]
struct StoreInner {
    points: HashMap<String, Arc<Datapoint>>,
    clients: HashMap<ClientId, Client>,
}

impl StoreInner {
    fn collect_sinks(&mut self, name: &str, new_name: bool) -> Vec<(ClientId, Arc<dyn DeliverySink>)> {
        self.clients
            .iter_mut()
            .filter_map(|(id, client)| {
                let mut deliver = false;
                for sub in client.subs.iter_mut() {
                    if sub.matcher.is_match(name) && sub.advance(new_name) {
                        deliver = true;
                    }
                }
                deliver.then(|| (*id, client.sink.clone()))
            })
            .collect()
    }

    fn client(&mut self, id: &ClientId) -> Result<&mut Client, StoreError> {
        self.clients
            .get_mut(id)
            .ok_or(StoreError::UnknownClient(*id))
    }

    fn key_list(&self) -> String {
        let mut keys: Vec<&str> = self.points.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys.join(" ")
    }
}

/// Latest value of every datapoint plus the subscriptions on them.
///
/// `set` may be called from any thread. Matching happens under the table
/// lock; delivery happens after it is released, under a separate ordering
/// lock taken before the table lock is dropped, so every sink sees updates
/// in the order they were stored.
#[derive(Default)]
pub struct DatapointStore {
    inner: Mutex<StoreInner>,
    dispatch: Mutex<()>,
    dropped: AtomicU64,
}

impl DatapointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `dp` and notifies matching clients. Returns whether the name was new.
    pub fn set(&self, dp: Datapoint) -> Result<bool, StoreError> {
        if dp.name.is_empty() || dp.name.len() > MAX_NAME_LEN {
            return Err(StoreError::InvalidName(dp.name));
        }

        let dp = Arc::new(dp);
        let mut inner = self.lock();
        let new_name = inner.points.insert(dp.name.clone(), dp.clone()).is_none();
        let sinks = inner.collect_sinks(&dp.name, new_name);
        let keys = (new_name && dp.name != KEYS_DPOINT).then(|| inner.key_list());

        let order = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        drop(inner);
        self.deliver(&dp, sinks);
        drop(order);

        if let Some(keys) = keys {
            self.set(Datapoint::string(KEYS_DPOINT, dp.timestamp, &keys))?;
        }
        Ok(new_name)
    }

    fn deliver(&self, dp: &Arc<Datapoint>, sinks: Vec<(ClientId, Arc<dyn DeliverySink>)>) {
        for (id, sink) in sinks {
            match sink.deliver(dp.clone()) {
                Ok(()) => {}
                Err(DeliveryError::Full) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(client = %id, name = %dp.name, "client queue full, update dropped");
                }
                Err(DeliveryError::Closed) => {
                    debug!(client = %id, name = %dp.name, "client queue closed");
                }
            }
        }
    }

    /// Re-publishes the current value of `name` stamped with now
    pub fn touch(&self, name: &str) -> Result<(), StoreError> {
        let dp = self.get(name)?.restamped(now_micros());
        self.set(dp)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Datapoint>, StoreError> {
        self.lock()
            .points
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().points.contains_key(name)
    }

    pub fn clear(&self, name: &str) -> Result<(), StoreError> {
        self.lock()
            .points
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Publishes the value of `from` under the name `to`
    pub fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let dp = self.get(from)?.renamed(to);
        self.set(dp)?;
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().points.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// `{name 0 len}` for every opaque group datapoint
    pub fn dg_dir(&self) -> String {
        let inner = self.lock();
        let mut entries: Vec<(&str, usize)> = inner
            .points
            .values()
            .filter(|dp| dp.dtype == DataType::OpaqueGroup)
            .map(|dp| (dp.name.as_str(), dp.payload.len()))
            .collect();
        entries.sort_unstable();
        entries
            .iter()
            .map(|(name, len)| format!("{{{name} 0 {len}}}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn register_client(&self, id: ClientId, sink: Arc<dyn DeliverySink>) {
        self.lock().clients.insert(
            id,
            Client {
                sink,
                subs: Vec::new(),
            },
        );
    }

    /// Drops the client and all of its subscriptions. Once this returns no
    /// further deliveries are made to its sink.
    pub fn unregister_client(&self, id: &ClientId) -> bool {
        let removed = self.lock().clients.remove(id).is_some();
        // wait out any delivery that matched before the removal
        drop(self.dispatch.lock().unwrap_or_else(PoisonError::into_inner));
        removed
    }

    /// Adds or replaces the client's subscription for `pattern`
    pub fn subscribe(&self, id: &ClientId, pattern: &str, stride: i64) -> Result<(), StoreError> {
        if stride <= 0 {
            return Err(StoreError::InvalidStride(stride));
        }
        let stride = u32::try_from(stride).unwrap_or(u32::MAX);
        let matcher = GlobBuilder::new(pattern)
            .build()
            .map_err(|e| StoreError::InvalidPattern(pattern.to_string(), e.kind().to_string()))?
            .compile_matcher();

        let mut inner = self.lock();
        let client = inner.client(id)?;
        let sub = Subscription {
            pattern: pattern.to_string(),
            matcher,
            stride,
            count: 0,
            primed: false,
        };
        match client.subs.iter_mut().find(|s| s.pattern == pattern) {
            Some(existing) => *existing = sub,
            None => client.subs.push(sub),
        }
        Ok(())
    }

    pub fn unsubscribe(&self, id: &ClientId, pattern: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let client = inner.client(id)?;
        let before = client.subs.len();
        client.subs.retain(|s| s.pattern != pattern);
        Ok(client.subs.len() != before)
    }

    pub fn unsubscribe_all(&self, id: &ClientId) -> Result<(), StoreError> {
        self.lock().client(id)?.subs.clear();
        Ok(())
    }

    /// The client's `(pattern, stride)` pairs in subscription order
    pub fn matches(&self, id: &ClientId) -> Result<Vec<(String, u32)>, StoreError> {
        Ok(self
            .lock()
            .client(id)?
            .subs
            .iter()
            .map(|s| (s.pattern.clone(), s.stride))
            .collect())
    }

    /// Number of updates dropped because a client queue was full
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::encode_json;
    use crate::event::EventNames;

    fn client(store: &DatapointStore, capacity: usize) -> (ClientId, mpsc::Receiver<Arc<Datapoint>>) {
        let id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(capacity);
        store.register_client(id, Arc::new(tx));
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<Datapoint>>) -> Vec<Arc<Datapoint>> {
        let mut out = Vec::new();
        while let Ok(dp) = rx.try_recv() {
            out.push(dp);
        }
        out
    }

    #[test]
    fn test_last_write_wins() {
        let store = DatapointStore::new();
        assert!(store.set(Datapoint::string("n", 1, "v1")).unwrap());
        assert!(!store.set(Datapoint::string("n", 2, "v2")).unwrap());
        let dp = store.get("n").unwrap();
        assert_eq!(&dp.payload[..], b"v2");
        assert_eq!(dp.timestamp, 2);
    }

    #[test]
    fn test_missing_names() {
        let store = DatapointStore::new();
        assert_eq!(store.get("nope").unwrap_err(), StoreError::NotFound("nope".into()));
        assert!(matches!(store.touch("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.clear("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.copy("nope", "b"), Err(StoreError::NotFound(_))));
        assert!(!store.exists("nope"));
    }

    #[test]
    fn test_clear_then_get() {
        let store = DatapointStore::new();
        store.set(Datapoint::string("n", 1, "v")).unwrap();
        store.clear("n").unwrap();
        assert!(store.get("n").is_err());
        store.set(Datapoint::string("n", 2, "w")).unwrap();
        assert!(store.exists("n"));
    }

    #[test]
    fn test_invalid_name() {
        let store = DatapointStore::new();
        assert!(matches!(
            store.set(Datapoint::string("", 1, "v")),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_stride_delivery() {
        let store = DatapointStore::new();
        let (id, mut rx) = client(&store, 64);
        store.subscribe(&id, "ain/*", 3).unwrap();

        for ts in 1..=7 {
            store.set(Datapoint::string("ain/vals", ts, "x")).unwrap();
        }
        let got: Vec<u64> = drain(&mut rx).iter().map(|dp| dp.timestamp).collect();
        assert_eq!(got, vec![1, 3, 6]);
    }

    #[test]
    fn test_new_names_bypass_stride() {
        let store = DatapointStore::new();
        store.set(Datapoint::string("a/old", 0, "x")).unwrap();
        let (id, mut rx) = client(&store, 64);
        store.subscribe(&id, "a/*", 5).unwrap();

        store.set(Datapoint::string("a/old", 1, "x")).unwrap();
        store.set(Datapoint::string("a/old", 2, "x")).unwrap();
        store.set(Datapoint::string("a/new", 3, "x")).unwrap();
        store.set(Datapoint::string("a/old", 4, "x")).unwrap();

        let got: Vec<u64> = drain(&mut rx).iter().map(|dp| dp.timestamp).collect();
        assert_eq!(got, vec![1, 3]);
    }

    #[test]
    fn test_one_delivery_per_client() {
        let store = DatapointStore::new();
        let (id, mut rx) = client(&store, 64);
        // an existing name, so no `@keys` update rides along
        store.set(Datapoint::string("ain/vals", 1, "x")).unwrap();
        store.subscribe(&id, "ain/*", 1).unwrap();
        store.subscribe(&id, "*", 1).unwrap();
        store.set(Datapoint::string("ain/vals", 2, "y")).unwrap();
        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, 2);
    }

    #[test]
    fn test_pattern_matching() {
        let store = DatapointStore::new();
        let names = ["ain/vals", "din/vals", "ain/vals2", "timer/0", "xaybzab"];
        for name in names {
            store.set(Datapoint::string(name, 0, "x")).unwrap();
        }

        let matched = |pattern: &str| {
            let (id, mut rx) = client(&store, 64);
            store.subscribe(&id, pattern, 1).unwrap();
            for name in names {
                store.set(Datapoint::string(name, 1, "x")).unwrap();
            }
            store.unregister_client(&id);
            drain(&mut rx).iter().map(|dp| dp.name.clone()).collect::<Vec<_>>()
        };

        assert_eq!(matched("ain/*"), vec!["ain/vals", "ain/vals2"]);
        assert_eq!(matched("*"), names.to_vec());
        assert_eq!(matched("ain/vals"), vec!["ain/vals"]);
        assert_eq!(matched("?in/vals"), vec!["ain/vals", "din/vals"]);
        assert_eq!(matched("*/vals"), vec!["ain/vals", "din/vals"]);
        assert_eq!(matched("*a*b"), vec!["xaybzab"]);
        assert_eq!(matched("timer/?"), vec!["timer/0"]);
        assert!(matched("ain/?").is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let store = DatapointStore::new();
        let (id, _rx) = client(&store, 4);
        assert!(matches!(
            store.subscribe(&id, "ain/[", 1),
            Err(StoreError::InvalidPattern(p, _)) if p == "ain/["
        ));
        assert!(store.matches(&id).unwrap().is_empty());
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let store = DatapointStore::new();
        let (id, mut rx) = client(&store, 64);
        store.subscribe(&id, "a", 1).unwrap();
        store.subscribe(&id, "b", 1).unwrap();
        assert!(store.unregister_client(&id));

        store.set(Datapoint::string("a", 1, "x")).unwrap();
        store.set(Datapoint::string("b", 1, "x")).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.matches(&id), Err(StoreError::UnknownClient(id)));
    }

    #[test]
    fn test_subscription_management() {
        let store = DatapointStore::new();
        let (id, _rx) = client(&store, 4);
        store.subscribe(&id, "a/*", 1).unwrap();
        store.subscribe(&id, "b", 4).unwrap();
        store.subscribe(&id, "a/*", 2).unwrap();
        assert_eq!(
            store.matches(&id).unwrap(),
            vec![("a/*".to_string(), 2), ("b".to_string(), 4)]
        );

        assert_eq!(store.subscribe(&id, "c", 0), Err(StoreError::InvalidStride(0)));
        assert_eq!(store.subscribe(&id, "c", -1), Err(StoreError::InvalidStride(-1)));

        assert!(store.unsubscribe(&id, "b").unwrap());
        assert!(!store.unsubscribe(&id, "b").unwrap());
        store.unsubscribe_all(&id).unwrap();
        assert!(store.matches(&id).unwrap().is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let store = DatapointStore::new();
        let (id, mut rx) = client(&store, 1);
        store.subscribe(&id, "x", 1).unwrap();
        store.set(Datapoint::string("x", 1, "a")).unwrap();
        store.set(Datapoint::string("x", 2, "b")).unwrap();
        assert_eq!(store.dropped_deliveries(), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_keys_datapoint() {
        let store = DatapointStore::new();
        let (id, mut rx) = client(&store, 16);
        store.subscribe(&id, KEYS_DPOINT, 1).unwrap();

        store.set(Datapoint::string("b", 1, "x")).unwrap();
        store.set(Datapoint::string("a", 1, "x")).unwrap();
        store.set(Datapoint::string("a", 2, "y")).unwrap();

        let pushes = drain(&mut rx);
        assert_eq!(pushes.len(), 2);
        assert_eq!(&pushes[1].payload[..], b"@keys a b");
        assert_eq!(store.keys(), vec!["@keys", "a", "b"]);
    }

    #[test]
    fn test_touch_and_copy() {
        let store = DatapointStore::new();
        store.set(Datapoint::string("src", 5, "payload")).unwrap();
        store.touch("src").unwrap();
        let touched = store.get("src").unwrap();
        assert!(touched.timestamp > 5);
        assert_eq!(&touched.payload[..], b"payload");

        store.copy("src", "dst").unwrap();
        let copied = store.get("dst").unwrap();
        assert_eq!(copied.name, "dst");
        assert_eq!(copied.payload, touched.payload);
    }

    #[test]
    fn test_dg_dir() {
        let store = DatapointStore::new();
        store
            .set(Datapoint::new("grp/b", 0, DataType::OpaqueGroup, vec![0u8; 10]))
            .unwrap();
        store
            .set(Datapoint::new("grp/a", 0, DataType::OpaqueGroup, vec![0u8; 3]))
            .unwrap();
        store.set(Datapoint::string("other", 0, "x")).unwrap();
        assert_eq!(store.dg_dir(), "{grp/a 0 3} {grp/b 0 10}");
    }

    #[test]
    fn test_subscriber_receives_json_push() {
        let store = DatapointStore::new();
        let (id, mut rx) = client(&store, 4);
        store.subscribe(&id, "ain/*", 1).unwrap();

        let payload: Vec<u8> = [12i16, 34].iter().flat_map(|v| v.to_le_bytes()).collect();
        store
            .set(Datapoint::new("ain/vals", 1000, DataType::Int16, payload))
            .unwrap();

        let pushes = drain(&mut rx);
        assert_eq!(pushes.len(), 1);
        let json: serde_json::Value =
            serde_json::from_str(&encode_json(&pushes[0], &EventNames::default()).unwrap()).unwrap();
        assert_eq!(json["data"], serde_json::json!([12, 34]));
    }

    #[test]
    fn test_concurrent_producers() {
        let store = Arc::new(DatapointStore::new());
        let (id, mut rx) = client(&store, 1024);
        store.subscribe(&id, "p/*", 1).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .set(Datapoint::string(format!("p/{t}"), i, "x"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let pushes = drain(&mut rx);
        assert_eq!(pushes.len(), 200);
        for t in 0..4 {
            let name = format!("p/{t}");
            let stamps: Vec<u64> = pushes
                .iter()
                .filter(|dp| dp.name == name)
                .map(|dp| dp.timestamp)
                .collect();
            assert_eq!(stamps, (0..50).collect::<Vec<u64>>());
        }
    }
}
