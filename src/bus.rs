// ===============================
// src/bus.rs
// ===============================
//
// In-process pub/sub:
// - subscribe(topic, handler)   : exact-topic registration, FIFO per topic
// - publish(event)              : enqueue only, never waits for delivery
// - dispatch loop (tokio task)  : single consumer, handlers run one by one
//
// Queue policy:
// - unbounded (default)         : tokio mpsc unbounded
// - bounded                     : tokio broadcast ring, drop-oldest. Every
//                                 dropped event is counted (stats + metrics).
//                                 Effective capacity is rounded up to a power
//                                 of two by tokio.
//
// Handler failures (Err or panic) are contained here: logged, counted and
// re-published as an ERROR event. A failing ERROR handler is only logged.
//
use ahash::AHashMap as HashMap;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::domain::{ErrorRecord, Payload};
use crate::error::{ConfigError, DeliveryError, HandlerResult};
use crate::event::{Category, Event};
use crate::metrics::{DELIVERY_ERRORS, EVENTS_DELIVERED, EVENTS_DROPPED, EVENTS_PUBLISHED};
use crate::price_cache::LastPriceCache;

/// Error id carried on ERROR events produced by the dispatch loop itself.
pub const DELIVERY_ERROR_ID: i64 = 9001;

pub type Handler = Box<dyn FnMut(&Event) -> HandlerResult + Send>;
type SharedHandler = Arc<Mutex<Handler>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str { &self.topic }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Tag used on ERROR records raised by the bus.
    pub name: String,
    /// `None` = unbounded queue.
    pub queue_capacity: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self { Self { name: "EventBus".into(), queue_capacity: None } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub delivery_errors: u64,
}

enum QueueTx {
    Unbounded(mpsc::UnboundedSender<Event>),
    Bounded(broadcast::Sender<Event>),
}

enum QueueRx {
    Unbounded(mpsc::UnboundedReceiver<Event>),
    Bounded(broadcast::Receiver<Event>),
}

impl QueueRx {
    async fn recv(&mut self, shared: &Shared) -> Option<Event> {
        match self {
            QueueRx::Unbounded(rx) => rx.recv().await,
            QueueRx::Bounded(rx) => loop {
                match rx.recv().await {
                    Ok(ev) => return Some(ev),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(bus = %shared.name, dropped = n, "event queue overflow, oldest events dropped");
                        shared.count_dropped(n)
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    fn try_recv(&mut self, shared: &Shared) -> Option<Event> {
        match self {
            QueueRx::Unbounded(rx) => rx.try_recv().ok(),
            QueueRx::Bounded(rx) => loop {
                match rx.try_recv() {
                    Ok(ev) => return Some(ev),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!(bus = %shared.name, dropped = n, "event queue overflow, oldest events dropped");
                        shared.count_dropped(n)
                    }
                    Err(_) => return None,
                }
            },
        }
    }
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<(u64, SharedHandler)>>,
}

struct Shared {
    name: String,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    tx: QueueTx,
    rx: Mutex<Option<QueueRx>>,
    // false once the loop has taken its final drain; publish checks it
    // under the read lock so no send can slip past the last drain
    accepting: RwLock<bool>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    delivery_errors: AtomicU64,
    last_prices: LastPriceCache,
}

#[derive(Clone)]
pub struct WeakEventBus {
    shared: Weak<Shared>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.shared.upgrade().map(|shared| EventBus { shared })
    }
}

/// Owned event bus. Clones are handles to the same bus.
///
/// Lifecycle: `new` -> `start` (spawns the dispatch loop on the current
/// tokio runtime) -> `shutdown` (delivers everything queued so far, then
/// stops). Events published before `start` are buffered.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EventBus {
    pub fn new(cfg: BusConfig) -> Result<Self, ConfigError> {
        let (tx, rx) = match cfg.queue_capacity {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
            }
            Some(0) => return Err(ConfigError::ZeroCapacity),
            Some(cap) => {
                let (tx, rx) = broadcast::channel(cap);
                (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
            }
        };
        Ok(Self::from_parts(cfg.name, tx, rx))
    }

    /// Unbounded bus with default name.
    pub fn unbounded() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::from_parts(BusConfig::default().name, QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
    }

    fn from_parts(name: String, tx: QueueTx, rx: QueueRx) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                tx,
                rx: Mutex::new(Some(rx)),
                accepting: RwLock::new(true),
                stop_tx,
                task: Mutex::new(None),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                delivery_errors: AtomicU64::new(0),
                last_prices: LastPriceCache::new(),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.shared.name }

    pub fn last_prices(&self) -> &LastPriceCache { &self.shared.last_prices }

    /// Handle that does not keep the bus alive.
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus { shared: Arc::downgrade(&self.shared) }
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<SubscriptionHandle, ConfigError>
    where
        F: FnMut(&Event) -> HandlerResult + Send + 'static,
    {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.insert(&topic, id, Box::new(handler));
        debug!(%topic, id, "subscribed");
        Ok(SubscriptionHandle { id, topic })
    }

    /// Subscription whose events are handed off to another execution context.
    /// The dispatch loop only forwards; the receiver's owner does the work,
    /// in publish order. Dropping the receiver ends the subscription.
    pub fn subscribe_handoff(
        &self,
        topic: impl Into<String>,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Event>), ConfigError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let t = topic.clone();
        self.shared.insert(
            &topic,
            id,
            Box::new(move |ev: &Event| {
                if tx.send(ev.clone()).is_err() {
                    // receiver hilang -> lepas langganan
                    if let Some(shared) = weak.upgrade() {
                        shared.remove(&t, id);
                    }
                    debug!(topic = %t, id, "handoff receiver dropped, unsubscribed");
                }
                Ok(())
            }),
        );
        Ok((SubscriptionHandle { id, topic }, rx))
    }

    /// Removes one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.shared.remove(&handle.topic, handle.id);
        if removed {
            debug!(topic = %handle.topic, id = handle.id, "unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let reg = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.topics.get(topic).map(|v| v.len()).unwrap_or(0)
    }

    /// Fire-and-forget enqueue. Safe from any thread.
    pub fn publish(&self, event: Event) {
        self.shared.publish(event);
    }

    /// Spawns the dispatch loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), ConfigError> {
        let rx = self
            .shared
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ConfigError::AlreadyStarted)?;
        let stop_rx = self.shared.stop_tx.subscribe();
        let shared = self.shared.clone();
        let handle = tokio::spawn(run_loop(shared, rx, stop_rx));
        *self.shared.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(bus = %self.shared.name, "event bus started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Delivers every event queued before the call, then stops the loop.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shared.stop_tx.send(true);
        let handle = self.shared.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                error!(?e, bus = %self.shared.name, "dispatch loop ended abnormally");
            }
            info!(bus = %self.shared.name, stats = ?self.stats(), "event bus stopped");
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            delivery_errors: self.shared.delivery_errors.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn insert(&self, topic: &str, id: u64, handler: Handler) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(Mutex::new(handler))));
    }

    fn remove(&self, topic: &str, id: u64) -> bool {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = reg.topics.get_mut(topic) else { return false };
        let before = list.len();
        list.retain(|(i, _)| *i != id);
        let removed = list.len() != before;
        if list.is_empty() {
            reg.topics.remove(topic);
        }
        removed
    }

    fn is_registered(&self, topic: &str, id: u64) -> bool {
        let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.topics.get(topic).map(|l| l.iter().any(|(i, _)| *i == id)).unwrap_or(false)
    }

    fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        EVENTS_PUBLISHED.with_label_values(&[event.category().as_str()]).inc();
        let sent = {
            let accepting = self.accepting.read().unwrap_or_else(|e| e.into_inner());
            *accepting
                && match &self.tx {
                    QueueTx::Unbounded(tx) => tx.send(event).is_ok(),
                    QueueTx::Bounded(tx) => tx.send(event).is_ok(),
                }
        };
        if !sent {
            // loop sudah berhenti
            self.count_dropped(1);
            debug!(bus = %self.name, "publish after shutdown, event dropped");
        }
    }

    fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        EVENTS_DROPPED.inc_by(n);
    }

    fn dispatch(&self, ev: &Event) {
        let handlers: Vec<(u64, SharedHandler)> = {
            let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            match reg.topics.get(&ev.topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (id, handler) in handlers {
            // an earlier handler of this same event may have removed it
            if !self.is_registered(&ev.topic, id) {
                continue;
            }
            let outcome = {
                let mut guard = handler.lock().unwrap_or_else(|e| e.into_inner());
                let f: &mut Handler = &mut guard;
                catch_unwind(AssertUnwindSafe(|| f(ev)))
            };
            match outcome {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    EVENTS_DELIVERED.inc();
                }
                Ok(Err(e)) => self.report(
                    DeliveryError::Handler { topic: ev.topic.clone(), reason: e.to_string() },
                    ev,
                ),
                Err(panic) => self.report(
                    DeliveryError::Panicked { topic: ev.topic.clone(), reason: panic_reason(&*panic) },
                    ev,
                ),
            }
        }
    }

    fn report(&self, err: DeliveryError, ev: &Event) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
        DELIVERY_ERRORS.inc();
        error!(bus = %self.name, topic = %ev.topic, error = %err, "delivery error");
        if ev.category() == Category::Error {
            return;
        }
        let mut rec = ErrorRecord::new(&self.name, DELIVERY_ERROR_ID, err.to_string());
        rec.additional_info = ev.topic.clone();
        self.publish(Event::general(Payload::Error(rec)));
    }
}

fn panic_reason(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn run_loop(shared: Arc<Shared>, mut rx: QueueRx, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            maybe_ev = rx.recv(&shared) => match maybe_ev {
                Some(ev) => shared.dispatch(&ev),
                None => break,
            },
            _ = stop_rx.changed() => {
                // drain: semua event sebelum shutdown tetap terkirim
                while let Some(ev) = rx.try_recv(&shared) {
                    shared.dispatch(&ev);
                }
                // tutup pintu, lalu ambil sisa yang sempat masuk
                *shared.accepting.write().unwrap_or_else(|e| e.into_inner()) = false;
                while let Some(ev) = rx.try_recv(&shared) {
                    shared.dispatch(&ev);
                }
                break;
            }
        }
    }
    debug!(bus = %shared.name, "dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LogRecord, Order};
    use crate::error::HandlerError;

    fn log_event(topic: &str, n: usize) -> Event {
        Event::with_topic(topic, Payload::Log(LogRecord::new("T", format!("{n}"))))
    }

    fn content(ev: &Event) -> String {
        match &ev.payload {
            Payload::Log(l) => l.log_content.clone(),
            _ => String::new(),
        }
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    fn recorder(bus: &EventBus, topic: &str) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topic, move |ev| {
            s.lock().unwrap().push(content(ev));
            Ok(())
        })
        .unwrap();
        seen
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::unbounded();
        let a = recorder(&bus, "LOG");
        let b = recorder(&bus, "LOG");
        bus.start().unwrap();
        for i in 0..100 {
            bus.publish(log_event("LOG", i));
        }
        bus.shutdown().await;
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(*a.lock().unwrap(), expected);
        assert_eq!(*b.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn exact_topic_fan_out() {
        let bus = EventBus::unbounded();
        let x = recorder(&bus, "TICK:X");
        let y = recorder(&bus, "TICK:Y");
        let general = recorder(&bus, "TICK");
        bus.start().unwrap();
        bus.publish(log_event("TICK:X", 1));
        bus.shutdown().await;
        assert_eq!(x.lock().unwrap().len(), 1);
        assert!(y.lock().unwrap().is_empty());
        assert!(general.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_published_before_start_are_buffered() {
        let bus = EventBus::unbounded();
        let seen = recorder(&bus, "LOG");
        bus.publish(log_event("LOG", 7));
        bus.start().unwrap();
        bus.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec!["7".to_string()]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = EventBus::unbounded();
        bus.subscribe("ORDER", |ev| {
            if content(ev) == "1" { Err(HandlerError::new("boom")) } else { Ok(()) }
        })
        .unwrap();
        let ok = recorder(&bus, "ORDER");
        let errors = recorder(&bus, "ERROR");
        let err_seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let es = err_seen.clone();
        bus.subscribe("ERROR", move |ev| {
            if let Payload::Error(e) = &ev.payload {
                es.lock().unwrap().push(e.additional_info.clone());
            }
            Ok(())
        })
        .unwrap();
        bus.start().unwrap();
        for i in 0..3 {
            bus.publish(log_event("ORDER", i));
        }
        bus.shutdown().await;
        assert_eq!(*ok.lock().unwrap(), vec!["0", "1", "2"]);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(*err_seen.lock().unwrap(), vec!["ORDER".to_string()]);
        assert_eq!(bus.stats().delivery_errors, 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let bus = EventBus::unbounded();
        bus.subscribe("ORDER", |ev| {
            if content(ev) == "0" {
                panic!("handler blew up");
            }
            Ok(())
        })
        .unwrap();
        let ok = recorder(&bus, "ORDER");
        bus.start().unwrap();
        bus.publish(log_event("ORDER", 0));
        bus.publish(log_event("ORDER", 1));
        bus.shutdown().await;
        assert_eq!(*ok.lock().unwrap(), vec!["0", "1"]);
        assert_eq!(bus.stats().delivery_errors, 1);
    }

    #[tokio::test]
    async fn failing_error_handler_does_not_loop() {
        let bus = EventBus::unbounded();
        bus.subscribe("ERROR", |_| Err(HandlerError::new("nope"))).unwrap();
        bus.start().unwrap();
        bus.publish(Event::general(Payload::Error(ErrorRecord::new("GW", 1, "x"))));
        bus.shutdown().await;
        let s = bus.stats();
        assert_eq!(s.published, 1);
        assert_eq!(s.delivery_errors, 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_exactly_one() {
        let bus = EventBus::unbounded();
        let a = recorder(&bus, "LOG");
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let h = bus
            .subscribe("LOG", move |ev| {
                s.lock().unwrap().push(content(ev));
                Ok(())
            })
            .unwrap();
        assert_eq!(bus.subscriber_count("LOG"), 2);
        assert!(bus.unsubscribe(&h));
        assert!(!bus.unsubscribe(&h));
        assert_eq!(bus.subscriber_count("LOG"), 1);
        bus.start().unwrap();
        bus.publish(log_event("LOG", 1));
        bus.shutdown().await;
        assert_eq!(a.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_from_inside_a_handler() {
        let bus = EventBus::unbounded();
        let other = recorder(&bus, "LOG");
        let victim: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let v = victim.clone();
        let b2 = bus.clone();
        bus.subscribe("ORDER", move |_| {
            if let Some(h) = v.lock().unwrap().take() {
                b2.unsubscribe(&h);
            }
            Ok(())
        })
        .unwrap();
        let h = bus.subscribe("LOG", |_| Ok(())).unwrap();
        *victim.lock().unwrap() = Some(h);
        bus.start().unwrap();
        bus.publish(log_event("ORDER", 0));
        bus.publish(log_event("LOG", 1));
        bus.shutdown().await;
        assert_eq!(bus.subscriber_count("LOG"), 1);
        assert_eq!(other.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_topic_rejected_at_setup() {
        let bus = EventBus::unbounded();
        assert_eq!(bus.subscribe("", |_| Ok(())).unwrap_err(), ConfigError::EmptyTopic);
        assert_eq!(bus.subscribe_handoff("").unwrap_err(), ConfigError::EmptyTopic);
        assert_eq!(
            EventBus::new(BusConfig { queue_capacity: Some(0), ..Default::default() }).unwrap_err(),
            ConfigError::ZeroCapacity
        );
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let bus = EventBus::unbounded();
        bus.start().unwrap();
        assert!(bus.is_running());
        assert_eq!(bus.start().unwrap_err(), ConfigError::AlreadyStarted);
        bus.shutdown().await;
        assert!(!bus.is_running());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn bounded_queue_counts_dropped_events() {
        let bus = EventBus::new(BusConfig { name: "B".into(), queue_capacity: Some(4) }).unwrap();
        let seen = recorder(&bus, "LOG");
        for i in 0..10 {
            bus.publish(log_event("LOG", i));
        }
        bus.start().unwrap();
        bus.shutdown().await;
        // drop-oldest: the newest four survive
        assert_eq!(*seen.lock().unwrap(), vec!["6", "7", "8", "9"]);
        let s = bus.stats();
        assert_eq!(s.published, 10);
        assert_eq!(s.dropped, 6);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_counted() {
        let bus = EventBus::unbounded();
        bus.start().unwrap();
        bus.shutdown().await;
        bus.publish(log_event("LOG", 0));
        assert_eq!(bus.stats().dropped, 1);
    }

    #[tokio::test]
    async fn every_publish_is_delivered_or_counted_around_shutdown() {
        let bus = EventBus::unbounded();
        // one subscriber per topic, and LOG handlers publish an ECHO each
        let echo = recorder(&bus, "ECHO");
        let log_seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let (b, s) = (bus.clone(), log_seen.clone());
        bus.subscribe("LOG", move |ev| {
            s.lock().unwrap().push(content(ev));
            b.publish(log_event("ECHO", 0));
            Ok(())
        })
        .unwrap();
        bus.start().unwrap();

        let producer = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    bus.publish(log_event("LOG", i));
                }
            })
        };
        tokio::task::yield_now().await;
        bus.shutdown().await;
        producer.join().unwrap();

        let s = bus.stats();
        let delivered = (log_seen.lock().unwrap().len() + echo.lock().unwrap().len()) as u64;
        assert_eq!(delivered, s.delivered);
        assert_eq!(s.published, s.delivered + s.dropped);
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_the_bus_alive() {
        let bus = EventBus::unbounded();
        let weak = bus.downgrade();
        assert!(weak.upgrade().is_some());
        drop(bus);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn handoff_preserves_order_and_ends_on_drop() {
        let bus = EventBus::unbounded();
        let (_h, mut rx) = bus.subscribe_handoff("ORDER").unwrap();
        bus.start().unwrap();
        let o = |n: usize| log_event("ORDER", n);
        bus.publish(o(1));
        bus.publish(o(2));
        assert_eq!(content(&rx.recv().await.unwrap()), "1");
        assert_eq!(content(&rx.recv().await.unwrap()), "2");
        drop(rx);
        bus.publish(o(3));
        bus.shutdown().await;
        assert_eq!(bus.subscriber_count("ORDER"), 0);
    }

    #[tokio::test]
    async fn concurrent_producers_keep_per_producer_order() {
        let bus = EventBus::unbounded();
        let seen = recorder(&bus, "LOG");
        bus.start().unwrap();
        let mut joins = Vec::new();
        for p in 0..4 {
            let b = bus.clone();
            joins.push(std::thread::spawn(move || {
                for i in 0..50 {
                    b.publish(log_event("LOG", p * 1000 + i));
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        bus.shutdown().await;
        let got: Vec<usize> = seen.lock().unwrap().iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(got.len(), 200);
        for p in 0..4 {
            let mine: Vec<usize> = got.iter().copied().filter(|v| v / 1000 == p).collect();
            let mut sorted = mine.clone();
            sorted.sort();
            assert_eq!(mine, sorted);
        }
    }

    #[test]
    fn order_payload_category() {
        let o = Order {
            symbol: "X".into(),
            exchange: "EX".into(),
            vt_symbol: "X.EX".into(),
            order_id: "1".into(),
            vt_order_id: "GW.1".into(),
            direction: crate::domain::Direction::Long,
            offset: crate::domain::Offset::Open,
            price: 1.0,
            total_volume: 1.0,
            traded_volume: 0.0,
            status: crate::domain::OrderStatus::Submitted,
            order_time: chrono::Utc::now(),
            cancel_time: None,
            gateway_name: "GW".into(),
        };
        assert_eq!(Event::general(Payload::Order(o)).topic, "ORDER");
    }
}
