//! Synchronous publish/subscribe channel for engine events.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::event::Event;

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;
type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Selects which events a subscriber receives.
#[derive(Clone)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Events of one type.
    Type(String),
    /// Events of any of the listed types.
    Types(Vec<String>),
    /// Events accepted by a predicate.
    Predicate(Predicate),
}

impl EventFilter {
    /// Build a predicate filter.
    pub fn predicate(f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Events carrying the given correlation ID.
    pub fn correlation(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::predicate(move |event| event.correlates_with(&id))
    }

    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Type(t) => event.event_type == *t,
            Self::Types(types) => types.iter().any(|t| event.event_type == *t),
            Self::Predicate(p) => p(event),
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Type(t) => f.debug_tuple("Type").field(t).finish(),
            Self::Types(ts) => f.debug_tuple("Types").field(ts).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for EventFilter {
    fn from(event_type: &str) -> Self {
        Self::Type(event_type.to_string())
    }
}

impl From<String> for EventFilter {
    fn from(event_type: String) -> Self {
        Self::Type(event_type)
    }
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    listener: Listener,
    active: AtomicBool,
}

#[derive(Default)]
struct Delivery {
    queue: VecDeque<Event>,
    draining: bool,
}

struct BusInner {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    // Reentrant so a listener may publish on the same thread; its event is
    // queued behind the one being delivered.
    delivery: ReentrantMutex<RefCell<Delivery>>,
}

/// Publish/subscribe channel shared by the dispatcher, query processor and
/// attribute filter loaders.
///
/// Delivery is synchronous: [`publish`](EventBus::publish) returns after
/// every matching listener has run. Events are delivered in publish order.
/// An event published from inside a listener is queued and delivered after
/// the current event has reached all its listeners.
///
/// Cloning an `EventBus` is cheap and yields a handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                delivery: ReentrantMutex::new(RefCell::new(Delivery::default())),
            }),
        }
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// Listeners that panic are logged and skipped; delivery continues with
    /// the remaining listeners.
    pub fn publish(&self, event: Event) {
        let guard = self.inner.delivery.lock();
        {
            let mut delivery = guard.borrow_mut();
            delivery.queue.push_back(event);
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }
        let _draining = Draining(&guard);

        loop {
            let next = guard.borrow_mut().queue.pop_front();
            let Some(event) = next else { break };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &Event) {
        let subscribers = self.inner.subscribers.lock().clone();
        tracing::trace!(
            event_type = %event.event_type,
            subscribers = subscribers.len(),
            "delivering event"
        );
        for subscriber in subscribers {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            // Filter predicates are user code too.
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                if subscriber.filter.matches(event) {
                    (subscriber.listener)(event);
                }
            }));
            if delivered.is_err() {
                tracing::error!(
                    event_type = %event.event_type,
                    subscriber = subscriber.id,
                    "event listener panicked"
                );
            }
        }
    }

    /// Register a listener.
    ///
    /// # Returns
    ///
    /// A [`Subscription`] guard. Dropping it (or calling
    /// [`unsubscribe`](Subscription::unsubscribe)) removes the listener;
    /// use [`detach`](Subscription::detach) to keep it for the bus's
    /// lifetime. A listener removed while an event is being delivered does
    /// not receive that event if it has not been reached yet.
    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            filter: filter.into(),
            listener: Arc::new(listener),
            active: AtomicBool::new(true),
        });
        self.inner.subscribers.lock().push(subscriber);
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Receive matching events as an async stream.
    ///
    /// Events are buffered without bound until the stream is polled. The
    /// subscription ends when the stream is dropped.
    pub fn stream(&self, filter: impl Into<EventFilter>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(filter, move |event| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            events: UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }

    /// Number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Clears the draining flag when delivery ends, including by unwinding.
struct Draining<'a>(&'a RefCell<Delivery>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().draining = false;
    }
}

fn remove_subscriber(inner: &BusInner, id: u64) {
    let mut subscribers = inner.subscribers.lock();
    if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
        let removed = subscribers.remove(pos);
        removed.active.store(false, Ordering::Release);
    }
}

/// Guard returned by [`EventBus::subscribe`]; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: Option<u64>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {}

    /// Keep the listener registered for as long as the bus lives.
    pub fn detach(mut self) {
        self.id = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let (Some(id), Some(bus)) = (self.id, self.bus.upgrade()) {
            remove_subscriber(&bus, id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Stream of events returned by [`EventBus::stream`].
pub struct EventStream {
    events: UnboundedReceiverStream<Event>,
    _subscription: Subscription,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
