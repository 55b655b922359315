//! Synchronous in-process event bus with trace-ID propagation.
//!
//! The bus dispatches [`Event`]s to subscribed handlers in priority order,
//! isolates handler failures, and keeps bounded per-type statistics plus a
//! ring buffer of recent events.
//!
//! # Example
//!
//! ```
//! use sboxpipe_events::EventBus;
//! use serde_json::json;
//!
//! let bus = EventBus::new();
//! bus.subscribe("subscription.fetched", 0, |event| {
//!     assert_eq!(event.event_type, "subscription.fetched");
//!     Ok(())
//! });
//! bus.emit_typed("subscription.fetched", "pipeline", json!({"bytes": 42}));
//! assert_eq!(bus.statistics().emitted("subscription.fetched"), 1);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use sboxpipe_types::{Event, EventPriority};
use serde_json::Value;

pub mod trace;

/// Default bound on the recent-events ring buffer.
pub const RING_CAPACITY: usize = 1000;

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: u64,
    priority: i32,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<String, Vec<HandlerEntry>>,
    next_handler_id: u64,
    emitted: BTreeMap<String, u64>,
    handler_errors: BTreeMap<String, u64>,
    recent: VecDeque<Event>,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default)]
pub struct BusStatistics {
    emitted: BTreeMap<String, u64>,
    handler_errors: BTreeMap<String, u64>,
    recent: Vec<Event>,
}

impl BusStatistics {
    pub fn emitted(&self, event_type: &str) -> u64 {
        self.emitted.get(event_type).copied().unwrap_or(0)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.values().sum()
    }

    pub fn handler_errors(&self, event_type: &str) -> u64 {
        self.handler_errors.get(event_type).copied().unwrap_or(0)
    }

    pub fn total_handler_errors(&self) -> u64 {
        self.handler_errors.values().sum()
    }

    /// Recent events, oldest first, bounded by [`RING_CAPACITY`].
    pub fn recent(&self) -> &[Event] {
        &self.recent
    }
}

/// Synchronous publish/dispatch bus.
///
/// Handlers of one event type run in descending priority order; equal
/// priorities fire in subscription order. A failing handler is counted and
/// skipped; it never prevents later handlers from running.
pub struct EventBus {
    state: Mutex<BusState>,
    ring_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_ring_capacity(RING_CAPACITY)
    }

    pub fn with_ring_capacity(ring_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            ring_capacity,
        }
    }

    /// Process-wide bus shared by pipeline stages and event sinks.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    pub fn subscribe<F>(&self, event_type: &str, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        let id = state.next_handler_id;
        state.next_handler_id += 1;
        state
            .handlers
            .entry(event_type.to_string())
            .or_default()
            .push(HandlerEntry {
                id,
                priority,
                handler: Arc::new(handler),
            });
        HandlerId(id)
    }

    /// Returns true when a handler was removed.
    pub fn unsubscribe(&self, event_type: &str, handler: HandlerId) -> bool {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        let Some(entries) = state.handlers.get_mut(event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != handler.0);
        entries.len() != before
    }

    /// Dispatch an event to every handler of its type.
    ///
    /// The subscriber table lock is released before handlers run, so
    /// handlers may emit further events.
    pub fn emit(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            *state.emitted.entry(event.event_type.clone()).or_insert(0) += 1;
            if self.ring_capacity > 0 {
                if state.recent.len() == self.ring_capacity {
                    state.recent.pop_front();
                }
                state.recent.push_back(event.clone());
            }

            match state.handlers.get_mut(&event.event_type) {
                Some(entries) => {
                    // Descending priority; stable, so equal priorities keep
                    // subscription order.
                    entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
                    entries.iter().map(|e| Arc::clone(&e.handler)).collect()
                }
                None => Vec::new(),
            }
        };

        let mut failures = 0u64;
        for handler in handlers {
            if handler(&event).is_err() {
                failures += 1;
            }
        }

        if failures > 0 {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            *state
                .handler_errors
                .entry(event.event_type.clone())
                .or_insert(0) += failures;
        }
    }

    /// Build and emit an event with a fresh id, the current timestamp and
    /// the ambient trace id.
    pub fn emit_typed(&self, event_type: &str, source: &str, data: Value) {
        self.emit_with_priority(event_type, source, EventPriority::Normal, data);
    }

    pub fn emit_with_priority(
        &self,
        event_type: &str,
        source: &str,
        priority: EventPriority,
        data: Value,
    ) {
        self.emit(new_event(event_type, source, priority, data));
    }

    pub fn statistics(&self) -> BusStatistics {
        let state = self.state.lock().expect("event bus lock poisoned");
        BusStatistics {
            emitted: state.emitted.clone(),
            handler_errors: state.handler_errors.clone(),
            recent: state.recent.iter().cloned().collect(),
        }
    }
}

/// Construct an event carrying the ambient trace id (or a fresh one when
/// no trace scope is active).
pub fn new_event(event_type: &str, source: &str, priority: EventPriority, data: Value) -> Event {
    Event {
        id: trace::short_token(),
        event_type: event_type.to_string(),
        source: source.to_string(),
        timestamp: chrono::Utc::now(),
        priority,
        trace_id: trace::current_trace_id().unwrap_or_else(trace::generate_trace_id),
        data,
    }
}
