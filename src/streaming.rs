//! SSE streaming layer.
//!
//! Three pieces: an [`ActivityCounter`] the orchestrator bumps around real
//! work (never around bare publishing), an
//! [`IdleWaiter`] built on top of it that a per-request task awaits to know
//! when to close the response, and a [`StreamingLayer`] that fans wire lines
//! out to connected subscribers with bounded buffers and drop-on-slow-client
//! backpressure.

use crate::event_bus::{BusPayload, Channel, EventBus};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// World-wide in-flight-work counter. Only the orchestrator touches this —
/// an agent turn or tool execution brackets its work with
/// `begin()`/`complete()`.
#[derive(Default)]
pub struct ActivityCounter {
    count: AtomicI64,
}

impl ActivityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn complete(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.count.load(Ordering::SeqCst) <= 0
    }
}

/// Per-SSE-request idle detector. Resolves either when `main_timeout`
/// elapses with no activity at all, or once the world returns to idle and
/// stays idle for `grace_period`.
pub struct IdleWaiter {
    activity: Arc<ActivityCounter>,
    main_timeout: Duration,
    grace_period: Duration,
    notify: Arc<Notify>,
}

impl IdleWaiter {
    /// `notify` is typically `World`'s shared activity notifier so every
    /// connection's waiter wakes on the same qualifying events, rather than
    /// each owning an isolated `Notify` only it can signal.
    pub fn new(activity: Arc<ActivityCounter>, notify: Arc<Notify>, main_timeout: Duration, grace_period: Duration) -> Self {
        Self {
            activity,
            main_timeout,
            grace_period,
            notify,
        }
    }

    /// Called on every qualifying activity (stream start/chunk/end,
    /// tool-start/end, tool-stream) to extend the idle window.
    pub fn notify_activity(&self) {
        self.notify.notify_waiters();
    }

    /// Blocks until the request should complete.
    pub async fn wait(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.main_timeout) => return,
                _ = self.notify.notified() => {}
            }
            if !self.activity.is_idle() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.grace_period) => {
                    if self.activity.is_idle() {
                        return;
                    }
                }
                _ = self.notify.notified() => {}
            }
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<String>,
}

/// Fans wire-formatted SSE lines out to connected
/// clients. One instance per world.
pub struct StreamingLayer {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    buffer_capacity: usize,
}

impl StreamingLayer {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            buffer_capacity,
        }
    }

    /// Registers a new client connection, returning its id (for
    /// `unsubscribe`) and the receiving half of its bounded channel.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().expect("streaming layer poisoned").push(Subscriber { id, sender: tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("streaming layer poisoned")
            .retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("streaming layer poisoned").len()
    }

    /// Sends `line` to every subscriber. A subscriber whose buffer is full
    /// is dropped outright rather than letting a slow client stall the bus.
    fn broadcast_line(&self, line: String) {
        let mut subs = self.subscribers.lock().expect("streaming layer poisoned");
        subs.retain(|s| match s.sender.try_send(line.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("sse subscriber {} backpressured off, dropping connection", s.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Wires a [`StreamingLayer`] to a world's [`EventBus`]: every `sse`,
/// `message`, and `system` publish is serialized to its wire line and
/// broadcast to subscribers. Returns the bus's unsubscribe tokens so the
/// caller can tear the wiring down when the world is deleted.
pub fn attach_streaming(bus: &EventBus, layer: Arc<StreamingLayer>) -> Vec<crate::event_bus::Unsubscribe> {
    let mut tokens = Vec::new();

    let sse_layer = layer.clone();
    tokens.push(bus.subscribe(Channel::Sse, move |payload| {
        let layer = sse_layer.clone();
        async move {
            if let BusPayload::Sse(envelope) = payload {
                layer.broadcast_line(envelope.to_wire_line());
            }
        }
    }));

    let system_layer = layer.clone();
    tokens.push(bus.subscribe(Channel::System, move |payload| {
        let layer = system_layer.clone();
        async move {
            if let BusPayload::System(msg) = payload {
                let line = serde_json::json!({
                    "type": "system",
                    "level": msg.level,
                    "category": msg.category,
                    "message": msg.message,
                })
                .to_string();
                layer.broadcast_line(format!("data: {}", line));
            }
        }
    }));

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn activity_counter_tracks_idle() {
        let counter = ActivityCounter::new();
        assert!(counter.is_idle());
        counter.begin();
        assert!(!counter.is_idle());
        counter.complete();
        assert!(counter.is_idle());
    }

    #[tokio::test]
    async fn idle_waiter_resolves_on_main_timeout_without_activity() {
        let counter = Arc::new(ActivityCounter::new());
        let waiter = IdleWaiter::new(counter, Arc::new(Notify::new()), StdDuration::from_millis(20), StdDuration::from_secs(5));
        let started = tokio::time::Instant::now();
        waiter.wait().await;
        assert!(started.elapsed() >= StdDuration::from_millis(20));
    }

    #[tokio::test]
    async fn idle_waiter_resolves_after_grace_period_once_idle() {
        let counter = Arc::new(ActivityCounter::new());
        counter.begin();
        let waiter = IdleWaiter::new(counter.clone(), Arc::new(Notify::new()), StdDuration::from_secs(5), StdDuration::from_millis(20));
        let c2 = counter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
            c2.complete();
        });
        waiter.notify_activity();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        waiter.notify_activity();
        waiter.wait().await;
        assert!(counter.is_idle());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_instead_of_blocking() {
        let layer = StreamingLayer::new(1);
        let (id, mut rx) = layer.subscribe();
        layer.broadcast_line("one".to_string());
        layer.broadcast_line("two".to_string());
        assert_eq!(layer.subscriber_count(), 0, "full buffer should have dropped the subscriber");
        let _ = id;
        assert_eq!(rx.recv().await, Some("one".to_string()));
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_subscriber() {
        let layer = StreamingLayer::new(4);
        let (id, _rx) = layer.subscribe();
        assert_eq!(layer.subscriber_count(), 1);
        layer.unsubscribe(id);
        assert_eq!(layer.subscriber_count(), 0);
    }
}
