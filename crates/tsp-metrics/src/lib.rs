//! Process-wide counter sink.
//!
//! Every pipeline stage reports into a shared registry of named counters and
//! gauges. A counter is addressed by its metric name plus an optional tag
//! suffix in `k=v k2=v2` form, e.g. `("decoder.Errors", "type=Syntax")`.
//! The registry is write-mostly: stages increment, and the self-metrics
//! exporter snapshots everything on a fixed cadence.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// A cheaply clonable handle to one registered counter.
#[derive(Clone)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn incr(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

type GaugeFn = Box<dyn Fn() -> i64 + Send + Sync>;

/// A registry of counters and gauges keyed by `(name, tags)`.
pub struct Sink {
    counters: DashMap<(String, String), Arc<AtomicI64>>,
    gauges: DashMap<(String, String), GaugeFn>,
}

impl Sink {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
        }
    }

    /// Return the counter registered under `name` + `tags`, creating it on
    /// first use. `tags` is empty for an untagged counter.
    pub fn counter(&self, name: &str, tags: &str) -> Counter {
        let value = self
            .counters
            .entry((name.to_string(), tags.to_string()))
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .value()
            .clone();
        Counter { value }
    }

    /// Register a gauge sampled at snapshot time. A second registration under
    /// the same key replaces the first.
    pub fn register_gauge(
        &self,
        name: &str,
        tags: &str,
        f: impl Fn() -> i64 + Send + Sync + 'static,
    ) {
        self.gauges
            .insert((name.to_string(), tags.to_string()), Box::new(f));
    }

    /// Visit every counter and gauge with its current value. Iteration order
    /// is unspecified.
    pub fn for_each(&self, mut f: impl FnMut(&str, &str, i64)) {
        for entry in self.counters.iter() {
            let (name, tags) = entry.key();
            f(name, tags, entry.value().load(Ordering::Relaxed));
        }
        for entry in self.gauges.iter() {
            let (name, tags) = entry.key();
            f(name, tags, (entry.value())());
        }
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<Sink> = Lazy::new(Sink::new);

/// The process-wide sink.
pub fn global() -> &'static Sink {
    &GLOBAL
}

/// Shorthand for a counter in the process-wide sink.
pub fn counter(name: &str, tags: &str) -> Counter {
    global().counter(name, tags)
}

/// Shorthand for a gauge in the process-wide sink.
pub fn register_gauge(name: &str, tags: &str, f: impl Fn() -> i64 + Send + Sync + 'static) {
    global().register_gauge(name, tags, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_shared_by_key() {
        let sink = Sink::new();
        let a = sink.counter("errors", "type=Syntax");
        let b = sink.counter("errors", "type=Syntax");
        a.incr();
        b.add(2);
        assert_eq!(a.get(), 3);
    }

    #[test]
    fn test_counter_distinct_tags() {
        let sink = Sink::new();
        let a = sink.counter("errors", "type=Syntax");
        let b = sink.counter("errors", "type=Order");
        a.incr();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 0);
    }

    #[test]
    fn test_gauge_sampled_at_snapshot() {
        let sink = Sink::new();
        let live = Arc::new(AtomicI64::new(7));
        let live2 = live.clone();
        sink.register_gauge("queue", "", move || live2.load(Ordering::Relaxed));

        let mut seen = Vec::new();
        sink.for_each(|name, tags, value| seen.push((name.to_string(), tags.to_string(), value)));
        assert_eq!(seen, vec![("queue".to_string(), String::new(), 7)]);

        live.store(9, Ordering::Relaxed);
        let mut seen = Vec::new();
        sink.for_each(|_, _, value| seen.push(value));
        assert_eq!(seen, vec![9]);
    }

    #[test]
    fn test_for_each_sees_all_entries() {
        let sink = Sink::new();
        sink.counter("a", "").incr();
        sink.counter("b", "x=y").add(5);
        sink.register_gauge("c", "", || -1);

        let mut seen = Vec::new();
        sink.for_each(|name, tags, value| seen.push((name.to_string(), tags.to_string(), value)));
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), String::new(), 1),
                ("b".to_string(), "x=y".to_string(), 5),
                ("c".to_string(), String::new(), -1),
            ]
        );
    }
}
