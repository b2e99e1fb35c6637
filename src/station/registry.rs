//! Event subscription registry and dispatcher.
//!
//! Many local consumers may watch one object id; the device only needs to be
//! told about the first and the last of them. `subscribe`/`unsubscribe`
//! report those 0→1 and 1→0 transitions so the controller can issue the
//! matching remote `request`/`release` commands.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::value::{ObjectId, ObjectOption, OptionResult};

/// Capability to receive decoded events for an object id.
pub trait EventSink: Send + Sync {
    /// Handle the options of one event row addressed to `id`.
    fn on_event(&self, id: ObjectId, options: &[ObjectOption]) -> anyhow::Result<()>;
}

impl<F> EventSink for F
where
    F: Fn(ObjectId, &[ObjectOption]) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, id: ObjectId, options: &[ObjectOption]) -> anyhow::Result<()> {
        self(id, options)
    }
}

/// Shared handle to a consumer; identity is the allocation.
pub type SinkHandle = Arc<dyn EventSink>;

/// A consumer failure caught during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    /// Object id of the event row
    pub id: ObjectId,
    /// Failure description
    pub message: String,
}

fn same_sink(a: &SinkHandle, b: &SinkHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Consumers keyed by object id.
#[derive(Default)]
pub struct EventRegistry {
    subscriptions: Mutex<HashMap<ObjectId, Vec<SinkHandle>>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `sink` for `id`. Returns true if it is the first consumer of `id`.
    pub fn subscribe(&self, id: ObjectId, sink: SinkHandle) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let sinks = subscriptions.entry(id).or_default();
        if sinks.iter().any(|existing| same_sink(existing, &sink)) {
            return false;
        }
        sinks.push(sink);
        sinks.len() == 1
    }

    /// Remove `sink` from `id`. Returns true if `id` has no consumers left.
    pub fn unsubscribe(&self, id: ObjectId, sink: &SinkHandle) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(sinks) = subscriptions.get_mut(&id) else {
            return false;
        };
        let before = sinks.len();
        sinks.retain(|existing| !same_sink(existing, sink));
        if sinks.len() == before {
            return false;
        }
        if sinks.is_empty() {
            subscriptions.remove(&id);
            true
        } else {
            false
        }
    }

    /// Ids with at least one consumer, ascending.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.subscriptions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of consumers for `id`.
    pub fn consumer_count(&self, id: ObjectId) -> usize {
        self.subscriptions.lock().get(&id).map_or(0, Vec::len)
    }

    /// Deliver each result row to the consumers of its id.
    ///
    /// Consumers run outside the lock, so they may subscribe or unsubscribe.
    /// A failing or panicking consumer is reported and skipped.
    pub fn dispatch(&self, results: &[OptionResult]) -> Vec<DispatchError> {
        let mut failures = Vec::new();
        for result in results {
            let sinks: Vec<SinkHandle> = match self.subscriptions.lock().get(&result.id) {
                Some(sinks) => sinks.clone(),
                None => {
                    tracing::trace!(id = result.id, "event without consumer");
                    continue;
                }
            };

            for sink in sinks {
                let delivered =
                    catch_unwind(AssertUnwindSafe(|| sink.on_event(result.id, &result.options)));
                let message = match delivered {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => format!("{err:#}"),
                    Err(panic) => panic_message(panic.as_ref()),
                };
                tracing::warn!(id = result.id, %message, "event consumer failed");
                failures.push(DispatchError {
                    id: result.id,
                    message,
                });
            }
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("consumer panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("consumer panicked: {text}")
    } else {
        "consumer panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn recorder() -> (SinkHandle, Arc<PlMutex<Vec<(ObjectId, Vec<ObjectOption>)>>>) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let log = seen.clone();
        let sink: SinkHandle =
            Arc::new(move |id: ObjectId, options: &[ObjectOption]| -> anyhow::Result<()> {
                log.lock().push((id, options.to_vec()));
                Ok(())
            });
        (sink, seen)
    }

    #[test]
    fn transitions_are_reported_once() {
        let registry = EventRegistry::new();
        let (a, _) = recorder();
        let (b, _) = recorder();

        assert!(registry.subscribe(1002, a.clone()));
        assert!(!registry.subscribe(1002, b.clone()));
        assert!(!registry.subscribe(1002, a.clone()));
        assert_eq!(registry.consumer_count(1002), 2);

        assert!(!registry.unsubscribe(1002, &a));
        assert!(!registry.unsubscribe(1002, &a));
        assert!(registry.unsubscribe(1002, &b));
        assert!(!registry.unsubscribe(1002, &b));
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn dispatch_routes_by_id() {
        let registry = EventRegistry::new();
        let (engine, engine_seen) = recorder();
        let (station, station_seen) = recorder();
        registry.subscribe(1002, engine);
        registry.subscribe(1, station);

        let func = ObjectOption::named("func").with(3).with(1);
        let failures = registry.dispatch(&[
            OptionResult::new(1002, vec![func.clone()]),
            OptionResult::new(77, vec![ObjectOption::named("ignored")]),
        ]);
        assert!(failures.is_empty());
        assert_eq!(*engine_seen.lock(), vec![(1002, vec![func])]);
        assert!(station_seen.lock().is_empty());
        assert_eq!(registry.ids(), vec![1, 1002]);
    }

    #[test]
    fn failing_consumer_does_not_stop_dispatch() {
        let registry = EventRegistry::new();
        let failing: SinkHandle =
            Arc::new(|_id: ObjectId, _options: &[ObjectOption]| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("view disposed"))
            });
        let panicking: SinkHandle =
            Arc::new(|_id: ObjectId, _options: &[ObjectOption]| -> anyhow::Result<()> {
                panic!("boom")
            });
        let (healthy, seen) = recorder();
        registry.subscribe(5, failing);
        registry.subscribe(5, panicking);
        registry.subscribe(5, healthy);

        let failures = registry.dispatch(&[
            OptionResult::new(5, vec![ObjectOption::named("speed").with(10)]),
            OptionResult::new(5, vec![ObjectOption::named("speed").with(0)]),
        ]);
        assert_eq!(failures.len(), 4);
        assert_eq!(failures[0].message, "view disposed");
        assert!(failures[1].message.contains("boom"));
        assert_eq!(seen.lock().len(), 2);
    }
}
