//! Request/reply correlation.
//!
//! Pending requests are keyed by their exact serialized command text, which
//! the device echoes in the reply header. Identical commands issued while one
//! is outstanding share a single entry and receive the same outcome.
//!
//! Every enqueue arms its own timer, but expiry removes the shared entry, so a
//! timer firing rejects every caller sharing that entry, including callers
//! whose own deadline has not yet passed.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::error::{RequestError, RequestResult};
use super::value::OptionResult;

/// Result delivered to every caller waiting on a request.
pub type Outcome = RequestResult<Vec<OptionResult>>;

type Completion = Shared<BoxFuture<'static, Outcome>>;

struct PendingRequest {
    generation: u64,
    waiters: usize,
    sender: oneshot::Sender<Outcome>,
    completion: Completion,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, PendingRequest>,
    next_generation: u64,
}

/// One caller's handle on a pending request.
pub struct Waiter {
    command: String,
    generation: u64,
    primary: bool,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl Waiter {
    /// Serialized command text this waiter is keyed by.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// True for the caller that created the entry and must write the command.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Wait for the shared outcome.
    pub async fn outcome(&self) -> Outcome {
        self.completion.clone().await
    }
}

/// Table of in-flight commands.
#[derive(Clone, Default)]
pub struct Correlator {
    table: Arc<Mutex<Table>>,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `command`.
    ///
    /// Must be called within a tokio runtime; the timeout runs as a task.
    pub fn enqueue(&self, command: &str, timeout: Duration) -> Waiter {
        let (generation, primary, completion) = {
            let mut table = self.table.lock();
            match table.entries.get_mut(command) {
                Some(pending) => {
                    pending.waiters += 1;
                    (pending.generation, false, pending.completion.clone())
                }
                None => {
                    let generation = table.next_generation;
                    table.next_generation += 1;
                    let (sender, receiver) = oneshot::channel();
                    let completion = receiver
                        .map(|received| received.unwrap_or(Err(RequestError::Connectivity)))
                        .boxed()
                        .shared();
                    table.entries.insert(
                        command.to_string(),
                        PendingRequest {
                            generation,
                            waiters: 1,
                            sender,
                            completion: completion.clone(),
                        },
                    );
                    (generation, true, completion)
                }
            }
        };

        let timer = arm_timer(
            Arc::downgrade(&self.table),
            command.to_string(),
            generation,
            timeout,
        );

        Waiter {
            command: command.to_string(),
            generation,
            primary,
            completion,
            timer: Some(timer),
        }
    }

    /// Complete the request for `command`. Returns false if nothing was pending.
    pub fn resolve(&self, command: &str, outcome: Outcome) -> bool {
        let pending = self.table.lock().entries.remove(command);
        match pending {
            Some(pending) => {
                let _ = pending.sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove and reject the entry `waiter` belongs to.
    pub fn cancel(&self, waiter: &Waiter, error: RequestError) -> bool {
        let pending = remove_generation(&mut self.table.lock(), &waiter.command, waiter.generation);
        match pending {
            Some(pending) => {
                let _ = pending.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop one caller's interest. The table entry itself stays until it is
    /// resolved, cancelled or timed out.
    pub fn release(&self, mut waiter: Waiter) {
        if let Some(timer) = waiter.timer.take() {
            timer.abort();
        }
        let mut table = self.table.lock();
        if let Some(pending) = table.entries.get_mut(&waiter.command) {
            if pending.generation == waiter.generation {
                pending.waiters = pending.waiters.saturating_sub(1);
            }
        }
    }

    /// Reject every pending request with `error`.
    pub fn reject_all(&self, error: RequestError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table.lock();
            table.entries.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.sender.send(Err(error.clone()));
        }
        count
    }

    /// Number of distinct pending commands.
    pub fn pending_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Number of callers waiting on `command`, if it is pending.
    pub fn waiter_count(&self, command: &str) -> Option<usize> {
        self.table
            .lock()
            .entries
            .get(command)
            .map(|pending| pending.waiters)
    }
}

fn remove_generation(table: &mut Table, command: &str, generation: u64) -> Option<PendingRequest> {
    match table.entries.get(command) {
        Some(pending) if pending.generation == generation => table.entries.remove(command),
        _ => None,
    }
}

fn arm_timer(
    table: Weak<Mutex<Table>>,
    command: String,
    generation: u64,
    timeout: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(table) = table.upgrade() else {
            return;
        };
        let expired = remove_generation(&mut table.lock(), &command, generation);
        if let Some(pending) = expired {
            tracing::warn!(%command, waiters = pending.waiters, "request timed out");
            let _ = pending.sender.send(Err(RequestError::Timeout { command }));
        }
    })
    .abort_handle()
}
