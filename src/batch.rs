//! Debounced delivery of computed feedback values.
//!
//! Values are coalesced per instance id (latest wins) and flushed as one
//! batch: no sooner than the quiet period after the most recent value, and no
//! later than the ceiling after the first value of the batch, so a steady
//! stream of changes cannot starve delivery.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::types::FeedbackValue;

pub const DEFAULT_QUIET: Duration = Duration::from_millis(5);
pub const DEFAULT_CEILING: Duration = Duration::from_millis(25);

/// Sink for one flushed batch.
pub type FlushFn = Box<dyn Fn(Vec<FeedbackValue>) + Send>;

/// Two timers drive the machine: the quiet deadline is reset on every new
/// value, the ceiling is fixed when the first value of a batch arrives.
enum BatchState {
    Idle,
    Pending { first_at: Instant, quiet_until: Instant },
}

/// Handle feeding the batcher task. Dropping every handle flushes whatever is
/// still pending and stops the task.
#[derive(Clone)]
pub struct ValueBatcher {
    tx: mpsc::UnboundedSender<FeedbackValue>,
}

impl ValueBatcher {
    pub fn spawn(quiet: Duration, ceiling: Duration, flush: FlushFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(batch_loop(rx, quiet, ceiling, flush));
        Self { tx }
    }

    /// Record the latest value for an instance. Intermediate values are
    /// overwritten, never queued.
    pub fn push(&self, value: FeedbackValue) {
        let _ = self.tx.send(value);
    }
}

async fn batch_loop(
    mut rx: mpsc::UnboundedReceiver<FeedbackValue>,
    quiet: Duration,
    ceiling: Duration,
    flush: FlushFn,
) {
    let mut pending: HashMap<String, FeedbackValue> = HashMap::new();
    let mut state = BatchState::Idle;

    loop {
        match state {
            BatchState::Idle => match rx.recv().await {
                Some(value) => {
                    let now = Instant::now();
                    pending.insert(value.id.clone(), value);
                    state = BatchState::Pending { first_at: now, quiet_until: now + quiet };
                }
                None => break,
            },
            BatchState::Pending { first_at, quiet_until } => {
                let deadline = quiet_until.min(first_at + ceiling);
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(value) => {
                            pending.insert(value.id.clone(), value);
                            state = BatchState::Pending {
                                first_at,
                                quiet_until: Instant::now() + quiet,
                            };
                        }
                        None => {
                            flush_now(&mut pending, &flush);
                            break;
                        }
                    },
                    _ = sleep_until(deadline) => {
                        flush_now(&mut pending, &flush);
                        state = BatchState::Idle;
                    }
                }
            }
        }
    }
}

fn flush_now(pending: &mut HashMap<String, FeedbackValue>, flush: &FlushFn) {
    if pending.is_empty() {
        return;
    }
    let values: Vec<FeedbackValue> = pending.drain().map(|(_, v)| v).collect();
    debug!(count = values.len(), "flushing feedback value batch");
    flush(values);
}
