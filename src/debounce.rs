//! Debounced event delivery.
//!
//! Bursts of filesystem events are coalesced per task: each submit records
//! the latest arguments under the task's name and re-arms a single timer
//! `dwell` seconds out. When the timer fires, the pending entries drain in
//! ascending config order, one callback per task, carrying the last
//! arguments seen. A non-positive dwell disables batching entirely.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::Instant;

use crate::display::display_warning;
use crate::event::ChangeEvent;
use crate::task::ForemonTask;

pub type DebounceCallback = Box<dyn Fn(Arc<ForemonTask>, ChangeEvent) + Send>;

/// Handle for submitting events. Submits are plain channel sends, so the
/// observer thread can call them directly; delivery always happens on the
/// scheduler.
#[derive(Clone)]
pub struct Debouncer {
    tx: UnboundedSender<(Arc<ForemonTask>, ChangeEvent)>,
}

impl Debouncer {
    /// Spawn the drain loop on the current runtime and return the handle.
    pub fn spawn(dwell: f64, callback: DebounceCallback) -> Debouncer {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_drain_loop(rx, dwell, callback));
        Debouncer { tx }
    }

    /// Record `ev` for `task`. Thread-safe; may be called from the
    /// observer's thread.
    pub fn submit(&self, task: Arc<ForemonTask>, ev: ChangeEvent) {
        let _ = self.tx.send((task, ev));
    }
}

struct EventContainer {
    name: String,
    task: Arc<ForemonTask>,
    ev: ChangeEvent,
    reset_count: u32,
    warn_after: u32,
}

impl EventContainer {
    fn set(&mut self, task: Arc<ForemonTask>, ev: ChangeEvent) {
        self.reset_count += 1;
        self.task = task;
        self.ev = ev;

        if self.reset_count < self.warn_after {
            return;
        }
        self.warn_after += 100;
        display_warning(format!(
            "detected high event volume - suppressed {} events",
            self.reset_count
        ));
    }
}

async fn run_drain_loop(
    mut rx: mpsc::UnboundedReceiver<(Arc<ForemonTask>, ChangeEvent)>,
    dwell: f64,
    callback: DebounceCallback,
) {
    let mut pending: Vec<EventContainer> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((task, ev)) = msg else { break };
                if dwell <= 0.0 {
                    callback(task, ev);
                    continue;
                }
                record(&mut pending, task, ev);
                deadline = Some(Instant::now() + Duration::from_secs_f64(dwell));
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                deadline = None;
                drain(&mut pending, &callback);
            }
        }
    }
}

fn record(pending: &mut Vec<EventContainer>, task: Arc<ForemonTask>, ev: ChangeEvent) {
    match pending.iter_mut().find(|c| c.name == task.name()) {
        Some(container) => container.set(task, ev),
        None => pending.push(EventContainer {
            name: task.name().to_string(),
            task,
            ev,
            reset_count: 0,
            warn_after: 100,
        }),
    }
}

fn drain(pending: &mut Vec<EventContainer>, callback: &DebounceCallback) {
    let mut containers = std::mem::take(pending);
    // Stable sort: insertion order breaks order ties.
    containers.sort_by_key(|c| c.task.config().order);
    for container in containers {
        callback(container.task, container.ev);
    }
}
