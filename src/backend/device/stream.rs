//! Device execution queue
//!
//! Submissions are non-blocking: an [`Event`] is returned at once and the
//! work is parked until every event in its wait-set has finished. Only
//! then is it handed to the queue's worker threads, so work waiting on
//! dependencies never occupies a worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use super::engine::Engine;
use super::error::{DeviceError, DeviceResult};
use super::event::{Event, EventStatus};

/// Number of workers serving an out-of-order queue
pub const OUT_OF_ORDER_WORKERS: usize = 4;

/// Ordering discipline of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    /// Every submission implicitly waits for the previous one
    #[default]
    InOrder,
    /// Only explicit dependencies order submissions
    OutOfOrder,
}

/// A unit of device work
pub type DeviceWork = Box<dyn FnOnce() -> DeviceResult<()> + Send + 'static>;

struct Task {
    deps: Vec<Event>,
    work: DeviceWork,
    done: Event,
}

impl Task {
    fn run(self) {
        // Every dependency has finished by now; `wait` only reports faults
        for dep in &self.deps {
            if let Err(e) = dep.wait() {
                let fault = DeviceError::DependencyFaulted {
                    label: dep.label().to_string(),
                    message: e.to_string(),
                };
                self.done.finish(EventStatus::Faulted(fault.to_string()));
                return;
            }
        }

        let outcome = match panic::catch_unwind(AssertUnwindSafe(self.work)) {
            Ok(Ok(())) => EventStatus::Complete,
            Ok(Err(e)) => EventStatus::Faulted(e.to_string()),
            Err(_) => EventStatus::Faulted("device work panicked".to_string()),
        };
        if let EventStatus::Faulted(message) = &outcome {
            tracing::warn!("Stream: '{}' faulted: {}", self.done.label(), message);
        }
        self.done.finish(outcome);
    }
}

/// A task parked until its outstanding dependencies finish
struct PendingTask {
    // Outstanding dependencies plus one guard held by `schedule`
    remaining: AtomicUsize,
    slot: Mutex<Option<(Task, Sender<Task>)>>,
}

impl PendingTask {
    /// Hand the task to the workers once the last dependency released it
    fn release(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let parked = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some((task, sender)) = parked else {
            return;
        };
        let done = task.done.clone();
        if sender.send(task).is_err() {
            tracing::warn!("Stream: '{}' dropped, queue workers are gone", done.label());
            done.finish(EventStatus::Faulted("queue workers are gone".to_string()));
        }
    }
}

/// Dispatch `task` to the workers once its wait-set has finished
fn schedule(task: Task, sender: Sender<Task>) {
    let deps = task.deps.clone();
    let pending = Arc::new(PendingTask {
        remaining: AtomicUsize::new(deps.len() + 1),
        slot: Mutex::new(Some((task, sender))),
    });
    for dep in &deps {
        let pending = Arc::clone(&pending);
        dep.on_finish(move || pending.release());
    }
    pending.release();
}

struct StreamInner {
    engine: Engine,
    order: QueueOrder,
    sender: Mutex<Option<Sender<Task>>>,
    // In-order queues chain every submission on the previous event
    last: Mutex<Option<Event>>,
    in_flight: Mutex<Vec<Event>>,
    submitted: AtomicUsize,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Closing the channel lets workers drain remaining work and exit
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// Device execution queue
///
/// Cloning is cheap; clones submit to the same workers.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.inner.engine.index())
            .field("order", &self.inner.order)
            .field("submitted", &self.submitted())
            .finish()
    }
}

impl Stream {
    /// Create a new queue on `engine`
    pub fn new(engine: Engine, order: QueueOrder) -> DeviceResult<Self> {
        let workers = match order {
            QueueOrder::InOrder => 1,
            QueueOrder::OutOfOrder => OUT_OF_ORDER_WORKERS,
        };
        tracing::debug!(
            "Stream::new: device {} {:?} queue with {} worker(s)",
            engine.index(),
            order,
            workers
        );

        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..workers {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("woq-dev{}-q{}", engine.index(), worker))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| {
                    DeviceError::SubmissionFailed(format!(
                        "failed to start queue worker {}: {}",
                        worker, e
                    ))
                })?;
        }

        Ok(Stream {
            inner: Arc::new(StreamInner {
                engine,
                order,
                sender: Mutex::new(Some(sender)),
                last: Mutex::new(None),
                in_flight: Mutex::new(Vec::new()),
                submitted: AtomicUsize::new(0),
            }),
        })
    }

    /// Device this queue executes on
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Ordering discipline
    pub fn order(&self) -> QueueOrder {
        self.inner.order
    }

    /// Number of units of work submitted so far
    pub fn submitted(&self) -> usize {
        self.inner.submitted.load(Ordering::Acquire)
    }

    /// Submit a unit of work that starts once every event in `deps` finished
    ///
    /// Returns immediately; the returned event completes when `work` returns.
    pub fn submit<F>(&self, label: &str, deps: &[Event], work: F) -> DeviceResult<Event>
    where
        F: FnOnce() -> DeviceResult<()> + Send + 'static,
    {
        let done = Event::pending(label);
        let mut wait_set: Vec<Event> = deps.to_vec();

        let mut last = self.inner.last.lock()?;
        if self.inner.order == QueueOrder::InOrder {
            if let Some(previous) = last.as_ref() {
                wait_set.push(previous.clone());
            }
        }

        tracing::trace!(
            "Stream::submit: '{}' (event #{}) waits on {} event(s)",
            label,
            done.id(),
            wait_set.len()
        );

        let task = Task {
            deps: wait_set,
            work: Box::new(work),
            done: done.clone(),
        };

        let sender = self.inner.sender.lock()?.clone().ok_or_else(|| {
            DeviceError::SubmissionFailed("queue has been shut down".to_string())
        })?;
        schedule(task, sender);

        *last = Some(done.clone());
        drop(last);

        let mut in_flight = self.inner.in_flight.lock()?;
        in_flight.retain(|e| !e.is_finished());
        in_flight.push(done.clone());
        self.inner.submitted.fetch_add(1, Ordering::AcqRel);

        Ok(done)
    }

    /// Block until all work submitted so far finished
    ///
    /// Returns the first fault among the finished work, if any.
    pub fn synchronize(&self) -> DeviceResult<()> {
        let pending: Vec<Event> = self.inner.in_flight.lock()?.clone();
        Event::wait_all(&pending)
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            match guard.recv() {
                Ok(task) => task,
                Err(_) => return,
            }
        };
        task.run();
    }
}
