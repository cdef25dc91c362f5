//! Completion events for work submitted to a device queue

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::error::{DeviceError, DeviceResult};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a unit of work as seen through its event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Submitted, not finished
    Pending,
    /// Finished successfully
    Complete,
    /// Finished with a device-side fault
    Faulted(String),
}

/// Callback run once when an event leaves `Pending`
type Continuation = Box<dyn FnOnce() + Send + 'static>;

struct EventState {
    status: EventStatus,
    continuations: Vec<Continuation>,
}

struct EventInner {
    id: u64,
    label: String,
    state: Mutex<EventState>,
    signal: Condvar,
}

/// Completion handle for a pending unit of device work
///
/// Events are cheap to clone and are passed as dependency lists to later
/// submissions. Unlike a raw runtime event, clones share state: completing
/// or faulting the work is observed by every clone.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(super) fn pending(label: impl Into<String>) -> Self {
        Event {
            inner: Arc::new(EventInner {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::AcqRel),
                label: label.into(),
                state: Mutex::new(EventState {
                    status: EventStatus::Pending,
                    continuations: Vec::new(),
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete
    pub fn completed(label: impl Into<String>) -> Self {
        let event = Event::pending(label);
        event.finish(EventStatus::Complete);
        event
    }

    /// Unique event id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Label of the unit of work this event tracks
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn lock_state(&self) -> MutexGuard<'_, EventState> {
        // A poisoned state still holds the last written status
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current status without blocking
    pub fn status(&self) -> EventStatus {
        self.lock_state().status.clone()
    }

    /// True once the work finished, successfully or not
    pub fn is_finished(&self) -> bool {
        !matches!(self.lock_state().status, EventStatus::Pending)
    }

    /// True once the work finished successfully
    pub fn is_complete(&self) -> bool {
        matches!(self.lock_state().status, EventStatus::Complete)
    }

    /// Block the calling thread until the work finishes
    ///
    /// Returns the device-side fault if the work (or one of its
    /// dependencies) failed.
    pub fn wait(&self) -> DeviceResult<()> {
        let mut state = self.inner.state.lock()?;
        while matches!(state.status, EventStatus::Pending) {
            state = self.inner.signal.wait(state)?;
        }
        match &state.status {
            EventStatus::Faulted(message) => Err(DeviceError::ExecutionFault(format!(
                "{} (event #{} '{}')",
                message, self.inner.id, self.inner.label
            ))),
            _ => Ok(()),
        }
    }

    /// Wait for every event, returning the first fault encountered
    pub fn wait_all(events: &[Event]) -> DeviceResult<()> {
        let mut first_fault = None;
        for event in events {
            if let Err(e) = event.wait() {
                first_fault.get_or_insert(e);
            }
        }
        match first_fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `f` once this event finishes; immediately if it already has
    ///
    /// `f` runs on the thread that finishes the event, after waiters were
    /// woken, so it must not block.
    pub(super) fn on_finish(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.lock_state();
        if matches!(state.status, EventStatus::Pending) {
            state.continuations.push(Box::new(f));
            return;
        }
        drop(state);
        f();
    }

    pub(super) fn finish(&self, outcome: EventStatus) {
        let mut state = self.lock_state();
        if !matches!(state.status, EventStatus::Pending) {
            return;
        }
        tracing::trace!(
            "Event #{} '{}' finished: {:?}",
            self.inner.id,
            self.inner.label,
            outcome
        );
        state.status = outcome;
        let continuations = std::mem::take(&mut state.continuations);
        drop(state);
        self.inner.signal.notify_all();
        for continuation in continuations {
            continuation();
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_completed_event_does_not_block() {
        let event = Event::completed("noop");
        assert!(event.is_complete());
        assert!(event.wait().is_ok());
    }

    #[test]
    fn test_wait_observes_completion_from_other_thread() {
        let event = Event::pending("work");
        let remote = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.finish(EventStatus::Complete);
        });
        event.wait().unwrap();
        assert!(event.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_fault_surfaces_through_wait() {
        let event = Event::pending("bad kernel");
        event.finish(EventStatus::Faulted("nibble out of range".to_string()));
        let err = event.wait().unwrap_err();
        assert!(err.to_string().contains("nibble out of range"));
        assert!(event.is_finished());
        assert!(!event.is_complete());
    }

    #[test]
    fn test_first_outcome_wins() {
        let event = Event::pending("work");
        event.finish(EventStatus::Complete);
        event.finish(EventStatus::Faulted("late".to_string()));
        assert_eq!(event.status(), EventStatus::Complete);
    }

    #[test]
    fn test_on_finish_runs_once_after_completion() {
        let event = Event::pending("work");
        let (tx, rx) = std::sync::mpsc::channel();
        let early = tx.clone();
        event.on_finish(move || early.send("early").unwrap());
        assert!(rx.try_recv().is_err());

        event.finish(EventStatus::Complete);
        assert_eq!(rx.try_recv().unwrap(), "early");
        event.finish(EventStatus::Faulted("late".to_string()));
        assert!(rx.try_recv().is_err());

        // Registered after the fact: runs immediately
        event.on_finish(move || tx.send("late").unwrap());
        assert_eq!(rx.try_recv().unwrap(), "late");
    }

    #[test]
    fn test_wait_all_reports_fault() {
        let ok = Event::completed("ok");
        let bad = Event::pending("bad");
        bad.finish(EventStatus::Faulted("boom".to_string()));
        assert!(Event::wait_all(&[ok.clone()]).is_ok());
        assert!(Event::wait_all(&[ok, bad]).is_err());
    }
}
