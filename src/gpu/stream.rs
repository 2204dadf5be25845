//! In-order execution streams and completion events.
//!
//! A [`Stream`] owns one worker thread that runs enqueued operations
//! strictly in submission order, the way a device stream does. Work on two
//! different streams overlaps. An [`Event`] marks a point in a stream and
//! carries the instant it was reached, which is how per-stream elapsed time
//! is measured.
//!
//! Once an operation fails or panics the stream is faulted: the remaining
//! queue is dropped, every pending event on it fails, and further enqueues
//! are refused.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ErrorClass;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to spawn stream worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream {0} is faulted")]
    Faulted(String),

    #[error("Stream {0} is closed")]
    Closed(String),

    #[error("Event was dropped before completion")]
    EventFailed,

    #[error("Stream operation failed: {0}")]
    OpFailed(String),
}

impl StreamError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Device
    }
}

type Op = Box<dyn FnOnce() -> Result<(), StreamError> + Send + 'static>;

#[derive(Debug, Clone, Copy)]
enum EventState {
    Pending,
    Fired(Instant),
    Failed,
}

/// A completion marker recorded on a stream.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<(Mutex<EventState>, Condvar)>,
}

impl Event {
    fn pending() -> (Event, EventSignal) {
        let event = Event {
            inner: Arc::new((Mutex::new(EventState::Pending), Condvar::new())),
        };
        let signal = EventSignal {
            event: event.clone(),
            fired: false,
        };
        (event, signal)
    }

    /// An event that has already completed.
    pub fn completed() -> Event {
        Event {
            inner: Arc::new((Mutex::new(EventState::Fired(Instant::now())), Condvar::new())),
        }
    }

    fn set(&self, state: EventState) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = state;
        cvar.notify_all();
    }

    /// Block until the event completes; returns the instant it was reached.
    pub fn synchronize(&self) -> Result<Instant, StreamError> {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *state {
                EventState::Fired(at) => return Ok(at),
                EventState::Failed => return Err(StreamError::EventFailed),
                EventState::Pending => {
                    state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Non-blocking completion check.
    pub fn query(&self) -> Option<Instant> {
        let (lock, _) = &*self.inner;
        match *lock.lock().unwrap_or_else(PoisonError::into_inner) {
            EventState::Fired(at) => Some(at),
            _ => None,
        }
    }

    /// Time between two completed events on the same stream.
    pub fn elapsed(start: &Event, end: &Event) -> Option<Duration> {
        Some(end.query()?.saturating_duration_since(start.query()?))
    }
}

/// Write side of an [`Event`]. Dropping it unfired fails the event.
struct EventSignal {
    event: Event,
    fired: bool,
}

impl EventSignal {
    fn fire(mut self) {
        self.fired = true;
        self.event.set(EventState::Fired(Instant::now()));
    }
}

impl Drop for EventSignal {
    fn drop(&mut self) {
        if !self.fired {
            self.event.set(EventState::Failed);
        }
    }
}

/// An in-order execution queue backed by a dedicated worker thread.
pub struct Stream {
    name: String,
    tx: Option<mpsc::UnboundedSender<Op>>,
    worker: Option<JoinHandle<()>>,
    faulted: Arc<AtomicBool>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Result<Self, StreamError> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Op>();
        let faulted = Arc::new(AtomicBool::new(false));

        let worker_faulted = Arc::clone(&faulted);
        let worker_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(op) = rx.blocking_recv() {
                    if worker_faulted.load(Ordering::Acquire) {
                        // Dropping the op fails any event it carries.
                        drop(op);
                        continue;
                    }
                    let outcome = match catch_unwind(AssertUnwindSafe(op)) {
                        Ok(result) => result,
                        Err(_) => Err(StreamError::OpFailed("operation panicked".into())),
                    };
                    if let Err(e) = outcome {
                        error!(stream = %worker_name, error = %e, "Stream faulted");
                        worker_faulted.store(true, Ordering::Release);
                    }
                }
                debug!(stream = %worker_name, "Stream worker exiting");
            })
            .map_err(|source| StreamError::Spawn {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            tx: Some(tx),
            worker: Some(worker),
            faulted,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    fn submit(&self, op: Op) -> Result<(), StreamError> {
        if self.is_faulted() {
            return Err(StreamError::Faulted(self.name.clone()));
        }
        self.tx
            .as_ref()
            .ok_or_else(|| StreamError::Closed(self.name.clone()))?
            .send(op)
            .map_err(|_| StreamError::Closed(self.name.clone()))
    }

    /// Enqueue an infallible operation.
    pub fn enqueue<F>(&self, f: F) -> Result<(), StreamError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(move || {
            f();
            Ok(())
        }))
    }

    /// Enqueue an operation whose failure faults the stream.
    pub fn enqueue_fallible<F>(&self, f: F) -> Result<(), StreamError>
    where
        F: FnOnce() -> Result<(), StreamError> + Send + 'static,
    {
        self.submit(Box::new(f))
    }

    /// Record an event that completes once all previously enqueued work has run.
    pub fn record(&self) -> Result<Event, StreamError> {
        let (event, signal) = Event::pending();
        self.submit(Box::new(move || {
            signal.fire();
            Ok(())
        }))?;
        Ok(event)
    }

    /// Make later work on this stream wait for `event` (which may belong to
    /// another stream). Does not block the caller.
    pub fn wait_event(&self, event: &Event) -> Result<(), StreamError> {
        let event = event.clone();
        self.submit(Box::new(move || event.synchronize().map(|_| ())))
    }

    /// Block the caller until all enqueued work has completed.
    pub fn synchronize(&self) -> Result<(), StreamError> {
        self.record()?.synchronize().map(|_| ())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_in_order_execution() {
        let stream = Stream::new("test-order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream.enqueue(move || log.lock().unwrap().push(i)).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_cross_stream_wait() {
        let a = Stream::new("test-a").unwrap();
        let b = Stream::new("test-b").unwrap();
        let value = Arc::new(AtomicUsize::new(0));

        let v = Arc::clone(&value);
        a.enqueue(move || {
            std::thread::sleep(Duration::from_millis(20));
            v.store(7, Ordering::SeqCst);
        })
        .unwrap();
        let done_a = a.record().unwrap();

        b.wait_event(&done_a).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let (v, s) = (Arc::clone(&value), Arc::clone(&seen));
        b.enqueue(move || s.store(v.load(Ordering::SeqCst), Ordering::SeqCst))
            .unwrap();
        b.synchronize().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_event_elapsed() {
        let stream = Stream::new("test-elapsed").unwrap();
        let start = stream.record().unwrap();
        stream
            .enqueue(|| std::thread::sleep(Duration::from_millis(5)))
            .unwrap();
        let end = stream.record().unwrap();
        end.synchronize().unwrap();
        let elapsed = Event::elapsed(&start, &end).unwrap();
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn test_failed_op_faults_stream() {
        let stream = Stream::new("test-fault").unwrap();
        stream
            .enqueue_fallible(|| Err(StreamError::OpFailed("boom".into())))
            .unwrap();
        let after = stream.record();
        // Either the record was refused or its event fails.
        match after {
            Ok(event) => assert!(event.synchronize().is_err()),
            Err(e) => assert!(matches!(e, StreamError::Faulted(_))),
        }
        assert!(stream.is_faulted());
        assert!(stream.enqueue(|| {}).is_err());
    }
}
