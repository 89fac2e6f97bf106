//! Cancellable background threads.
//!
//! Every long-lived component (reaper, probes, watcher, scheduler, sampler,
//! API server) runs as a thread context: the callback receives a
//! cancellation consumer and is expected to return promptly once a message
//! arrives on it. All timed waits inside those loops go through
//! [`EventConsumer::is_cancelled`], so every sleep in the supervisor tree is
//! interruptible.

use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::utils::threads::spawn_named_thread;
use crossbeam::channel::RecvTimeoutError;
use std::thread::{sleep, JoinHandle};
use std::time::{Duration, Instant};
use tracing::Span;

/// How long a stopped thread gets to wind down before `stop` gives up on
/// joining it.
const STOP_GRACE: Duration = Duration::from_secs(1);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Message telling a background thread to wind down.
pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Sleeps for `timeout` unless cancellation arrives first; returns
    /// whether the thread should exit. A closed channel counts as
    /// cancellation: a context whose stop handle is gone has nothing left
    /// to run for.
    pub fn is_cancelled(&self, timeout: Duration) -> bool {
        match self.as_ref().recv_timeout(timeout) {
            Ok(_) => true,
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

pub struct NotStartedThreadContext<F, T>
where
    F: FnOnce(EventConsumer<CancellationMessage>) -> T + Send + 'static,
    T: Send + 'static,
{
    thread_name: String,
    callback: F,
}

impl<F, T> NotStartedThreadContext<F, T>
where
    F: FnOnce(EventConsumer<CancellationMessage>) -> T + Send + 'static,
    T: Send + 'static,
{
    pub fn new<S: Into<String>>(thread_name: S, callback: F) -> Self {
        Self {
            thread_name: thread_name.into(),
            callback,
        }
    }

    /// Spawns the thread. The caller's current span is entered inside the
    /// thread, so component logs stay attached to the bootstrap or fleet
    /// span that created them.
    pub fn start(self) -> StartedThreadContext {
        let (stop_publisher, stop_consumer) = pub_sub::<CancellationMessage>();
        let parent_span = Span::current();

        StartedThreadContext {
            thread_name: self.thread_name.clone(),
            stop_publisher,
            join_handle: spawn_named_thread(&self.thread_name, move || {
                let _guard = parent_span.enter();
                (self.callback)(stop_consumer);
            }),
        }
    }
}

pub struct StartedThreadContext {
    thread_name: String,
    stop_publisher: EventPublisher<CancellationMessage>,
    join_handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThreadContextStopperError {
    #[error("the `{0}` thread stopped listening before it was cancelled: {1}")]
    EventPublisherError(String, String),

    #[error("the `{0}` thread panicked")]
    JoinError(String),

    #[error("the `{0}` thread ignored its cancellation for {1:?}")]
    StopTimeout(String, Duration),
}

impl StartedThreadContext {
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Publishes the cancellation and waits up to the stop grace for the
    /// thread to finish. A thread still running after the grace is left
    /// behind and reported; it holds no children, only its loop.
    pub fn stop(self) -> Result<(), ThreadContextStopperError> {
        self.publish_cancellation()?;

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if self.join_handle.is_finished() {
                return self.join();
            }
            sleep(STOP_POLL_INTERVAL);
        }

        Err(ThreadContextStopperError::StopTimeout(
            self.thread_name,
            STOP_GRACE,
        ))
    }

    /// Publishes the cancellation and waits however long the thread takes.
    pub fn stop_blocking(self) -> Result<(), ThreadContextStopperError> {
        self.publish_cancellation()?;
        self.join()
    }

    fn publish_cancellation(&self) -> Result<(), ThreadContextStopperError> {
        self.stop_publisher.publish(()).map_err(|err| {
            ThreadContextStopperError::EventPublisherError(
                self.thread_name.clone(),
                err.to_string(),
            )
        })
    }

    fn join(self) -> Result<(), ThreadContextStopperError> {
        self.join_handle
            .join()
            .map_err(|_| ThreadContextStopperError::JoinError(self.thread_name))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn thread_context_starts_and_stops() {
        let callback = |stop_consumer: EventConsumer<CancellationMessage>| loop {
            if stop_consumer.is_cancelled(Duration::default()) {
                break;
            }
        };

        let started = NotStartedThreadContext::new("tick-loop", callback).start();
        assert!(!started.is_finished());
        started.stop_blocking().unwrap();

        let started = NotStartedThreadContext::new("tick-loop", callback).start();
        assert!(!started.is_finished());
        started.stop().unwrap();
    }

    #[test]
    fn a_dropped_stop_handle_counts_as_cancellation() {
        let (publisher, consumer) = pub_sub::<CancellationMessage>();
        drop(publisher);
        assert!(consumer.is_cancelled(Duration::from_secs(5)));
    }

    #[test]
    fn stop_gives_up_on_a_stuck_thread() {
        let never_ending = |_: EventConsumer<CancellationMessage>| {
            sleep(Duration::from_secs(u64::MAX));
        };
        let started = NotStartedThreadContext::new("stuck-loop", never_ending).start();

        assert!(!started.is_finished());
        assert_matches!(
            started.stop().unwrap_err(),
            ThreadContextStopperError::StopTimeout(name, _) => {
                assert_eq!(name, "stuck-loop");
            }
        );
    }
}
