//! Typed channels between components.
//!
//! Two flavors cover every link in the supervisor tree: unbounded channels
//! for lifecycle events and requests that must never be dropped, and small
//! bounded channels for observations (probe outcomes, reload notifications)
//! where only the freshest value matters. Publish errors name the event type
//! so a closed link is attributable in the logs.

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::any::type_name;
use thiserror::Error;

#[derive(Debug)]
pub struct EventPublisher<E>(Sender<E>);

#[derive(Debug)]
pub struct EventConsumer<E>(Receiver<E>);

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("no consumer left for `{event_type}` events")]
    Closed { event_type: &'static str },

    #[error("the `{event_type}` event buffer is full")]
    Full { event_type: &'static str },
}

/// An unbounded link: publishing never blocks and never drops.
pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (sender, receiver) = unbounded();
    (EventPublisher(sender), EventConsumer(receiver))
}

/// A bounded link for observations where freshness beats backlog; pair with
/// [`EventPublisher::publish_latest`].
pub fn pub_sub_latest<E>(capacity: usize) -> (EventPublisher<E>, EventConsumer<E>) {
    let (sender, receiver) = bounded(capacity);
    (EventPublisher(sender), EventConsumer(receiver))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0.send(event).map_err(|_| EventPublisherError::Closed {
            event_type: type_name::<E>(),
        })
    }

    pub fn try_publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => EventPublisherError::Full {
                event_type: type_name::<E>(),
            },
            TrySendError::Disconnected(_) => EventPublisherError::Closed {
                event_type: type_name::<E>(),
            },
        })
    }

    /// Publish into a bounded link, displacing the oldest undelivered event
    /// when the buffer is full. The consumer side of the same link must be
    /// passed in so the displacement drains the right queue.
    pub fn publish_latest(
        &self,
        receiver: &EventConsumer<E>,
        event: E,
    ) -> Result<(), EventPublisherError> {
        match self.0.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                let _ = receiver.0.try_recv();
                // a concurrent publisher may have refilled the slot; losing
                // that race still leaves a fresher event in the buffer
                self.0.try_send(event).map_err(|err| match err {
                    TrySendError::Full(_) => EventPublisherError::Full {
                        event_type: type_name::<E>(),
                    },
                    TrySendError::Disconnected(_) => EventPublisherError::Closed {
                        event_type: type_name::<E>(),
                    },
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(EventPublisherError::Closed {
                event_type: type_name::<E>(),
            }),
        }
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}

impl<E> Clone for EventConsumer<E> {
    fn clone(&self) -> Self {
        EventConsumer(self.0.clone())
    }
}
