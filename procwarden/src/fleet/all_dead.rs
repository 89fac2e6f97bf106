use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Mutex;

/// Latched one-shot signal for the terminal fleet condition: every
/// supervisor reached `Stopped` or `Failed`. Firing is idempotent, and a
/// subscriber attaching after the fact is notified immediately rather than
/// waiting on a signal that already happened.
#[derive(Default)]
pub struct AllDeadSignal {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: bool,
    subscribers: Vec<Sender<()>>,
}

impl AllDeadSignal {
    pub fn subscribe(&self) -> Receiver<()> {
        let (sender, receiver) = bounded(1);
        let mut inner = self.inner.lock().expect("the signal lock is never poisoned");
        if inner.fired {
            let _ = sender.send(());
        } else {
            inner.subscribers.push(sender);
        }
        receiver
    }

    /// Notifies every subscriber once; further calls change nothing.
    pub fn fire(&self) {
        let mut inner = self.inner.lock().expect("the signal lock is never poisoned");
        if inner.fired {
            return;
        }
        inner.fired = true;
        for subscriber in inner.subscribers.drain(..) {
            let _ = subscriber.send(());
        }
    }

    pub fn has_fired(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.fired)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn subscribers_are_notified_on_fire() {
        let signal = AllDeadSignal::default();
        let first = signal.subscribe();
        let second = signal.subscribe();

        assert!(first.try_recv().is_err());
        signal.fire();

        assert!(first.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(second.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn late_subscribers_still_observe_the_signal() {
        let signal = AllDeadSignal::default();
        signal.fire();

        let late = signal.subscribe();
        assert!(late.try_recv().is_ok());
        assert!(signal.has_fired());
    }

    #[test]
    fn firing_twice_notifies_once() {
        let signal = AllDeadSignal::default();
        let subscriber = signal.subscribe();

        signal.fire();
        signal.fire();

        assert!(subscriber.try_recv().is_ok());
        assert!(subscriber.try_recv().is_err());
    }
}
