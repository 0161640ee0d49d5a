//! Event delivery to listeners and channel subscribers.
//!
//! Events are collected into an [`Outbox`] while the recorder holds its
//! locks and published afterwards, so listeners may call back into the
//! recorder.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::{trace, warn};

use replay_ipc::{event_channel, Notification, RecorderEvent};

type StateListener = Arc<dyn Fn(bool) + Send + Sync>;
type NotificationListener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Events waiting to be published.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    events: Vec<RecorderEvent>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, event: RecorderEvent) {
        self.events.push(event);
    }
}

/// Fan-out of recorder events.
#[derive(Default)]
pub(crate) struct EventHub {
    subscribers: RwLock<Vec<Sender<RecorderEvent>>>,
    state_listeners: RwLock<Vec<StateListener>>,
    notification_listeners: RwLock<Vec<NotificationListener>>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Receiver<RecorderEvent> {
        let (tx, rx) = event_channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub(crate) fn on_state_change(&self, listener: StateListener) {
        self.state_listeners.write().push(listener);
    }

    pub(crate) fn on_notification(&self, listener: NotificationListener) {
        self.notification_listeners.write().push(listener);
    }

    /// Deliver a single event.
    pub(crate) fn emit(&self, event: RecorderEvent) {
        let mut outbox = Outbox::new();
        outbox.push(event);
        self.publish(outbox);
    }

    /// Deliver queued events in order. Must be called without holding any
    /// recorder lock.
    pub(crate) fn publish(&self, outbox: Outbox) {
        for event in outbox.events {
            self.notify_listeners(&event);
            self.broadcast(event);
        }
    }

    fn notify_listeners(&self, event: &RecorderEvent) {
        match event {
            RecorderEvent::RecordingChanged(recording) => {
                let listeners = self.state_listeners.read().clone();
                for listener in listeners {
                    listener(*recording);
                }
            }
            RecorderEvent::Notification(notification) => {
                let listeners = self.notification_listeners.read().clone();
                for listener in listeners {
                    listener(notification);
                }
            }
            _ => {}
        }
    }

    fn broadcast(&self, event: RecorderEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event subscriber is full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("Event subscriber disconnected");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use replay_ipc::ReplayFailure;

    #[test]
    fn test_listeners_and_subscribers_receive_in_order() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.on_state_change(Arc::new(move |recording: bool| sink.lock().push(recording)));

        let mut outbox = Outbox::new();
        outbox.push(RecorderEvent::RecordingChanged(true));
        outbox.push(RecorderEvent::RecordingChanged(false));
        hub.publish(outbox);

        assert_eq!(*seen.lock(), [true, false]);
        assert_eq!(rx.try_recv().unwrap(), RecorderEvent::RecordingChanged(true));
        assert_eq!(rx.try_recv().unwrap(), RecorderEvent::RecordingChanged(false));
    }

    #[test]
    fn test_notification_listener() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.on_notification(Arc::new(move |n: &Notification| sink.lock().push(n.clone())));

        let failed = Notification::ReplayFailed {
            reason: ReplayFailure::InsufficientBuffer,
            message: "empty".to_string(),
        };
        hub.emit(RecorderEvent::Notification(failed.clone()));
        hub.emit(RecorderEvent::Ready);

        assert_eq!(*seen.lock(), [failed]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let hub = EventHub::new();
        drop(hub.subscribe());
        let live = hub.subscribe();

        hub.emit(RecorderEvent::Ready);

        assert_eq!(hub.subscribers.read().len(), 1);
        assert_eq!(live.try_recv().unwrap(), RecorderEvent::Ready);
    }
}
