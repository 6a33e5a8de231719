//! One-way notification of log lines and transfer progress to observers.

use crate::state::ImageKind;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub object: ImageKind,
    pub total_bytes: u32,
    pub sent_bytes: u32,
    pub validated_bytes: u32,
}

#[derive(Debug, Clone)]
pub enum Event {
    Log { message: String },
    Progress(ProgressEvent),
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Registry of event listeners, dispatched synchronously.
#[derive(Default)]
pub struct EventSink {
    listeners: Mutex<Vec<Listener>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self { listeners: Mutex::new(Vec::new()) }
    }

    /// Register a listener, invoked for every subsequent event. Returns a
    /// token that can be passed to [`EventSink::unregister`].
    pub fn on<F>(&self, listener: F) -> usize
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.push(Box::new(listener));
        listeners.len() - 1
    }

    /// Remove a listener previously registered with [`EventSink::on`].
    ///
    /// Tokens are positional; removing one shifts the tokens of listeners
    /// registered after it. Callers that need stable tokens should avoid
    /// unregistering out of order.
    pub fn unregister(&self, token: usize) {
        let mut listeners = self.listeners.lock().unwrap();
        if token < listeners.len() {
            listeners.remove(token);
        }
    }

    /// Dispatch an event to every registered listener, in registration
    /// order. A listener that panics is caught and reported back through
    /// this same sink's `log` channel instead of propagating.
    pub fn dispatch(&self, event: Event) {
        let mut panics = Vec::new();
        {
            let listeners = self.listeners.lock().unwrap();
            for listener in listeners.iter() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "event listener panicked".to_string());
                    panics.push(message);
                }
            }
        }
        for message in panics {
            self.log(format!("event listener panicked: {message}"));
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.dispatch(Event::Log { message: message.into() });
    }

    pub fn progress(&self, progress: ProgressEvent) {
        self.dispatch(Event::Progress(progress));
    }
}
