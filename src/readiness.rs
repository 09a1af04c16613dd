//! Readiness broadcaster
//!
//! A sticky, one-shot publish/subscribe primitive. Every subscription fires exactly
//! once: immediately if a payload has already been published, otherwise at the next
//! publish. The cached payload (not the listener list) is what replays to late
//! subscribers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type Listener<T> = Box<dyn FnOnce(T) + Send + 'static>;

struct State<T> {
    payload: Option<T>,
    listeners: Vec<Listener<T>>,
    delivering: bool,
}

/// Sticky one-shot broadcaster for a single channel
pub struct Broadcaster<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                payload: None,
                listeners: Vec::new(),
                delivering: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Listeners never run under the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a one-shot listener
    ///
    /// Runs right away when a payload is cached and no delivery is in progress.
    /// During a delivery the listener is queued behind the listeners already being
    /// served, which keeps registration order intact.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut state = self.lock();
        match &state.payload {
            Some(payload) if !state.delivering => {
                let payload = payload.clone();
                drop(state);
                listener(payload);
            }
            _ => state.listeners.push(Box::new(listener)),
        }
    }

    /// Future-returning subscription
    pub fn subscribe_once(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(move |payload| {
            let _ = tx.send(payload);
        });
        rx
    }

    /// Cache `payload` and deliver it to every registered listener, in order
    pub fn publish(&self, payload: T) {
        let mut state = self.lock();
        state.payload = Some(payload);

        // A publish from inside a listener only swaps the cache; the outer loop
        // serves whatever gets registered meanwhile.
        if state.delivering {
            return;
        }
        state.delivering = true;

        loop {
            let listeners = std::mem::take(&mut state.listeners);
            let payload = match (&state.payload, listeners.is_empty()) {
                (Some(payload), false) => payload.clone(),
                _ => break,
            };
            drop(state);

            for listener in listeners {
                listener(payload.clone());
            }

            state = self.lock();
        }

        state.delivering = false;
    }

    /// The cached payload, if any
    pub fn payload(&self) -> Option<T> {
        self.lock().payload.clone()
    }

    pub fn is_published(&self) -> bool {
        self.lock().payload.is_some()
    }

    /// Number of listeners still waiting for a publish
    pub fn pending(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
