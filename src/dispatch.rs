//! Readiness-gated command dispatch
//!
//! Every entity class owns one `Dispatcher`. Until a connection is bound, commands are
//! parked on the class-level readiness channel and forwarded in issuance order once the
//! connection arrives. After binding, commands go straight to the connection and the
//! channel is never consulted again.
//!
//! There is no cancellation or timeout here: a command queued on a class that never
//! gets bound stays pending for as long as the class lives.

use crate::command::{BatchOptions, Command};
use crate::connection::{Connection, Pending, Rows};
use crate::error::OrmError;
use crate::readiness::Broadcaster;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    name: String,
    connection: OnceCell<Arc<dyn Connection>>,
    ready: Broadcaster<Arc<dyn Connection>>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: OnceCell::new(),
            ready: Broadcaster::new(),
        }
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.get()
    }

    pub fn is_bound(&self) -> bool {
        self.connection.get().is_some()
    }

    /// Bind the connection (write-once) and release everything queued so far
    ///
    /// Returns `false` and leaves the existing binding alone when already bound.
    pub fn bind(&self, connection: Arc<dyn Connection>) -> bool {
        if self.connection.set(connection.clone()).is_err() {
            warn!("{}: connection already bound, ignoring rebind", self.name);
            return false;
        }

        info!(
            "{}: connection bound, releasing {} queued operation(s)",
            self.name,
            self.ready.pending()
        );
        self.ready.publish(connection);
        true
    }

    /// Subscribe to the class-level ready channel
    pub fn on_ready<F>(&self, listener: F)
    where
        F: FnOnce(Arc<dyn Connection>) + Send + 'static,
    {
        self.ready.subscribe(listener);
    }

    /// Forward an operation to the connection, now or once it is bound
    ///
    /// `forward` runs exactly once: immediately when bound, otherwise at bind time in
    /// queue order. The queueing happens on this call, not on first poll.
    pub fn submit<T, F>(&self, forward: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Connection) -> Pending<T> + Send + 'static,
    {
        if let Some(connection) = self.connection.get() {
            return forward(connection.as_ref());
        }

        debug!("{}: no connection yet, queueing operation", self.name);

        let (tx, rx) = oneshot::channel();
        self.ready.subscribe(move |connection: Arc<dyn Connection>| {
            let _ = tx.send(forward(connection.as_ref()));
        });

        let name = self.name.clone();
        Box::pin(async move {
            match rx.await {
                Ok(response) => response.await,
                Err(_) => Err(OrmError::NotConnected(format!(
                    "{name}: dispatcher dropped before a connection was bound"
                ))),
            }
        })
    }

    pub fn execute(&self, command: Command) -> Pending<Rows> {
        self.submit(move |connection| connection.execute(command))
    }

    pub fn batch(&self, commands: Vec<Command>, options: BatchOptions) -> Pending<()> {
        self.submit(move |connection| connection.batch(commands, options))
    }
}
