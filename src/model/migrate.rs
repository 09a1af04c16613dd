//! Automigration
//!
//! Creates an entity's backing table when the backend does not know it. Existing tables
//! are taken as they are: there is no column diff and no ALTER.

use super::EntityClass;
use crate::connection::{Connection, Pending};
use crate::error::{OrmError, OrmResult};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

impl EntityClass {
    /// Reconcile the table against an explicit connection
    pub async fn automigrate_with(&self, connection: &dyn Connection) -> OrmResult<()> {
        let table = self.builder().table_name();

        let metadata = match connection.table_metadata(&table).await {
            Ok(metadata) => metadata,
            Err(OrmError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if metadata.is_some() {
            debug!("{}: table {} exists, nothing to migrate", self.name(), table);
            return Ok(());
        }

        info!("{}: table {} missing, creating it", self.name(), table);
        connection.execute(self.builder().create_table()).await?;
        Ok(())
    }

    /// Reconcile the table against this class's connection, waiting for it if unbound
    pub fn automigrate(self: &Arc<Self>) -> Pending<()> {
        let class = Arc::clone(self);

        if let Some(connection) = self.connection() {
            let connection = Arc::clone(connection);
            return Box::pin(async move { class.automigrate_with(connection.as_ref()).await });
        }

        let (tx, rx) = oneshot::channel();
        self.on_ready(move |connection| {
            let _ = tx.send(connection);
        });

        Box::pin(async move {
            let connection = rx.await.map_err(|_| {
                OrmError::NotConnected(format!("{}: never bound", class.name()))
            })?;
            class.automigrate_with(connection.as_ref()).await
        })
    }
}
