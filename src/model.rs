//! Entity classes
//!
//! An `EntityClass` is the runtime descriptor of one declared entity type: its schema,
//! the command builder bound to that schema, and the dispatcher that holds (or waits
//! for) the backend connection. All class-level operations build a command and hand it
//! to the dispatcher.

mod entity;
mod migrate;

pub use entity::Entity;

use crate::command::{
    BatchOptions, Command, CommandBuilder, Conditions, Consistency, Order, TableChange,
    WriteOptions,
};
use crate::connection::{Connection, Pending, Rows};
use crate::dispatch::Dispatcher;
use crate::error::OrmError;
use crate::orm::ModelEvent;
use crate::readiness::Broadcaster;
use crate::schema::{Identity, Record, Schema};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::error;

/// Outcome of `EntityClass::prepare`
pub type Preparation = Pending<Arc<EntityClass>>;

pub struct EntityClass {
    name: String,
    schema: Arc<Schema>,
    builder: Arc<dyn CommandBuilder>,
    dispatcher: Dispatcher,
    global_ready: Arc<Broadcaster<Arc<dyn Connection>>>,
    events: broadcast::Sender<ModelEvent>,
}

impl EntityClass {
    pub(crate) fn new(
        schema: Arc<Schema>,
        builder: Arc<dyn CommandBuilder>,
        global_ready: Arc<Broadcaster<Arc<dyn Connection>>>,
        events: broadcast::Sender<ModelEvent>,
    ) -> Arc<Self> {
        let name = schema.name().to_string();
        Arc::new(Self {
            dispatcher: Dispatcher::new(name.clone()),
            name,
            schema,
            builder,
            global_ready,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn builder(&self) -> &Arc<dyn CommandBuilder> {
        &self.builder
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.dispatcher.connection()
    }

    pub fn is_bound(&self) -> bool {
        self.dispatcher.is_bound()
    }

    /// Wait for the global ready channel, automigrate, then bind
    ///
    /// The procedure runs whether or not the returned future is awaited. A failed
    /// automigration leaves the class unbound and is not retried.
    pub fn prepare(self: &Arc<Self>) -> Preparation {
        let (tx, rx) = oneshot::channel();
        let class = Arc::clone(self);

        self.global_ready.subscribe(move |connection: Arc<dyn Connection>| {
            let handle = match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    error!("{}: ready published outside a tokio runtime", class.name);
                    let _ = tx.send(Err(OrmError::Internal(
                        "automigration needs a tokio runtime".to_string(),
                    )));
                    return;
                }
            };

            handle.spawn(async move {
                let outcome = match class.automigrate_with(connection.as_ref()).await {
                    Ok(()) => {
                        class.use_connection(connection);
                        Ok(Arc::clone(&class))
                    }
                    Err(e) => {
                        error!("{}: automigration failed, class stays unbound: {}", class.name, e);
                        Err(e)
                    }
                };
                let _ = tx.send(outcome);
            });
        });

        let name = self.name.clone();
        Box::pin(async move {
            rx.await.map_err(|_| {
                OrmError::Internal(format!("{name}: preparation task ended without an outcome"))
            })?
        })
    }

    /// Bind `connection` to this class. Only the first call has an effect.
    pub fn use_connection(&self, connection: Arc<dyn Connection>) -> bool {
        let bound = self.dispatcher.bind(connection);
        if bound {
            let _ = self.events.send(ModelEvent::ClassReady(self.name.clone()));
        }
        bound
    }

    /// Subscribe to the class-level ready channel
    pub fn on_ready<F>(&self, listener: F)
    where
        F: FnOnce(Arc<dyn Connection>) + Send + 'static,
    {
        self.dispatcher.on_ready(listener);
    }

    pub fn execute(&self, command: Command) -> Pending<Rows> {
        self.dispatcher.execute(command)
    }

    pub fn batch(&self, commands: Vec<Command>, options: BatchOptions) -> Pending<()> {
        self.dispatcher.batch(commands, options)
    }

    /// New, not yet persisted instance
    pub fn build(self: &Arc<Self>, data: Record) -> Entity {
        Entity::init(Arc::clone(self), data, false)
    }

    /// Instance for a record that already exists in the backend
    pub fn hydrate(self: &Arc<Self>, data: Record) -> Entity {
        Entity::init(Arc::clone(self), data, true)
    }

    /// Build a new instance and save it right away
    pub fn create(self: &Arc<Self>, data: Record, options: WriteOptions) -> Pending<Entity> {
        let entity = self.build(data);
        let saved = entity.save(options);
        Box::pin(async move {
            saved.await?;
            Ok(entity)
        })
    }

    pub(crate) fn emit_new_instance(&self, entity: &Entity) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(ModelEvent::NewInstance(entity.clone()));
        }
    }

    /// Turn backend rows into persisted instances; null rows stay `None`
    pub fn from_database(self: &Arc<Self>, rows: Rows) -> Vec<Option<Entity>> {
        rows.into_iter()
            .map(|row| {
                let row = row?;
                let data: Record = row
                    .iter()
                    .map(|cell| {
                        let value = self.schema.from_database(cell.value.clone(), &cell.name);
                        (cell.name.clone(), value)
                    })
                    .collect();
                Some(self.hydrate(data))
            })
            .collect()
    }

    fn read_many(self: &Arc<Self>, command: Command) -> Pending<Vec<Option<Entity>>> {
        let class = Arc::clone(self);
        let rows = self.execute(command);
        Box::pin(async move { Ok(class.from_database(rows.await?)) })
    }

    fn read_first(self: &Arc<Self>, command: Command) -> Pending<Option<Entity>> {
        let many = self.read_many(command);
        Box::pin(async move { Ok(many.await?.into_iter().next().flatten()) })
    }

    pub fn find(
        self: &Arc<Self>,
        filter: &Conditions,
        consistency: Option<Consistency>,
    ) -> Pending<Vec<Option<Entity>>> {
        self.read_many(self.builder.select_all(filter, consistency))
    }

    pub fn all(
        self: &Arc<Self>,
        filter: &Conditions,
        consistency: Option<Consistency>,
    ) -> Pending<Vec<Option<Entity>>> {
        self.find(filter, consistency)
    }

    pub fn select(
        self: &Arc<Self>,
        columns: &[String],
        filter: &Conditions,
        consistency: Option<Consistency>,
    ) -> Pending<Vec<Option<Entity>>> {
        self.read_many(self.builder.select(columns, filter, consistency))
    }

    pub fn one(
        self: &Arc<Self>,
        conds: &Conditions,
        order: Option<&Order>,
        offset: Option<u64>,
        consistency: Option<Consistency>,
    ) -> Pending<Option<Entity>> {
        self.read_first(self.builder.select_one(conds, order, offset, consistency))
    }

    pub fn by_id(
        self: &Arc<Self>,
        id: &Identity,
        consistency: Option<Consistency>,
    ) -> Pending<Option<Entity>> {
        self.read_first(self.builder.select_by_id(id, consistency))
    }

    /// Row count; the first column of the first row
    pub fn count(
        &self,
        conds: &Conditions,
        limit: Option<u64>,
        offset: Option<u64>,
        consistency: Option<Consistency>,
    ) -> Pending<u64> {
        let rows = self.execute(self.builder.count(conds, limit, offset, consistency));
        Box::pin(async move {
            let rows = rows.await?;
            let value = rows
                .first()
                .and_then(Option::as_ref)
                .and_then(|row| row.cells.first())
                .map(|cell| &cell.value);

            Ok(match value {
                Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
                Some(Value::String(s)) => s.parse().unwrap_or(0),
                _ => 0,
            })
        })
    }

    pub fn insert(&self, data: &Record, options: &WriteOptions) -> Pending<Rows> {
        self.execute(self.builder.insert(data, options))
    }

    pub fn update(&self, data: &Record, conds: &Conditions, options: &WriteOptions) -> Pending<Rows> {
        self.execute(self.builder.update(data, conds, options))
    }

    pub fn update_by_id(&self, data: &Record, id: &Identity, options: &WriteOptions) -> Pending<Rows> {
        self.execute(self.builder.update_by_id(data, id, options))
    }

    pub fn destroy(&self, columns: &[String], conds: &Conditions, options: &WriteOptions) -> Pending<Rows> {
        self.execute(self.builder.destroy(columns, conds, options))
    }

    pub fn destroy_all(&self, conds: &Conditions, options: &WriteOptions) -> Pending<Rows> {
        self.execute(self.builder.destroy_all(conds, options))
    }

    pub fn destroy_by_id(&self, id: &Identity, options: &WriteOptions) -> Pending<Rows> {
        self.execute(self.builder.destroy_by_id(id, options))
    }

    pub fn truncate(&self) -> Pending<Rows> {
        self.execute(self.builder.truncate())
    }

    pub fn empty(&self) -> Pending<Rows> {
        self.truncate()
    }

    pub fn alter_table(&self, changes: &[TableChange]) -> Pending<Rows> {
        self.execute(self.builder.alter_table(changes))
    }
}

impl fmt::Debug for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityClass")
            .field("name", &self.name)
            .field("table", &self.schema.table())
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Cell, Row};
    use crate::orm::Orm;
    use crate::schema::{FieldDef, FieldType, SchemaInfo};
    use crate::testing::{op, Catalog, EchoBuilder, RecordingConnection};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn orm() -> Orm {
        Orm::with_builder(|schema| Arc::new(EchoBuilder::new(&schema)))
    }

    fn user_info() -> SchemaInfo {
        SchemaInfo::new()
            .field("id", FieldDef::key(FieldType::Int))
            .field("name", FieldDef::new(FieldType::Text))
            .field("active", FieldDef::new(FieldType::Boolean))
    }

    fn row(value: Value) -> Option<Row> {
        Some(
            value
                .as_object()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_reads_hydrate_persisted_instances() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let connection = RecordingConnection::new();
        connection.respond(Ok(vec![row(json!({"id": "7", "active": 1})), None]));
        users.use_connection(connection.clone());

        let found = users.find(&Record::new(), None).await.unwrap();

        assert_eq!(found.len(), 2);
        let first = found[0].as_ref().unwrap();
        assert!(first.exists());
        assert_eq!(first.get("id"), Some(&json!(7)));
        assert_eq!(first.get("active"), Some(&json!(true)));
        assert!(found[1].is_none());
        assert_eq!(op(&connection.statements()[0]), "select_all user");
    }

    #[tokio::test]
    async fn test_by_id_returns_first_or_none() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let connection = RecordingConnection::new();
        connection.respond(Ok(vec![]));
        users.use_connection(connection.clone());

        let missing = users.by_id(&Identity::Single(json!(9)), None).await.unwrap();

        assert!(missing.is_none());
        assert_eq!(connection.statements(), vec!["select_by_id user 9"]);
    }

    #[tokio::test]
    async fn test_count_reads_first_cell() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let connection = RecordingConnection::new();
        connection.respond(Ok(vec![Some(Row::new(vec![Cell::new("count", json!(3))]))]));
        users.use_connection(connection.clone());

        assert_eq!(users.count(&Record::new(), None, None, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_transport_errors_propagate_unchanged() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let connection = RecordingConnection::new();
        connection.respond(Err(OrmError::Transport("socket closed".to_string())));
        users.use_connection(connection.clone());

        let err = users.find(&Record::new(), None).await.unwrap_err();
        assert!(matches!(err, OrmError::Transport(msg) if msg == "socket closed"));
    }

    #[tokio::test]
    async fn test_prepare_binds_after_automigration() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let preparation = users.prepare();
        assert!(!users.is_bound());

        let connection = RecordingConnection::with_catalog(Catalog::NotFound);
        orm.connect_ready(connection.clone());

        let prepared = preparation.await.unwrap();
        assert!(prepared.is_bound());
        assert_eq!(connection.lookups(), vec!["user"]);
        assert_eq!(connection.statements(), vec!["create_table user null"]);
    }

    #[tokio::test]
    async fn test_prepare_failure_leaves_class_unbound() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let preparation = users.prepare();

        let connection = RecordingConnection::with_catalog(Catalog::Fails("denied".to_string()));
        orm.connect_ready(connection.clone());

        let err = preparation.await.unwrap_err();
        assert!(matches!(err, OrmError::Transport(_)));
        assert!(!users.is_bound());
        assert!(connection.statements().is_empty());
    }

    #[tokio::test]
    async fn test_class_ready_channel_replays_connection() {
        let orm = orm();
        let users = orm.define("User", user_info());
        users.use_connection(RecordingConnection::new());

        let (tx, rx) = oneshot::channel();
        users.on_ready(move |_| {
            let _ = tx.send(());
        });
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_write_operations_build_expected_commands() {
        let orm = orm();
        let users = orm.define("User", user_info());
        let connection = RecordingConnection::new();
        users.use_connection(connection.clone());
        let options = WriteOptions::default();
        let conds: Record = json!({"name": "x"}).as_object().cloned().unwrap();

        users.destroy_all(&conds, &options).await.unwrap();
        users.empty().await.unwrap();
        users
            .alter_table(&[TableChange::DropColumn { name: "active".to_string() }])
            .await
            .unwrap();

        let ops: Vec<String> = connection.statements().iter().map(|s| op(s)).collect();
        assert_eq!(ops, vec!["destroy_all user", "truncate user", "alter_table user"]);
    }
}
