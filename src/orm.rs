//! Runtime registry
//!
//! Holds the global "backend ready" channel, the notification bus and the declared
//! entity classes. `Orm::global()` is the process-wide instance; tests and embedders
//! that want isolation build their own.

use crate::command::{BuilderFactory, CommandBuilder};
use crate::connection::Connection;
use crate::model::{Entity, EntityClass};
use crate::db::PgCommandBuilder;
use crate::readiness::Broadcaster;
use crate::schema::{Schema, SchemaInfo};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Notifications for registration and introspection hooks
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// A class was declared
    NewModel(Arc<EntityClass>),
    /// An instance that does not exist in the backend yet was constructed
    NewInstance(Entity),
    /// A class bound its connection
    ClassReady(String),
}

const EVENT_CAPACITY: usize = 256;

static GLOBAL: Lazy<Orm> = Lazy::new(Orm::new);

pub struct Orm {
    ready: Arc<Broadcaster<Arc<dyn Connection>>>,
    events: broadcast::Sender<ModelEvent>,
    builders: BuilderFactory,
    models: RwLock<HashMap<String, Arc<EntityClass>>>,
}

impl Orm {
    /// Registry that builds PostgreSQL commands against the `public` schema
    pub fn new() -> Self {
        Self::postgres("public")
    }

    /// Registry that builds PostgreSQL commands against `namespace`
    pub fn postgres(namespace: &str) -> Self {
        let namespace = namespace.to_string();
        Self::with_builder(move |schema| Arc::new(PgCommandBuilder::new(schema, &namespace)))
    }

    /// Registry with a custom command builder per declared schema
    pub fn with_builder<F>(factory: F) -> Self
    where
        F: Fn(Arc<Schema>) -> Arc<dyn CommandBuilder> + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ready: Arc::new(Broadcaster::new()),
            events,
            builders: Arc::new(factory),
            models: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static Orm {
        &GLOBAL
    }

    /// Build and register a class without waiting for the backend
    pub fn define(&self, name: &str, info: SchemaInfo) -> Arc<EntityClass> {
        let schema = Arc::new(Schema::new(name, info));
        let builder = (self.builders)(Arc::clone(&schema));
        let class = EntityClass::new(schema, builder, Arc::clone(&self.ready), self.events.clone());

        let replaced = self
            .models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&class));
        if replaced.is_some() {
            warn!("{}: redeclared, the previous class is no longer registered", name);
        }

        info!("{}: declared (table {})", name, class.schema().table());
        let _ = self.events.send(ModelEvent::NewModel(Arc::clone(&class)));
        class
    }

    /// Define a class and prepare it against the global ready channel
    ///
    /// The preparation outcome is logged; call `define` + `prepare` to observe it.
    pub fn declare(&self, name: &str, info: SchemaInfo) -> Arc<EntityClass> {
        let class = self.define(name, info);
        drop(class.prepare());
        class
    }

    /// Publish the backend connection on the global ready channel
    pub fn connect_ready(&self, connection: Arc<dyn Connection>) {
        info!("backend ready, notifying {} waiting class(es)", self.ready.pending());
        self.ready.publish(connection);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_published()
    }

    /// Subscribe to the global ready channel
    pub fn on_ready<F>(&self, listener: F)
    where
        F: FnOnce(Arc<dyn Connection>) + Send + 'static,
    {
        self.ready.subscribe(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    pub fn model(&self, name: &str) -> Option<Arc<EntityClass>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn models(&self) -> Vec<Arc<EntityClass>> {
        let mut models: Vec<_> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        models.sort_by(|a, b| a.name().cmp(b.name()));
        models
    }
}

impl Default for Orm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WriteOptions;
    use crate::schema::{FieldDef, FieldType, Record};
    use crate::testing::{Catalog, EchoBuilder, RecordingConnection};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn orm() -> Orm {
        Orm::with_builder(|schema| Arc::new(EchoBuilder::new(&schema)))
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_define_registers_and_announces() {
        let orm = orm();
        let mut events = orm.subscribe();

        let users = orm.define("User", SchemaInfo::new().field("id", FieldDef::key(FieldType::Int)));

        assert!(Arc::ptr_eq(&orm.model("User").unwrap(), &users));
        match events.recv().await.unwrap() {
            ModelEvent::NewModel(class) => assert_eq!(class.name(), "User"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_save_waits_for_backend() {
        let orm = orm();
        let users = orm.declare(
            "User",
            SchemaInfo::new()
                .field("id", FieldDef::key(FieldType::Int))
                .field("email", FieldDef::new(FieldType::Text).with_default(Value::Null))
                .key_generator(|| vec![json!(1)]),
        );
        let mut events = orm.subscribe();

        let user = users.build(record(json!({"email": "a@b.c"})));
        let mut saved = user.save(WriteOptions::default());
        assert!((&mut saved).now_or_never().is_none());

        let connection = RecordingConnection::with_catalog(Catalog::Exists);
        orm.connect_ready(connection.clone());

        saved.await.unwrap();
        assert!(users.is_bound());
        assert_eq!(
            connection.statements(),
            vec![r#"insert user {"email":"a@b.c","id":1}"#]
        );

        let mut saw_ready = false;
        while let Ok(event) = events.try_recv() {
            if let ModelEvent::ClassReady(name) = event {
                saw_ready = name == "User";
            }
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_class_declared_after_ready_still_prepares() {
        let orm = orm();
        let connection = RecordingConnection::with_catalog(Catalog::NotFound);
        orm.connect_ready(connection.clone());
        assert!(orm.is_ready());

        let tokens = orm.define("Token", SchemaInfo::new().field("id", FieldDef::key(FieldType::Uuid)));
        let prepared = tokens.prepare().await.unwrap();

        assert!(prepared.is_bound());
        assert_eq!(connection.statements(), vec!["create_table token null"]);
    }

    #[tokio::test]
    async fn test_models_listed_by_name() {
        let orm = orm();
        orm.define("Zebra", SchemaInfo::new());
        orm.define("Apple", SchemaInfo::new());

        let names: Vec<String> = orm.models().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["Apple", "Zebra"]);
    }
}
