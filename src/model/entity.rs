//! Entity instances
//!
//! One record's data plus its persisted flag. Every backend operation goes through the
//! owning class, so an instance built before the database is up simply queues.

use super::EntityClass;
use crate::command::{Consistency, WriteOptions};
use crate::connection::{Pending, Rows};
use crate::error::OrmResult;
use crate::schema::{Identity, Record};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Entity {
    class: Arc<EntityClass>,
    data: Record,
    exists: bool,
}

impl Entity {
    /// Reset to the class defaults and merge `data` over them
    ///
    /// Instances that do not exist yet are announced on the notification bus.
    pub fn init(class: Arc<EntityClass>, data: Record, exists: bool) -> Self {
        let mut entity = Self {
            data: class.schema().defaults(),
            class,
            exists,
        };
        entity.mixin(data);

        if !entity.exists {
            entity.class.emit_new_instance(&entity);
        }
        entity
    }

    pub fn class(&self) -> &Arc<EntityClass> {
        &self.class
    }

    pub fn data(&self) -> &Record {
        &self.data
    }

    pub fn into_data(self) -> Record {
        self.data
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// `save` never flips the flag; callers do once the backend confirmed the insert.
    pub fn set_exists(&mut self, exists: bool) {
        self.exists = exists;
    }

    pub fn mark_persisted(&mut self) -> &mut Self {
        self.exists = true;
        self
    }

    pub fn defaults(&self) -> Record {
        self.class.schema().defaults()
    }

    /// Replace the data with fresh defaults (new key values included)
    pub fn reset(&mut self) -> &mut Self {
        self.data = self.defaults();
        self
    }

    /// Overwrite-by-key merge; keys not in `data` are left alone
    pub fn mixin(&mut self, data: Record) -> &mut Self {
        for (name, value) in data {
            self.data.insert(name, value);
        }
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.data.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn id(&self) -> Identity {
        self.class.schema().identity(&self.data)
    }

    /// Insert when new, update by identity when persisted
    pub fn save(&self, options: WriteOptions) -> Pending<Rows> {
        if self.exists {
            return self.write_back(options);
        }
        self.class.insert(&self.data, &options)
    }

    /// Merge `data` (if any) and write the record back by identity
    pub fn update(&mut self, data: Option<Record>, options: WriteOptions) -> Pending<Rows> {
        if let Some(data) = data {
            self.mixin(data);
        }
        self.write_back(options)
    }

    fn write_back(&self, options: WriteOptions) -> Pending<Rows> {
        self.class.update_by_id(&self.data, &self.id(), &options)
    }

    /// Delete the record by identity. The local data stays as it is.
    pub fn destroy(&self, options: WriteOptions) -> Pending<Rows> {
        self.class.destroy_by_id(&self.id(), &options)
    }

    /// Re-read by identity and merge the returned columns over the local data
    pub async fn sync(&mut self, consistency: Option<Consistency>) -> OrmResult<()> {
        let command = self.class.builder().select_by_id(&self.id(), consistency);
        let rows = self.class.execute(command).await?;

        if let Some(row) = rows.into_iter().flatten().next() {
            let schema = Arc::clone(self.class.schema());
            for cell in &row {
                let value = schema.from_database(cell.value.clone(), &cell.name);
                self.data.insert(cell.name.clone(), value);
            }
        }
        Ok(())
    }
}
