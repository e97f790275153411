//! Business-rule callbacks attached to published services.
//!
//! Services refer to callbacks by identifier. The application registers
//! closures under those identifiers in a [`CallbackRegistry`]; identifiers
//! are resolved once, when a service is registered.

use crate::error::{ServerError, ServerResult};
use crate::source::{Record, SourceTransaction};
use restfeed_protocol::ServiceDefinition;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Turns a stored record into its published representation.
pub type PublishFn = dyn Fn(&Record) -> Result<Value, String> + Send + Sync;

/// Applies a request payload to a (possibly new) record.
pub type UpdateFn = dyn Fn(&mut Record, &Value) -> Result<(), String> + Send + Sync;

/// Deletes a record, possibly touching related records in the same
/// transaction.
pub type DeleteFn = dyn Fn(&mut dyn SourceTransaction, &Record) -> ServerResult<()> + Send + Sync;

/// Named callbacks available to service definitions.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    publish: HashMap<String, Arc<PublishFn>>,
    update: HashMap<String, Arc<UpdateFn>>,
    delete: HashMap<String, Arc<DeleteFn>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publish transform.
    pub fn register_publish<F>(&mut self, id: impl Into<String>, callback: F) -> &mut Self
    where
        F: Fn(&Record) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.publish.insert(id.into(), Arc::new(callback));
        self
    }

    /// Registers an update callback.
    pub fn register_update<F>(&mut self, id: impl Into<String>, callback: F) -> &mut Self
    where
        F: Fn(&mut Record, &Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.update.insert(id.into(), Arc::new(callback));
        self
    }

    /// Registers a delete callback.
    pub fn register_delete<F>(&mut self, id: impl Into<String>, callback: F) -> &mut Self
    where
        F: Fn(&mut dyn SourceTransaction, &Record) -> ServerResult<()> + Send + Sync + 'static,
    {
        self.delete.insert(id.into(), Arc::new(callback));
        self
    }

    /// Resolves the callbacks named by `definition`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown identifiers, or when create
    /// or update is enabled without an update callback.
    pub(crate) fn resolve(&self, definition: &ServiceDefinition) -> ServerResult<ServiceCallbacks> {
        let publish = lookup(&self.publish, definition, definition.on_publish.as_deref())?;
        let update = lookup(&self.update, definition, definition.on_update.as_deref())?;
        let delete = lookup(&self.delete, definition, definition.on_delete.as_deref())?;

        let writable = definition.flags.create || definition.flags.update;
        if writable && update.is_none() {
            return Err(ServerError::Configuration(format!(
                "service '{}' allows create or update but has no update callback",
                definition.name
            )));
        }

        Ok(ServiceCallbacks {
            publish,
            update,
            delete,
        })
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("publish", &self.publish.keys().collect::<Vec<_>>())
            .field("update", &self.update.keys().collect::<Vec<_>>())
            .field("delete", &self.delete.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lookup<T: ?Sized>(
    table: &HashMap<String, Arc<T>>,
    definition: &ServiceDefinition,
    id: Option<&str>,
) -> ServerResult<Option<(String, Arc<T>)>> {
    let Some(id) = id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };
    table
        .get(id)
        .map(|callback| Some((id.to_string(), Arc::clone(callback))))
        .ok_or_else(|| {
            ServerError::Configuration(format!(
                "service '{}' refers to unknown callback '{id}'",
                definition.name
            ))
        })
}

/// Callbacks resolved for one service.
#[derive(Clone)]
pub(crate) struct ServiceCallbacks {
    publish: Option<(String, Arc<PublishFn>)>,
    update: Option<(String, Arc<UpdateFn>)>,
    delete: Option<(String, Arc<DeleteFn>)>,
}

impl ServiceCallbacks {
    /// Publishes a record. Without a transform the record itself is served.
    pub(crate) fn publish(&self, record: &Record) -> ServerResult<Value> {
        match &self.publish {
            Some((id, callback)) => callback(record).map_err(|message| ServerError::Callback {
                callback: id.clone(),
                message,
            }),
            None => Ok(Value::Object(record.clone())),
        }
    }

    pub(crate) fn update(&self, record: &mut Record, payload: &Value) -> ServerResult<()> {
        let Some((id, callback)) = &self.update else {
            return Err(ServerError::Configuration(
                "no update callback configured".to_string(),
            ));
        };
        callback(record, payload).map_err(|message| ServerError::Callback {
            callback: id.clone(),
            message,
        })
    }

    /// Runs the delete callback. Returns false if none is configured.
    pub(crate) fn delete(
        &self,
        tx: &mut dyn SourceTransaction,
        record: &Record,
    ) -> ServerResult<bool> {
        match &self.delete {
            Some((_, callback)) => callback(tx, record).map(|()| true),
            None => Ok(false),
        }
    }
}
