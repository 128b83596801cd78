//! Process-wide model registry.
//!
//! Registration and eviction go through one `RwLock`; the models themselves
//! are immutable and read without locking through [`ModelHandle`]s. Removing
//! a model from the table never invalidates a handle a session still holds.

use std::path::Path;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::Model;
use super::format::read_model;
use crate::daemon::protocol::ModelInfo;
use crate::error::{LoadError, StoreError};

/// Shared, reference-counted access to a loaded model.
pub type ModelHandle = Arc<Model>;

#[derive(Default)]
struct Table {
    models: FxHashMap<String, ModelHandle>,
    /// Registration order, used for listing and the implicit default.
    order: Vec<String>,
    default: Option<String>,
}

/// Registry of loaded models.
#[derive(Default)]
pub struct ModelStore {
    table: RwLock<Table>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a model file and register it.
    ///
    /// An existing entry with the same name is replaced; sessions holding the
    /// previous handle keep using it until they finish.
    pub fn load(&self, name: Option<&str>, path: &Path) -> Result<ModelHandle, LoadError> {
        let model = read_model(path, name)?;
        info!(
            name = %model.name(),
            path = %path.display(),
            labels = model.labels().len(),
            dim = model.dim(),
            vocabulary = model.nwords(),
            "Loaded model"
        );
        Ok(self.insert(model))
    }

    /// Register an already-built model.
    pub fn insert(&self, model: Model) -> ModelHandle {
        let name = model.name().to_string();
        let handle = Arc::new(model);
        let mut table = self.table.write();
        if table.models.insert(name.clone(), Arc::clone(&handle)).is_some() {
            info!(name = %name, "Replaced model");
        } else {
            table.order.push(name);
        }
        handle
    }

    /// Handle to the model registered under `name`.
    pub fn get(&self, name: &str) -> Result<ModelHandle, StoreError> {
        self.table
            .read()
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Handle to `name`, or to the default model when `name` is `None`.
    ///
    /// The default is the one set with [`set_default`](Self::set_default),
    /// else the first model registered.
    pub fn resolve(&self, name: Option<&str>) -> Result<ModelHandle, StoreError> {
        if let Some(name) = name {
            return self.get(name);
        }
        let table = self.table.read();
        let default = table
            .default
            .as_ref()
            .or_else(|| table.order.first())
            .ok_or(StoreError::Empty)?;
        table
            .models
            .get(default)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(default.clone()))
    }

    /// Choose which model serves sessions that do not name one.
    pub fn set_default(&self, name: &str) -> Result<(), StoreError> {
        let mut table = self.table.write();
        if !table.models.contains_key(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }
        table.default = Some(name.to_string());
        Ok(())
    }

    /// Remove a model from the table and return the store's handle to it.
    pub fn unload(&self, name: &str) -> Result<ModelHandle, StoreError> {
        let mut table = self.table.write();
        let handle = table
            .models
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        table.order.retain(|n| n != name);
        if table.default.as_deref() == Some(name) {
            table.default = None;
        }
        let outstanding = Arc::strong_count(&handle) - 1;
        if outstanding > 0 {
            warn!(name = %name, outstanding, "Unloaded model still referenced by sessions");
        } else {
            info!(name = %name, "Unloaded model");
        }
        Ok(handle)
    }

    /// Loaded models in registration order.
    pub fn list(&self) -> Vec<ModelInfo> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|name| table.models.get(name))
            .map(|model| model.info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry; used at shutdown.
    pub fn drain(&self) -> usize {
        let mut table = self.table.write();
        let count = table.models.len();
        table.models.clear();
        table.order.clear();
        table.default = None;
        count
    }
}
