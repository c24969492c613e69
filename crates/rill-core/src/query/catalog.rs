//! Named views available for querying.

use super::{Query, QueryResult};
use crate::error::{Error, QueryError, Result};
use crate::sink::MaterializedView;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of materialized views by name.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct ViewCatalog {
    views: Arc<DashMap<String, Arc<MaterializedView>>>,
}

impl ViewCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view under its name. Names must be unique.
    pub fn register(&self, view: Arc<MaterializedView>) -> Result<()> {
        let name = view.name().to_string();
        match self.views.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Config(format!(
                "View {} is already registered",
                name
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(view);
                info!(view = %name, "Registered view");
                Ok(())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<MaterializedView>> {
        self.views.remove(name).map(|(_, v)| v)
    }

    pub fn get(&self, name: &str) -> std::result::Result<Arc<MaterializedView>, QueryError> {
        self.views
            .get(name)
            .map(|v| v.value().clone())
            .ok_or_else(|| QueryError::ViewNotFound(name.to_string()))
    }

    /// Registered view names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Run a query against the named view.
    pub fn query(&self, name: &str, query: &Query) -> std::result::Result<QueryResult, QueryError> {
        self.get(name)?.query(query)
    }
}
