//! The interface between the protocol layer and the store holding the resources.
//!
//! The protocol layer never talks to a database directly. Everything it needs (loading resources
//! matching a compiled filter, following relationships, and writing resources and linkage) goes
//! through a [`DataSource`]. [`SqlDataSource`](crate::sql::SqlDataSource) implements it on top of
//! an abstract SQL connection.

use super::{filter::Predicate, sort::OrderBy};
use crate::schema::{EntityType, Instance, Relationship, Value};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// A slice of a result set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub offset: usize,
    pub limit: usize,
}

/// A query for the resources of one type.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub predicate: Predicate,
    pub ordering: Vec<OrderBy>,
    pub window: Option<Window>,
}

impl Query {
    /// Every resource, in no particular order.
    pub fn all() -> Self {
        Self {
            predicate: Predicate::always(),
            ordering: vec![],
            window: None,
        }
    }
}

/// A request-scoped session with a store.
///
/// Cloning a data source opens a new session. Writes made inside
/// [`begin`](Self::begin)/[`commit`](Self::commit) are applied atomically.
#[async_trait]
pub trait DataSource: Clone + Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn begin(&self) -> Result<(), Self::Error>;
    async fn commit(&self) -> Result<(), Self::Error>;
    async fn rollback(&self) -> Result<(), Self::Error>;

    /// Load the resources of type `ty` selected by `query`.
    async fn query(&self, ty: &EntityType, query: &Query) -> Result<Vec<Instance>, Self::Error>;

    /// Count the resources of type `ty` satisfying `predicate`.
    async fn count(&self, ty: &EntityType, predicate: &Predicate) -> Result<usize, Self::Error>;

    /// Load resources of type `ty` by ID.
    ///
    /// IDs which do not exist (or are not even valid for the type) are silently skipped, so the
    /// result may be shorter than `ids`.
    async fn get(&self, ty: &EntityType, ids: &[String]) -> Result<Vec<Instance>, Self::Error>;

    /// Load the targets of `rel` for each of the resources `owners` of type `ty`.
    ///
    /// The result maps each owner ID to its targets. Owners with no targets may be missing from
    /// the map.
    async fn load_relation(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owners: &[String],
    ) -> Result<HashMap<String, Vec<Instance>>, Self::Error>;

    /// Create a resource of type `ty`.
    ///
    /// If `values` does not include the ID field, the store assigns one.
    async fn insert(
        &self,
        ty: &EntityType,
        values: BTreeMap<String, Value>,
    ) -> Result<Instance, Self::Error>;

    /// Update fields of a resource. Returns whether the resource exists.
    async fn update(
        &self,
        ty: &EntityType,
        id: &str,
        values: BTreeMap<String, Value>,
    ) -> Result<bool, Self::Error>;

    /// Delete a resource. Returns whether it existed.
    async fn delete(&self, ty: &EntityType, id: &str) -> Result<bool, Self::Error>;

    /// Point the to-one relationship `rel` of `owner` at `target`, or clear it.
    async fn set_to_one(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        target: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// Link `targets` to `owner` through the to-many relationship `rel`.
    ///
    /// Targets which are already linked are left alone.
    async fn add_to_many(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        targets: &[String],
    ) -> Result<(), Self::Error>;

    /// Unlink `targets` from `owner`. Targets which are not linked are ignored.
    async fn remove_from_many(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        targets: &[String],
    ) -> Result<(), Self::Error>;
}
