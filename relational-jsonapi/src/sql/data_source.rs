//! Instantiation of a JSON:API [`DataSource`] for a SQL database.

use super::{db, ops};
use crate::{
    jsonapi::{
        backend::{DataSource, Query},
        filter::Predicate,
    },
    schema::{EntityType, Instance, Relationship, Schema, Value},
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A data source implemented using a SQL database.
#[derive(Clone, Debug)]
pub struct SqlDataSource<Db> {
    db: Db,
    schema: Arc<Schema>,
}

impl<Db: db::Connection> SqlDataSource<Db> {
    /// A data source for `schema`, stored in `db`.
    ///
    /// The tables for every entity type in `schema` are created if they do not already exist.
    pub async fn new(db: Db, schema: Arc<Schema>) -> Result<Self, ops::Error> {
        ops::register::execute(&db, &schema).await?;
        Ok(Self { db, schema })
    }

    /// The underlying connection to the database.
    pub fn inner(&self) -> &Db {
        &self.db
    }

    /// Unwrap this data source to get at the underlying connection.
    pub fn into_inner(self) -> Db {
        self.db
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

#[async_trait]
impl<Db: 'static + db::Connection> DataSource for SqlDataSource<Db> {
    type Error = ops::Error;

    async fn begin(&self) -> Result<(), Self::Error> {
        self.db.begin().await.map_err(ops::Error::sql)
    }

    async fn commit(&self) -> Result<(), Self::Error> {
        self.db.commit().await.map_err(ops::Error::sql)
    }

    async fn rollback(&self) -> Result<(), Self::Error> {
        self.db.rollback().await.map_err(ops::Error::sql)
    }

    async fn query(&self, ty: &EntityType, query: &Query) -> Result<Vec<Instance>, Self::Error> {
        ops::select::execute(&self.db, &self.schema, ty, query).await
    }

    async fn count(&self, ty: &EntityType, predicate: &Predicate) -> Result<usize, Self::Error> {
        ops::select::count(&self.db, &self.schema, ty, predicate).await
    }

    async fn get(&self, ty: &EntityType, ids: &[String]) -> Result<Vec<Instance>, Self::Error> {
        ops::select::get(&self.db, ty, ids).await
    }

    async fn load_relation(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owners: &[String],
    ) -> Result<HashMap<String, Vec<Instance>>, Self::Error> {
        ops::select::load_relation(&self.db, &self.schema, ty, rel, owners).await
    }

    async fn insert(
        &self,
        ty: &EntityType,
        values: BTreeMap<String, Value>,
    ) -> Result<Instance, Self::Error> {
        ops::insert::execute(&self.db, ty, &values).await
    }

    async fn update(
        &self,
        ty: &EntityType,
        id: &str,
        values: BTreeMap<String, Value>,
    ) -> Result<bool, Self::Error> {
        ops::update::execute(&self.db, ty, id, &values).await
    }

    async fn delete(&self, ty: &EntityType, id: &str) -> Result<bool, Self::Error> {
        ops::update::delete(&self.db, &self.schema, ty, id).await
    }

    async fn set_to_one(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        target: Option<&str>,
    ) -> Result<(), Self::Error> {
        ops::relation::set_to_one(&self.db, &self.schema, ty, rel, owner, target).await
    }

    async fn add_to_many(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        targets: &[String],
    ) -> Result<(), Self::Error> {
        ops::relation::add_to_many(&self.db, &self.schema, ty, rel, owner, targets).await
    }

    async fn remove_from_many(
        &self,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        targets: &[String],
    ) -> Result<(), Self::Error> {
        ops::relation::remove_from_many(&self.db, &self.schema, ty, rel, owner, targets).await
    }
}
