//! Common items that you will always want in scope when serving a JSON:API.

pub use crate::jsonapi::{
    api::{Api, ApiConfig, HttpMethod, Method, ProcessingError, Request, ResourceConfig, Response},
    backend::DataSource,
    document::{Document, Serializer},
    Error,
};
pub use crate::schema::{
    EntityType, Field, FieldType, Identifier, Instance, Relationship, Schema, Storage, Value,
};

#[cfg(feature = "sql")]
pub use crate::sql::SqlDataSource;
