//! Relational JSON:API is a protocol engine which serves [JSON:API](https://jsonapi.org) documents
//! from relational data. It consists of two sections:
//!
//! * A [protocol layer](jsonapi), which compiles client requests (filters, sorting, pagination,
//!   inclusion of related resources and sparse fieldsets) into abstract queries and assembles the
//!   results into JSON:API documents. [`Api`](jsonapi::api::Api) exposes every JSON:API endpoint
//!   for a set of resource types through a transport-neutral request handler.
//! * A [backend](jsonapi::backend), which is responsible for executing those queries. The protocol
//!   layer is completely agnostic to the specifics of the application's data model. It uses a
//!   generic [schema] describing the resource types and their relationships, so that one backend
//!   can serve many applications.
//!
//! This crate comes with a [sql] backend, which works with any implementation of the abstract
//! [`Connection`](sql::db::Connection) interface. An in-memory implementation, which is useful for
//! lightweight testing, is available with the `mocks` feature. The library is completely modular,
//! though, so it is possible to implement your own backend to meet your application's specific
//! needs by implementing the [`DataSource`](jsonapi::backend::DataSource) trait.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

pub mod jsonapi;
pub mod prelude;
pub mod schema;
#[cfg(feature = "sql")]
pub mod sql;

/// Initialize tracing.
pub fn init_logging() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        color_eyre::install().unwrap();
        tracing_subscriber::fmt()
            .with_ansi(true)
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    });
}
