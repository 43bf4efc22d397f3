//! Relational JSON:API backend based on a SQL database.

pub mod data_source;
pub mod db;
mod ops;

pub use data_source::*;
