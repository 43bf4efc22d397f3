//! Errors reported to clients.
//!
//! Every layer has its own error type. At the protocol boundary they are all converted into
//! [`Error`], which knows the HTTP status it maps to and how to render itself as a list of JSON:API
//! [error objects](ErrorObject).

use super::{filter::FilterError, page::PaginationError, sort::SortError};
use serde::Serialize;
use snafu::Snafu;
use std::fmt::Display;

/// Messages by which a backend reports that a write conflicts with existing data.
const CONFLICT_INDICATORS: &[&str] = &[
    "conflicts with",
    "UNIQUE constraint failed",
    "is not unique",
    "duplicate key",
];

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    #[snafu(context(false), display("{source}"))]
    Filter { source: FilterError },

    #[snafu(context(false), display("{source}"))]
    Sort { source: SortError },

    #[snafu(context(false), display("{source}"))]
    Pagination { source: PaginationError },

    #[snafu(display("{detail}"))]
    BadRequest { detail: String },

    #[snafu(display("{detail}"))]
    NotFound { detail: String },

    #[snafu(display("{detail}"))]
    Conflict { detail: String },

    #[snafu(display("{detail}"))]
    Forbidden { detail: String },

    #[snafu(display("Method {method} is not allowed for {path}"))]
    MethodNotAllowed { method: String, path: String },

    /// A processor hook short-circuited the request.
    #[snafu(display("{detail}"))]
    Processing { status: u16, detail: String },

    /// One or more resources could not be rendered.
    #[snafu(display("{}", failures.join("; ")))]
    Serialization { failures: Vec<String> },

    /// The backend failed. `write` tells whether it failed while modifying data.
    #[snafu(display("{message}"))]
    Backend { message: String, write: bool },
}

impl Error {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::BadRequest {
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound {
            detail: detail.into(),
        }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict {
            detail: detail.into(),
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::Forbidden {
            detail: detail.into(),
        }
    }

    /// The resource `id` of type `ty` does not exist.
    pub fn no_resource(ty: &str, id: &str) -> Self {
        Self::not_found(format!("No resource with ID {id} and type {ty}"))
    }

    /// The backend failed while reading.
    pub fn backend_read(error: impl Display) -> Self {
        Self::Backend {
            message: error.to_string(),
            write: false,
        }
    }

    /// The backend failed while writing.
    pub fn backend_write(error: impl Display) -> Self {
        Self::Backend {
            message: error.to_string(),
            write: true,
        }
    }

    /// The HTTP status code of a response reporting this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Filter { .. }
            | Self::Sort { .. }
            | Self::Pagination { .. }
            | Self::BadRequest { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::Conflict { .. } => 409,
            Self::Processing { status, .. } => *status,
            Self::Serialization { .. } => 500,
            Self::Backend { message, write } => {
                if !write {
                    500
                } else if CONFLICT_INDICATORS.iter().any(|ind| message.contains(ind)) {
                    409
                } else {
                    400
                }
            }
        }
    }

    /// A short, human-readable summary of the kind of error.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Filter { .. } => "Invalid filter",
            Self::Sort { .. } => "Invalid sort",
            Self::Pagination { .. } => "Invalid page",
            Self::Serialization { .. } => "Serialization error",
            Self::Processing { .. } => "Processing error",
            _ => reason(self.status()),
        }
    }

    /// The JSON:API error objects describing this error.
    pub fn objects(&self) -> Vec<ErrorObject> {
        let status = self.status().to_string();
        match self {
            Self::Serialization { failures } => failures
                .iter()
                .map(|failure| ErrorObject {
                    status: status.clone(),
                    title: self.title().into(),
                    detail: failure.clone(),
                })
                .collect(),
            _ => vec![ErrorObject {
                status,
                title: self.title().into(),
                detail: self.to_string(),
            }],
        }
    }
}

/// A JSON:API error object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorObject {
    /// The HTTP status code, as a string.
    pub status: String,
    pub title: String,
    pub detail: String,
}

fn reason(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "Error",
    }
}
