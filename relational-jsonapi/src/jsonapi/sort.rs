//! Resolution of the `sort` query parameter.

use crate::schema::{EntityType, Schema};
use snafu::Snafu;
use std::str::FromStr;

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum SortError {
    #[snafu(display("Invalid sorting: No such field {name}"))]
    UnknownField { name: String },

    #[snafu(display("Invalid sorting: can not sort by the to-many relationship {name}"))]
    ToMany { name: String },
}

/// A client's sort request, as written in the `sort` query parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SortRequest {
    /// No sort was requested; order by primary key.
    #[default]
    Default,
    /// `sort=0`: leave the order up to the backend.
    Disabled,
    Keys(Vec<SortKey>),
}

/// A dotted path to sort by, like `author.name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub descending: bool,
    pub path: Vec<String>,
}

impl FromStr for SortKey {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (descending, path) = match s.strip_prefix('-') {
            Some(path) => (true, path),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let path = path.split('.').map(String::from).collect::<Vec<_>>();
        if let Some(segment) = path.iter().find(|segment| segment.is_empty()) {
            return Err(SortError::UnknownField {
                name: segment.clone(),
            });
        }
        Ok(Self { descending, path })
    }
}

impl FromStr for SortRequest {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(Self::Default),
            "0" => Ok(Self::Disabled),
            s => Ok(Self::Keys(
                s.split(',')
                    .map(|key| key.trim().parse())
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}

/// One resolved sort key.
///
/// `path` is the (possibly empty) sequence of to-one relationships to follow from the sorted type
/// before reaching the type which owns `field`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub path: Vec<String>,
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            path: vec![],
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            descending: true,
            ..Self::asc(field)
        }
    }
}

/// Resolve a sort request for resources of type `ty`.
pub fn resolve(
    schema: &Schema,
    ty: &EntityType,
    req: &SortRequest,
) -> Result<Vec<OrderBy>, SortError> {
    match req {
        SortRequest::Default => Ok(ty.primary_key().iter().map(OrderBy::asc).collect()),
        SortRequest::Disabled => Ok(vec![]),
        SortRequest::Keys(keys) => keys.iter().map(|key| resolve_key(schema, ty, key)).collect(),
    }
}

fn resolve_key(schema: &Schema, ty: &EntityType, key: &SortKey) -> Result<OrderBy, SortError> {
    let Some((field, rels)) = key.path.split_last() else {
        return Err(SortError::UnknownField { name: String::new() });
    };

    let mut ty = ty;
    for name in rels {
        let rel = ty
            .get_relationship(name)
            .ok_or_else(|| SortError::UnknownField { name: name.clone() })?;
        if rel.is_to_many() {
            return Err(SortError::ToMany { name: name.clone() });
        }
        ty = schema
            .entity(rel.target())
            .ok_or_else(|| SortError::UnknownField { name: name.clone() })?;
    }
    if ty.get_field(field).is_none() {
        return Err(SortError::UnknownField {
            name: field.clone(),
        });
    }

    Ok(OrderBy {
        path: rels.to_vec(),
        field: field.clone(),
        descending: key.descending,
    })
}
