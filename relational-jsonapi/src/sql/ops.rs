//! Compilation of high-level JSON:API operations into low-level SQL operations.

use super::db::{self, Column, SchemaColumn, SelectColumn, Type};
use crate::schema::{EntityType, FieldType, Instance, Relationship, Schema, Storage, Value};
use convert_case::{Case, Casing};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::Display;

pub mod insert;
pub mod register;
pub mod relation;
pub mod select;
pub mod update;

/// Errors encountered when executing JSON:API operations.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{error}"))]
    Sql { error: String },

    #[snafu(display("type mismatch: {error}"))]
    TypeMismatch { error: String },

    #[snafu(display("no such type {ty}"))]
    UnknownType { ty: String },

    #[snafu(display("an ID is required to create a resource of type {ty}"))]
    MissingId { ty: String },

    #[snafu(display("no such field {ty}.{field}"))]
    UnknownField { ty: String, field: String },

    #[snafu(display("no such relationship {ty}.{relationship}"))]
    UnknownRelationship { ty: String, relationship: String },

    #[snafu(display("relationship {ty}.{relationship} does not support {operation}"))]
    Unsupported {
        ty: String,
        relationship: String,
        operation: &'static str,
    },
}

impl Error {
    /// An error in the SQL layer.
    pub fn sql(error: impl Display) -> Self {
        Self::Sql {
            error: error.to_string(),
        }
    }
}

/// Look up an entity type.
fn entity<'s>(schema: &'s Schema, ty: &str) -> Result<&'s EntityType, Error> {
    schema
        .entity(ty)
        .ok_or_else(|| Error::UnknownType { ty: ty.into() })
}

/// Look up a relationship and the entity type it targets.
fn relationship<'s>(
    schema: &'s Schema,
    ty: &'s EntityType,
    name: &str,
) -> Result<(&'s Relationship, &'s EntityType), Error> {
    let rel = ty
        .get_relationship(name)
        .ok_or_else(|| Error::UnknownRelationship {
            ty: ty.name().into(),
            relationship: name.into(),
        })?;
    Ok((rel, entity(schema, rel.target())?))
}

/// The name of the table corresponding to the entity `ty`.
fn table_name(ty: &EntityType) -> String {
    match ty.table_name() {
        Some(table) => table.into(),
        None => to_snake_case(ty.name()),
    }
}

/// The name of the column corresponding to the field with name `field_name`.
fn column_name(field_name: &str) -> String {
    to_snake_case(field_name)
}

/// The column holding the ID of `ty`, qualified by `alias`.
fn id_column(ty: &EntityType, alias: &str) -> Column<'static> {
    Column::qualified(alias.to_string(), column_name(ty.id_field().name()))
}

/// The column corresponding to `field`, qualified by `alias`.
fn field_column(alias: &str, field: &str) -> Column<'static> {
    Column::qualified(alias.to_string(), column_name(field))
}

/// Select every field of `ty`, in declaration order.
fn field_columns(ty: &EntityType, alias: &str) -> Vec<SelectColumn<'static>> {
    ty.fields()
        .iter()
        .map(|f| SelectColumn::Column(field_column(alias, f.name())))
        .collect()
}

/// Convert a string to snake case.
fn to_snake_case(s: &str) -> String {
    use convert_case::Boundary::*;
    s.with_boundaries(&[Hyphen, Underscore, Space, LowerUpper])
        .to_case(Case::Snake)
}

/// Parse resource IDs, dropping those which are not valid for `ty`.
///
/// An ID which does not parse cannot identify any stored row.
fn parse_ids<'i>(ty: &EntityType, ids: impl IntoIterator<Item = &'i String>) -> Vec<db::Value> {
    ids.into_iter()
        .filter_map(|id| ty.parse_id(id))
        .map(|id| lower_value(&id))
        .collect()
}

/// Parse a single resource ID.
fn parse_id(ty: &EntityType, id: &str) -> Result<db::Value, Error> {
    ty.parse_id(id)
        .map(|id| lower_value(&id))
        .ok_or_else(|| Error::TypeMismatch {
            error: format!("invalid ID {id} for type {}", ty.name()),
        })
}

/// Convert a [`Value`] to a database [`Value`](db::Value).
fn lower_value(val: &Value) -> db::Value {
    match val {
        Value::Null => db::Value::Null,
        Value::Bool(b) => db::Value::Bool(*b),
        Value::Int(x) => db::Value::Int8(*x),
        Value::Float(x) => db::Value::Float8(*x),
        Value::String(s) | Value::Enum(s) => db::Value::Text(s.clone()),
        Value::Date(d) => db::Value::Date(*d),
        Value::DateTime(d) => db::Value::Timestamp(*d),
        Value::Time(t) => db::Value::Time(*t),
        Value::Duration(d) => db::Value::Interval(*d),
    }
}

/// Convert a database [`Value`](db::Value) to a [`Value`] of type `ty`.
fn lift_value(ty: &FieldType, val: db::Value) -> Result<Value, Error> {
    Ok(match (ty, val) {
        (_, db::Value::Null) => Value::Null,
        (FieldType::String, db::Value::Text(s)) => Value::String(s),
        (FieldType::Enum(_), db::Value::Text(s)) => Value::Enum(s),
        (FieldType::Int, db::Value::Int8(x)) => Value::Int(x),
        (FieldType::Float, db::Value::Float8(x)) => Value::Float(x),
        (FieldType::Float, db::Value::Int8(x)) => Value::Float(x as f64),
        (FieldType::Bool, db::Value::Bool(b)) => Value::Bool(b),
        (FieldType::Date, db::Value::Date(d)) => Value::Date(d),
        (FieldType::DateTime, db::Value::Timestamp(d)) => Value::DateTime(d),
        (FieldType::Time, db::Value::Time(t)) => Value::Time(t),
        (FieldType::Duration, db::Value::Interval(d)) => Value::Duration(d),
        (ty, val) => {
            return Err(Error::TypeMismatch {
                error: format!("cannot convert {val} to {ty:?}"),
            })
        }
    })
}

/// Convert a [`FieldType`] to a SQL [`Type`].
fn lower_field_type(ty: &FieldType) -> Type {
    match ty {
        FieldType::String | FieldType::Enum(_) => Type::Text,
        FieldType::Int => Type::Int8,
        FieldType::Float => Type::Float8,
        FieldType::Bool => Type::Bool,
        FieldType::Date => Type::Date,
        FieldType::DateTime => Type::Timestamp,
        FieldType::Time => Type::Time,
        FieldType::Duration => Type::Interval,
    }
}

/// The type of a column holding IDs of `ty`.
fn id_type(ty: &EntityType) -> Type {
    lower_field_type(ty.id_field().ty())
}

/// The columns of the table storing `ty`.
///
/// These are the columns for each field, followed by foreign key columns. A foreign key column is
/// owned by this table either because a relationship of `ty` stores its key locally, or because a
/// relationship of some other type targeting `ty` stores its key on the target.
fn table_columns(schema: &Schema, ty: &EntityType) -> Result<Vec<SchemaColumn<'static>>, Error> {
    let mut columns = BTreeMap::new();
    for field in ty.fields() {
        let sql_ty = if field.name() == ty.id_field().name() && *field.ty() == FieldType::Int {
            Type::Serial
        } else {
            lower_field_type(field.ty())
        };
        columns.insert(column_name(field.name()), (columns.len(), sql_ty));
    }

    let mut foreign = vec![];
    for rel in ty.relationships() {
        if let Storage::OwnerKey { column } = rel.storage() {
            foreign.push((column.clone(), id_type(entity(schema, rel.target())?)));
        }
    }
    for owner in schema.entities() {
        for rel in owner.relationships() {
            if let Storage::TargetKey { column } = rel.storage() {
                if rel.target() == ty.name() {
                    foreign.push((column.clone(), id_type(owner)));
                }
            }
        }
    }
    for (column, sql_ty) in foreign {
        let index = columns.len();
        columns.entry(column).or_insert((index, sql_ty));
    }

    let mut columns = columns.into_iter().collect::<Vec<_>>();
    columns.sort_by_key(|(_, (index, _))| *index);
    Ok(columns
        .into_iter()
        .map(|(name, (_, sql_ty))| SchemaColumn::new(name, sql_ty))
        .collect())
}

/// Reconstruct an instance of `ty` from a row selecting [`field_columns`], starting at `offset`.
fn parse_row<R: db::Row>(ty: &EntityType, row: &R, offset: usize) -> Result<Instance, Error> {
    let mut values = BTreeMap::new();
    for (i, field) in ty.fields().iter().enumerate() {
        let val = row.column(offset + i).map_err(Error::sql)?;
        values.insert(field.name().to_string(), lift_value(field.ty(), val)?);
    }
    Ok(Instance::new(ty, values))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::schema::test::blog;
    use crate::sql::db::{mock, Connection, Insert};

    /// A mock database with the tables for [`blog`] and a few rows in each.
    ///
    /// * people: 1 alice (30), 2 bob (no age), 3 carol (20)
    /// * articles: 1 "Hello" by alice, 2 "Rust" by alice, 3 "Orphan" with no author
    /// * comments: 1 "first" on article 1 by bob, 2 "second" on article 1 by carol,
    ///   3 "meh" on article 2 with no author
    /// * tags: red "news" on articles 1 and 2, green "tech" on article 2
    pub async fn blog_db() -> (Schema, mock::Connection) {
        let schema = blog();
        let conn = mock::Connection::create();
        register::execute(&conn, &schema).await.unwrap();

        conn.insert("person", ["name", "age", "other"])
            .rows([
                vec!["alice".into(), 30.into(), db::Value::Float8(1.5)],
                vec!["bob".into(), db::Value::Null, db::Value::Null],
                vec!["carol".into(), 20.into(), db::Value::Float8(-2.0)],
            ])
            .execute()
            .await
            .unwrap();
        let published = |d: &str| {
            db::Value::Timestamp(crate::schema::parse_datetime(d).unwrap())
        };
        conn.insert("article", ["title", "published", "author_id"])
            .rows([
                vec!["Hello".into(), published("2020-01-01T00:00:00"), 1.into()],
                vec!["Rust".into(), published("2021-06-15T12:00:00"), 1.into()],
                vec!["Orphan".into(), db::Value::Null, db::Value::Null],
            ])
            .execute()
            .await
            .unwrap();
        conn.insert("comment", ["body", "article_id", "author_id"])
            .rows([
                vec!["first".into(), 1.into(), 2.into()],
                vec!["second".into(), 1.into(), 3.into()],
                vec!["meh".into(), 2.into(), db::Value::Null],
            ])
            .execute()
            .await
            .unwrap();
        conn.insert("tag", ["name", "color"])
            .rows([
                vec!["news".into(), "red".into()],
                vec!["tech".into(), "green".into()],
            ])
            .execute()
            .await
            .unwrap();
        conn.insert("article_tags", ["article_id", "tag_id"])
            .rows([
                vec![1.into(), "news".into()],
                vec![2.into(), "news".into()],
                vec![2.into(), "tech".into()],
            ])
            .execute()
            .await
            .unwrap();

        (schema, conn)
    }

    #[test]
    fn test_names() {
        assert_eq!(to_snake_case("BlogPost"), "blog_post");
        assert_eq!(to_snake_case("blog-post"), "blog_post");
        let schema = blog();
        assert_eq!(table_name(schema.entity("person").unwrap()), "person");
    }

    #[test]
    fn test_table_columns() {
        let schema = blog();
        let columns = table_columns(&schema, schema.entity("article").unwrap())
            .unwrap()
            .into_iter()
            .map(|col| (col.name().into_owned(), col.ty()))
            .collect::<Vec<_>>();
        assert_eq!(
            columns,
            [
                ("id".to_string(), Type::Serial),
                ("title".to_string(), Type::Text),
                ("published".to_string(), Type::Timestamp),
                ("author_id".to_string(), Type::Int8),
            ]
        );

        let columns = table_columns(&schema, schema.entity("comment").unwrap()).unwrap();
        assert_eq!(
            columns.iter().map(|col| col.name()).collect::<Vec<_>>(),
            ["id", "body", "article_id", "author_id"]
        );
    }

    #[test]
    fn test_lift_lower() {
        let ty = FieldType::enumeration(["red", "green"]);
        let val = Value::Enum("red".into());
        assert_eq!(lift_value(&ty, lower_value(&val)).unwrap(), val);
        assert_eq!(
            lift_value(&FieldType::Float, db::Value::Int8(2)).unwrap(),
            Value::Float(2.0)
        );
        assert!(lift_value(&FieldType::Int, db::Value::Text("x".into())).is_err());
        assert_eq!(lift_value(&FieldType::Int, db::Value::Null).unwrap(), Value::Null);
    }
}
