//! Compilation of resource updates and deletions into SQL `UPDATE` and `DELETE` statements.

use super::{column_name, id_column, lower_value, select, table_name, Error};
use crate::{
    schema::{EntityType, Schema, Storage, Value},
    sql::db::{self, Boolean, Column, Connection, Delete, Update},
};
use std::collections::BTreeMap;

/// Set fields of the resource `id` of type `ty`.
///
/// Returns whether the resource exists.
pub async fn execute<C: Connection>(
    conn: &C,
    ty: &EntityType,
    id: &str,
    values: &BTreeMap<String, Value>,
) -> Result<bool, Error> {
    if let Some(field) = values.keys().find(|field| ty.get_field(field).is_none()) {
        return Err(Error::UnknownField {
            ty: ty.name().into(),
            field: field.clone(),
        });
    }
    if values.is_empty() {
        return Ok(!select::get(conn, ty, &[id.to_string()]).await?.is_empty());
    }
    let Some(id) = ty.parse_id(id) else {
        return Ok(false);
    };

    let table = table_name(ty);
    let mut update = conn
        .update(&table)
        .filter(Boolean::cmp(id_column(ty, &table), "=", lower_value(&id)));
    for (field, val) in values {
        update = update.set(column_name(field), lower_value(val));
    }
    let updated = update.execute().await.map_err(Error::sql)?;
    Ok(updated > 0)
}

/// Delete the resource `id` of type `ty`.
///
/// Linkage to the resource is removed first: join table rows referring to it are deleted and
/// foreign keys referring to it are set to `NULL`. Returns whether the resource existed.
pub async fn delete<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    id: &str,
) -> Result<bool, Error> {
    let Some(id) = ty.parse_id(id) else {
        return Ok(false);
    };
    let id = lower_value(&id);

    // Relationships of `ty` itself.
    for rel in ty.relationships() {
        match rel.storage() {
            Storage::OwnerKey { .. } => {}
            Storage::TargetKey { column } => {
                let target = super::entity(schema, rel.target())?;
                clear_key(conn, &table_name(target), column, &id).await?;
            }
            Storage::JoinTable {
                table,
                owner_column,
                ..
            } => delete_links(conn, table, owner_column, &id).await?,
        }
    }

    // Relationships of other types targeting `ty`.
    for owner in schema.entities() {
        for rel in owner.relationships() {
            if rel.target() != ty.name() {
                continue;
            }
            match rel.storage() {
                Storage::OwnerKey { column } => {
                    clear_key(conn, &table_name(owner), column, &id).await?
                }
                Storage::TargetKey { .. } => {}
                Storage::JoinTable {
                    table,
                    target_column,
                    ..
                } => delete_links(conn, table, target_column, &id).await?,
            }
        }
    }

    let table = table_name(ty);
    let deleted = conn
        .delete(&table)
        .filter(Boolean::cmp(id_column(ty, &table), "=", id))
        .execute()
        .await
        .map_err(Error::sql)?;
    tracing::debug!("deleted {deleted} rows from {table}");
    Ok(deleted > 0)
}

/// Set `column` to `NULL` wherever it refers to `id`.
async fn clear_key<C: Connection>(
    conn: &C,
    table: &str,
    column: &str,
    id: &db::Value,
) -> Result<(), Error> {
    conn.update(table)
        .set(column, db::Value::Null)
        .filter(Boolean::cmp(
            Column::qualified(table, column),
            "=",
            id.clone(),
        ))
        .execute()
        .await
        .map_err(Error::sql)?;
    Ok(())
}

/// Delete the rows of a join table whose `column` refers to `id`.
async fn delete_links<C: Connection>(
    conn: &C,
    table: &str,
    column: &str,
    id: &db::Value,
) -> Result<(), Error> {
    conn.delete(table)
        .filter(Boolean::cmp(
            Column::qualified(table, column),
            "=",
            id.clone(),
        ))
        .execute()
        .await
        .map_err(Error::sql)?;
    Ok(())
}
