//! Compilation of resource creation into SQL `INSERT` statements.

use super::{column_name, lift_value, lower_value, select, table_name, Error};
use crate::{
    schema::{EntityType, FieldType, Instance, Value},
    sql::db::{Connection, Insert},
};
use std::collections::BTreeMap;

/// Insert a resource of type `ty` with the given field values.
///
/// If no ID is given, the database generates one. Fields which are not given are `NULL`. The
/// stored resource is read back and returned.
pub async fn execute<C: Connection>(
    conn: &C,
    ty: &EntityType,
    values: &BTreeMap<String, Value>,
) -> Result<Instance, Error> {
    if let Some(field) = values.keys().find(|field| ty.get_field(field).is_none()) {
        return Err(Error::UnknownField {
            ty: ty.name().into(),
            field: field.clone(),
        });
    }

    let id_field = ty.id_field();
    let given_id = values.get(id_field.name()).filter(|id| !id.is_null());
    if given_id.is_none() && *id_field.ty() != FieldType::Int {
        return Err(Error::MissingId {
            ty: ty.name().into(),
        });
    }

    // Leave a null ID out of the statement, so that the database fills it in.
    let (columns, row): (Vec<_>, Vec<_>) = values
        .iter()
        .filter(|(field, val)| *field != id_field.name() || !val.is_null())
        .map(|(field, val)| (column_name(field), lower_value(val)))
        .unzip();

    let table = table_name(ty);
    let mut insert = conn.insert(&table, columns).rows([row]);
    if given_id.is_none() {
        insert = insert.returning(column_name(id_field.name()));
    }
    let returned = insert.execute().await.map_err(Error::sql)?;

    let id = match given_id {
        Some(id) => id.to_string(),
        None => {
            let id = returned
                .into_iter()
                .next()
                .ok_or_else(|| Error::sql("insert did not return an ID"))?;
            lift_value(id_field.ty(), id)?.to_string()
        }
    };
    tracing::debug!("inserted {}/{id}", ty.name());

    select::get(conn, ty, &[id.clone()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::sql(format!("inserted resource {}/{id} not found", ty.name())))
}
