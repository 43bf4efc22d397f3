//! Compilation of relationship mutations into SQL statements.
//!
//! How a link between two resources is added or removed depends on where the relationship stores
//! its linkage:
//!
//! * [`OwnerKey`](Storage::OwnerKey): a column on the owner's row holds the target's ID. Only
//!   to-one relationships can be stored this way.
//! * [`TargetKey`](Storage::TargetKey): a column on each target's row holds the owner's ID.
//! * [`JoinTable`](Storage::JoinTable): each link is a row in a separate table.

use super::{id_column, parse_id, parse_ids, relationship, table_name, Error};
use crate::{
    schema::{EntityType, Relationship, Schema, Storage},
    sql::db::{
        self, Boolean, Column, Connection, Delete, Insert, Row, SelectColumn, SelectExt, Update,
        WhereClause,
    },
};
use std::collections::HashSet;

/// Point the to-one relationship `rel` of `owner` at `target`, or clear it.
pub async fn set_to_one<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    target: Option<&str>,
) -> Result<(), Error> {
    if rel.is_to_many() {
        return Err(unsupported(ty, rel, "to-one replacement"));
    }
    let (_, target_ty) = relationship(schema, ty, rel.name())?;
    let owner = parse_id(ty, owner)?;
    let target = target.map(|id| parse_id(target_ty, id)).transpose()?;

    match rel.storage() {
        Storage::OwnerKey { column } => {
            let table = table_name(ty);
            conn.update(&table)
                .set(column.as_str(), target.unwrap_or(db::Value::Null))
                .filter(Boolean::cmp(id_column(ty, &table), "=", owner))
                .execute()
                .await
                .map_err(Error::sql)?;
        }
        Storage::TargetKey { column } => {
            // Unlink the old target, if any, then link the new one.
            let table = table_name(target_ty);
            conn.update(&table)
                .set(column.as_str(), db::Value::Null)
                .filter(Boolean::cmp(
                    Column::qualified(table.as_str(), column.as_str()),
                    "=",
                    owner.clone(),
                ))
                .execute()
                .await
                .map_err(Error::sql)?;
            if let Some(target) = target {
                conn.update(&table)
                    .set(column.as_str(), owner)
                    .filter(Boolean::cmp(id_column(target_ty, &table), "=", target))
                    .execute()
                    .await
                    .map_err(Error::sql)?;
            }
        }
        Storage::JoinTable {
            table,
            owner_column,
            target_column,
        } => {
            conn.delete(table)
                .filter(Boolean::cmp(
                    Column::qualified(table.as_str(), owner_column.as_str()),
                    "=",
                    owner.clone(),
                ))
                .execute()
                .await
                .map_err(Error::sql)?;
            if let Some(target) = target {
                conn.insert(table, [owner_column, target_column])
                    .rows([vec![owner, target]])
                    .execute()
                    .await
                    .map_err(Error::sql)?;
            }
        }
    }
    Ok(())
}

/// Link each of `targets` to `owner`, skipping targets which are already linked.
pub async fn add_to_many<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    targets: &[String],
) -> Result<(), Error> {
    let (_, target_ty) = relationship(schema, ty, rel.name())?;
    let owner = parse_id(ty, owner)?;
    let targets = parse_ids(target_ty, targets);
    if targets.is_empty() {
        return Ok(());
    }

    match rel.storage() {
        Storage::TargetKey { column } => {
            let table = table_name(target_ty);
            conn.update(&table)
                .set(column.as_str(), owner)
                .filter(Boolean::one_of(id_column(target_ty, &table), targets))
                .execute()
                .await
                .map_err(Error::sql)?;
        }
        Storage::JoinTable {
            table,
            owner_column,
            target_column,
        } => {
            // Find the targets which are already linked, so we don't insert duplicate rows.
            let columns = [SelectColumn::Column(Column::qualified(
                table.as_str(),
                target_column.as_str(),
            ))];
            let linked = conn
                .select(&columns, table)
                .cmp(
                    Column::qualified(table.as_str(), owner_column.as_str()),
                    "=",
                    owner.clone(),
                )
                .many()
                .await
                .map_err(Error::sql)?
                .into_iter()
                .map(|row| row.column(0).map(|id| id.to_string()))
                .collect::<Result<HashSet<_>, _>>()
                .map_err(Error::sql)?;

            let mut seen = HashSet::new();
            let rows = targets
                .into_iter()
                .filter(|target| {
                    let key = target.to_string();
                    !linked.contains(&key) && seen.insert(key)
                })
                .map(|target| vec![owner.clone(), target])
                .collect::<Vec<_>>();
            if rows.is_empty() {
                return Ok(());
            }
            conn.insert(table, [owner_column, target_column])
                .rows(rows)
                .execute()
                .await
                .map_err(Error::sql)?;
        }
        Storage::OwnerKey { .. } => return Err(unsupported(ty, rel, "to-many updates")),
    }
    Ok(())
}

/// Unlink each of `targets` from `owner`. Targets which are not linked are ignored.
pub async fn remove_from_many<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    targets: &[String],
) -> Result<(), Error> {
    let (_, target_ty) = relationship(schema, ty, rel.name())?;
    let owner = parse_id(ty, owner)?;
    let targets = parse_ids(target_ty, targets);
    if targets.is_empty() {
        return Ok(());
    }

    match rel.storage() {
        Storage::TargetKey { column } => {
            let table = table_name(target_ty);
            conn.update(&table)
                .set(column.as_str(), db::Value::Null)
                .filter(WhereClause::all([
                    Boolean::one_of(id_column(target_ty, &table), targets),
                    Boolean::cmp(
                        Column::qualified(table.as_str(), column.as_str()),
                        "=",
                        owner,
                    ),
                ]))
                .execute()
                .await
                .map_err(Error::sql)?;
        }
        Storage::JoinTable {
            table,
            owner_column,
            target_column,
        } => {
            conn.delete(table)
                .filter(WhereClause::all([
                    Boolean::cmp(
                        Column::qualified(table.as_str(), owner_column.as_str()),
                        "=",
                        owner,
                    ),
                    Boolean::one_of(
                        Column::qualified(table.as_str(), target_column.as_str()),
                        targets,
                    ),
                ]))
                .execute()
                .await
                .map_err(Error::sql)?;
        }
        Storage::OwnerKey { .. } => return Err(unsupported(ty, rel, "to-many updates")),
    }
    Ok(())
}

fn unsupported(ty: &EntityType, rel: &Relationship, operation: &'static str) -> Error {
    Error::Unsupported {
        ty: ty.name().into(),
        relationship: rel.name().into(),
        operation,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{init_logging, sql::ops::select::load_relation, sql::ops::test::blog_db};

    /// The IDs of the targets of `rel` for `owner`.
    async fn targets<C: Connection>(
        conn: &C,
        schema: &Schema,
        ty: &str,
        rel: &str,
        owner: &str,
    ) -> Vec<String> {
        let ty = schema.entity(ty).unwrap();
        let rel = ty.get_relationship(rel).unwrap();
        load_relation(conn, schema, ty, rel, &[owner.to_string()])
            .await
            .unwrap()
            .remove(owner)
            .unwrap_or_default()
            .iter()
            .map(|instance| instance.id().to_string())
            .collect()
    }

    fn strings(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[async_std::test]
    async fn test_set_to_one() {
        init_logging();
        let (schema, conn) = blog_db().await;
        let article = schema.entity("article").unwrap();
        let author = article.get_relationship("author").unwrap();

        set_to_one(&conn, &schema, article, author, "3", Some("2"))
            .await
            .unwrap();
        assert_eq!(targets(&conn, &schema, "article", "author", "3").await, ["2"]);
        assert_eq!(
            targets(&conn, &schema, "person", "articles", "2").await,
            ["3"]
        );

        set_to_one(&conn, &schema, article, author, "1", None)
            .await
            .unwrap();
        assert!(targets(&conn, &schema, "article", "author", "1")
            .await
            .is_empty());

        // To-many relationships can't be set this way.
        let person = schema.entity("person").unwrap();
        assert!(matches!(
            set_to_one(
                &conn,
                &schema,
                person,
                person.get_relationship("articles").unwrap(),
                "1",
                None
            )
            .await,
            Err(Error::Unsupported { .. })
        ));
    }

    #[async_std::test]
    async fn test_target_key() {
        init_logging();
        let (schema, conn) = blog_db().await;
        let person = schema.entity("person").unwrap();
        let articles = person.get_relationship("articles").unwrap();

        add_to_many(&conn, &schema, person, articles, "2", &strings(&["3", "1"]))
            .await
            .unwrap();
        assert_eq!(
            targets(&conn, &schema, "person", "articles", "2").await,
            ["1", "3"]
        );
        assert_eq!(
            targets(&conn, &schema, "person", "articles", "1").await,
            ["2"]
        );

        // Removing an article which belongs to someone else does nothing.
        remove_from_many(&conn, &schema, person, articles, "2", &strings(&["2", "3"]))
            .await
            .unwrap();
        assert_eq!(
            targets(&conn, &schema, "person", "articles", "2").await,
            ["1"]
        );
        assert_eq!(
            targets(&conn, &schema, "person", "articles", "1").await,
            ["2"]
        );
    }

    #[async_std::test]
    async fn test_join_table() {
        init_logging();
        let (schema, conn) = blog_db().await;
        let article = schema.entity("article").unwrap();
        let tags = article.get_relationship("tags").unwrap();

        // Already-linked and repeated targets are inserted only once.
        add_to_many(
            &conn,
            &schema,
            article,
            tags,
            "1",
            &strings(&["news", "tech", "tech"]),
        )
        .await
        .unwrap();
        assert_eq!(
            targets(&conn, &schema, "article", "tags", "1").await,
            ["news", "tech"]
        );
        assert_eq!(
            targets(&conn, &schema, "tag", "articles", "tech").await,
            ["1", "2"]
        );

        remove_from_many(&conn, &schema, article, tags, "1", &strings(&["news", "bogus"]))
            .await
            .unwrap();
        assert_eq!(targets(&conn, &schema, "article", "tags", "1").await, ["tech"]);
        assert_eq!(
            targets(&conn, &schema, "article", "tags", "2").await,
            ["news", "tech"]
        );
    }

    #[async_std::test]
    async fn test_owner_key_to_many() {
        use crate::schema::{Field, FieldType};

        init_logging();
        let schema = Schema::new([
            EntityType::new("box", Field::new("id", FieldType::Int)).relationship(
                Relationship::to_many("items", "box", Storage::owner_key("item_id")),
            ),
        ])
        .unwrap();
        let conn = crate::sql::db::mock::Connection::create();
        super::super::register::execute(&conn, &schema).await.unwrap();

        let ty = schema.entity("box").unwrap();
        let rel = ty.get_relationship("items").unwrap();
        assert!(matches!(
            add_to_many(&conn, &schema, ty, rel, "1", &strings(&["2"])).await,
            Err(Error::Unsupported { .. })
        ));
    }
}
