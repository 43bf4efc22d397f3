//! Compilation of a [`Schema`] into the SQL tables which store it.

use super::{column_name, entity, id_type, table_columns, table_name, Error};
use crate::{
    schema::{EntityType, Schema, Storage},
    sql::db::{Connection, ConstraintKind, CreateTable, CreateTableExt, SchemaColumn},
};
use futures::future::{try_join_all, BoxFuture, FutureExt, TryFutureExt};
use std::collections::hash_map::{Entry, HashMap};

/// Create the tables for every entity type in `schema`.
///
/// Tables which already exist are left alone.
pub async fn execute<C: Connection>(conn: &C, schema: &Schema) -> Result<(), Error> {
    let mut entities = Dependencies::default();
    let mut join_tables = Dependencies::default();
    for ty in schema.entities() {
        register_entity(conn, schema, ty, &mut entities)?;
        register_join_tables(conn, schema, ty, &mut join_tables)?;
    }

    // Join tables reference the entity tables, so the entity tables must exist first.
    entities.execute().await?;
    join_tables.execute().await
}

fn register_entity<'a, C: Connection>(
    conn: &'a C,
    schema: &Schema,
    ty: &EntityType,
    dependencies: &mut Dependencies<'a>,
) -> Result<(), Error> {
    let columns = table_columns(schema, ty)?;
    let primary_key = ty
        .primary_key()
        .iter()
        .map(|field| column_name(field))
        .collect::<Vec<_>>();
    let unique = ty
        .fields()
        .iter()
        .filter(|field| field.is_unique())
        .map(|field| (ConstraintKind::Unique, vec![column_name(field.name())]));

    let constraints = [(ConstraintKind::PrimaryKey, primary_key)]
        .into_iter()
        .chain(unique)
        .collect::<Vec<_>>();
    dependencies.register(table_name(ty), move |table| {
        conn.create_table(table, columns)
            .constraints(constraints)
            .execute()
            .map_err(Error::sql)
            .boxed()
    });
    Ok(())
}

fn register_join_tables<'a, C: Connection>(
    conn: &'a C,
    schema: &Schema,
    ty: &EntityType,
    dependencies: &mut Dependencies<'a>,
) -> Result<(), Error> {
    for rel in ty.relationships() {
        let Storage::JoinTable {
            table,
            owner_column,
            target_column,
        } = rel.storage()
        else {
            continue;
        };
        let target = entity(schema, rel.target())?;

        // A table with just two columns, one for the ID of each side of the relationship. Each of
        // these columns has a foreign key constraint on the table it refers to, and there is a
        // primary key constraint on the pair.
        let columns = vec![
            SchemaColumn::new(owner_column.clone(), id_type(ty)),
            SchemaColumn::new(target_column.clone(), id_type(target)),
        ];
        let constraints = [
            (
                ConstraintKind::PrimaryKey,
                vec![owner_column.clone(), target_column.clone()],
            ),
            (
                ConstraintKind::ForeignKey {
                    table: table_name(ty),
                },
                vec![owner_column.clone()],
            ),
            (
                ConstraintKind::ForeignKey {
                    table: table_name(target),
                },
                vec![target_column.clone()],
            ),
        ];

        // Both sides of the relationship declare the same join table. Whichever is seen first
        // creates it.
        dependencies.register(table.clone(), move |table| {
            conn.create_table(table, columns)
                .constraints(constraints)
                .execute()
                .map_err(Error::sql)
                .boxed()
        });
    }
    Ok(())
}

/// A batch of tables to create.
///
/// Tables are collected first and then created all at once in [`execute`](Self::execute).
#[derive(Default)]
struct Dependencies<'a> {
    tables: HashMap<String, BoxFuture<'a, Result<(), Error>>>,
}

impl<'a> Dependencies<'a> {
    /// Register a table if it is not already added.
    ///
    /// If there is already a table with this name in the batch, this function does nothing.
    /// Otherwise, it invokes the function `create`, which should return a future to create the
    /// table. The resulting future will be executed in [`execute`](Self::execute).
    fn register<F>(&mut self, table: String, create: F)
    where
        F: FnOnce(String) -> BoxFuture<'a, Result<(), Error>>,
    {
        if let Entry::Vacant(e) = self.tables.entry(table) {
            let table = e.key().clone();
            e.insert(create(table));
        }
    }

    /// Create all the tables.
    async fn execute(self) -> Result<(), Error> {
        try_join_all(self.tables.into_values()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        init_logging,
        schema::{test::blog, Field, FieldType, Relationship},
        sql::db::{mock, Type},
    };

    #[async_std::test]
    async fn test_blog() {
        init_logging();
        let db = mock::Connection::create();
        execute(&db, &blog()).await.unwrap();
        let schema = db.schema().await;

        assert_eq!(
            schema["person"],
            [
                SchemaColumn::new("id", Type::Serial),
                SchemaColumn::new("name", Type::Text),
                SchemaColumn::new("age", Type::Int8),
                SchemaColumn::new("other", Type::Float8),
            ]
        );

        // Tags are identified by name, which is not generated by the database.
        assert_eq!(
            schema["tag"],
            [
                SchemaColumn::new("name", Type::Text),
                SchemaColumn::new("color", Type::Text),
            ]
        );

        // The join table is shared by both directions of the relationship.
        assert_eq!(
            schema["article_tags"],
            [
                SchemaColumn::new("article_id", Type::Int8),
                SchemaColumn::new("tag_id", Type::Text),
            ]
        );

        let mut tables = schema.into_keys().collect::<Vec<_>>();
        tables.sort();
        assert_eq!(
            tables,
            ["article", "article_tags", "comment", "person", "tag"]
        );

        // Registering again is a no-op.
        execute(&db, &blog()).await.unwrap();
        assert_eq!(db.schema().await.len(), 5);
    }

    #[async_std::test]
    async fn test_explicit_table_name() {
        init_logging();
        let schema = Schema::new([
            EntityType::new("BlogPost", Field::new("id", FieldType::Int))
                .field(Field::new("wordCount", FieldType::Int)),
            EntityType::new("Author", Field::new("id", FieldType::Int))
                .table("writers")
                .relationship(Relationship::to_many(
                    "posts",
                    "BlogPost",
                    Storage::target_key("writer_id"),
                )),
        ])
        .unwrap();
        let db = mock::Connection::create();
        execute(&db, &schema).await.unwrap();
        let tables = db.schema().await;

        assert_eq!(tables["writers"], [SchemaColumn::new("id", Type::Serial)]);
        assert_eq!(
            tables["blog_post"],
            [
                SchemaColumn::new("id", Type::Serial),
                SchemaColumn::new("word_count", Type::Int8),
                SchemaColumn::new("writer_id", Type::Int8),
            ]
        );
    }

    #[async_std::test]
    async fn test_constraints() {
        use crate::sql::db::{Insert, Value};

        init_logging();
        let db = mock::Connection::create();
        execute(&db, &blog()).await.unwrap();

        db.insert("person", ["name"])
            .rows([vec![Value::from("alice")]])
            .execute()
            .await
            .unwrap();
        let err = db
            .insert("person", ["name"])
            .rows([vec![Value::from("alice")]])
            .execute()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint failed"), "{err}");

        db.insert("article_tags", ["article_id", "tag_id"])
            .rows([vec![Value::from(1), Value::from("news")]])
            .execute()
            .await
            .unwrap();
        db.insert("article_tags", ["article_id", "tag_id"])
            .rows([vec![Value::from(1), Value::from("news")]])
            .execute()
            .await
            .unwrap_err();
    }
}
