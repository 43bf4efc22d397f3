//! The JSON:API protocol layer.
//!
//! This module compiles client requests (filter trees, sort paths, page and inclusion parameters)
//! into operations on a [`DataSource`](backend::DataSource), and assembles the results into
//! JSON:API documents. [`Api`](api::Api) ties everything together into a transport-neutral request
//! handler.

pub mod api;
pub mod backend;
pub mod document;
pub mod error;
pub mod filter;
pub mod include;
pub mod mutate;
pub mod page;
pub mod params;
pub mod sort;

pub use error::Error;

#[cfg(all(test, feature = "sql"))]
pub(crate) mod test {
    use super::backend::DataSource;
    use crate::{
        schema::{test::blog, EntityType, Instance, Value},
        sql::{db::mock, SqlDataSource},
    };
    use chrono::NaiveDate;
    use std::sync::Arc;

    pub type Source = SqlDataSource<mock::Connection>;

    async fn insert(source: &Source, ty: &EntityType, values: Vec<(&str, Value)>) -> Instance {
        source
            .insert(
                ty,
                values
                    .into_iter()
                    .map(|(field, value)| (field.to_string(), value))
                    .collect(),
            )
            .await
            .unwrap()
    }

    async fn link(source: &Source, ty: &EntityType, rel: &str, owner: &str, target: &str) {
        let rel = ty.get_relationship(rel).unwrap();
        if rel.is_to_many() {
            source
                .add_to_many(ty, rel, owner, &[target.to_string()])
                .await
                .unwrap();
        } else {
            source
                .set_to_one(ty, rel, owner, Some(target))
                .await
                .unwrap();
        }
    }

    /// A blog stored in a fresh mock database:
    ///
    /// * people: 1 alice (30, 1.5), 2 bob (no age), 3 carol (20, -2.0)
    /// * articles: 1 "Hello" and 2 "Rust" by alice, 3 "Orphan" with no author
    /// * comments: 1 "first" on article 1 by bob, 2 "second" on article 1 by carol, 3 "meh" on
    ///   article 2 with no author
    /// * tags: red "news" on articles 1 and 2, green "tech" on article 2
    pub async fn blog_source() -> Source {
        let source = SqlDataSource::new(mock::Connection::create(), Arc::new(blog()))
            .await
            .unwrap();
        let schema = source.schema().clone();
        let person = schema.entity("person").unwrap();
        let article = schema.entity("article").unwrap();
        let comment = schema.entity("comment").unwrap();
        let tag = schema.entity("tag").unwrap();

        for (name, age, other) in [
            ("alice", Value::Int(30), Value::Float(1.5)),
            ("bob", Value::Null, Value::Null),
            ("carol", Value::Int(20), Value::Float(-2.0)),
        ] {
            insert(
                &source,
                person,
                vec![("name", name.into()), ("age", age), ("other", other)],
            )
            .await;
        }

        let date = |y, m, d| {
            Value::DateTime(
                NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
            )
        };
        for (title, published) in [
            ("Hello", date(2020, 1, 1)),
            ("Rust", date(2021, 6, 15)),
            ("Orphan", Value::Null),
        ] {
            insert(
                &source,
                article,
                vec![("title", title.into()), ("published", published)],
            )
            .await;
        }
        link(&source, article, "author", "1", "1").await;
        link(&source, article, "author", "2", "1").await;

        for body in ["first", "second", "meh"] {
            insert(&source, comment, vec![("body", body.into())]).await;
        }
        link(&source, comment, "article", "1", "1").await;
        link(&source, comment, "author", "1", "2").await;
        link(&source, comment, "article", "2", "1").await;
        link(&source, comment, "author", "2", "3").await;
        link(&source, comment, "article", "3", "2").await;

        for (name, color) in [("news", "red"), ("tech", "green")] {
            insert(
                &source,
                tag,
                vec![("name", name.into()), ("color", Value::Enum(color.into()))],
            )
            .await;
        }
        link(&source, article, "tags", "1", "news").await;
        link(&source, article, "tags", "2", "news").await;
        link(&source, article, "tags", "2", "tech").await;

        source
    }
}
