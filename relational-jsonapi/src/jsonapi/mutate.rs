//! Mutation of relationships.
//!
//! Every operation validates the whole batch of identifiers before writing anything, so a request
//! which fails partway through leaves the relationship untouched. Callers are expected to run
//! each operation in a transaction along with any other writes belonging to the same request.

use super::{backend::DataSource, error::Error};
use crate::schema::{EntityType, Identifier, Relationship, Schema};
use std::collections::HashSet;

/// Point the to-one relationship `rel` of `owner` at `target`, or clear it.
pub async fn replace_to_one<D: DataSource>(
    source: &D,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    target: Option<&Identifier>,
) -> Result<(), Error> {
    if rel.is_to_many() {
        return Err(Error::bad_request(format!(
            "Relationship {} is to-many; its linkage must be a list of resource identifiers",
            rel.name()
        )));
    }
    let target = match target {
        Some(target) => require_targets(source, schema, rel, std::slice::from_ref(target))
            .await?
            .pop(),
        None => None,
    };
    source
        .set_to_one(ty, rel, owner, target.as_deref())
        .await
        .map_err(Error::backend_write)
}

/// Replace the whole collection of the to-many relationship `rel` of `owner` with `targets`.
///
/// Fails unless `allowed`.
pub async fn replace_to_many<D: DataSource>(
    source: &D,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    targets: &[Identifier],
    allowed: bool,
) -> Result<(), Error> {
    if !allowed {
        return Err(Error::forbidden(format!(
            "Not allowed to replace the to-many relationship {}",
            rel.name()
        )));
    }
    require_to_many(rel, "replace")?;
    let wanted = require_targets(source, schema, rel, targets).await?;
    let current = current_targets(source, ty, rel, owner).await?;

    let stale = current
        .iter()
        .filter(|id| !wanted.contains(id))
        .cloned()
        .collect::<Vec<_>>();
    let fresh = wanted
        .iter()
        .filter(|id| !current.contains(id))
        .cloned()
        .collect::<Vec<_>>();
    tracing::debug!(
        "replacing {}.{}: removing {stale:?}, adding {fresh:?}",
        ty.name(),
        rel.name()
    );
    source
        .remove_from_many(ty, rel, owner, &stale)
        .await
        .map_err(Error::backend_write)?;
    source
        .add_to_many(ty, rel, owner, &fresh)
        .await
        .map_err(Error::backend_write)
}

/// Add `targets` to the to-many relationship `rel` of `owner`.
///
/// Targets which are already present are skipped.
pub async fn append_to_many<D: DataSource>(
    source: &D,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    targets: &[Identifier],
) -> Result<(), Error> {
    require_to_many(rel, "add to")?;
    let wanted = require_targets(source, schema, rel, targets).await?;
    source
        .add_to_many(ty, rel, owner, &wanted)
        .await
        .map_err(Error::backend_write)
}

/// Remove `targets` from the to-many relationship `rel` of `owner`.
///
/// Targets which exist but are not in the collection are ignored. Returns whether the collection
/// changed. Fails unless `allowed`.
pub async fn remove_from_many<D: DataSource>(
    source: &D,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
    targets: &[Identifier],
    allowed: bool,
) -> Result<bool, Error> {
    if !allowed {
        return Err(Error::forbidden(format!(
            "Not allowed to remove from the to-many relationship {}",
            rel.name()
        )));
    }
    require_to_many(rel, "remove from")?;
    let wanted = require_targets(source, schema, rel, targets).await?;
    let current = current_targets(source, ty, rel, owner).await?;
    let present = wanted
        .into_iter()
        .filter(|id| current.contains(id))
        .collect::<Vec<_>>();
    if present.is_empty() {
        return Ok(false);
    }
    source
        .remove_from_many(ty, rel, owner, &present)
        .await
        .map_err(Error::backend_write)?;
    Ok(true)
}

fn require_to_many(rel: &Relationship, operation: &str) -> Result<(), Error> {
    if rel.is_to_many() {
        Ok(())
    } else {
        Err(Error::forbidden(format!(
            "Can not {operation} the to-one relationship {}",
            rel.name()
        )))
    }
}

/// Check that every identified target of `rel` exists.
///
/// Returns the distinct target IDs, in order. All missing targets are reported together.
async fn require_targets<D: DataSource>(
    source: &D,
    schema: &Schema,
    rel: &Relationship,
    targets: &[Identifier],
) -> Result<Vec<String>, Error> {
    let target_ty = schema.entity(rel.target()).ok_or_else(|| {
        Error::not_found(format!("No such type {}", rel.target()))
    })?;
    if let Some(target) = targets.iter().find(|target| target.ty != rel.target()) {
        return Err(Error::conflict(format!(
            "Type must be {}, not {}",
            rel.target(),
            target.ty
        )));
    }

    let mut distinct = HashSet::new();
    let ids = targets
        .iter()
        .filter(|target| distinct.insert(&target.id))
        .map(|target| target.id.clone())
        .collect::<Vec<_>>();
    if ids.is_empty() {
        return Ok(ids);
    }
    let found = source
        .get(target_ty, &ids)
        .await
        .map_err(Error::backend_read)?
        .into_iter()
        .map(|instance| instance.id().to_string())
        .collect::<HashSet<_>>();
    let missing = ids
        .iter()
        .filter(|id| !found.contains(*id))
        .map(String::as_str)
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(Error::not_found(format!(
            "No resources of type {} with IDs {}",
            rel.target(),
            missing.join(", ")
        )));
    }
    Ok(ids)
}

/// The IDs of the targets `rel` of `owner` currently links to.
async fn current_targets<D: DataSource>(
    source: &D,
    ty: &EntityType,
    rel: &Relationship,
    owner: &str,
) -> Result<Vec<String>, Error> {
    Ok(source
        .load_relation(ty, rel, &[owner.to_string()])
        .await
        .map_err(Error::backend_read)?
        .remove(owner)
        .unwrap_or_default()
        .into_iter()
        .map(|instance| instance.id().to_string())
        .collect())
}

#[cfg(all(test, feature = "sql"))]
mod test {
    use super::*;
    use crate::{
        init_logging,
        jsonapi::test::{blog_source, Source},
    };

    fn tags(ids: &[&str]) -> Vec<Identifier> {
        ids.iter().map(|id| Identifier::new("tag", *id)).collect()
    }

    async fn linked(source: &Source, ty: &str, rel: &str, owner: &str) -> Vec<String> {
        let ty = source.schema().entity(ty).unwrap();
        current_targets(source, ty, ty.get_relationship(rel).unwrap(), owner)
            .await
            .unwrap()
    }

    #[async_std::test]
    async fn test_replace_to_one() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let author = article.get_relationship("author").unwrap();

        replace_to_one(
            &source,
            &schema,
            article,
            author,
            "3",
            Some(&Identifier::new("person", "2")),
        )
        .await
        .unwrap();
        assert_eq!(linked(&source, "article", "author", "3").await, ["2"]);

        replace_to_one(&source, &schema, article, author, "3", None)
            .await
            .unwrap();
        assert!(linked(&source, "article", "author", "3").await.is_empty());

        let err = replace_to_one(
            &source,
            &schema,
            article,
            author,
            "1",
            Some(&Identifier::new("person", "42")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(err.to_string(), "No resources of type person with IDs 42");
        assert_eq!(linked(&source, "article", "author", "1").await, ["1"]);

        let err = replace_to_one(
            &source,
            &schema,
            article,
            author,
            "1",
            Some(&Identifier::new("tag", "news")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 409);

        let tags_rel = article.get_relationship("tags").unwrap();
        let err = replace_to_one(&source, &schema, article, tags_rel, "1", None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[async_std::test]
    async fn test_replace_to_many() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let rel = article.get_relationship("tags").unwrap();

        let err = replace_to_many(&source, &schema, article, rel, "2", &tags(&["news"]), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);

        // Every missing target is reported, and nothing changes.
        let err = replace_to_many(
            &source,
            &schema,
            article,
            rel,
            "2",
            &tags(&["bogus", "tech", "other"]),
            true,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(
            err.to_string(),
            "No resources of type tag with IDs bogus, other"
        );
        assert_eq!(
            linked(&source, "article", "tags", "2").await,
            ["news", "tech"]
        );

        replace_to_many(&source, &schema, article, rel, "2", &tags(&["tech"]), true)
            .await
            .unwrap();
        assert_eq!(linked(&source, "article", "tags", "2").await, ["tech"]);

        replace_to_many(&source, &schema, article, rel, "2", &[], true)
            .await
            .unwrap();
        assert!(linked(&source, "article", "tags", "2").await.is_empty());
        assert_eq!(linked(&source, "article", "tags", "1").await, ["news"]);
    }

    #[async_std::test]
    async fn test_append_to_many() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let rel = article.get_relationship("tags").unwrap();

        // Appending is idempotent.
        for _ in 0..2 {
            append_to_many(&source, &schema, article, rel, "1", &tags(&["news"]))
                .await
                .unwrap();
            assert_eq!(linked(&source, "article", "tags", "1").await, ["news"]);
        }

        append_to_many(&source, &schema, article, rel, "1", &tags(&["tech", "tech"]))
            .await
            .unwrap();
        assert_eq!(
            linked(&source, "article", "tags", "1").await,
            ["news", "tech"]
        );

        let err = append_to_many(&source, &schema, article, rel, "3", &tags(&["news", "bogus"]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
        assert!(linked(&source, "article", "tags", "3").await.is_empty());

        let author = article.get_relationship("author").unwrap();
        let err = append_to_many(
            &source,
            &schema,
            article,
            author,
            "3",
            &[Identifier::new("person", "1")],
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[async_std::test]
    async fn test_remove_from_many() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let rel = article.get_relationship("tags").unwrap();

        let err = remove_from_many(&source, &schema, article, rel, "1", &tags(&["news"]), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);

        // Removing a tag which was never there succeeds, but changes nothing.
        assert!(
            !remove_from_many(&source, &schema, article, rel, "1", &tags(&["tech"]), true)
                .await
                .unwrap()
        );
        assert!(
            remove_from_many(&source, &schema, article, rel, "1", &tags(&["tech", "news"]), true)
                .await
                .unwrap()
        );
        assert!(linked(&source, "article", "tags", "1").await.is_empty());
        assert_eq!(
            linked(&source, "article", "tags", "2").await,
            ["news", "tech"]
        );

        let err = remove_from_many(&source, &schema, article, rel, "2", &tags(&["bogus"]), true)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }
}
