//! Resolution of inclusion paths into the `included` member of a compound document.
//!
//! Paths like `comments.author` are merged into a tree by common prefix and traversed breadth
//! first, one level at a time. Each level follows one relationship for every instance reached so
//! far with a single batched [`load_relation`](DataSource::load_relation) call. Every instance is
//! included at most once, the first time it is reached, and the primary data is never included.

use super::{backend::DataSource, error::Error};
use crate::schema::{EntityType, Identifier, Instance, Schema};
use std::collections::HashSet;

/// Inclusion paths merged by common prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PathTree {
    /// Relationship names and the paths continuing from them, in the order they were requested.
    children: Vec<(String, PathTree)>,
}

impl PathTree {
    fn insert<'a>(&mut self, mut path: impl Iterator<Item = &'a str>) {
        let Some(segment) = path.next() else {
            return;
        };
        let pos = match self.children.iter().position(|(name, _)| name == segment) {
            Some(pos) => pos,
            None => {
                self.children.push((segment.to_string(), Self::default()));
                self.children.len() - 1
            }
        };
        self.children[pos].1.insert(path);
    }

    /// Check that every path names relationships starting from `ty`.
    fn validate(&self, schema: &Schema, ty: &EntityType) -> Result<(), Error> {
        for (name, child) in &self.children {
            let target = ty
                .get_relationship(name)
                .and_then(|rel| schema.entity(rel.target()))
                .ok_or_else(|| {
                    Error::bad_request(format!("Invalid include: No such relationship {name}"))
                })?;
            child.validate(schema, target)?;
        }
        Ok(())
    }
}

/// Resolve the instances reachable from `roots` (of type `ty`) along `paths`.
///
/// Instances are returned in the order they are first reached. Roots are never returned.
pub async fn resolve<D: DataSource>(
    source: &D,
    schema: &Schema,
    ty: &EntityType,
    roots: &[Instance],
    paths: &[String],
) -> Result<Vec<Instance>, Error> {
    let mut tree = PathTree::default();
    for path in paths {
        tree.insert(path.split('.'));
    }
    tree.validate(schema, ty)?;

    let mut visited: HashSet<Identifier> =
        roots.iter().map(|root| root.identifier().clone()).collect();
    let mut included = vec![];

    let mut frontier = vec![(ty, roots.to_vec(), &tree)];
    let mut depth = 0;
    while !frontier.is_empty() {
        let mut next = vec![];
        for (ty, instances, tree) in frontier {
            if instances.is_empty() {
                continue;
            }
            let owners = instances
                .iter()
                .map(|instance| instance.id().to_string())
                .collect::<Vec<_>>();
            for (name, child) in &tree.children {
                let (Some(rel), Some(target)) = (
                    ty.get_relationship(name),
                    schema.target_type_of(ty.name(), name),
                ) else {
                    continue;
                };
                let mut loaded = source
                    .load_relation(ty, rel, &owners)
                    .await
                    .map_err(Error::backend_read)?;

                let mut level = vec![];
                let mut seen = HashSet::new();
                for owner in &owners {
                    for instance in loaded.remove(owner).into_iter().flatten() {
                        if visited.insert(instance.identifier().clone()) {
                            included.push(instance.clone());
                        }
                        if !child.children.is_empty() && seen.insert(instance.identifier().clone())
                        {
                            level.push(instance);
                        }
                    }
                }
                next.push((target, level, child));
            }
        }
        depth += 1;
        tracing::debug!("included {} resources after {depth} levels", included.len());
        frontier = next;
    }
    Ok(included)
}

#[cfg(all(test, feature = "sql"))]
mod test {
    use super::*;
    use crate::{init_logging, jsonapi::test::blog_source};

    fn paths(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|path| path.to_string()).collect()
    }

    fn identifiers(instances: &[Instance]) -> Vec<String> {
        instances
            .iter()
            .map(|instance| instance.identifier().to_string())
            .collect()
    }

    #[test]
    fn test_path_tree() {
        let mut tree = PathTree::default();
        for path in ["comments.author", "author", "comments.article"] {
            tree.insert(path.split('.'));
        }
        let names = |tree: &PathTree| {
            tree.children
                .iter()
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&tree), ["comments", "author"]);
        assert_eq!(names(&tree.children[0].1), ["author", "article"]);
        assert!(tree.children[1].1.children.is_empty());
    }

    #[async_std::test]
    async fn test_include() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let roots = source.get(article, &["1".into()]).await.unwrap();

        let included = resolve(
            &source,
            &schema,
            article,
            &roots,
            &paths(&["author", "comments.author", "tags"]),
        )
        .await
        .unwrap();
        assert_eq!(
            identifiers(&included),
            [
                "person/1",
                "comment/1",
                "comment/2",
                "tag/news",
                "person/2",
                "person/3"
            ]
        );
    }

    #[async_std::test]
    async fn test_include_dedup() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let roots = source
            .get(article, &["1".into(), "2".into()])
            .await
            .unwrap();

        // Both articles share an author and a tag, and the author's articles are the roots.
        let included = resolve(
            &source,
            &schema,
            article,
            &roots,
            &paths(&["author.articles", "author", "tags.articles"]),
        )
        .await
        .unwrap();
        assert_eq!(
            identifiers(&included),
            ["person/1", "tag/news", "tag/tech"]
        );
    }

    #[async_std::test]
    async fn test_include_null() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let comment = schema.entity("comment").unwrap();

        // Comment 3 has no author.
        let roots = source.get(comment, &["3".into()]).await.unwrap();
        let included = resolve(&source, &schema, comment, &roots, &paths(&["author.articles"]))
            .await
            .unwrap();
        assert!(included.is_empty());

        // Article 3 has no comments.
        let roots = source.get(article, &["3".into()]).await.unwrap();
        let included = resolve(&source, &schema, article, &roots, &paths(&["comments.author"]))
            .await
            .unwrap();
        assert!(included.is_empty());

        let included = resolve(&source, &schema, article, &roots, &[])
            .await
            .unwrap();
        assert!(included.is_empty());
    }

    #[async_std::test]
    async fn test_include_unknown() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let article = schema.entity("article").unwrap();
        let roots = source.get(article, &["3".into()]).await.unwrap();

        // Even when no instance reaches the bad segment.
        let err = resolve(&source, &schema, article, &roots, &paths(&["author.bogus"]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_string(), "Invalid include: No such relationship bogus");
    }
}
