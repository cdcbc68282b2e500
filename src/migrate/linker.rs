//! Deferred relation linking.
//!
//! Associations are buffered as plain id tuples while parent entities are read,
//! then written in a later phase once both endpoints exist, in chunks no larger
//! than the target's per-statement row ceiling.
use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::model::{PendingRelation, RelationKind};
use crate::store::TargetStore;

/// Rows per association insert unless configured otherwise.
pub const DEFAULT_LINK_CHUNK: usize = 500;

/// Insertion-ordered, de-duplicated relation buffer.
#[derive(Debug, Default, Clone)]
pub struct RelationBuffer {
    pending: Vec<PendingRelation>,
    seen: HashSet<PendingRelation>,
}

impl RelationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the same relation was already buffered.
    pub fn push(&mut self, relation: PendingRelation) -> bool {
        if self.seen.insert(relation) {
            self.pending.push(relation);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRelation> {
        self.pending.iter()
    }

    /// Splits the buffer into relations whose endpoints pass `resolvable` and
    /// the ones that do not. The caller accounts for the latter.
    pub fn partition<F>(self, resolvable: F) -> (Vec<PendingRelation>, Vec<PendingRelation>)
    where
        F: Fn(&PendingRelation) -> bool,
    {
        self.pending.into_iter().partition(|r| resolvable(r))
    }

    pub fn into_vec(self) -> Vec<PendingRelation> {
        self.pending
    }
}

impl Extend<PendingRelation> for RelationBuffer {
    fn extend<I: IntoIterator<Item = PendingRelation>>(&mut self, iter: I) {
        for r in iter {
            self.push(r);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub linked: BTreeMap<RelationKind, usize>,
    pub chunks: usize,
}

impl LinkReport {
    pub fn total(&self) -> usize {
        self.linked.values().sum()
    }

    pub fn merge(&mut self, other: LinkReport) {
        for (kind, n) in other.linked {
            *self.linked.entry(kind).or_default() += n;
        }
        self.chunks += other.chunks;
    }
}

/// Writes `relations` grouped by kind, `batch_limit` rows per statement or
/// fewer when the target caps the kind.
/// Chunks are independent; a rejected chunk aborts the pass and is reported
/// with its index, earlier chunks stay written.
pub async fn link<T>(
    target: &T,
    relations: &[PendingRelation],
    batch_limit: usize,
) -> Result<LinkReport, LinkError>
where
    T: TargetStore + ?Sized,
{
    let batch_limit = batch_limit.max(1);
    let mut by_kind: BTreeMap<RelationKind, Vec<PendingRelation>> = BTreeMap::new();
    for r in relations {
        by_kind.entry(r.kind).or_default().push(*r);
    }

    let mut report = LinkReport::default();
    for (kind, rows) in by_kind {
        let limit = target
            .max_link_rows(kind)
            .map_or(batch_limit, |cap| batch_limit.min(cap.max(1)));
        if limit < batch_limit {
            debug!(kind = kind.label(), requested = batch_limit, limit, "link chunk capped by target");
        }
        for (chunk, slice) in rows.chunks(limit).enumerate() {
            target
                .bulk_link(kind, slice)
                .await
                .map_err(|source| LinkError {
                    kind: kind.label(),
                    chunk,
                    rows: slice.len(),
                    source,
                })?;
            debug!(kind = kind.label(), chunk, rows = slice.len(), "relation chunk written");
            report.chunks += 1;
            *report.linked.entry(kind).or_default() += slice.len();
        }
        info!(
            kind = kind.label(),
            rows = report.linked.get(&kind).copied().unwrap_or(0),
            "relations linked"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryTarget;
    use crate::error::StoreError;
    use crate::model::{Article, AsBatch, Collection, TreeNode};

    fn article(id: i64) -> Article {
        Article {
            id,
            name: format!("Article {id}"),
            slug: format!("article-{id}"),
            text: String::new(),
            published: true,
            date: None,
            creation_date: None,
            modification_date: None,
            user_id: None,
        }
    }

    fn category(id: i64) -> TreeNode {
        TreeNode {
            id,
            source_id: id,
            parent_id: None,
            left: 1,
            right: 2,
            level: 0,
            tree_id: 0,
            name: format!("Category {id}"),
            slug: format!("category-{id}"),
            active: true,
            collection_id: 1,
        }
    }

    async fn seeded_target(categories: i64, articles: i64) -> MemoryTarget {
        seed(MemoryTarget::default(), categories, articles).await
    }

    async fn seed(target: MemoryTarget, categories: i64, articles: i64) -> MemoryTarget {
        target
            .create_collection(&Collection {
                id: 1,
                name: "Categories".into(),
                slug: "categories".into(),
                active: true,
            })
            .await
            .unwrap();
        let cats: Vec<TreeNode> = (1..=categories).map(category).collect();
        target.bulk_create(TreeNode::batch(&cats)).await.unwrap();
        let arts: Vec<Article> = (1..=articles).map(article).collect();
        target.bulk_create(Article::batch(&arts)).await.unwrap();
        target
    }

    #[test]
    fn buffer_drops_repeats_and_partitions() {
        let mut buf = RelationBuffer::new();
        assert!(buf.push(PendingRelation::new(RelationKind::Categorization, 1, 10)));
        assert!(!buf.push(PendingRelation::new(RelationKind::Categorization, 1, 10)));
        buf.extend([
            PendingRelation::new(RelationKind::Categorization, 2, 10),
            PendingRelation::new(RelationKind::Categorization, 99, 10),
        ]);
        assert_eq!(buf.len(), 3);
        let (ok, dropped) = buf.partition(|r| r.subject_id < 50);
        assert_eq!(ok.len(), 2);
        assert_eq!(dropped, vec![PendingRelation::new(RelationKind::Categorization, 99, 10)]);
    }

    #[tokio::test]
    async fn chunks_respect_the_limit() {
        let target = seeded_target(3, 400).await;
        let relations: Vec<PendingRelation> = (1..=3)
            .flat_map(|c| (1..=400).map(move |a| PendingRelation::new(RelationKind::Categorization, c, a)))
            .collect();
        assert_eq!(relations.len(), 1200);

        let report = link(&target, &relations, 500).await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.total(), 1200);
        assert_eq!(target.link_calls().await, vec![500, 500, 200]);
        assert_eq!(target.count("collections_categorization").await, 1200);
    }

    #[tokio::test]
    async fn oversized_limit_is_capped_by_the_target() {
        let target = seed(MemoryTarget::new().with_link_ceiling(150), 2, 200).await;
        let relations: Vec<PendingRelation> = (1..=2)
            .flat_map(|c| (1..=200).map(move |a| PendingRelation::new(RelationKind::Categorization, c, a)))
            .collect();

        // Same shape as `--link-chunk 30000` against Postgres.
        let report = link(&target, &relations, 30_000).await.unwrap();
        assert_eq!(report.total(), 400);
        assert_eq!(report.chunks, 3);
        assert_eq!(target.link_calls().await, vec![150, 150, 100]);
        assert_eq!(target.count("collections_categorization").await, 400);

        // A limit under the cap is left alone.
        let target = seed(MemoryTarget::new().with_link_ceiling(150), 1, 90).await;
        let relations: Vec<PendingRelation> =
            (1..=90).map(|a| PendingRelation::new(RelationKind::Categorization, 1, a)).collect();
        link(&target, &relations, 40).await.unwrap();
        assert_eq!(target.link_calls().await, vec![40, 40, 10]);
    }

    #[tokio::test]
    async fn missing_endpoint_fails_its_chunk() {
        let target = seeded_target(1, 3).await;
        let relations = vec![
            PendingRelation::new(RelationKind::Categorization, 1, 1),
            PendingRelation::new(RelationKind::Categorization, 1, 2),
            PendingRelation::new(RelationKind::Categorization, 1, 3),
            PendingRelation::new(RelationKind::Categorization, 1, 42),
        ];
        let err = link(&target, &relations, 2).await.unwrap_err();
        assert_eq!(err.chunk, 1);
        assert_eq!(err.rows, 2);
        assert!(matches!(err.source, StoreError::ForeignKeyViolation { .. }));
        // First chunk stays; the rejected one is not partially applied.
        assert_eq!(target.count("collections_categorization").await, 2);
    }

    #[tokio::test]
    async fn empty_input_issues_no_statements() {
        let target = MemoryTarget::default();
        let report = link(&target, &[], 500).await.unwrap();
        assert_eq!(report, LinkReport::default());
        assert!(target.link_calls().await.is_empty());
    }
}
