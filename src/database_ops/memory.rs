//! In-memory target with the constraints of the Cyclope schema: primary keys,
//! per-table unique slugs, category names unique within a collection, foreign
//! keys, and all-or-nothing batches. Backs dry runs and tests.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::migrate::tree::{rebuild_nested_set, TreeEntry};
use crate::model::{
    Article, Batch, Collection, Menu, MenuItem, PendingRelation, Picture, RelationKind, TreeNode,
    TreeTable, User,
};
use crate::store::TargetStore;

#[derive(Debug, Default)]
struct MemoryState {
    collections: BTreeMap<i64, Collection>,
    users: BTreeMap<i64, User>,
    menus: BTreeMap<i64, Menu>,
    menu_items: BTreeMap<i64, MenuItem>,
    categories: BTreeMap<i64, TreeNode>,
    articles: BTreeMap<i64, Article>,
    pictures: BTreeMap<i64, Picture>,
    /// (category, article)
    categorizations: Vec<(i64, i64)>,
    /// (article, picture)
    article_pictures: BTreeSet<(i64, i64)>,
    link_calls: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct MemoryTarget {
    state: Mutex<MemoryState>,
    link_ceiling: Option<usize>,
}

fn unique<K, E, I>(table: &str, what: &str, existing: E, incoming: I) -> Result<(), StoreError>
where
    K: Eq + Hash + Debug,
    E: IntoIterator<Item = K>,
    I: IntoIterator<Item = K>,
{
    let mut seen: HashSet<K> = existing.into_iter().collect();
    for key in incoming {
        if seen.contains(&key) {
            return Err(StoreError::UniqueViolation {
                table: table.to_string(),
                detail: format!("duplicate {what} {key:?}"),
            });
        }
        seen.insert(key);
    }
    Ok(())
}

fn foreign(table: &str, what: &str, value: i64, present: bool) -> Result<(), StoreError> {
    if present {
        Ok(())
    } else {
        Err(StoreError::ForeignKeyViolation {
            table: table.to_string(),
            detail: format!("{what} {value} does not exist"),
        })
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects relation chunks above `rows`, the way a store with a
    /// per-statement parameter limit would.
    pub fn with_link_ceiling(mut self, rows: usize) -> Self {
        self.link_ceiling = Some(rows.max(1));
        self
    }

    /// Rows currently stored in `table`.
    pub async fn count(&self, table: &str) -> usize {
        let s = self.state.lock().await;
        match table {
            "collections_collection" => s.collections.len(),
            "auth_user" => s.users.len(),
            "cyclope_menu" => s.menus.len(),
            "cyclope_menuitem" => s.menu_items.len(),
            "collections_category" => s.categories.len(),
            "articles_article" => s.articles.len(),
            "medialibrary_picture" => s.pictures.len(),
            "collections_categorization" => s.categorizations.len(),
            "articles_article_pictures" => s.article_pictures.len(),
            _ => 0,
        }
    }

    /// Row counts of each relation chunk written so far, in order.
    pub async fn link_calls(&self) -> Vec<usize> {
        self.state.lock().await.link_calls.clone()
    }

    pub async fn categories(&self) -> Vec<TreeNode> {
        self.state.lock().await.categories.values().cloned().collect()
    }

    pub async fn menu_items(&self) -> Vec<MenuItem> {
        self.state.lock().await.menu_items.values().cloned().collect()
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.lock().await.users.values().cloned().collect()
    }

    pub async fn articles(&self) -> Vec<Article> {
        self.state.lock().await.articles.values().cloned().collect()
    }

    pub async fn pictures(&self) -> Vec<Picture> {
        self.state.lock().await.pictures.values().cloned().collect()
    }

    pub async fn categorizations(&self) -> Vec<(i64, i64)> {
        self.state.lock().await.categorizations.clone()
    }

    pub async fn article_pictures(&self) -> Vec<(i64, i64)> {
        self.state.lock().await.article_pictures.iter().copied().collect()
    }
}

fn check_tree(
    table: &str,
    existing: &BTreeMap<i64, TreeNode>,
    nodes: &[&TreeNode],
) -> Result<(), StoreError> {
    unique(table, "id", existing.keys().copied(), nodes.iter().map(|n| n.id))?;
    unique(
        table,
        "slug",
        existing.values().map(|n| n.slug.clone()),
        nodes.iter().map(|n| n.slug.clone()),
    )?;
    let batch_ids: HashSet<i64> = nodes.iter().map(|n| n.id).collect();
    for n in nodes {
        if let Some(p) = n.parent_id {
            foreign(table, "parent", p, existing.contains_key(&p) || batch_ids.contains(&p))?;
        }
    }
    Ok(())
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn create_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        let mut s = self.state.lock().await;
        let table = "collections_collection";
        unique(table, "id", s.collections.keys().copied(), [collection.id])?;
        unique(
            table,
            "slug",
            s.collections.values().map(|c| c.slug.clone()),
            [collection.slug.clone()],
        )?;
        s.collections.insert(collection.id, collection.clone());
        Ok(())
    }

    async fn bulk_create(&self, batch: Batch<'_>) -> Result<(), StoreError> {
        let mut s = self.state.lock().await;
        let table = batch.table();
        match batch {
            Batch::Users(rows) => {
                unique(table, "id", s.users.keys().copied(), rows.iter().map(|u| u.id))?;
                unique(
                    table,
                    "username",
                    s.users.values().map(|u| u.username.clone()),
                    rows.iter().map(|u| u.username.clone()),
                )?;
                for u in rows {
                    s.users.insert(u.id, u.clone());
                }
            }
            Batch::Menus(rows) => {
                unique(table, "id", s.menus.keys().copied(), rows.iter().map(|m| m.id))?;
                unique(
                    table,
                    "slug",
                    s.menus.values().map(|m| m.slug.clone()),
                    rows.iter().map(|m| m.slug.clone()),
                )?;
                for m in rows {
                    s.menus.insert(m.id, m.clone());
                }
            }
            Batch::MenuItems(rows) => {
                let existing: BTreeMap<i64, TreeNode> = s
                    .menu_items
                    .iter()
                    .map(|(id, item)| (*id, item.node.clone()))
                    .collect();
                let nodes: Vec<&TreeNode> = rows.iter().map(|r| &r.node).collect();
                check_tree(table, &existing, &nodes)?;
                for n in &nodes {
                    foreign(table, "menu", n.collection_id, s.menus.contains_key(&n.collection_id))?;
                }
                for item in rows {
                    s.menu_items.insert(item.node.id, item.clone());
                }
            }
            Batch::Categories(rows) => {
                let nodes: Vec<&TreeNode> = rows.iter().collect();
                check_tree(table, &s.categories, &nodes)?;
                unique(
                    table,
                    "name in collection",
                    s.categories.values().map(|n| (n.collection_id, n.name.clone())),
                    rows.iter().map(|n| (n.collection_id, n.name.clone())),
                )?;
                for n in rows {
                    foreign(
                        table,
                        "collection",
                        n.collection_id,
                        s.collections.contains_key(&n.collection_id),
                    )?;
                }
                for n in rows {
                    s.categories.insert(n.id, n.clone());
                }
            }
            Batch::Articles(rows) => {
                unique(table, "id", s.articles.keys().copied(), rows.iter().map(|a| a.id))?;
                unique(
                    table,
                    "slug",
                    s.articles.values().map(|a| a.slug.clone()),
                    rows.iter().map(|a| a.slug.clone()),
                )?;
                for a in rows {
                    if let Some(u) = a.user_id {
                        foreign(table, "user", u, s.users.contains_key(&u))?;
                    }
                }
                for a in rows {
                    s.articles.insert(a.id, a.clone());
                }
            }
            Batch::Pictures(rows) => {
                unique(table, "id", s.pictures.keys().copied(), rows.iter().map(|p| p.id))?;
                unique(
                    table,
                    "slug",
                    s.pictures.values().map(|p| p.slug.clone()),
                    rows.iter().map(|p| p.slug.clone()),
                )?;
                for p in rows {
                    s.pictures.insert(p.id, p.clone());
                }
            }
        }
        Ok(())
    }

    fn max_link_rows(&self, _kind: RelationKind) -> Option<usize> {
        self.link_ceiling
    }

    async fn bulk_link(
        &self,
        kind: RelationKind,
        relations: &[PendingRelation],
    ) -> Result<(), StoreError> {
        if let Some(ceiling) = self.link_ceiling.filter(|c| relations.len() > *c) {
            return Err(StoreError::Database {
                table: match kind {
                    RelationKind::Categorization => "collections_categorization",
                    RelationKind::ArticlePicture => "articles_article_pictures",
                }
                .to_string(),
                source: sqlx::Error::Protocol(format!(
                    "{} relations in one statement, at most {ceiling} allowed",
                    relations.len()
                )),
            });
        }
        let mut s = self.state.lock().await;
        s.link_calls.push(relations.len());
        match kind {
            RelationKind::Categorization => {
                let table = "collections_categorization";
                for r in relations {
                    foreign(table, "category", r.subject_id, s.categories.contains_key(&r.subject_id))?;
                    foreign(table, "article", r.object_id, s.articles.contains_key(&r.object_id))?;
                }
                s.categorizations
                    .extend(relations.iter().map(|r| (r.subject_id, r.object_id)));
            }
            RelationKind::ArticlePicture => {
                let table = "articles_article_pictures";
                for r in relations {
                    foreign(table, "article", r.subject_id, s.articles.contains_key(&r.subject_id))?;
                    foreign(table, "picture", r.object_id, s.pictures.contains_key(&r.object_id))?;
                }
                unique(
                    table,
                    "article/picture pair",
                    s.article_pictures.iter().copied(),
                    relations.iter().map(|r| (r.subject_id, r.object_id)),
                )?;
                s.article_pictures
                    .extend(relations.iter().map(|r| (r.subject_id, r.object_id)));
            }
        }
        Ok(())
    }

    async fn rebuild_tree(&self, table: TreeTable) -> Result<(), StoreError> {
        let mut s = self.state.lock().await;
        let nodes: Vec<&mut TreeNode> = match table {
            TreeTable::Categories => s.categories.values_mut().collect(),
            TreeTable::MenuItems => s.menu_items.values_mut().map(|m| &mut m.node).collect(),
        };
        let entries: Vec<TreeEntry> = nodes
            .iter()
            .map(|n| TreeEntry {
                id: n.id,
                parent_id: n.parent_id,
                order_key: n.left,
            })
            .collect();
        let bounds: std::collections::HashMap<i64, _> = rebuild_nested_set(&entries)
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        for n in nodes {
            if let Some(b) = bounds.get(&n.id) {
                n.left = b.left;
                n.right = b.right;
                n.level = b.level;
                n.tree_id = b.tree_id;
            }
        }
        Ok(())
    }

    async fn existing_slugs(&self, table: &str) -> Result<HashSet<String>, StoreError> {
        let s = self.state.lock().await;
        Ok(match table {
            "collections_category" => s.categories.values().map(|n| n.slug.clone()).collect(),
            "cyclope_menuitem" => s.menu_items.values().map(|m| m.node.slug.clone()).collect(),
            "cyclope_menu" => s.menus.values().map(|m| m.slug.clone()).collect(),
            "articles_article" => s.articles.values().map(|a| a.slug.clone()).collect(),
            "medialibrary_picture" => s.pictures.values().map(|p| p.slug.clone()).collect(),
            _ => HashSet::new(),
        })
    }

    async fn update_article_texts(&self, updates: &[(i64, String)]) -> Result<(), StoreError> {
        let mut s = self.state.lock().await;
        for (id, text) in updates {
            if let Some(a) = s.articles.get_mut(id) {
                a.text = text.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub use source::MemorySource;

#[cfg(test)]
mod source {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use indexmap::IndexMap;
    use serde_json::Value;

    use crate::error::StoreError;
    use crate::store::{DuplicateQuery, SourceQuery, SourceRow, SourceStore};

    /// Source fixture: rows per table, already shaped like the projections
    /// (aliases included). Predicates and ordering are not evaluated; paging is.
    #[derive(Debug, Default)]
    pub struct MemorySource {
        prefix: String,
        tables: HashMap<String, Vec<SourceRow>>,
    }

    impl MemorySource {
        pub fn new(prefix: &str) -> Self {
            Self {
                prefix: prefix.to_string(),
                tables: HashMap::new(),
            }
        }

        pub fn with_table(mut self, table: &str, rows: Vec<Value>) -> Self {
            let rows = rows
                .into_iter()
                .map(|v| {
                    let map: IndexMap<String, Value> = serde_json::from_value(v).unwrap_or_default();
                    SourceRow::new(table, map)
                })
                .collect();
            self.tables.insert(table.to_string(), rows);
            self
        }
    }

    #[async_trait]
    impl SourceStore for MemorySource {
        fn prefix(&self) -> &str {
            &self.prefix
        }

        async fn fetch(&self, query: &SourceQuery) -> Result<Vec<SourceRow>, StoreError> {
            let rows = self.tables.get(&query.table).cloned().unwrap_or_default();
            let skip = query.offset.unwrap_or(0) as usize;
            let take = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
            Ok(rows.into_iter().skip(skip).take(take).collect())
        }

        async fn count(&self, table: &str, _predicate: Option<&str>) -> Result<u64, StoreError> {
            Ok(self.tables.get(table).map(|r| r.len() as u64).unwrap_or(0))
        }

        async fn has_table(&self, table: &str) -> Result<bool, StoreError> {
            Ok(self.tables.contains_key(table))
        }

        async fn duplicate_ids(&self, query: &DuplicateQuery) -> Result<HashSet<i64>, StoreError> {
            let rows = self.tables.get(&query.table).cloned().unwrap_or_default();
            let mut by_name: HashMap<String, Vec<i64>> = HashMap::new();
            let mut by_slug: HashMap<String, Vec<i64>> = HashMap::new();
            for r in &rows {
                let id = r.i64(&query.id_column)?;
                let name = r.str(&query.name_column).to_lowercase();
                let slug = r.str(&query.slug_column);
                if !name.is_empty() {
                    by_name.entry(name).or_default().push(id);
                }
                if !slug.is_empty() {
                    by_slug.entry(slug).or_default().push(id);
                }
            }
            Ok(by_name
                .into_values()
                .chain(by_slug.into_values())
                .filter(|ids| ids.len() > 1)
                .flatten()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AsBatch;

    fn node(id: i64, parent_id: Option<i64>, name: &str) -> TreeNode {
        TreeNode {
            id,
            source_id: id,
            parent_id,
            left: id,
            right: id,
            level: 0,
            tree_id: 0,
            name: name.to_string(),
            slug: name.to_lowercase(),
            active: true,
            collection_id: 1,
        }
    }

    async fn with_collection() -> MemoryTarget {
        let t = MemoryTarget::new();
        t.create_collection(&Collection {
            id: 1,
            name: "Categories".into(),
            slug: "categories".into(),
            active: true,
        })
        .await
        .unwrap();
        t
    }

    #[tokio::test]
    async fn batches_are_atomic() {
        let t = with_collection().await;
        let err = t
            .bulk_create(TreeNode::batch(&[node(1, None, "A"), node(2, None, "a2"), node(3, None, "A")]))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(t.count("collections_category").await, 0);

        let err = t
            .bulk_create(TreeNode::batch(&[node(1, None, "A"), node(2, Some(9), "B")]))
            .await
            .unwrap_err();
        assert!(err.is_foreign_key_violation());
        assert_eq!(t.count("collections_category").await, 0);
    }

    #[tokio::test]
    async fn category_needs_its_collection() {
        let t = MemoryTarget::new();
        let err = t.bulk_create(TreeNode::batch(&[node(1, None, "A")])).await.unwrap_err();
        assert!(err.is_foreign_key_violation());
    }

    #[tokio::test]
    async fn rebuild_recomputes_bounds() {
        let t = with_collection().await;
        // Children listed before their parent; bounds are garbage until rebuilt.
        let rows = vec![node(3, Some(1), "C"), node(2, Some(1), "B"), node(1, None, "A"), node(4, None, "D")];
        t.bulk_create(TreeNode::batch(&rows)).await.unwrap();
        t.rebuild_tree(TreeTable::Categories).await.unwrap();
        let got: Vec<(i64, i64, i64, i64, i64)> = t
            .categories()
            .await
            .iter()
            .map(|n| (n.id, n.left, n.right, n.level, n.tree_id))
            .collect();
        assert_eq!(
            got,
            vec![(1, 1, 6, 0, 1), (2, 2, 3, 1, 1), (3, 4, 5, 1, 1), (4, 1, 2, 0, 2)]
        );
    }

    #[tokio::test]
    async fn article_pictures_are_unique_pairs() {
        let t = MemoryTarget::new();
        let article = Article {
            id: 1,
            name: "A".into(),
            slug: "a".into(),
            text: String::new(),
            published: true,
            date: None,
            creation_date: None,
            modification_date: None,
            user_id: None,
        };
        let picture = Picture {
            id: 1,
            name: "P".into(),
            slug: "p-1".into(),
            image: "pictures/p.jpg".into(),
            description: String::new(),
        };
        t.bulk_create(Article::batch(&[article])).await.unwrap();
        t.bulk_create(Picture::batch(&[picture])).await.unwrap();
        let rel = PendingRelation::new(RelationKind::ArticlePicture, 1, 1);
        t.bulk_link(RelationKind::ArticlePicture, &[rel]).await.unwrap();
        let err = t.bulk_link(RelationKind::ArticlePicture, &[rel]).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(t.article_pictures().await, vec![(1, 1)]);
    }
}
