//! Bulk insert with fallback reconciliation of unique names and slugs.
//!
//! The cheap path is a plain bulk insert. Only when the target reports a
//! uniqueness violation is the (expensive) duplicate lookup run, the colliding
//! rows renamed, and the batch inserted again.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ReconcileError, StoreError};
use crate::model::{Article, AsBatch, MenuItem, TreeNode};
use crate::store::TargetStore;

/// A row carrying a globally unique slug and a name unique within its scope.
pub trait Reconcilable {
    /// Identifier in the source population, as reported by a [`DuplicateLookup`].
    fn source_id(&self) -> i64;
    fn name(&self) -> &str;
    fn slug(&self) -> &str;
    /// Scope in which names must be unique; `None` means names are free.
    fn name_scope(&self) -> Option<i64>;
    fn set_name(&mut self, name: String);
    fn set_slug(&mut self, slug: String);
}

impl Reconcilable for TreeNode {
    fn source_id(&self) -> i64 {
        self.source_id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn slug(&self) -> &str {
        &self.slug
    }
    fn name_scope(&self) -> Option<i64> {
        Some(self.collection_id)
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn set_slug(&mut self, slug: String) {
        self.slug = slug;
    }
}

impl Reconcilable for MenuItem {
    fn source_id(&self) -> i64 {
        self.node.source_id
    }
    fn name(&self) -> &str {
        &self.node.name
    }
    fn slug(&self) -> &str {
        &self.node.slug
    }
    fn name_scope(&self) -> Option<i64> {
        None
    }
    fn set_name(&mut self, name: String) {
        self.node.name = name;
    }
    fn set_slug(&mut self, slug: String) {
        self.node.slug = slug;
    }
}

impl Reconcilable for Article {
    fn source_id(&self) -> i64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn slug(&self) -> &str {
        &self.slug
    }
    fn name_scope(&self) -> Option<i64> {
        None
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn set_slug(&mut self, slug: String) {
        self.slug = slug;
    }
}

/// Lazily answers which source ids collide on a unique key.
#[async_trait]
pub trait DuplicateLookup: Send + Sync {
    async fn colliding_ids(&self) -> Result<HashSet<i64>, StoreError>;
}

/// Lookup answered from rows already in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalDuplicates(pub HashSet<i64>);

impl LocalDuplicates {
    pub fn of<R: Reconcilable>(rows: &[R]) -> Self {
        Self(find_collisions(rows))
    }
}

#[async_trait]
impl DuplicateLookup for LocalDuplicates {
    async fn colliding_ids(&self) -> Result<HashSet<i64>, StoreError> {
        Ok(self.0.clone())
    }
}

/// Source ids whose slug repeats anywhere in `rows`, or whose case-insensitive
/// name repeats inside the same name scope.
pub fn find_collisions<R: Reconcilable>(rows: &[R]) -> HashSet<i64> {
    let mut by_slug: HashMap<String, Vec<i64>> = HashMap::new();
    let mut by_name: HashMap<(i64, String), Vec<i64>> = HashMap::new();
    for r in rows {
        by_slug
            .entry(r.slug().to_lowercase())
            .or_default()
            .push(r.source_id());
        if let Some(scope) = r.name_scope() {
            by_name
                .entry((scope, r.name().to_lowercase()))
                .or_default()
                .push(r.source_id());
        }
    }
    by_slug
        .into_values()
        .chain(by_name.into_values())
        .filter(|ids| ids.len() > 1)
        .flatten()
        .collect()
}

/// Slug-pass state: the name of the current run and the next suffix for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlugRun {
    name: Option<String>,
    next_suffix: u32,
}

impl SlugRun {
    /// Returns the suffix for an entry named `name_key` (`None` for the first
    /// of its run) and the state for the next entry.
    pub fn step(self, name_key: &str) -> (Option<u32>, SlugRun) {
        if self.name.as_deref() == Some(name_key) {
            let suffix = self.next_suffix;
            (
                Some(suffix),
                SlugRun {
                    name: self.name,
                    next_suffix: suffix + 1,
                },
            )
        } else {
            (
                None,
                SlugRun {
                    name: Some(name_key.to_string()),
                    next_suffix: 2,
                },
            )
        }
    }
}

/// Name-pass state. The counter restarts when the name changes but not when
/// only the scope changes, so a second same-name run in another collection
/// continues the previous run's numbering.
// NOTE: possibly an artifact of the sort order rather than a business rule; kept as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameRun {
    name: Option<String>,
    scope: Option<i64>,
    counter: u32,
}

impl NameRun {
    pub fn step(self, name_key: &str, scope: Option<i64>) -> (Option<u32>, NameRun) {
        if self.name.as_deref() != Some(name_key) {
            return (
                None,
                NameRun {
                    name: Some(name_key.to_string()),
                    scope,
                    counter: 1,
                },
            );
        }
        if scope.is_some() && scope == self.scope {
            let n = self.counter;
            (
                Some(n),
                NameRun {
                    name: self.name,
                    scope,
                    counter: n + 1,
                },
            )
        } else {
            (
                None,
                NameRun {
                    name: self.name,
                    scope,
                    counter: self.counter,
                },
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation<R> {
    /// Clean rows first, then the reconciled duplicates in name order.
    pub rows: Vec<R>,
    pub duplicates: usize,
    pub slugs_renamed: usize,
    pub names_renamed: usize,
}

/// Renames rows whose source id is in `duplicates`; everything else is untouched.
pub fn reconcile<R: Reconcilable>(rows: Vec<R>, duplicates: &HashSet<i64>) -> Reconciliation<R> {
    reconcile_with_taken(rows, duplicates, HashSet::new())
}

/// Like [`reconcile`], with slugs already occupied outside the batch. A slug
/// in `taken` (or held by a clean row) is never handed out; the run advances
/// to the next free suffix instead.
pub fn reconcile_with_taken<R: Reconcilable>(
    rows: Vec<R>,
    duplicates: &HashSet<i64>,
    mut taken: HashSet<String>,
) -> Reconciliation<R> {
    let (mut clean, mut dups): (Vec<R>, Vec<R>) = rows
        .into_iter()
        .partition(|r| !duplicates.contains(&r.source_id()));
    if dups.is_empty() {
        return Reconciliation {
            rows: clean,
            duplicates: 0,
            slugs_renamed: 0,
            names_renamed: 0,
        };
    }
    taken.extend(clean.iter().map(|r| r.slug().to_string()));
    dups.sort_by_cached_key(|r| r.name().to_lowercase());

    let (slugs_renamed, _) = dedupe_slugs(&mut dups, taken);
    let names_renamed = disambiguate_names(&mut dups);
    let duplicates = dups.len();
    clean.append(&mut dups);
    Reconciliation {
        rows: clean,
        duplicates,
        slugs_renamed,
        names_renamed,
    }
}

/// Returns the number of slugs changed and the final set of taken slugs.
fn dedupe_slugs<R: Reconcilable>(rows: &mut [R], mut taken: HashSet<String>) -> (usize, HashSet<String>) {
    let mut run = SlugRun::default();
    let mut renamed = 0;
    for row in rows.iter_mut() {
        let (suffix, next) = run.step(&row.name().to_lowercase());
        run = next;
        let base = row.slug().to_string();
        let mut candidate = match suffix {
            None => base.clone(),
            Some(n) => format!("{base}-{n}"),
        };
        while taken.contains(&candidate) {
            let (n, next) = run.step(&row.name().to_lowercase());
            run = next;
            candidate = format!("{base}-{}", n.unwrap_or(2));
        }
        if candidate != base {
            row.set_slug(candidate.clone());
            renamed += 1;
        }
        taken.insert(candidate);
    }
    (renamed, taken)
}

fn disambiguate_names<R: Reconcilable>(rows: &mut [R]) -> usize {
    let mut run = NameRun::default();
    let mut renamed = 0;
    for row in rows.iter_mut() {
        let (counter, next) = run.step(&row.name().to_lowercase(), row.name_scope());
        run = next;
        if let Some(n) = counter {
            let name = format!("{} ({n})", row.name());
            row.set_name(name);
            renamed += 1;
        }
    }
    renamed
}

/// Bulk-creates `rows`; on a uniqueness violation runs `lookup`, reconciles the
/// colliding rows and tries exactly once more.
pub async fn insert_with_reconciliation<R, T, L>(
    target: &T,
    rows: Vec<R>,
    lookup: &L,
) -> Result<Reconciliation<R>, ReconcileError>
where
    R: Reconcilable + AsBatch + Send + Sync,
    T: TargetStore + ?Sized,
    L: DuplicateLookup + ?Sized,
{
    let table = R::batch(&rows).table();
    match target.bulk_create(R::batch(&rows)).await {
        Ok(()) => {
            return Ok(Reconciliation {
                rows,
                duplicates: 0,
                slugs_renamed: 0,
                names_renamed: 0,
            })
        }
        Err(e) if e.is_unique_violation() => {
            warn!(table, error = %e, "bulk insert hit a uniqueness violation; reconciling duplicates");
        }
        Err(e) => return Err(e.into()),
    }

    let mut colliding = lookup
        .colliding_ids()
        .await
        .map_err(|source| ReconcileError::Lookup { table, source })?;
    let taken = target.existing_slugs(table).await?;
    colliding.extend(
        rows.iter()
            .filter(|r| taken.contains(r.slug()))
            .map(|r| r.source_id()),
    );

    let outcome = reconcile_with_taken(rows, &colliding, taken);
    info!(
        table,
        duplicates = outcome.duplicates,
        slugs_renamed = outcome.slugs_renamed,
        names_renamed = outcome.names_renamed,
        "duplicates reconciled"
    );
    match target.bulk_create(R::batch(&outcome.rows)).await {
        Ok(()) => Ok(outcome),
        Err(source) if source.is_unique_violation() => {
            Err(ReconcileError::Unresolved { table, source })
        }
        Err(e) => Err(e.into()),
    }
}

/// URL slug: accents folded, ASCII alphanumerics and `_` kept, whitespace and
/// hyphen runs collapsed to one `-`, everything else dropped.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars().map(fold_accent) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch == '-' {
            pending_dash = true;
        }
    }
    out
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' | 'Á' | 'À' | 'Ä' | 'Â' | 'Ã' | 'Å' => 'a',
        'é' | 'è' | 'ë' | 'ê' | 'É' | 'È' | 'Ë' | 'Ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' | 'Í' | 'Ì' | 'Ï' | 'Î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' | 'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' | 'Ú' | 'Ù' | 'Ü' | 'Û' => 'u',
        'ñ' | 'Ñ' => 'n',
        'ç' | 'Ç' => 'c',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryTarget;
    use crate::model::Collection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(id: i64, name: &str, collection_id: i64) -> TreeNode {
        TreeNode {
            id,
            source_id: id,
            parent_id: None,
            left: 1,
            right: 2,
            level: 0,
            tree_id: 0,
            name: name.to_string(),
            slug: slugify(name),
            active: true,
            collection_id,
        }
    }

    fn all_ids<R: Reconcilable>(rows: &[R]) -> HashSet<i64> {
        rows.iter().map(|r| r.source_id()).collect()
    }

    #[test]
    fn slugify_matches_cms_conventions() {
        assert_eq!(slugify("Hello World!"), "hello-world");
        assert_eq!(slugify("(Test) Game"), "test-game");
        assert_eq!(slugify("  Información   General -- 2010 "), "informacion-general-2010");
        assert_eq!(slugify("don't_stop"), "dont_stop");
        assert_eq!(slugify("¿?"), "");
    }

    #[test]
    fn repeated_names_get_increasing_slug_suffixes() {
        let rows = vec![
            node(1, "Apple", 1),
            node(2, "apple", 2),
            node(3, "APPLE", 3),
            node(4, "Banana", 1),
        ];
        let ids = all_ids(&rows);
        let out = reconcile(rows, &ids);
        let slugs: Vec<&str> = out.rows.iter().map(|r| r.slug.as_str()).collect();
        assert_eq!(slugs, vec!["apple", "apple-2", "apple-3", "banana"]);
        assert_eq!(out.slugs_renamed, 2);
        assert_eq!(out.names_renamed, 0, "different collections keep their names");
    }

    #[test]
    fn duplicates_are_sorted_case_insensitively_and_stably() {
        let rows = vec![node(1, "beta", 1), node(2, "Alpha", 2), node(3, "alpha", 3)];
        let ids = all_ids(&rows);
        let out = reconcile(rows, &ids);
        let order: Vec<i64> = out.rows.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(out.rows[1].slug, "alpha-2");
    }

    #[test]
    fn same_name_same_collection_gets_counter() {
        let rows = vec![node(1, "News", 1), node(2, "News", 1), node(3, "News", 2)];
        let ids = all_ids(&rows);
        let out = reconcile(rows, &ids);
        let names: Vec<&str> = out.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["News", "News (1)", "News"]);
        let slugs: Vec<&str> = out.rows.iter().map(|r| r.slug.as_str()).collect();
        assert_eq!(slugs, vec!["news", "news-2", "news-3"]);
    }

    #[test]
    fn name_counter_is_not_reset_by_a_collection_change() {
        let rows = vec![
            node(1, "News", 1),
            node(2, "News", 1),
            node(3, "News", 2),
            node(4, "News", 2),
        ];
        let ids = all_ids(&rows);
        let out = reconcile(rows, &ids);
        let names: Vec<&str> = out.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["News", "News (1)", "News", "News (2)"]);
    }

    #[test]
    fn clean_rows_are_untouched_and_come_first() {
        let rows = vec![node(1, "Solo", 1), node(2, "Twin", 1), node(3, "Twin", 1)];
        let dups: HashSet<i64> = [2, 3].into_iter().collect();
        let out = reconcile(rows, &dups);
        assert_eq!(out.rows[0], node(1, "Solo", 1));
        assert_eq!(out.duplicates, 2);
    }

    #[test]
    fn suffixes_skip_slugs_held_by_clean_rows() {
        let mut clean = node(9, "Apple two", 1);
        clean.slug = "apple-2".into();
        let rows = vec![clean, node(1, "Apple", 1), node(2, "Apple", 2)];
        let dups: HashSet<i64> = [1, 2].into_iter().collect();
        let out = reconcile(rows, &dups);
        let slugs: Vec<&str> = out.rows.iter().map(|r| r.slug.as_str()).collect();
        assert_eq!(slugs, vec!["apple-2", "apple", "apple-3"]);
    }

    #[test]
    fn resolving_a_resolved_batch_is_a_no_op() {
        let rows = vec![
            node(1, "News", 1),
            node(2, "news", 1),
            node(3, "News", 2),
            node(4, "Sports", 1),
        ];
        let first = reconcile(rows.clone(), &find_collisions(&rows));
        let remaining = find_collisions(&first.rows);
        assert!(remaining.is_empty(), "left over: {remaining:?}");
        let second = reconcile(first.rows.clone(), &remaining);
        assert_eq!(second.rows, first.rows);
        assert_eq!(second.duplicates, 0);
    }

    #[test]
    fn collisions_respect_name_scope() {
        let rows = vec![node(1, "News", 1), node(2, "News", 2)];
        // Same slug, so both collide even across collections.
        assert_eq!(find_collisions(&rows).len(), 2);

        let mut other = node(2, "News", 2);
        other.slug = "news-other".into();
        let rows = vec![node(1, "News", 1), other];
        assert!(find_collisions(&rows).is_empty());
    }

    struct CountingLookup {
        calls: AtomicUsize,
        ids: HashSet<i64>,
    }

    #[async_trait]
    impl DuplicateLookup for CountingLookup {
        async fn colliding_ids(&self) -> Result<HashSet<i64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ids.clone())
        }
    }

    async fn target_with_collections() -> MemoryTarget {
        let target = MemoryTarget::default();
        for id in [1, 2] {
            target
                .create_collection(&Collection {
                    id,
                    name: format!("c{id}"),
                    slug: format!("c{id}"),
                    active: true,
                })
                .await
                .unwrap();
        }
        target
    }

    #[tokio::test]
    async fn lookup_only_runs_after_a_violation() {
        let target = target_with_collections().await;
        let lookup = CountingLookup {
            calls: AtomicUsize::new(0),
            ids: HashSet::new(),
        };
        let rows = vec![node(1, "A", 1), node(2, "B", 1)];
        let out = insert_with_reconciliation(&target, rows, &lookup).await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.duplicates, 0);
        assert_eq!(target.count("collections_category").await, 2);
    }

    #[tokio::test]
    async fn violation_triggers_lookup_and_retry() {
        let target = target_with_collections().await;
        let rows = vec![node(1, "News", 1), node(2, "News", 1), node(3, "News", 2)];
        let lookup = CountingLookup {
            calls: AtomicUsize::new(0),
            ids: all_ids(&rows),
        };
        let out = insert_with_reconciliation(&target, rows, &lookup).await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.duplicates, 3);
        assert_eq!(target.count("collections_category").await, 3);
    }

    #[tokio::test]
    async fn slugs_already_in_the_target_are_avoided() {
        let target = target_with_collections().await;
        target.bulk_create(TreeNode::batch(&[node(1, "News", 1)])).await.unwrap();

        let mut tag = node(5, "News", 2);
        tag.id = 6;
        let lookup = CountingLookup {
            calls: AtomicUsize::new(0),
            ids: HashSet::new(),
        };
        let out = insert_with_reconciliation(&target, vec![tag], &lookup).await.unwrap();
        assert_eq!(out.rows[0].slug, "news-2");
    }

    #[tokio::test]
    async fn unresolvable_collisions_are_fatal() {
        let target = target_with_collections().await;
        let mut twin = node(2, "Twin", 1);
        twin.slug = "twin-b".into();
        // The lookup misses the collision, so nothing gets renamed.
        let lookup = LocalDuplicates(HashSet::new());
        let err = insert_with_reconciliation(&target, vec![node(1, "Twin", 1), twin], &lookup)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Unresolved { table: "collections_category", .. }));
        assert_eq!(target.count("collections_category").await, 0);
    }
}
