//! Tree importer: nested-set rows from a source table into target tree nodes.
//!
//! Two independently numbered source trees (categories and tags) land in the
//! same target table, so every tree after the first is shifted past the ids the
//! previous one consumed (see [`IdentitySpace`]).
use std::collections::{HashMap, HashSet};

use crate::error::TreeError;
use crate::migrate::reconcile::slugify;
use crate::model::TreeNode;

/// One row of a nested-set encoded source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTreeRow {
    pub id: i64,
    pub parent_id: i64,
    pub left: i64,
    pub right: i64,
    pub level: i64,
    pub title: String,
    pub alias: String,
    pub published: bool,
    pub collection_id: i64,
}

impl SourceTreeRow {
    /// Alias when the source has one, otherwise derived from the title.
    pub fn slug(&self) -> String {
        let alias = slugify(&self.alias);
        if alias.is_empty() {
            slugify(&self.title)
        } else {
            alias
        }
    }
}

/// Ids already taken in a shared target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentitySpace {
    max_id: i64,
}

impl IdentitySpace {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(nodes: &[TreeNode]) -> Self {
        Self {
            max_id: nodes.iter().map(|n| n.id).max().unwrap_or(0),
        }
    }

    /// Offset to apply to the next tree imported into the same table.
    pub fn offset(&self) -> i64 {
        self.max_id
    }

    /// Space covering both `self` and `nodes`.
    pub fn extend(self, nodes: &[TreeNode]) -> Self {
        Self {
            max_id: self.max_id.max(Self::of(nodes).max_id),
        }
    }
}

/// How `left`/`right`/`level` reach the target.
pub trait TreeEncoding {
    fn name(&self) -> &'static str;
    fn encode(&self, nodes: &mut [TreeNode]) -> Result<(), TreeError>;
}

/// Keeps the source bounds verbatim. Only valid while source and target use the
/// same nested-set encoding; the bounds are checked, never repaired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedSetCopy;

impl TreeEncoding for NestedSetCopy {
    fn name(&self) -> &'static str {
        "nested-set-copy"
    }

    fn encode(&self, nodes: &mut [TreeNode]) -> Result<(), TreeError> {
        let bounds: HashMap<i64, (i64, i64)> =
            nodes.iter().map(|n| (n.id, (n.left, n.right))).collect();
        for node in nodes.iter() {
            if node.left >= node.right {
                return Err(TreeError::InvertedBounds {
                    id: node.id,
                    left: node.left,
                    right: node.right,
                });
            }
            if let Some(parent_id) = node.parent_id {
                if let Some(&(p_left, p_right)) = bounds.get(&parent_id) {
                    if !(p_left < node.left && node.right < p_right) {
                        return Err(TreeError::Uncontained {
                            id: node.id,
                            parent_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Re-derives bounds, levels and tree ids from parent pointers, for targets
/// whose hierarchy encoding differs from the source's. Siblings keep the order
/// of their source `left` bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentPointerEncoding;

impl TreeEncoding for ParentPointerEncoding {
    fn name(&self) -> &'static str {
        "parent-pointer"
    }

    fn encode(&self, nodes: &mut [TreeNode]) -> Result<(), TreeError> {
        let entries: Vec<TreeEntry> = nodes
            .iter()
            .map(|n| TreeEntry {
                id: n.id,
                parent_id: n.parent_id,
                order_key: n.left,
            })
            .collect();
        let bounds: HashMap<i64, NestedBounds> = rebuild_nested_set(&entries)
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        for node in nodes.iter_mut() {
            if let Some(b) = bounds.get(&node.id) {
                node.left = b.left;
                node.right = b.right;
                node.level = b.level;
                node.tree_id = b.tree_id;
            }
        }
        Ok(())
    }
}

pub struct TreeImporter<E = NestedSetCopy> {
    encoding: E,
    root_id: Option<i64>,
    tree_id: i64,
}

impl Default for TreeImporter<NestedSetCopy> {
    fn default() -> Self {
        Self::new(NestedSetCopy)
    }
}

impl<E: TreeEncoding> TreeImporter<E> {
    pub fn new(encoding: E) -> Self {
        Self {
            encoding,
            root_id: None,
            tree_id: 0,
        }
    }

    /// Source id of a system root that is not imported itself; its children
    /// become target roots. Parent ids `<= 0` always mean "no parent".
    pub fn with_root_id(mut self, root_id: i64) -> Self {
        self.root_id = Some(root_id);
        self
    }

    /// Placeholder written to `tree_id`; the target's tree rebuild replaces it.
    pub fn with_tree_id(mut self, tree_id: i64) -> Self {
        self.tree_id = tree_id;
        self
    }

    pub fn encoding(&self) -> &E {
        &self.encoding
    }

    pub fn import(&self, rows: &[SourceTreeRow], offset: i64) -> Result<Vec<TreeNode>, TreeError> {
        let source_ids: HashSet<i64> = rows.iter().map(|r| r.id).collect();
        let mut seen = HashSet::with_capacity(rows.len());
        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            if row.id <= 0 {
                return Err(TreeError::NonPositiveId { id: row.id });
            }
            let id = row.id + offset;
            if !seen.insert(id) {
                return Err(TreeError::DuplicateId { id, offset });
            }
            let parent_id = if self.is_root_parent(row.parent_id) {
                None
            } else if source_ids.contains(&row.parent_id) {
                Some(row.parent_id + offset)
            } else {
                return Err(TreeError::DanglingParent {
                    id: row.id,
                    parent_id: row.parent_id,
                });
            };
            nodes.push(TreeNode {
                id,
                source_id: row.id,
                parent_id,
                left: row.left,
                right: row.right,
                level: row.level,
                tree_id: self.tree_id,
                name: row.title.trim().to_string(),
                slug: row.slug(),
                active: row.published,
                collection_id: row.collection_id,
            });
        }
        self.encoding.encode(&mut nodes)?;
        Ok(nodes)
    }

    fn is_root_parent(&self, parent_id: i64) -> bool {
        parent_id <= 0 || Some(parent_id) == self.root_id
    }
}

/// Imports with verbatim nested-set bounds and no system root.
pub fn import_tree(rows: &[SourceTreeRow], offset: i64) -> Result<Vec<TreeNode>, TreeError> {
    TreeImporter::default().import(rows, offset)
}

/// Input to [`rebuild_nested_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    pub id: i64,
    pub parent_id: Option<i64>,
    /// Sibling ordering; ties fall back to id.
    pub order_key: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedBounds {
    pub id: i64,
    pub left: i64,
    pub right: i64,
    pub level: i64,
    pub tree_id: i64,
}

/// Recomputes MPTT bounds from parent pointers: one tree per root (roots ordered
/// by `order_key`, then id), root level 0, bounds restarting at 1 in each tree.
/// Nodes whose parent is missing are treated as roots.
pub fn rebuild_nested_set(entries: &[TreeEntry]) -> Vec<NestedBounds> {
    let ids: HashSet<i64> = entries.iter().map(|e| e.id).collect();
    let mut children: HashMap<i64, Vec<TreeEntry>> = HashMap::new();
    let mut roots: Vec<TreeEntry> = Vec::new();
    for e in entries {
        match e.parent_id {
            Some(p) if p != e.id && ids.contains(&p) => children.entry(p).or_default().push(*e),
            _ => roots.push(*e),
        }
    }
    let sibling_order = |a: &TreeEntry, b: &TreeEntry| (a.order_key, a.id).cmp(&(b.order_key, b.id));
    roots.sort_by(sibling_order);
    for siblings in children.values_mut() {
        siblings.sort_by(sibling_order);
    }

    let mut out = Vec::with_capacity(entries.len());
    let mut seen: HashSet<i64> = HashSet::with_capacity(entries.len());
    let mut tree_id = 0;
    for root in &roots {
        tree_id += 1;
        walk_tree(root.id, tree_id, &children, &mut seen, &mut out);
    }
    // Parent cycles never hang from a root; give each remaining cycle its own tree.
    for e in entries {
        if !seen.contains(&e.id) {
            tree_id += 1;
            walk_tree(e.id, tree_id, &children, &mut seen, &mut out);
        }
    }
    out
}

fn walk_tree(
    root_id: i64,
    tree_id: i64,
    children: &HashMap<i64, Vec<TreeEntry>>,
    seen: &mut HashSet<i64>,
    out: &mut Vec<NestedBounds>,
) {
    let mut counter = 1;
    seen.insert(root_id);
    out.push(NestedBounds {
        id: root_id,
        left: counter,
        right: 0,
        level: 0,
        tree_id,
    });
    counter += 1;
    // (node id, level, next child index, slot in `out`)
    let mut stack: Vec<(i64, i64, usize, usize)> = vec![(root_id, 0, 0, out.len() - 1)];
    while let Some(frame) = stack.last_mut() {
        let (id, level, next, slot) = *frame;
        let kids = children.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        if next < kids.len() {
            frame.2 += 1;
            let child = kids[next];
            if !seen.insert(child.id) {
                continue;
            }
            out.push(NestedBounds {
                id: child.id,
                left: counter,
                right: 0,
                level: level + 1,
                tree_id,
            });
            counter += 1;
            stack.push((child.id, level + 1, 0, out.len() - 1));
        } else {
            out[slot].right = counter;
            counter += 1;
            stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(id: i64, parent_id: i64, left: i64, right: i64, level: i64, title: &str) -> SourceTreeRow {
        SourceTreeRow {
            id,
            parent_id,
            left,
            right,
            level,
            title: title.to_string(),
            alias: String::new(),
            published: true,
            collection_id: 1,
        }
    }

    /// A root with `n - 1` direct children, ids 1..=n, nested-set encoded.
    fn flat_tree(n: i64) -> Vec<SourceTreeRow> {
        let mut rows = vec![row(1, 0, 1, 2 * n, 0, "root")];
        for id in 2..=n {
            let left = 2 * (id - 1);
            rows.push(row(id, 1, left, left + 1, 1, &format!("node {id}")));
        }
        rows
    }

    #[test]
    fn second_tree_is_shifted_past_the_first() {
        let first = import_tree(&flat_tree(3), 0).unwrap();
        let offset = IdentitySpace::of(&first).offset();
        assert_eq!(offset, 3);
        let second = import_tree(&flat_tree(2), offset).unwrap();

        let ids: Vec<i64> = first.iter().chain(second.iter()).map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(first[0].parent_id, None);
        assert_eq!(first[1].parent_id, Some(1));
        assert_eq!(first[2].parent_id, Some(1));
        assert_eq!(second[0].parent_id, None);
        assert_eq!(second[1].parent_id, Some(4));
        assert_eq!(second[1].source_id, 2);
    }

    #[test]
    fn system_root_children_become_roots() {
        let rows = vec![
            row(2, 1, 1, 4, 1, "News"),
            row(3, 2, 2, 3, 2, "Local"),
            row(4, 1, 5, 6, 1, "Sports"),
        ];
        let nodes = TreeImporter::default().with_root_id(1).import(&rows, 0).unwrap();
        assert_eq!(nodes[0].parent_id, None);
        assert_eq!(nodes[1].parent_id, Some(2));
        assert_eq!(nodes[2].parent_id, None);
        assert_eq!(nodes[0].level, 1, "levels stay verbatim until the rebuild");
    }

    #[test]
    fn tree_id_placeholder_and_slug_are_applied() {
        let mut rows = flat_tree(2);
        rows[1].alias = "Custom Alias".into();
        let nodes = TreeImporter::default().with_tree_id(7).import(&rows, 0).unwrap();
        assert!(nodes.iter().all(|n| n.tree_id == 7));
        assert_eq!(nodes[0].slug, "root");
        assert_eq!(nodes[1].slug, "custom-alias");
    }

    #[test]
    fn rejects_inverted_bounds() {
        let rows = vec![row(1, 0, 4, 3, 0, "broken")];
        assert_eq!(
            import_tree(&rows, 0),
            Err(TreeError::InvertedBounds {
                id: 1,
                left: 4,
                right: 3
            })
        );
    }

    #[test]
    fn rejects_child_outside_parent_bounds() {
        let rows = vec![row(1, 0, 1, 4, 0, "root"), row(2, 1, 5, 6, 1, "stray")];
        assert_eq!(
            import_tree(&rows, 0),
            Err(TreeError::Uncontained { id: 2, parent_id: 1 })
        );
    }

    #[test]
    fn rejects_dangling_parent_and_duplicate_ids() {
        let rows = vec![row(1, 0, 1, 4, 0, "root"), row(2, 9, 2, 3, 1, "orphan")];
        assert_eq!(
            import_tree(&rows, 0),
            Err(TreeError::DanglingParent { id: 2, parent_id: 9 })
        );

        let rows = vec![row(1, 0, 1, 2, 0, "a"), row(1, 0, 3, 4, 0, "b")];
        assert_eq!(
            import_tree(&rows, 5),
            Err(TreeError::DuplicateId { id: 6, offset: 5 })
        );

        let rows = vec![row(0, 0, 1, 2, 0, "zero")];
        assert_eq!(import_tree(&rows, 0), Err(TreeError::NonPositiveId { id: 0 }));
    }

    #[test]
    fn parent_pointer_encoding_rederives_bounds() {
        // Bounds are garbage; only parent pointers and sibling order matter.
        let rows = vec![
            row(1, 0, 10, 11, 5, "root"),
            row(2, 1, 30, 31, 5, "second"),
            row(3, 1, 20, 21, 5, "first"),
            row(4, 0, 40, 41, 5, "other root"),
        ];
        let nodes = TreeImporter::new(ParentPointerEncoding).import(&rows, 0).unwrap();
        let by_id: HashMap<i64, &TreeNode> = nodes.iter().map(|n| (n.id, n)).collect();
        assert_eq!((by_id[&1].left, by_id[&1].right, by_id[&1].level), (1, 6, 0));
        assert_eq!((by_id[&3].left, by_id[&3].right, by_id[&3].level), (2, 3, 1));
        assert_eq!((by_id[&2].left, by_id[&2].right, by_id[&2].level), (4, 5, 1));
        assert_eq!((by_id[&4].left, by_id[&4].right, by_id[&4].tree_id), (1, 2, 2));
    }

    #[test]
    fn rebuild_handles_deep_chains_and_cycles() {
        let mut entries: Vec<TreeEntry> = (1..=4)
            .map(|id| TreeEntry {
                id,
                parent_id: if id == 1 { None } else { Some(id - 1) },
                order_key: 0,
            })
            .collect();
        entries.push(TreeEntry { id: 10, parent_id: Some(11), order_key: 0 });
        entries.push(TreeEntry { id: 11, parent_id: Some(10), order_key: 0 });

        let bounds = rebuild_nested_set(&entries);
        assert_eq!(bounds.len(), 6);
        let leaf = bounds.iter().find(|b| b.id == 4).unwrap();
        assert_eq!((leaf.left, leaf.right, leaf.level), (4, 5, 3));
        let root = bounds.iter().find(|b| b.id == 1).unwrap();
        assert_eq!((root.left, root.right), (1, 8));
        assert!(bounds.iter().all(|b| b.left < b.right));
    }

    proptest! {
        #[test]
        fn offset_never_collides(n in 1i64..200, m in 1i64..200) {
            let first = import_tree(&flat_tree(n), 0).unwrap();
            let offset = IdentitySpace::of(&first).offset();
            let second = import_tree(&flat_tree(m), offset).unwrap();
            let max_first = first.iter().map(|n| n.id).max().unwrap();
            let min_second = second.iter().map(|n| n.id).min().unwrap();
            prop_assert!(min_second > max_first);
        }

        #[test]
        fn shifting_preserves_parent_links(n in 1i64..100, offset in 0i64..10_000) {
            let rows = flat_tree(n);
            let nodes = import_tree(&rows, offset).unwrap();
            for (row, node) in rows.iter().zip(&nodes) {
                prop_assert!(node.left < node.right);
                prop_assert_eq!(node.id, row.id + offset);
                let expected = if row.parent_id == 0 { None } else { Some(row.parent_id + offset) };
                prop_assert_eq!(node.parent_id, expected);
            }
        }
    }
}
