//! Rows written to the Cyclope schema.
use chrono::NaiveDateTime;
use serde::Serialize;

/// A node of a tree-indexed table (categories, tags) in nested-set form.
///
/// `left`/`right`/`level`/`tree_id` are provisional until the target rebuilds
/// the tree from parent pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: i64,
    /// Id in the source table, before the namespace offset was applied.
    pub source_id: i64,
    pub parent_id: Option<i64>,
    pub left: i64,
    pub right: i64,
    pub level: i64,
    pub tree_id: i64,
    pub name: String,
    pub slug: String,
    pub active: bool,
    pub collection_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub is_staff: bool,
    pub is_active: bool,
    pub is_superuser: bool,
    pub last_login: Option<NaiveDateTime>,
    pub date_joined: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Menu {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub main_menu: bool,
}

/// Menu entries share the tree shape of categories; `node.collection_id` holds
/// the owning menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub node: TreeNode,
    pub custom_url: String,
    pub site_home: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub text: String,
    pub published: bool,
    pub date: Option<NaiveDateTime>,
    pub creation_date: Option<NaiveDateTime>,
    pub modification_date: Option<NaiveDateTime>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub id: i64,
    pub name: String,
    pub slug: String,
    /// Storage path relative to the media root.
    pub image: String,
    pub description: String,
}

/// Association tables filled by the deferred linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// category ← article, through `collections_categorization`.
    Categorization,
    /// article → picture, through `articles_article_pictures`.
    ArticlePicture,
}

impl RelationKind {
    pub fn label(self) -> &'static str {
        match self {
            RelationKind::Categorization => "categorization",
            RelationKind::ArticlePicture => "article_picture",
        }
    }
}

/// An association recorded before both endpoints are known to exist.
///
/// For categorizations the subject is the category and the object the article;
/// for article pictures the subject is the article and the object the picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingRelation {
    pub subject_id: i64,
    pub object_id: i64,
    pub kind: RelationKind,
}

impl PendingRelation {
    pub fn new(kind: RelationKind, subject_id: i64, object_id: i64) -> Self {
        Self {
            subject_id,
            object_id,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeTable {
    Categories,
    MenuItems,
}

impl TreeTable {
    pub fn table(self) -> &'static str {
        match self {
            TreeTable::Categories => "collections_category",
            TreeTable::MenuItems => "cyclope_menuitem",
        }
    }
}

/// A borrowed batch handed to `TargetStore::bulk_create`.
#[derive(Debug, Clone, Copy)]
pub enum Batch<'a> {
    Users(&'a [User]),
    Menus(&'a [Menu]),
    MenuItems(&'a [MenuItem]),
    Categories(&'a [TreeNode]),
    Articles(&'a [Article]),
    Pictures(&'a [Picture]),
}

impl Batch<'_> {
    pub fn table(&self) -> &'static str {
        match self {
            Batch::Users(_) => "auth_user",
            Batch::Menus(_) => "cyclope_menu",
            Batch::MenuItems(_) => "cyclope_menuitem",
            Batch::Categories(_) => "collections_category",
            Batch::Articles(_) => "articles_article",
            Batch::Pictures(_) => "medialibrary_picture",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Users(r) => r.len(),
            Batch::Menus(r) => r.len(),
            Batch::MenuItems(r) => r.len(),
            Batch::Categories(r) => r.len(),
            Batch::Articles(r) => r.len(),
            Batch::Pictures(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row types that can be handed to the target as a bulk batch.
pub trait AsBatch: Sized {
    fn batch(rows: &[Self]) -> Batch<'_>;
}

impl AsBatch for User {
    fn batch(rows: &[Self]) -> Batch<'_> {
        Batch::Users(rows)
    }
}

impl AsBatch for Menu {
    fn batch(rows: &[Self]) -> Batch<'_> {
        Batch::Menus(rows)
    }
}

impl AsBatch for MenuItem {
    fn batch(rows: &[Self]) -> Batch<'_> {
        Batch::MenuItems(rows)
    }
}

impl AsBatch for TreeNode {
    fn batch(rows: &[Self]) -> Batch<'_> {
        Batch::Categories(rows)
    }
}

impl AsBatch for Article {
    fn batch(rows: &[Self]) -> Batch<'_> {
        Batch::Articles(rows)
    }
}

impl AsBatch for Picture {
    fn batch(rows: &[Self]) -> Batch<'_> {
        Batch::Pictures(rows)
    }
}
