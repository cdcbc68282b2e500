//! The Joomla 2.5/3 side: which tables are read, with which projections, and how
//! each legacy row becomes a Cyclope row.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha1::{Digest, Sha1};

use crate::error::StoreError;
use crate::migrate::reconcile::{slugify, DuplicateLookup};
use crate::migrate::tree::SourceTreeRow;
use crate::model::{Article, Menu, User};
use crate::store::{DuplicateQuery, SourceQuery, SourceRow, SourceStore};

pub const USERS: &str = "users";
pub const USER_GROUPS: &str = "user_usergroup_map";
pub const MENU_TYPES: &str = "menu_types";
pub const MENU: &str = "menu";
pub const CATEGORIES: &str = "categories";
pub const TAGS: &str = "tags";
pub const CONTENT: &str = "content";
pub const TAG_MAP: &str = "contentitem_tag_map";

/// `ROOT` row shared by every nested-set table; never imported itself.
pub const SYSTEM_ROOT_ID: i64 = 1;
pub const SUPER_USER_GROUP: i64 = 8;
pub const ARTICLE_TYPE_ALIAS: &str = "com_content.article";

/// Django marker for an account that cannot log in until its password is set.
pub const UNUSABLE_PASSWORD: &str = "!";

const MENU_ITEM_FILTER: &str = "client_id = 0 AND id > 1 AND published >= 0";
const CATEGORY_FILTER: &str = "extension = 'com_content' AND id > 1";
const TAG_FILTER: &str = "id > 1";

pub fn users_query() -> SourceQuery {
    SourceQuery::table(USERS)
        .columns(&[
            "id",
            "name",
            "username",
            "email",
            "block",
            "CAST(registerDate AS CHAR) AS registerDate",
            "CAST(lastvisitDate AS CHAR) AS lastvisitDate",
        ])
        .order_by("id")
}

pub fn super_users_query() -> SourceQuery {
    SourceQuery::table(USER_GROUPS)
        .columns(&["user_id"])
        .filter(format!("group_id = {SUPER_USER_GROUP}"))
}

pub fn menu_types_query() -> SourceQuery {
    SourceQuery::table(MENU_TYPES)
        .columns(&["id", "menutype", "title"])
        .order_by("id")
}

pub fn menu_items_query() -> SourceQuery {
    SourceQuery::table(MENU)
        .columns(&[
            "id", "menutype", "title", "alias", "link", "published", "parent_id", "level", "lft",
            "rgt", "home",
        ])
        .filter(MENU_ITEM_FILTER)
        .order_by("lft")
}

pub fn menu_items_duplicates() -> DuplicateQuery {
    duplicates(MENU, "title", "alias", MENU_ITEM_FILTER)
}

fn tree_columns() -> [&'static str; 8] {
    ["id", "parent_id", "lft", "rgt", "level", "title", "alias", "published"]
}

pub fn categories_query() -> SourceQuery {
    SourceQuery::table(CATEGORIES)
        .columns(&tree_columns())
        .filter(CATEGORY_FILTER)
        .order_by("lft")
}

pub fn categories_duplicates() -> DuplicateQuery {
    duplicates(CATEGORIES, "title", "alias", CATEGORY_FILTER)
}

pub fn tags_query() -> SourceQuery {
    SourceQuery::table(TAGS)
        .columns(&tree_columns())
        .filter(TAG_FILTER)
        .order_by("lft")
}

pub fn tags_duplicates() -> DuplicateQuery {
    duplicates(TAGS, "title", "alias", TAG_FILTER)
}

pub fn articles_query(limit: u64, offset: u64) -> SourceQuery {
    SourceQuery::table(CONTENT)
        .columns(&[
            "id",
            "title",
            "alias",
            "introtext",
            "`fulltext` AS full_text",
            "state",
            "catid",
            "created_by",
            "CAST(created AS CHAR) AS created",
            "CAST(modified AS CHAR) AS modified",
            "CAST(publish_up AS CHAR) AS publish_up",
        ])
        .order_by("id")
        .page(limit, offset)
}

pub fn articles_duplicates() -> DuplicateQuery {
    DuplicateQuery {
        table: CONTENT.to_string(),
        id_column: "id".to_string(),
        // Article names are free; only the alias has to be unique.
        name_column: "CONCAT('#', id)".to_string(),
        slug_column: "alias".to_string(),
        predicate: None,
    }
}

pub fn tag_map_query() -> SourceQuery {
    SourceQuery::table(TAG_MAP)
        .columns(&["content_item_id", "tag_id"])
        .filter(format!("type_alias = '{ARTICLE_TYPE_ALIAS}'"))
        .order_by("content_item_id, tag_id")
}

fn duplicates(table: &str, name: &str, slug: &str, predicate: &str) -> DuplicateQuery {
    DuplicateQuery {
        table: table.to_string(),
        id_column: "id".to_string(),
        name_column: name.to_string(),
        slug_column: slug.to_string(),
        predicate: Some(predicate.to_string()),
    }
}

/// Django `sha1$salt$hexdigest` of `raw`.
pub fn hash_password(raw: &str, salt: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(raw.as_bytes());
    format!("sha1${salt}${:x}", hasher.finalize())
}

/// Stored password for a migrated account.
pub fn django_password(default_password: Option<&str>) -> String {
    match default_password {
        Some(raw) => {
            let salt: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(5)
                .map(char::from)
                .collect();
            hash_password(raw, &salt)
        }
        None => UNUSABLE_PASSWORD.to_string(),
    }
}

/// First word as first name, the rest as last name; both capped at the
/// 30-character columns of `auth_user`.
pub fn split_name(full: &str) -> (String, String) {
    let mut parts = full.split_whitespace();
    let first = parts.next().unwrap_or("");
    let last = parts.collect::<Vec<_>>().join(" ");
    (truncate(first, 30), truncate(&last, 30))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn user_from_row(
    row: &SourceRow,
    super_users: &HashSet<i64>,
    default_password: Option<&str>,
) -> Result<User, StoreError> {
    let id = row.i64("id")?;
    let (first_name, last_name) = split_name(&row.str("name"));
    let is_super = super_users.contains(&id);
    Ok(User {
        id,
        username: row.str("username").trim().to_string(),
        first_name,
        last_name,
        email: row.str("email").trim().to_string(),
        password: django_password(default_password),
        is_staff: is_super,
        is_active: row.opt_i64("block")?.unwrap_or(0) == 0,
        is_superuser: is_super,
        last_login: row.opt_datetime("lastvisitDate"),
        date_joined: row.opt_datetime("registerDate"),
    })
}

/// Menu and the `menutype` key its items refer to.
pub fn menu_from_row(row: &SourceRow, main_menu: bool) -> Result<(String, Menu), StoreError> {
    let id = row.i64("id")?;
    let menutype = row.str("menutype");
    let title = row.str("title").trim().to_string();
    let name = if title.is_empty() { menutype.clone() } else { title };
    let mut slug = slugify(&name);
    if slug.is_empty() {
        slug = format!("menu-{id}");
    }
    Ok((
        menutype,
        Menu {
            id,
            name,
            slug,
            main_menu,
        },
    ))
}

/// Menu-item columns that have no place in the shared tree shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItemExtras {
    pub custom_url: String,
    pub site_home: bool,
}

/// Tree row for a menu item, `None` when its `menutype` has no migrated menu.
pub fn menu_item_from_row(
    row: &SourceRow,
    menu_ids: &HashMap<String, i64>,
) -> Result<Option<(SourceTreeRow, MenuItemExtras)>, StoreError> {
    let Some(&menu_id) = menu_ids.get(&row.str("menutype")) else {
        return Ok(None);
    };
    let tree = tree_row_from(row, menu_id)?;
    let extras = MenuItemExtras {
        custom_url: row.str("link"),
        site_home: row.opt_i64("home")?.unwrap_or(0) == 1,
    };
    Ok(Some((tree, extras)))
}

/// Tree row for a category or tag filed under `collection_id`.
pub fn tree_row_from(row: &SourceRow, collection_id: i64) -> Result<SourceTreeRow, StoreError> {
    Ok(SourceTreeRow {
        id: row.i64("id")?,
        parent_id: row.opt_i64("parent_id")?.unwrap_or(0),
        left: row.i64("lft")?,
        right: row.i64("rgt")?,
        level: row.opt_i64("level")?.unwrap_or(0),
        title: row.str("title"),
        alias: row.str("alias"),
        published: row.opt_i64("published")?.unwrap_or(0) == 1,
        collection_id,
    })
}

/// Drops rows whose parent was filtered out (and, transitively, their
/// descendants). A row survives only when its parent chain reaches the root
/// through surviving rows, whatever the input order; survivors keep it.
pub fn prune_orphans<T>(rows: Vec<(SourceTreeRow, T)>, root_id: i64) -> (Vec<(SourceTreeRow, T)>, usize) {
    let mut kept_ids: HashSet<i64> = rows
        .iter()
        .filter(|(row, _)| row.parent_id <= 0 || row.parent_id == root_id)
        .map(|(row, _)| row.id)
        .collect();
    loop {
        let reached: Vec<i64> = rows
            .iter()
            .filter(|(row, _)| !kept_ids.contains(&row.id) && kept_ids.contains(&row.parent_id))
            .map(|(row, _)| row.id)
            .collect();
        if reached.is_empty() {
            break;
        }
        kept_ids.extend(reached);
    }
    let total = rows.len();
    let kept: Vec<_> = rows
        .into_iter()
        .filter(|(row, _)| kept_ids.contains(&row.id))
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// An article plus the references resolved in later phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyArticle {
    pub article: Article,
    pub category_id: Option<i64>,
}

pub fn article_from_row(row: &SourceRow, users: &HashSet<i64>) -> Result<LegacyArticle, StoreError> {
    let id = row.i64("id")?;
    let title = row.str("title").trim().to_string();
    let mut slug = slugify(&row.str("alias"));
    if slug.is_empty() {
        slug = slugify(&title);
    }
    if slug.is_empty() {
        slug = format!("article-{id}");
    }
    let created = row.opt_datetime("created");
    let mut text = row.str("introtext");
    text.push_str(&row.str("full_text"));
    let user_id = row.opt_i64("created_by")?.filter(|u| users.contains(u));
    Ok(LegacyArticle {
        article: Article {
            id,
            name: if title.is_empty() { format!("Article {id}") } else { title },
            slug,
            text,
            published: row.opt_i64("state")?.unwrap_or(0) == 1,
            date: row.opt_datetime("publish_up").or(created),
            creation_date: created,
            modification_date: row.opt_datetime("modified").or(created),
            user_id,
        },
        category_id: row.opt_i64("catid")?.filter(|c| *c > SYSTEM_ROOT_ID),
    })
}

/// `(article id, source tag id)` of one tag-map row.
pub fn tag_link_from_row(row: &SourceRow) -> Result<(i64, i64), StoreError> {
    Ok((row.i64("content_item_id")?, row.i64("tag_id")?))
}

/// Asks the source which ids collide, and adds collisions that only appear
/// after slugification of the in-memory rows.
pub struct SourceDuplicates<'a, S: SourceStore + ?Sized> {
    source: &'a S,
    query: DuplicateQuery,
    local: HashSet<i64>,
}

impl<'a, S: SourceStore + ?Sized> SourceDuplicates<'a, S> {
    pub fn new(source: &'a S, query: DuplicateQuery) -> Self {
        Self {
            source,
            query,
            local: HashSet::new(),
        }
    }

    pub fn with_local(mut self, ids: HashSet<i64>) -> Self {
        self.local = ids;
        self
    }
}

#[async_trait]
impl<S: SourceStore + ?Sized> DuplicateLookup for SourceDuplicates<'_, S> {
    async fn colliding_ids(&self) -> Result<HashSet<i64>, StoreError> {
        let mut ids = self.source.duplicate_ids(&self.query).await?;
        ids.extend(self.local.iter().copied());
        Ok(ids)
    }
}
