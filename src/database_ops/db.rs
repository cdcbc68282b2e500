//! Postgres target: the Cyclope (Django) schema.
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    query_builder::Separated,
    PgConnection, PgPool, Postgres, QueryBuilder, Row,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::migrate::tree::{rebuild_nested_set, TreeEntry};
use crate::model::{Batch, Collection, PendingRelation, RelationKind, TreeTable};
use crate::store::TargetStore;

/// Bind parameters Postgres accepts in one statement.
const PG_BIND_LIMIT: usize = 65_535;
/// Rows per UNNEST update statement.
const UPDATE_CHUNK: usize = 1_000;

/// Tables the migration writes, in dependency order.
pub const TARGET_TABLES: [&str; 10] = [
    "auth_user",
    "cyclope_menu",
    "cyclope_menuitem",
    "collections_collection",
    "collections_category",
    "articles_article",
    "medialibrary_picture",
    "collections_categorization",
    "articles_article_pictures",
    "django_content_type",
];

/// Tables whose ids are written explicitly and need their sequence moved.
const SEQUENCED_TABLES: [&str; 9] = [
    "auth_user",
    "cyclope_menu",
    "cyclope_menuitem",
    "collections_collection",
    "collections_category",
    "articles_article",
    "medialibrary_picture",
    "collections_categorization",
    "articles_article_pictures",
];

const SLUGGED_TABLES: [&str; 6] = [
    "cyclope_menu",
    "cyclope_menuitem",
    "collections_collection",
    "collections_category",
    "articles_article",
    "medialibrary_picture",
];

fn rows_per_statement(columns: usize) -> usize {
    (PG_BIND_LIMIT / columns.max(1)).max(1)
}

/// Bound parameters per row of each relation table.
fn link_columns(kind: RelationKind) -> usize {
    match kind {
        RelationKind::Categorization => 3,
        RelationKind::ArticlePicture => 2,
    }
}

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
    article_type: OnceCell<i64>,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let use_prepared = crate::util::env::env_flag("USE_PREPARED", false);
        let mut connect_options = PgConnectOptions::from_str(database_url)?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to target db");
        Ok(Self {
            pool,
            article_type: OnceCell::new(),
        })
    }

    /// Target tables that are not visible to the connected role.
    pub async fn missing_tables(&self) -> Result<Vec<&'static str>> {
        let mut missing = Vec::new();
        for table in TARGET_TABLES {
            let visible: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .persistent(false)
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
            if !visible {
                missing.push(table);
            }
        }
        Ok(missing)
    }

    /// Django content type of `articles.article`, looked up once.
    async fn article_content_type(&self) -> Result<i64, StoreError> {
        self.article_type
            .get_or_try_init(|| async {
                let id: i32 = sqlx::query_scalar(
                    "SELECT id FROM django_content_type WHERE app_label = 'articles' AND model = 'article'",
                )
                .persistent(false)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx("django_content_type", e))?;
                Ok::<i64, StoreError>(i64::from(id))
            })
            .await
            .copied()
    }
}

/// Multi-row INSERTs of `rows`, each statement under the bind ceiling.
async fn insert_chunked<'r, T, F>(
    conn: &mut PgConnection,
    table: &'static str,
    header: &str,
    columns: usize,
    rows: &'r [T],
    mut bind: F,
) -> Result<(), StoreError>
where
    T: Sync,
    F: FnMut(Separated<'_, 'r, Postgres, &'static str>, &'r T) + Send,
{
    for chunk in rows.chunks(rows_per_statement(columns)) {
        let mut qb: QueryBuilder<'r, Postgres> = QueryBuilder::new(header);
        qb.push_values(chunk, &mut bind);
        qb.build()
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        debug!(table, rows = chunk.len(), "bulk insert statement");
    }
    Ok(())
}

#[async_trait]
impl TargetStore for Db {
    async fn create_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        let table = "collections_collection";
        let article_type = self.article_content_type().await?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        sqlx::query(
            "INSERT INTO collections_collection \
             (id, name, slug, description, image, visible, navigation_root, default_list_view, view_options) \
             VALUES ($1, $2, $3, '', '', $4, false, 'default', '')",
        )
        .persistent(false)
        .bind(collection.id)
        .bind(&collection.name)
        .bind(&collection.slug)
        .bind(collection.active)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx(table, e))?;
        sqlx::query(
            "INSERT INTO collections_collection_content_types (collection_id, contenttype_id) VALUES ($1, $2)",
        )
        .persistent(false)
        .bind(collection.id)
        .bind(article_type)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx("collections_collection_content_types", e))?;
        tx.commit().await.map_err(|e| StoreError::from_sqlx(table, e))?;
        Ok(())
    }

    async fn bulk_create(&self, batch: Batch<'_>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let table = batch.table();
        let now: NaiveDateTime = Utc::now().naive_utc();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        match batch {
            Batch::Users(rows) => {
                insert_chunked(
                    &mut tx,
                    table,
                    "INSERT INTO auth_user (id, password, last_login, is_superuser, username, \
                     first_name, last_name, email, is_staff, is_active, date_joined) ",
                    11,
                    rows,
                    |mut b, u| {
                        b.push_bind(u.id)
                            .push_bind(&u.password)
                            .push_bind(u.last_login)
                            .push_bind(u.is_superuser)
                            .push_bind(&u.username)
                            .push_bind(&u.first_name)
                            .push_bind(&u.last_name)
                            .push_bind(&u.email)
                            .push_bind(u.is_staff)
                            .push_bind(u.is_active)
                            .push_bind(u.date_joined.unwrap_or(now));
                    },
                )
                .await?
            }
            Batch::Menus(rows) => {
                insert_chunked(
                    &mut tx,
                    table,
                    "INSERT INTO cyclope_menu (id, name, slug, main_menu) ",
                    4,
                    rows,
                    |mut b, m| {
                        b.push_bind(m.id)
                            .push_bind(&m.name)
                            .push_bind(&m.slug)
                            .push_bind(m.main_menu);
                    },
                )
                .await?
            }
            Batch::MenuItems(rows) => {
                insert_chunked(
                    &mut tx,
                    table,
                    "INSERT INTO cyclope_menuitem (id, menu_id, parent_id, name, slug, site_home, \
                     custom_url, url, active, persistent_layout, content_view, view_options, \
                     lft, rght, tree_id, level) ",
                    16,
                    rows,
                    |mut b, item| {
                        let n = &item.node;
                        b.push_bind(n.id)
                            .push_bind(n.collection_id)
                            .push_bind(n.parent_id)
                            .push_bind(&n.name)
                            .push_bind(&n.slug)
                            .push_bind(item.site_home)
                            .push_bind(&item.custom_url)
                            .push_bind("")
                            .push_bind(n.active)
                            .push_bind(false)
                            .push_bind("")
                            .push_bind("")
                            .push_bind(n.left)
                            .push_bind(n.right)
                            .push_bind(n.tree_id)
                            .push_bind(n.level);
                    },
                )
                .await?
            }
            Batch::Categories(rows) => {
                insert_chunked(
                    &mut tx,
                    table,
                    "INSERT INTO collections_category (id, collection_id, parent_id, name, slug, \
                     description, active, lft, rght, tree_id, level) ",
                    11,
                    rows,
                    |mut b, n| {
                        b.push_bind(n.id)
                            .push_bind(n.collection_id)
                            .push_bind(n.parent_id)
                            .push_bind(&n.name)
                            .push_bind(&n.slug)
                            .push_bind("")
                            .push_bind(n.active)
                            .push_bind(n.left)
                            .push_bind(n.right)
                            .push_bind(n.tree_id)
                            .push_bind(n.level);
                    },
                )
                .await?
            }
            Batch::Articles(rows) => {
                insert_chunked(
                    &mut tx,
                    table,
                    "INSERT INTO articles_article (id, name, slug, pretitle, summary, text, date, \
                     creation_date, modification_date, published, user_id, show_author, allow_comments) ",
                    13,
                    rows,
                    |mut b, a| {
                        b.push_bind(a.id)
                            .push_bind(&a.name)
                            .push_bind(&a.slug)
                            .push_bind("")
                            .push_bind("")
                            .push_bind(&a.text)
                            .push_bind(a.date.unwrap_or(now))
                            .push_bind(a.creation_date.unwrap_or(now))
                            .push_bind(a.modification_date.unwrap_or(now))
                            .push_bind(a.published)
                            .push_bind(a.user_id)
                            .push_bind("SITE")
                            .push_bind("SITE");
                    },
                )
                .await?
            }
            Batch::Pictures(rows) => {
                insert_chunked(
                    &mut tx,
                    table,
                    "INSERT INTO medialibrary_picture (id, name, slug, description, image, \
                     creation_date, modification_date, published, show_author, allow_comments) ",
                    10,
                    rows,
                    |mut b, p| {
                        b.push_bind(p.id)
                            .push_bind(&p.name)
                            .push_bind(&p.slug)
                            .push_bind(&p.description)
                            .push_bind(&p.image)
                            .push_bind(now)
                            .push_bind(now)
                            .push_bind(true)
                            .push_bind("SITE")
                            .push_bind("SITE");
                    },
                )
                .await?
            }
        }
        tx.commit().await.map_err(|e| StoreError::from_sqlx(table, e))?;
        info!(table, rows = batch.len(), "bulk create committed");
        Ok(())
    }

    async fn bulk_link(
        &self,
        kind: RelationKind,
        relations: &[PendingRelation],
    ) -> Result<(), StoreError> {
        if relations.is_empty() {
            return Ok(());
        }
        let (table, mut qb) = match kind {
            RelationKind::Categorization => {
                let content_type = self.article_content_type().await?;
                let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                    "INSERT INTO collections_categorization (category_id, content_type_id, object_id) ",
                );
                qb.push_values(relations, |mut b, r| {
                    b.push_bind(r.subject_id)
                        .push_bind(content_type)
                        .push_bind(r.object_id);
                });
                ("collections_categorization", qb)
            }
            RelationKind::ArticlePicture => {
                let mut qb: QueryBuilder<'_, Postgres> =
                    QueryBuilder::new("INSERT INTO articles_article_pictures (article_id, picture_id) ");
                qb.push_values(relations, |mut b, r| {
                    b.push_bind(r.subject_id).push_bind(r.object_id);
                });
                ("articles_article_pictures", qb)
            }
        };
        qb.build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        Ok(())
    }

    fn max_link_rows(&self, kind: RelationKind) -> Option<usize> {
        Some(rows_per_statement(link_columns(kind)))
    }

    async fn rebuild_tree(&self, tree: TreeTable) -> Result<(), StoreError> {
        let table = tree.table();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        let rows = sqlx::query(&format!(
            "SELECT id::bigint AS id, parent_id::bigint AS parent_id, lft::bigint AS lft FROM {table}"
        ))
            .persistent(false)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(TreeEntry {
                id: row.try_get::<i64, _>("id").map_err(|e| StoreError::from_sqlx(table, e))?,
                parent_id: row
                    .try_get::<Option<i64>, _>("parent_id")
                    .map_err(|e| StoreError::from_sqlx(table, e))?,
                order_key: row
                    .try_get::<i64, _>("lft")
                    .map_err(|e| StoreError::from_sqlx(table, e))?,
            });
        }
        let bounds = rebuild_nested_set(&entries);
        for chunk in bounds.chunks(UPDATE_CHUNK) {
            let ids: Vec<i64> = chunk.iter().map(|b| b.id).collect();
            let lft: Vec<i64> = chunk.iter().map(|b| b.left).collect();
            let rght: Vec<i64> = chunk.iter().map(|b| b.right).collect();
            let level: Vec<i64> = chunk.iter().map(|b| b.level).collect();
            let tree_id: Vec<i64> = chunk.iter().map(|b| b.tree_id).collect();
            sqlx::query(&format!(
                "UPDATE {table} AS t SET lft = v.lft, rght = v.rght, level = v.level, tree_id = v.tree_id \
                 FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[], $4::bigint[], $5::bigint[]) \
                 AS v(id, lft, rght, level, tree_id) WHERE t.id = v.id"
            ))
            .persistent(false)
            .bind(&ids)
            .bind(&lft)
            .bind(&rght)
            .bind(&level)
            .bind(&tree_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        }
        tx.commit().await.map_err(|e| StoreError::from_sqlx(table, e))?;
        info!(table, nodes = entries.len(), "tree rebuilt");
        Ok(())
    }

    async fn existing_slugs(&self, table: &str) -> Result<HashSet<String>, StoreError> {
        let Some(table) = SLUGGED_TABLES.iter().find(|t| **t == table) else {
            return Ok(HashSet::new());
        };
        let slugs: Vec<String> = sqlx::query_scalar(&format!("SELECT slug FROM {table}"))
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        Ok(slugs.into_iter().collect())
    }

    async fn update_article_texts(&self, updates: &[(i64, String)]) -> Result<(), StoreError> {
        let table = "articles_article";
        if updates.is_empty() {
            return Ok(());
        }
        // Last write wins when an id repeats.
        let latest: HashMap<i64, &str> = updates.iter().map(|(id, t)| (*id, t.as_str())).collect();
        let pairs: Vec<(i64, &str)> = latest.into_iter().collect();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        for chunk in pairs.chunks(UPDATE_CHUNK) {
            let ids: Vec<i64> = chunk.iter().map(|(id, _)| *id).collect();
            let texts: Vec<&str> = chunk.iter().map(|(_, t)| *t).collect();
            sqlx::query(
                "UPDATE articles_article AS a SET text = v.text \
                 FROM UNNEST($1::bigint[], $2::text[]) AS v(id, text) WHERE a.id = v.id",
            )
            .persistent(false)
            .bind(&ids)
            .bind(&texts)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        }
        tx.commit().await.map_err(|e| StoreError::from_sqlx(table, e))?;
        Ok(())
    }

    async fn reset_sequences(&self) -> Result<(), StoreError> {
        for table in SEQUENCED_TABLES {
            sqlx::query(&format!(
                "SELECT setval(pg_get_serial_sequence('{table}', 'id'), \
                 COALESCE((SELECT MAX(id) FROM {table}), 1), \
                 (SELECT MAX(id) FROM {table}) IS NOT NULL)"
            ))
            .persistent(false)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(table, e))?;
        }
        debug!(tables = SEQUENCED_TABLES.len(), "id sequences reset");
        Ok(())
    }
}
