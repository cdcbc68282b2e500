//! Contracts of the two stores the migration talks to.
//!
//! The source is a read-only legacy database addressed through a table prefix;
//! the target is the CMS database, written in bulk.
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{Batch, Collection, PendingRelation, RelationKind, TreeTable};

/// A projection over one prefixed source table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceQuery {
    pub table: String,
    /// Column expressions, e.g. `id` or `CAST(created AS CHAR) AS created`.
    pub columns: Vec<String>,
    pub predicate: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SourceQuery {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    pub fn page(mut self, limit: u64, offset: u64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    /// Renders the query against `prefix`. Predicates may mention other tables
    /// as `{prefix}name`.
    pub fn to_sql(&self, prefix: &str) -> String {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {columns} FROM {prefix}{}", self.table);
        if let Some(p) = &self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&p.replace("{prefix}", prefix));
        }
        if let Some(o) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(o);
        }
        match (self.limit, self.offset) {
            (Some(l), Some(o)) => sql.push_str(&format!(" LIMIT {l} OFFSET {o}")),
            (Some(l), None) => sql.push_str(&format!(" LIMIT {l}")),
            _ => {}
        }
        sql
    }
}

/// Ids in a source table that collide on a case-insensitive name or a slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateQuery {
    pub table: String,
    pub id_column: String,
    pub name_column: String,
    pub slug_column: String,
    pub predicate: Option<String>,
}

impl DuplicateQuery {
    pub fn to_sql(&self, prefix: &str) -> String {
        let table = format!("{prefix}{}", self.table);
        let scope = self
            .predicate
            .as_ref()
            .map(|p| p.replace("{prefix}", prefix))
            .unwrap_or_else(|| "1 = 1".to_string());
        let (id, name, slug) = (&self.id_column, &self.name_column, &self.slug_column);
        format!(
            "SELECT {id} AS id FROM {table} WHERE ({scope}) AND ( \
               LOWER({name}) IN (SELECT LOWER({name}) FROM {table} WHERE ({scope}) \
                                 GROUP BY LOWER({name}) HAVING COUNT(*) > 1) \
               OR {slug} IN (SELECT {slug} FROM {table} WHERE ({scope}) AND {slug} <> '' \
                             GROUP BY {slug} HAVING COUNT(*) > 1))"
        )
    }
}

/// One decoded source row, column name to JSON value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    table: String,
    values: IndexMap<String, Value>,
}

impl SourceRow {
    pub fn new(table: &str, values: IndexMap<String, Value>) -> Self {
        Self {
            table: table.to_string(),
            values,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    fn decode_err(&self, column: &str, detail: impl Into<String>) -> StoreError {
        StoreError::Decode {
            table: self.table.clone(),
            column: column.to_string(),
            detail: detail.into(),
        }
    }

    pub fn opt_i64(&self, column: &str) -> Result<Option<i64>, StoreError> {
        match self.get(column) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.decode_err(column, format!("{n} is not an integer"))),
            Some(Value::Bool(b)) => Ok(Some(i64::from(*b))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.decode_err(column, format!("{s:?} is not an integer"))),
            Some(other) => Err(self.decode_err(column, format!("unexpected value {other}"))),
        }
    }

    pub fn i64(&self, column: &str) -> Result<i64, StoreError> {
        self.opt_i64(column)?
            .ok_or_else(|| self.decode_err(column, "missing"))
    }

    pub fn opt_str(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Text column; null reads as empty.
    pub fn str(&self, column: &str) -> String {
        self.opt_str(column).unwrap_or_default()
    }

    /// MySQL datetime text; zero dates and unparsable values read as `None`.
    pub fn opt_datetime(&self, column: &str) -> Option<NaiveDateTime> {
        let raw = self.opt_str(column)?;
        let t = raw.trim();
        if t.is_empty() || t.starts_with("0000-00-00") {
            return None;
        }
        NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S"))
            .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
    }
}

/// Read-only legacy database.
#[async_trait]
pub trait SourceStore: Send + Sync {
    fn prefix(&self) -> &str;

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<SourceRow>, StoreError>;

    async fn count(&self, table: &str, predicate: Option<&str>) -> Result<u64, StoreError>;

    async fn has_table(&self, table: &str) -> Result<bool, StoreError>;

    async fn duplicate_ids(&self, query: &DuplicateQuery) -> Result<HashSet<i64>, StoreError>;
}

/// CMS database. Every `bulk_create` is atomic: the whole batch lands or none
/// of it does. Bulk paths skip per-row hooks such as slug generation.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn create_collection(&self, collection: &Collection) -> Result<(), StoreError>;

    async fn bulk_create(&self, batch: Batch<'_>) -> Result<(), StoreError>;

    /// One statement for one chunk of relations of a single kind.
    async fn bulk_link(
        &self,
        kind: RelationKind,
        relations: &[PendingRelation],
    ) -> Result<(), StoreError>;

    /// Most relations of `kind` one `bulk_link` statement may carry, `None`
    /// when unbounded.
    fn max_link_rows(&self, _kind: RelationKind) -> Option<usize> {
        None
    }

    /// Recomputes nested-set bounds and tree ids from parent pointers.
    async fn rebuild_tree(&self, table: TreeTable) -> Result<(), StoreError>;

    async fn existing_slugs(&self, table: &str) -> Result<HashSet<String>, StoreError>;

    async fn update_article_texts(&self, updates: &[(i64, String)]) -> Result<(), StoreError>;

    /// Aligns id sequences with explicitly inserted ids. No-op where ids are not
    /// sequence-backed.
    async fn reset_sequences(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(values: Value) -> SourceRow {
        let map: IndexMap<String, Value> = serde_json::from_value(values).unwrap();
        SourceRow::new("content", map)
    }

    #[test]
    fn renders_prefixed_paginated_query() {
        let q = SourceQuery::table("content")
            .columns(&["id", "title"])
            .filter("state >= 0 AND id IN (SELECT content_item_id FROM {prefix}contentitem_tag_map)")
            .order_by("id")
            .page(100, 200);
        assert_eq!(
            q.to_sql("jos_"),
            "SELECT id, title FROM jos_content WHERE state >= 0 AND id IN \
             (SELECT content_item_id FROM jos_contentitem_tag_map) ORDER BY id LIMIT 100 OFFSET 200"
        );
        assert_eq!(SourceQuery::table("users").to_sql(""), "SELECT * FROM users");
    }

    #[test]
    fn duplicate_query_groups_by_name_and_slug() {
        let q = DuplicateQuery {
            table: "tags".into(),
            id_column: "id".into(),
            name_column: "title".into(),
            slug_column: "alias".into(),
            predicate: Some("id > 1".into()),
        };
        let sql = q.to_sql("x_");
        assert!(sql.starts_with("SELECT id AS id FROM x_tags WHERE (id > 1)"));
        assert!(sql.contains("GROUP BY LOWER(title) HAVING COUNT(*) > 1"));
        assert!(sql.contains("GROUP BY alias HAVING COUNT(*) > 1"));
    }

    #[test]
    fn typed_getters_decode_loose_values() {
        let r = row(json!({
            "id": 7,
            "catid": "12",
            "title": "Hello",
            "created": "2011-03-04 05:06:07",
            "modified": "0000-00-00 00:00:00",
            "fulltext": null
        }));
        assert_eq!(r.i64("id").unwrap(), 7);
        assert_eq!(r.i64("catid").unwrap(), 12);
        assert_eq!(r.str("title"), "Hello");
        assert_eq!(r.str("fulltext"), "");
        assert!(r.opt_datetime("created").is_some());
        assert_eq!(r.opt_datetime("modified"), None);
        assert!(matches!(r.i64("missing"), Err(StoreError::Decode { .. })));
        assert!(matches!(r.i64("title"), Err(StoreError::Decode { .. })));
    }
}
