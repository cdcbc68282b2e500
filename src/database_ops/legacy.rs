//! Read-only access to the legacy Joomla MySQL database.
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde_json::Value;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow},
    Column, MySqlPool, Row, TypeInfo,
};
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::store::{DuplicateQuery, SourceQuery, SourceRow, SourceStore};

#[derive(Clone)]
pub struct LegacyDb {
    pub pool: MySqlPool,
    prefix: String,
}

impl LegacyDb {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(dsn))]
    pub async fn connect(dsn: &str, prefix: &str, max_connections: u32) -> Result<Self> {
        let options = MySqlConnectOptions::from_str(dsn)?.statement_cache_capacity(0);
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connectivity {
                store: "source",
                message: e.to_string(),
            })?;
        info!(prefix, "connected to legacy db");
        Ok(Self {
            pool,
            prefix: prefix.to_string(),
        })
    }

    fn table(&self, table: &str) -> String {
        format!("{}{}", self.prefix, table)
    }
}

/// Decodes one column by its declared type. Text and anything unrecognised
/// fall back to a (lossy) string.
fn decode_value(row: &MySqlRow, idx: usize) -> Result<Value, sqlx::Error> {
    let type_name = row.column(idx).type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "NULL" => Value::Null,
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(idx)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        t if t.contains("INT") && t.contains("UNSIGNED") => row
            .try_get::<Option<u64>, _>(idx)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        t if t.contains("INT") => row
            .try_get::<Option<i64>, _>(idx)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(idx)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        "DATETIME" | "TIMESTAMP" => match row.try_get::<Option<NaiveDateTime>, _>(idx) {
            Ok(v) => v
                .map(|d| Value::from(d.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null),
            // Zero dates do not decode; the row keeps the column as null.
            Err(_) => Value::Null,
        },
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => v.map(Value::from).unwrap_or(Value::Null),
            Err(_) => row
                .try_get_unchecked::<Option<Vec<u8>>, _>(idx)?
                .map(|b| Value::from(String::from_utf8_lossy(&b).into_owned()))
                .unwrap_or(Value::Null),
        },
    };
    Ok(value)
}

fn decode_row(table: &str, row: &MySqlRow) -> Result<SourceRow, StoreError> {
    let mut values = IndexMap::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, idx).map_err(|e| StoreError::Decode {
            table: table.to_string(),
            column: column.name().to_string(),
            detail: e.to_string(),
        })?;
        values.insert(column.name().to_string(), value);
    }
    Ok(SourceRow::new(table, values))
}

#[async_trait]
impl SourceStore for LegacyDb {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<SourceRow>, StoreError> {
        let table = self.table(&query.table);
        let sql = query.to_sql(&self.prefix);
        debug!(table = %table, "source query");
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(&table, e))?;
        rows.iter().map(|r| decode_row(&query.table, r)).collect()
    }

    async fn count(&self, table: &str, predicate: Option<&str>) -> Result<u64, StoreError> {
        let name = self.table(table);
        let mut sql = format!("SELECT COUNT(*) FROM {name}");
        if let Some(p) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&p.replace("{prefix}", &self.prefix));
        }
        let n: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(&name, e))?;
        Ok(n.max(0) as u64)
    }

    async fn has_table(&self, table: &str) -> Result<bool, StoreError> {
        let name = self.table(table);
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .persistent(false)
        .bind(&name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("information_schema.tables", e))?;
        Ok(n > 0)
    }

    async fn duplicate_ids(&self, query: &DuplicateQuery) -> Result<HashSet<i64>, StoreError> {
        let sql = query.to_sql(&self.prefix);
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(&self.table(&query.table), e))?;
        let mut ids = HashSet::with_capacity(rows.len());
        for r in &rows {
            ids.insert(decode_row(&query.table, r)?.i64("id")?);
        }
        Ok(ids)
    }
}
