use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendError, EmbeddedHandle};
use crate::results::NativeResult;

const LIST_DATABASES_SQL: &str =
    "SELECT database_name FROM duckdb_databases() WHERE NOT internal ORDER BY database_name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub databases: Vec<DatabaseInfo>,
}

impl SchemaCatalog {
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|database| database.name == name)
    }

    #[must_use]
    pub fn table(&self, database: &str, table: &str) -> Option<&TableInfo> {
        self.database(database)?
            .tables
            .iter()
            .find(|candidate| candidate.name == table)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    catalog: Arc<SchemaCatalog>,
    generation: u64,
}

impl SchemaSnapshot {
    #[must_use]
    pub fn from_catalog(catalog: SchemaCatalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            generation: 0,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.catalog)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn publish(&mut self, catalog: SchemaCatalog) {
        self.catalog = Arc::new(catalog);
        self.generation += 1;
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to list databases: {0}")]
    Databases(#[source] BackendError),
}

/// Only the database listing is fatal; a table or database that fails to
/// introspect is kept with whatever could be read.
pub async fn introspect<H>(handle: &H) -> Result<SchemaCatalog, SchemaError>
where
    H: EmbeddedHandle + ?Sized,
{
    let listing = handle
        .query(LIST_DATABASES_SQL)
        .await
        .map_err(SchemaError::Databases)?;
    let names = text_column(&listing, 0);

    let databases = join_all(names.into_iter().map(|name| introspect_database(handle, name))).await;
    Ok(SchemaCatalog { databases })
}

async fn introspect_database<H>(handle: &H, name: String) -> DatabaseInfo
where
    H: EmbeddedHandle + ?Sized,
{
    let sql = format!(
        "SELECT table_schema, table_name, table_type FROM information_schema.tables \
         WHERE table_catalog = {} ORDER BY table_schema, table_name",
        quote_literal(&name)
    );
    let listing = match handle.query(&sql).await {
        Ok(listing) => listing,
        Err(error) => {
            tracing::warn!(database = %name, %error, "failed to list tables");
            return DatabaseInfo {
                name,
                tables: Vec::new(),
            };
        }
    };

    let candidates = listing
        .rows
        .iter()
        .filter_map(|row| {
            let schema = row.first()?.as_str()?.to_string();
            let table = row.get(1)?.as_str()?.to_string();
            let kind = match row.get(2).and_then(|value| value.as_str()) {
                Some(kind) if kind.eq_ignore_ascii_case("VIEW") => TableKind::View,
                _ => TableKind::Table,
            };
            Some((schema, table, kind))
        })
        .collect::<Vec<_>>();

    let tables = join_all(
        candidates
            .into_iter()
            .map(|(schema, table, kind)| introspect_table(handle, &name, schema, table, kind)),
    )
    .await;
    DatabaseInfo { name, tables }
}

async fn introspect_table<H>(
    handle: &H,
    database: &str,
    schema: String,
    name: String,
    kind: TableKind,
) -> TableInfo
where
    H: EmbeddedHandle + ?Sized,
{
    let columns_sql = format!(
        "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
         WHERE table_catalog = {} AND table_schema = {} AND table_name = {} \
         ORDER BY ordinal_position",
        quote_literal(database),
        quote_literal(&schema),
        quote_literal(&name)
    );
    let count_sql = format!(
        "SELECT COUNT(*) FROM {}.{}.{}",
        quote_identifier(database),
        quote_identifier(&schema),
        quote_identifier(&name)
    );

    let columns_query = handle.query(&columns_sql);
    let count_query = async {
        match kind {
            TableKind::Table => Some(handle.query(&count_sql).await),
            TableKind::View => None,
        }
    };
    let (columns, count) = futures_util::join!(columns_query, count_query);

    let columns = match columns {
        Ok(result) => result
            .rows
            .iter()
            .filter_map(|row| {
                Some(ColumnInfo {
                    name: row.first()?.as_str()?.to_string(),
                    data_type: row.get(1)?.as_str()?.to_string(),
                    nullable: row.get(2).and_then(|value| value.as_bool()).unwrap_or(true),
                })
            })
            .collect(),
        Err(error) => {
            tracing::warn!(database, table = %name, %error, "failed to read columns");
            Vec::new()
        }
    };
    let row_count = match count {
        Some(Ok(result)) => result
            .first_column()
            .next()
            .and_then(|value| value.as_i64())
            .and_then(|count| u64::try_from(count).ok()),
        Some(Err(error)) => {
            tracing::warn!(database, table = %name, %error, "failed to count rows");
            None
        }
        None => None,
    };

    TableInfo {
        schema,
        name,
        kind,
        columns,
        row_count,
    }
}

fn text_column(result: &NativeResult, index: usize) -> Vec<String> {
    result
        .rows
        .iter()
        .filter_map(|row| row.get(index)?.as_str().map(str::to_string))
        .collect()
}

#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::{introspect, quote_identifier, quote_literal, SchemaSnapshot, TableKind};
    use crate::testing::FakeEngine;

    #[tokio::test]
    async fn walks_databases_tables_and_counts() {
        let engine = FakeEngine::new();
        engine.seed_table("memory", "users", &[("id", "INTEGER"), ("email", "VARCHAR")], 3);
        engine.seed_table("memory", "events", &[("at", "TIMESTAMP")], 10);
        engine.seed_database("archive");

        let catalog = introspect(&engine).await.expect("introspection should succeed");

        assert_eq!(catalog.databases.len(), 2);
        let users = catalog.table("memory", "users").expect("users table");
        assert_eq!(users.kind, TableKind::Table);
        assert_eq!(users.row_count, Some(3));
        assert_eq!(users.columns.len(), 2);
        assert_eq!(users.columns[1].name, "email");
        assert!(catalog.database("archive").is_some_and(|db| db.tables.is_empty()));
    }

    #[tokio::test]
    async fn one_failing_table_does_not_abort_the_others() {
        let engine = FakeEngine::new();
        engine.seed_table("memory", "good", &[("id", "INTEGER")], 1);
        engine.seed_table("memory", "bad", &[("id", "INTEGER")], 1);
        engine.fail_on("\"bad\"");

        let catalog = introspect(&engine).await.expect("introspection should succeed");

        assert_eq!(catalog.table("memory", "good").and_then(|t| t.row_count), Some(1));
        let bad = catalog.table("memory", "bad").expect("bad table still listed");
        assert_eq!(bad.row_count, None);
    }

    #[tokio::test]
    async fn failing_database_listing_is_an_error() {
        let engine = FakeEngine::new();
        engine.fail_on("duckdb_databases");

        assert!(introspect(&engine).await.is_err());
    }

    #[test]
    fn publish_swaps_catalog_and_bumps_generation() {
        let mut snapshot = SchemaSnapshot::default();
        let before = snapshot.catalog();
        snapshot.publish(super::SchemaCatalog::default());

        assert_eq!(snapshot.generation(), 1);
        assert!(before.is_empty());
    }

    #[test]
    fn quoting_escapes_delimiters() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
