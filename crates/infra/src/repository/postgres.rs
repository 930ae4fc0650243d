//! Postgres-backed data store.
//!
//! Every entity table is stored as JSONB documents in a single `records`
//! table keyed by `(table_name, id)`. Query specifications are translated to
//! SQL over `data -> 'field'`, with field names always bound as parameters.
//! Unique fields are enforced through `record_unique_keys`, so duplicates
//! are rejected by the database itself.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (foreign key violation) | `23503` | `ForeignKeyViolation` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Unavailable` |
//! | Io, PoolClosed | N/A | `Unavailable` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | Other | Any other | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row as _, Transaction};
use tracing::{error, instrument};

use taskhub_core::{FilterOp, Page, QueryFilter, QuerySort, Row};

use super::store::{DataStore, StoreError, StoreResult, StoreTransaction};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        table_name  TEXT        NOT NULL,
        id          TEXT        NOT NULL,
        seq         BIGSERIAL   NOT NULL,
        data        JSONB       NOT NULL,
        PRIMARY KEY (table_name, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS record_unique_keys (
        table_name  TEXT    NOT NULL,
        field       TEXT    NOT NULL,
        value       JSONB   NOT NULL,
        id          TEXT    NOT NULL,
        PRIMARY KEY (table_name, field, value),
        FOREIGN KEY (table_name, id) REFERENCES records (table_name, id) ON DELETE CASCADE
    )
    "#,
];

/// JSONB document store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the backing tables if they do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for PostgresStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> StoreResult<PostgresTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction { tx })
    }
}

pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn insert_unique_keys(
        &mut self,
        table: &str,
        id: &str,
        row: &Row,
        unique_fields: &[&str],
    ) -> StoreResult<()> {
        for field in unique_fields {
            let Some(value) = row.get(*field).filter(|v| !v.is_null()) else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO record_unique_keys (table_name, field, value, id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(table)
            .bind(*field)
            .bind(Json(value.clone()))
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_write_error("insert_unique_key", e, table, field))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn get(&mut self, table: &str, id: &str) -> StoreResult<Option<Row>> {
        let row = sqlx::query("SELECT data FROM records WHERE table_name = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_data(table, &row)).transpose()
    }

    #[instrument(skip(self, filters, sorts), fields(filters = filters.len()))]
    async fn select(
        &mut self,
        table: &str,
        filters: &[QueryFilter],
        sorts: &[QuerySort],
        page: Option<Page>,
    ) -> StoreResult<Vec<Row>> {
        let mut query = select_query(table, filters, sorts, page);
        let rows = query
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("select", e))?;

        rows.iter().map(|row| decode_data(table, row)).collect()
    }

    async fn count(&mut self, table: &str, filters: &[QueryFilter]) -> StoreResult<u64> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM records WHERE table_name = ");
        query.push_bind(table.to_string());
        push_filters(&mut query, filters);

        let row = query
            .build()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row.try_get("total").map_err(|e| StoreError::Corrupt {
            table: table.to_string(),
            message: format!("failed to read count: {e}"),
        })?;
        Ok(total.max(0) as u64)
    }

    async fn insert(&mut self, table: &str, id: &str, row: Row, unique_fields: &[&str]) -> StoreResult<()> {
        sqlx::query("INSERT INTO records (table_name, id, data) VALUES ($1, $2, $3)")
            .bind(table)
            .bind(id)
            .bind(Json(Value::Object(row.clone())))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_write_error("insert", e, table, "id"))?;

        self.insert_unique_keys(table, id, &row, unique_fields).await
    }

    async fn replace(&mut self, table: &str, id: &str, row: Row, unique_fields: &[&str]) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE records SET data = $3 WHERE table_name = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .bind(Json(Value::Object(row.clone())))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace", e))?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM record_unique_keys WHERE table_name = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_unique_keys", e))?;
        self.insert_unique_keys(table, id, &row, unique_fields).await?;
        Ok(true)
    }

    async fn remove(&mut self, table: &str, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE table_name = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn decode_data(table: &str, row: &sqlx::postgres::PgRow) -> StoreResult<Row> {
    let Json(data): Json<Value> = row.try_get("data").map_err(|e| StoreError::Corrupt {
        table: table.to_string(),
        message: e.to_string(),
    })?;
    match data {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Corrupt {
            table: table.to_string(),
            message: format!("expected a JSON object, found {other}"),
        }),
    }
}

/// Build the SELECT for a query specification. Ties fall back to insertion order.
fn select_query(
    table: &str,
    filters: &[QueryFilter],
    sorts: &[QuerySort],
    page: Option<Page>,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new("SELECT data FROM records WHERE table_name = ");
    query.push_bind(table.to_string());
    push_filters(&mut query, filters);

    query.push(" ORDER BY ");
    for sort in sorts {
        let direction = if sort.ascending { "ASC NULLS FIRST" } else { "DESC NULLS LAST" };
        // RFC 3339 strings sort as instants; everything else by jsonb order.
        query.push("CASE WHEN (data ->> ");
        query.push_bind(sort.field.clone());
        query.push(r") ~ '^\d{4}-\d{2}-\d{2}T' THEN (data ->> ");
        query.push_bind(sort.field.clone());
        query.push(format!(")::timestamptz END {direction}, data -> "));
        query.push_bind(sort.field.clone());
        query.push(format!(" {direction}, "));
    }
    query.push("seq ASC");

    if let Some(page) = page {
        query.push(" OFFSET ");
        query.push_bind(i64::try_from(page.skip).unwrap_or(i64::MAX));
        query.push(" LIMIT ");
        query.push_bind(i64::try_from(page.limit).unwrap_or(i64::MAX));
    }
    query
}

fn push_filters(query: &mut QueryBuilder<'static, Postgres>, filters: &[QueryFilter]) {
    for filter in filters {
        query.push(" AND ");
        push_filter(query, filter);
    }
}

fn push_filter(query: &mut QueryBuilder<'static, Postgres>, filter: &QueryFilter) {
    let field = filter.field.clone();
    let not_null = |query: &mut QueryBuilder<'static, Postgres>| {
        query.push(" AND jsonb_typeof(data -> ");
        query.push_bind(field.clone());
        query.push(") <> 'null'");
    };

    if filter.value.is_null() {
        match filter.op {
            FilterOp::Eq => {
                query.push("(data -> ");
                query.push_bind(field.clone());
                query.push(" IS NULL OR jsonb_typeof(data -> ");
                query.push_bind(field.clone());
                query.push(") = 'null')");
            }
            FilterOp::Ne => {
                query.push("(TRUE");
                not_null(query);
                query.push(")");
            }
            _ => {
                query.push("FALSE");
            }
        }
        return;
    }

    query.push("(");
    match filter.op {
        FilterOp::Eq | FilterOp::Ne => {
            let sql_op = if filter.op == FilterOp::Eq { " = " } else { " <> " };
            query.push("data -> ");
            query.push_bind(field.clone());
            query.push(sql_op);
            query.push_bind(Json(filter.value.clone()));
            not_null(query);
        }
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let sql_op = match filter.op {
                FilterOp::Gt => " > ",
                FilterOp::Gte => " >= ",
                FilterOp::Lt => " < ",
                _ => " <= ",
            };
            match filter.value.as_str().filter(|s| DateTime::parse_from_rfc3339(s).is_ok()) {
                Some(instant) => {
                    query.push("(data ->> ");
                    query.push_bind(field.clone());
                    query.push(")::timestamptz");
                    query.push(sql_op);
                    query.push_bind(instant.to_string());
                    query.push("::timestamptz");
                }
                None => {
                    query.push("data -> ");
                    query.push_bind(field.clone());
                    query.push(sql_op);
                    query.push_bind(Json(filter.value.clone()));
                }
            }
            not_null(query);
        }
        FilterOp::Like | FilterOp::Ilike => {
            let sql_op = if filter.op == FilterOp::Like { " LIKE " } else { " ILIKE " };
            query.push("data ->> ");
            query.push_bind(field.clone());
            query.push(sql_op);
            query.push_bind(filter.value.as_str().unwrap_or_default().to_string());
        }
        FilterOp::In | FilterOp::NotIn => {
            let sql_op = if filter.op == FilterOp::In { " IN (" } else { " NOT IN (" };
            query.push("data -> ");
            query.push_bind(field.clone());
            query.push(sql_op);
            let items = filter.value.as_array().cloned().unwrap_or_default();
            {
                let mut separated = query.separated(", ");
                for item in items {
                    separated.push_bind(Json(item));
                }
                separated.push_unseparated(")");
            }
            not_null(query);
        }
    }
    query.push(")");
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23503") => StoreError::ForeignKeyViolation {
                    field: db_err.constraint().unwrap_or("unknown").to_string(),
                    message: msg,
                },
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                _ => {
                    error!(operation, error = %msg, "unclassified database error");
                    StoreError::Backend(msg)
                }
            }
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("timed out acquiring a connection in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

/// Like [`map_sqlx_error`], attributing unique violations to `field`.
fn map_write_error(operation: &str, err: sqlx::Error, table: &str, field: &str) -> StoreError {
    if is_unique_violation(&err) {
        return StoreError::UniqueViolation {
            table: table.to_string(),
            field: field.to_string(),
        };
    }
    map_sqlx_error(operation, err)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
