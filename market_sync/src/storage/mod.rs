//! Generic storage gateway for market data tables.
//!
//! Every provider dataset lands in its own table whose columns are only known once
//! the first batch arrives. [`StorageGateway`] is the single read/write path for all
//! of them:
//! - introspection: [`StorageGateway::table_exists`], [`StorageGateway::columns`],
//!   [`StorageGateway::primary_key_exists`]
//! - reads: [`StorageGateway::read`] with a [`ReadSpec`], [`StorageGateway::latest_date`]
//! - writes: [`StorageGateway::write`] with a [`WriteMode`], each call in one
//!   `BEGIN IMMEDIATE` transaction
//! - keys: [`StorageGateway::add_primary_key`] creates the unique index
//!   `<table>_pkey`, which is how a primary key is attached after the fact in SQLite
//!
//! Methods are blocking; async callers go through [`StorageGateway::blocking`],
//! which checks a connection out of the pool for the duration of one operation.

mod error;
pub mod value;

use std::collections::HashSet;

use diesel::{
    prelude::*,
    sql_query,
    sql_types::{BigInt, Integer, Nullable, Text},
    sqlite::Sqlite,
};
use indexmap::IndexMap;
use market_data_ingestor::models::row_set::RowSet;
use serde_json::Value;
use tracing::{debug, warn};

pub use error::StorageError;
pub use value::{ColumnType, SqlValue};

use crate::db::connection::{DbConnection, DbPool, create_pool};
use value::{bind_all, quote_ident};

/// Upper bound on bind parameters per statement.
const MAX_BIND_PARAMS: usize = 10_000;

/// Arguments per `json_array` call when reading; SQLite caps function arity.
const JSON_ARGS_PER_CALL: usize = 100;

/// How [`StorageGateway::write`] treats existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop the table and recreate it from the given rows.
    Replace,
    /// Insert rows; create the table from the first batch, add new columns.
    Append,
    /// Like [`WriteMode::Append`], but rows whose key already exists are ignored.
    AppendDistinct,
}

/// Column typing and key for a write.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    /// Columns whose type is fixed regardless of the data.
    pub pinned: IndexMap<String, ColumnType>,
    /// Natural key; required by [`WriteMode::AppendDistinct`].
    pub key: Vec<String>,
}

impl TableSchema {
    pub fn new(pinned: IndexMap<String, ColumnType>, key: Vec<String>) -> Self {
        Self { pinned, key }
    }

    pub fn with_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn pin(mut self, column: impl Into<String>, ty: ColumnType) -> Self {
        self.pinned.insert(column.into(), ty);
        self
    }
}

/// Narrow read request. Empty `columns` means all columns.
#[derive(Debug, Clone, Default)]
pub struct ReadSpec {
    pub columns: Vec<String>,
    /// SQL predicate with `?` placeholders, bound from `binds` in order.
    pub filter: Option<String>,
    pub binds: Vec<SqlValue>,
    pub order_by: Vec<String>,
    pub distinct: bool,
}

impl ReadSpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, predicate: impl Into<String>, binds: Vec<SqlValue>) -> Self {
        self.filter = Some(predicate.into());
        self.binds = binds;
        self
    }

    /// Shorthand for `"column" = ?`.
    pub fn where_eq(self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filter(format!("{} = ?", quote_ident(column)), vec![value.into()])
    }

    pub fn order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}

/// Introspected column of a stored table.
#[derive(Debug, Clone, PartialEq, Eq, QueryableByName)]
pub struct ColumnInfo {
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub ty: String,
    /// 1-based position within the declared primary key, 0 if not part of it.
    #[diesel(sql_type = Integer)]
    pub pk: i32,
}

#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

#[derive(QueryableByName)]
struct MaybeInt {
    #[diesel(sql_type = Nullable<BigInt>)]
    value: Option<i64>,
}

#[derive(QueryableByName)]
struct Payload {
    #[diesel(sql_type = Text)]
    payload: String,
}

/// Shared handle to the market database. Cheap to clone.
#[derive(Clone)]
pub struct StorageGateway {
    pool: DbPool,
}

impl StorageGateway {
    /// Opens a pool of at most `max_connections` connections.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        Ok(Self::from_pool(create_pool(database_url, max_connections)?))
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Checks out a connection; it returns to the pool when dropped.
    pub fn conn(&self) -> Result<DbConnection, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Runs `op` on the blocking thread pool.
    pub async fn blocking<F, T>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&StorageGateway) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let gateway = self.clone();
        tokio::task::spawn_blocking(move || op(&gateway)).await?
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        table_exists(&mut *self.conn()?, table)
    }

    /// Columns of `table` in declaration order; empty when the table is missing.
    pub fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StorageError> {
        columns_of(&mut *self.conn()?, table)
    }

    /// `true` when the table has a declared primary key or its `<table>_pkey` index.
    pub fn primary_key_exists(&self, table: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let found: Count = sql_query(
            "SELECT COUNT(*) AS n FROM pragma_index_list(?) \
             WHERE \"unique\" = 1 AND (origin = 'pk' OR name = ?)",
        )
        .bind::<Text, _>(table)
        .bind::<Text, _>(pkey_name(table))
        .get_result(&mut conn)?;
        Ok(found.n > 0)
    }

    /// Number of rows; 0 for a missing table.
    pub fn row_count(&self, table: &str) -> Result<i64, StorageError> {
        let mut conn = self.conn()?;
        if !table_exists(&mut conn, table)? {
            return Ok(0);
        }
        let count: Count = sql_query(format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table)))
            .get_result(&mut conn)?;
        Ok(count.n)
    }

    /// Reads rows as a [`RowSet`]; integers, reals and text come back as JSON values.
    pub fn read(&self, table: &str, spec: &ReadSpec) -> Result<RowSet, StorageError> {
        let mut conn = self.conn()?;
        let columns = if spec.columns.is_empty() {
            let all: Vec<String> = columns_of(&mut conn, table)?
                .into_iter()
                .map(|c| c.name)
                .collect();
            if all.is_empty() {
                return Err(StorageError::schema(table, "table does not exist"));
            }
            all
        } else {
            spec.columns.clone()
        };

        let mut sql = format!(
            "SELECT {}{} AS payload FROM {}",
            if spec.distinct { "DISTINCT " } else { "" },
            payload_expr(&columns),
            quote_ident(table)
        );
        if let Some(filter) = &spec.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        if !spec.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&join_idents(&spec.order_by));
        }

        let query = bind_all(sql_query(sql).into_boxed::<Sqlite>(), spec.binds.clone());
        let payloads: Vec<Payload> = query.load(&mut conn)?;

        let mut rows = RowSet::new(columns);
        rows.items.reserve(payloads.len());
        for p in payloads {
            let cells: Vec<Value> =
                serde_json::from_str(&p.payload).map_err(|e| StorageError::Decode {
                    table: table.to_string(),
                    message: e.to_string(),
                })?;
            rows.push(cells);
        }
        Ok(rows)
    }

    /// Largest `date_col` stored for `code`; `None` when the code has no rows.
    pub fn latest_date(
        &self,
        table: &str,
        code_col: &str,
        date_col: &str,
        code: &str,
    ) -> Result<Option<i64>, StorageError> {
        let mut conn = self.conn()?;
        let sql = format!(
            "SELECT CAST(MAX({date}) AS INTEGER) AS value FROM {table} WHERE {code} = ?",
            date = quote_ident(date_col),
            table = quote_ident(table),
            code = quote_ident(code_col),
        );
        let found: MaybeInt = sql_query(sql).bind::<Text, _>(code).get_result(&mut conn)?;
        Ok(found.value)
    }

    /// Runs `sql`, which must yield one row with a nullable integer column `value`.
    pub fn query_i64(&self, sql: &str, binds: Vec<SqlValue>) -> Result<Option<i64>, StorageError> {
        let mut conn = self.conn()?;
        let query = bind_all(sql_query(sql).into_boxed::<Sqlite>(), binds);
        let found: MaybeInt = query.get_result(&mut conn)?;
        Ok(found.value)
    }

    /// Writes `rows` into `table` according to `mode`, atomically.
    ///
    /// Returns the number of rows actually inserted.
    pub fn write(
        &self,
        table: &str,
        rows: &RowSet,
        mode: WriteMode,
        schema: &TableSchema,
    ) -> Result<usize, StorageError> {
        if rows.fields.is_empty() {
            return Err(StorageError::schema(table, "rows have no columns"));
        }
        if mode == WriteMode::AppendDistinct {
            if schema.key.is_empty() {
                return Err(StorageError::schema(table, "append-distinct needs a key"));
            }
            if let Some(missing) = schema.key.iter().find(|k| rows.column_index(k).is_none()) {
                return Err(StorageError::schema(
                    table,
                    format!("key column {missing} missing from rows"),
                ));
            }
        }

        let mut conn = self.conn()?;
        let inserted = conn.immediate_transaction::<_, StorageError, _>(|conn| {
            let types = match mode {
                WriteMode::Replace => {
                    sql_query(format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
                        .execute(conn)?;
                    let types = infer_types(rows, schema);
                    create_table(conn, table, &rows.fields, &types)?;
                    types
                }
                WriteMode::Append | WriteMode::AppendDistinct => {
                    if rows.is_empty() {
                        return Ok(0);
                    }
                    prepare_append(conn, table, rows, schema)?
                }
            };
            if rows.is_empty() {
                return Ok(0);
            }
            match mode {
                WriteMode::Replace => insert_rows(conn, table, rows, &types, &[], false),
                WriteMode::Append => insert_rows(conn, table, rows, &types, &schema.key, false),
                WriteMode::AppendDistinct => {
                    insert_rows(conn, table, rows, &types, &schema.key, true)
                }
            }
        })?;

        debug!(table, rows = rows.len(), inserted, ?mode, "write");
        Ok(inserted)
    }

    /// Attaches a uniqueness key (`<table>_pkey`) over `columns`.
    ///
    /// Fails with [`StorageError::KeyViolation`] when stored rows are not unique or
    /// hold a null key. Adding a key that already exists is a no-op.
    pub fn add_primary_key(&self, table: &str, columns: &[String]) -> Result<(), StorageError> {
        if columns.is_empty() {
            return Err(StorageError::schema(table, "primary key needs at least one column"));
        }
        let mut conn = self.conn()?;
        let any_null = columns
            .iter()
            .map(|c| format!("{} IS NULL", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        let nulls: Count = sql_query(format!(
            "SELECT COUNT(*) AS n FROM {} WHERE {any_null}",
            quote_ident(table)
        ))
        .get_result(&mut conn)?;
        if nulls.n > 0 {
            return Err(StorageError::KeyViolation {
                table: table.to_string(),
                message: format!("{} rows with a null key", nulls.n),
            });
        }
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&pkey_name(table)),
            quote_ident(table),
            join_idents(columns)
        );
        sql_query(sql)
            .execute(&mut conn)
            .map_err(|e| StorageError::classify(table, e))?;
        debug!(table, ?columns, "primary key ensured");
        Ok(())
    }

    /// Drops `table` if present.
    pub fn drop_table(&self, table: &str) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        sql_query(format!("DROP TABLE IF EXISTS {}", quote_ident(table))).execute(&mut conn)?;
        Ok(())
    }
}

fn pkey_name(table: &str) -> String {
    format!("{table}_pkey")
}

fn join_idents(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `json_array(...)` over `columns`, spliced across calls when there are many.
fn payload_expr(columns: &[String]) -> String {
    let groups: Vec<String> = columns
        .chunks(JSON_ARGS_PER_CALL)
        .map(|chunk| format!("json_array({})", join_idents(chunk)))
        .collect();
    if groups.len() == 1 {
        return groups.into_iter().next().unwrap_or_default();
    }
    let inner = groups
        .iter()
        .map(|g| format!("substr({g}, 2, length({g}) - 2)"))
        .collect::<Vec<_>>()
        .join(" || ',' || ");
    format!("('[' || {inner} || ']')")
}

fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, StorageError> {
    let found: Count =
        sql_query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind::<Text, _>(table)
            .get_result(conn)?;
    Ok(found.n > 0)
}

fn columns_of(conn: &mut SqliteConnection, table: &str) -> Result<Vec<ColumnInfo>, StorageError> {
    let columns = sql_query("SELECT name, type AS ty, pk FROM pragma_table_info(?) ORDER BY cid")
        .bind::<Text, _>(table)
        .load(conn)?;
    Ok(columns)
}

/// Pinned type, else the first non-null value's type, else text.
fn infer_types(rows: &RowSet, schema: &TableSchema) -> Vec<ColumnType> {
    rows.fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            schema.pinned.get(field).copied().unwrap_or_else(|| {
                rows.items
                    .iter()
                    .find_map(|row| row.get(idx).and_then(ColumnType::infer))
                    .unwrap_or(ColumnType::Text)
            })
        })
        .collect()
}

fn create_table(
    conn: &mut SqliteConnection,
    table: &str,
    fields: &[String],
    types: &[ColumnType],
) -> Result<(), StorageError> {
    let mut seen = HashSet::new();
    if let Some(dup) = fields.iter().find(|f| !seen.insert(f.as_str())) {
        return Err(StorageError::schema(table, format!("duplicate column {dup}")));
    }
    let defs = fields
        .iter()
        .zip(types)
        .map(|(f, t)| format!("{} {}", quote_ident(f), t.sql()))
        .collect::<Vec<_>>()
        .join(", ");
    sql_query(format!(
        "CREATE TABLE IF NOT EXISTS {} ({defs})",
        quote_ident(table)
    ))
    .execute(conn)?;
    Ok(())
}

/// Creates the table or widens it, returning the type of every row column.
fn prepare_append(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &RowSet,
    schema: &TableSchema,
) -> Result<Vec<ColumnType>, StorageError> {
    let inferred = infer_types(rows, schema);
    let existing = columns_of(conn, table)?;
    if existing.is_empty() {
        create_table(conn, table, &rows.fields, &inferred)?;
        return Ok(inferred);
    }

    let declared: IndexMap<&str, ColumnType> = existing
        .iter()
        .map(|c| (c.name.as_str(), ColumnType::from_declared(&c.ty)))
        .collect();
    let mut types = Vec::with_capacity(rows.fields.len());
    for (field, guess) in rows.fields.iter().zip(inferred) {
        match declared.get(field.as_str()) {
            Some(ty) => types.push(*ty),
            None => {
                debug!(table, column = %field, ty = %guess, "adding column");
                sql_query(format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(field),
                    guess.sql()
                ))
                .execute(conn)?;
                types.push(guess);
            }
        }
    }
    Ok(types)
}

/// Inserts `rows`, skipping those with a null `key` cell.
///
/// With `distinct`, rows whose key is already stored (or repeated in the batch)
/// are skipped too.
fn insert_rows(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &RowSet,
    types: &[ColumnType],
    key: &[String],
    distinct: bool,
) -> Result<usize, StorageError> {
    let width = rows.fields.len();
    let per_chunk = (MAX_BIND_PARAMS / width).max(1);
    let placeholders = format!("({})", vec!["?"; width].join(", "));
    let target = format!("{} ({})", quote_ident(table), join_idents(&rows.fields));

    let key_cols: Vec<(&String, usize)> = key
        .iter()
        .filter_map(|k| rows.column_index(k).map(|i| (k, i)))
        .collect();
    let mut seen_keys = HashSet::new();
    let mut null_keys = 0usize;

    let mut inserted = 0;
    for chunk in rows.items.chunks(per_chunk) {
        let mut values = Vec::with_capacity(chunk.len() * width);
        let mut count = 0;
        for row in chunk {
            let coerced: Vec<SqlValue> = types
                .iter()
                .enumerate()
                .map(|(i, ty)| row.get(i).map_or(SqlValue::Null, |cell| SqlValue::coerce(cell, *ty)))
                .collect();
            if key_cols.iter().any(|(_, i)| coerced[*i] == SqlValue::Null) {
                null_keys += 1;
                continue;
            }
            if distinct {
                let repr: Vec<String> = key_cols.iter().map(|(_, i)| coerced[*i].key_repr()).collect();
                if !seen_keys.insert(repr) {
                    continue;
                }
            }
            values.extend(coerced);
            count += 1;
        }
        if count == 0 {
            continue;
        }

        let tuples = vec![placeholders.as_str(); count].join(", ");
        let sql = if distinct {
            let matches = key_cols
                .iter()
                .map(|(k, i)| format!("cur.{} IS v.column{}", quote_ident(k), i + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            format!(
                "INSERT INTO {target} SELECT * FROM (VALUES {tuples}) AS v \
                 WHERE NOT EXISTS (SELECT 1 FROM {} AS cur WHERE {matches})",
                quote_ident(table)
            )
        } else {
            format!("INSERT INTO {target} VALUES {tuples}")
        };

        let query = bind_all(sql_query(sql).into_boxed::<Sqlite>(), values);
        inserted += query
            .execute(conn)
            .map_err(|e| StorageError::classify(table, e))?;
    }
    if null_keys > 0 {
        warn!(table, null_keys, ?key, "rows with a null key skipped");
    }
    Ok(inserted)
}
