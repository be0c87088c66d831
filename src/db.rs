use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use log::warn;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::types::Json;
use sqlx::{Connection, MySqlConnection, PgConnection, Row, SqliteConnection};

use crate::settings::DbSettings;

/// Dynamically typed query parameter / result cell. Nulls stay typed so the
/// postgres wire protocol can infer a concrete parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
    Timestamp(Option<NaiveDateTime>),
    Json(Option<serde_json::Value>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Int(v) => v.is_none(),
            SqlValue::Float(v) => v.is_none(),
            SqlValue::Bool(v) => v.is_none(),
            SqlValue::Text(v) => v.is_none(),
            SqlValue::Bytes(v) => v.is_none(),
            SqlValue::Timestamp(v) => v.is_none(),
            SqlValue::Json(v) => v.is_none(),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(Some(v))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(Some(v))
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(Some(v))
    }
}

impl From<Option<NaiveDateTime>> for SqlValue {
    fn from(v: Option<NaiveDateTime>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(Some(v))
    }
}

/// One result row with positionally indexed cells.
#[derive(Debug, Clone)]
pub struct SqlRow(Vec<SqlValue>);

impl SqlRow {
    fn cell(&self, idx: usize) -> Result<&SqlValue> {
        self.0
            .get(idx)
            .with_context(|| format!("no column at index {idx}"))
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64> {
        match self.opt_i64(idx)? {
            Some(v) => Ok(v),
            None => bail!("column {idx} is null"),
        }
    }

    pub fn opt_i64(&self, idx: usize) -> Result<Option<i64>> {
        let cell = self.cell(idx)?;
        if cell.is_null() {
            return Ok(None);
        }
        match cell {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Float(v) => Ok(v.map(|f| f as i64)),
            other => bail!("column {idx} is not an integer: {other:?}"),
        }
    }

    pub fn opt_string(&self, idx: usize) -> Result<Option<String>> {
        let cell = self.cell(idx)?;
        if cell.is_null() {
            return Ok(None);
        }
        match cell {
            SqlValue::Text(v) => Ok(v.clone()),
            SqlValue::Json(v) => Ok(v.as_ref().map(|j| j.to_string())),
            other => bail!("column {idx} is not a string: {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
    MySql,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
        }
    }

    /// Builds an INSERT that tolerates the row already existing.
    pub fn duplicate_safe_insert(&self, table: &str, columns: &[&str]) -> String {
        let cols = columns.join(", ");
        let marks = vec!["?"; columns.len()].join(", ");
        match self {
            BackendKind::Sqlite => {
                format!("INSERT OR IGNORE INTO {table} ({cols}) VALUES ({marks})")
            }
            BackendKind::Postgres => {
                format!("INSERT INTO {table} ({cols}) VALUES ({marks}) ON CONFLICT DO NOTHING")
            }
            BackendKind::MySql => {
                format!("INSERT IGNORE INTO {table} ({cols}) VALUES ({marks})")
            }
        }
    }
}

/// Rewrites `?` markers to `$1..$n` for postgres. Tracks quote state so a
/// literal `?` inside a string literal is left alone; doubled quotes inside
/// literals toggle in and out and stay protected.
fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0u32;
    let mut in_single = false;
    let mut in_double = false;
    for c in sql.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '?' if !in_single && !in_double => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                SqlValue::Int(v) => q.bind(*v),
                SqlValue::Float(v) => q.bind(*v),
                SqlValue::Bool(v) => q.bind(*v),
                SqlValue::Text(v) => q.bind(v.clone()),
                SqlValue::Bytes(v) => q.bind(v.clone()),
                SqlValue::Timestamp(v) => q.bind(*v),
                SqlValue::Json(v) => q.bind(v.clone().map(Json)),
            };
        }
        q
    }};
}

/// Decodes one column by trying the types every backend supports, most
/// specific first. Null cells land on the first rung as a typed None.
macro_rules! decode_cell {
    ($row:expr, $i:expr) => {{
        if let Ok(v) = $row.try_get::<Option<i64>, _>($i) {
            SqlValue::Int(v)
        } else if let Ok(v) = $row.try_get::<Option<i32>, _>($i) {
            SqlValue::Int(v.map(i64::from))
        } else if let Ok(v) = $row.try_get::<Option<bool>, _>($i) {
            SqlValue::Bool(v)
        } else if let Ok(v) = $row.try_get::<Option<f64>, _>($i) {
            SqlValue::Float(v)
        } else if let Ok(v) = $row.try_get::<Option<String>, _>($i) {
            SqlValue::Text(v)
        } else if let Ok(v) = $row.try_get::<Option<NaiveDateTime>, _>($i) {
            SqlValue::Timestamp(v)
        } else if let Ok(v) = $row.try_get::<Option<Json<serde_json::Value>>, _>($i) {
            SqlValue::Json(v.map(|j| j.0))
        } else if let Ok(v) = $row.try_get::<Option<Vec<u8>>, _>($i) {
            SqlValue::Bytes(v)
        } else {
            bail!("unsupported column type at index {}", $i)
        }
    }};
}

macro_rules! decode_rows {
    ($rows:expr) => {{
        let mut out = Vec::with_capacity($rows.len());
        for row in &$rows {
            let mut cells = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                cells.push(decode_cell!(row, i));
            }
            out.push(SqlRow(cells));
        }
        out
    }};
}

/// A connection to one of the three supported backends. The variant is
/// chosen once at construction; each variant owns its own placeholder
/// translation and last-insert-id strategy.
///
/// Call sites write queries in a single dialect with `?` markers, the
/// native form for sqlite and mysql. Only postgres needs rewriting.
pub enum DbConnection {
    Sqlite(SqliteConnection),
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

impl DbConnection {
    pub async fn connect(cfg: &DbSettings) -> Result<Self> {
        match cfg {
            DbSettings::Sqlite { path } => {
                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(false);
                let conn = SqliteConnection::connect_with(&opts)
                    .await
                    .with_context(|| format!("failed to open sqlite database {path}"))?;
                Ok(DbConnection::Sqlite(conn))
            }
            DbSettings::Postgres {
                host,
                port,
                database,
                user,
                password,
            } => {
                let opts = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .database(database)
                    .username(user)
                    .password(password);
                let conn = PgConnection::connect_with(&opts)
                    .await
                    .with_context(|| format!("failed to connect to postgres at {host}:{port}"))?;
                Ok(DbConnection::Postgres(conn))
            }
            DbSettings::Mysql {
                host,
                port,
                database,
                user,
                password,
            } => {
                let opts = MySqlConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .database(database)
                    .username(user)
                    .password(password);
                let conn = MySqlConnection::connect_with(&opts)
                    .await
                    .with_context(|| format!("failed to connect to mysql at {host}:{port}"))?;
                Ok(DbConnection::MySql(conn))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            DbConnection::Sqlite(_) => BackendKind::Sqlite,
            DbConnection::Postgres(_) => BackendKind::Postgres,
            DbConnection::MySql(_) => BackendKind::MySql,
        }
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        match self {
            DbConnection::Sqlite(conn) => {
                let rows = bind_params!(sqlx::query(sql), params)
                    .fetch_all(conn)
                    .await
                    .with_context(|| format!("query failed: {sql}"))?;
                Ok(decode_rows!(rows))
            }
            DbConnection::Postgres(conn) => {
                let sql = number_placeholders(sql);
                let rows = bind_params!(sqlx::query(&sql), params)
                    .fetch_all(conn)
                    .await
                    .with_context(|| format!("query failed: {sql}"))?;
                Ok(decode_rows!(rows))
            }
            DbConnection::MySql(conn) => {
                let rows = bind_params!(sqlx::query(sql), params)
                    .fetch_all(conn)
                    .await
                    .with_context(|| format!("query failed: {sql}"))?;
                Ok(decode_rows!(rows))
            }
        }
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlRow>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    /// Runs a statement and returns the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self {
            DbConnection::Sqlite(conn) => {
                let res = bind_params!(sqlx::query(sql), params)
                    .execute(conn)
                    .await
                    .with_context(|| format!("statement failed: {sql}"))?;
                Ok(res.rows_affected())
            }
            DbConnection::Postgres(conn) => {
                let sql = number_placeholders(sql);
                let res = bind_params!(sqlx::query(&sql), params)
                    .execute(conn)
                    .await
                    .with_context(|| format!("statement failed: {sql}"))?;
                Ok(res.rows_affected())
            }
            DbConnection::MySql(conn) => {
                let res = bind_params!(sqlx::query(sql), params)
                    .execute(conn)
                    .await
                    .with_context(|| format!("statement failed: {sql}"))?;
                Ok(res.rows_affected())
            }
        }
    }

    /// Runs an INSERT and returns the new row id. Sqlite and mysql report
    /// the last inserted id on the connection; postgres has no equivalent,
    /// so the statement gets a RETURNING clause and the id is read from the
    /// result row.
    pub async fn insert_returning_id(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        match self {
            DbConnection::Sqlite(conn) => {
                let res = bind_params!(sqlx::query(sql), params)
                    .execute(conn)
                    .await
                    .with_context(|| format!("insert failed: {sql}"))?;
                Ok(res.last_insert_rowid())
            }
            DbConnection::Postgres(conn) => {
                let sql = number_placeholders(&format!("{sql} RETURNING id"));
                let row = bind_params!(sqlx::query(&sql), params)
                    .fetch_one(conn)
                    .await
                    .with_context(|| format!("insert failed: {sql}"))?;
                // serial columns may be int4 or int8 depending on the schema
                row.try_get::<i64, _>(0)
                    .or_else(|_| row.try_get::<i32, _>(0).map(i64::from))
                    .context("insert did not return an id")
            }
            DbConnection::MySql(conn) => {
                let res = bind_params!(sqlx::query(sql), params)
                    .execute(conn)
                    .await
                    .with_context(|| format!("insert failed: {sql}"))?;
                Ok(res.last_insert_id() as i64)
            }
        }
    }

    pub fn duplicate_safe_insert(&self, table: &str, columns: &[&str]) -> String {
        self.kind().duplicate_safe_insert(table, columns)
    }

    /// Opens the run-wide transaction. Drivers autocommit per statement by
    /// default, which would break the all-or-nothing commit boundary.
    pub async fn begin(&mut self) -> Result<()> {
        match self {
            DbConnection::MySql(_) => self.execute_raw("START TRANSACTION").await,
            _ => self.execute_raw("BEGIN").await,
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.execute_raw("COMMIT").await
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<()> {
        use sqlx::Executor;
        match self {
            DbConnection::Sqlite(conn) => {
                conn.execute(sql).await?;
            }
            DbConnection::Postgres(conn) => {
                conn.execute(sql).await?;
            }
            DbConnection::MySql(conn) => {
                conn.execute(sql).await?;
            }
        }
        Ok(())
    }

    /// Closes the connection, logging instead of failing; safe on either
    /// store during the abort path.
    pub async fn close(self) {
        let res = match self {
            DbConnection::Sqlite(conn) => conn.close().await,
            DbConnection::Postgres(conn) => conn.close().await,
            DbConnection::MySql(conn) => conn.close().await,
        };
        if let Err(e) = res {
            warn!("error closing connection: {e}");
        }
    }
}
