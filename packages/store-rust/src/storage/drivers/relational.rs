//! Relational [`StorageDriver`] over one table, via sqlx's `Any` backend.
//!
//! The column list is introspected once at open and becomes the store's
//! [`Schema`]. Records are forced to that schema on write; the primary-key
//! column always carries the record id. Values that do not fit a scalar
//! column (arrays, maps, bytes in non-blob columns) go through the tagged
//! text codec and are decoded by prefix on read.
//!
//! Transactions map onto native `BEGIN`/`COMMIT`/`ROLLBACK` on the store's
//! single connection. Calls outside a bracket autocommit. Enumeration and
//! `first()`/`last()` follow primary-key order.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use restkit_core::codec::{decode_text, encode_tagged};
use restkit_core::{
    merge, FieldMap, IdSequence, Page, Record, RecordSet, ResourceId, Schema, StoreError,
    StoreResult, Value,
};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Connection, Row};
use tokio::sync::Mutex;

use crate::config::RelationalConfig;
use crate::storage::driver::{DriverKind, StorageDriver};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

/// SQL dialect, chosen from the connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    /// Picks the dialect for a connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] for unsupported schemes.
    pub fn from_url(url: &str) -> StoreResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(SqlDialect::Sqlite),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            other => Err(StoreError::InvalidConfiguration(format!(
                "relational: unsupported url scheme `{other}`"
            ))),
        }
    }
}

/// Storage class of a column, derived from its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Real,
    Boolean,
    Blob,
    Text,
}

impl Affinity {
    fn from_declared(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        if declared.contains("BOOL") {
            Affinity::Boolean
        } else if declared.contains("INT") || declared.contains("SERIAL") {
            Affinity::Integer
        } else if declared.contains("CHAR") || declared.contains("TEXT") || declared.contains("CLOB") {
            Affinity::Text
        } else if declared.contains("BLOB") || declared.contains("BYTEA") {
            Affinity::Blob
        } else if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
            .iter()
            .any(|t| declared.contains(t))
        {
            Affinity::Real
        } else {
            Affinity::Text
        }
    }
}

/// One bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Null(Affinity),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlParam {
    #[allow(clippy::cast_precision_loss)]
    fn for_column(value: &Value, affinity: Affinity) -> Self {
        match value {
            Value::Null => SqlParam::Null(affinity),
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Int(i) if affinity == Affinity::Real => SqlParam::Float(*i as f64),
            Value::Int(i) => SqlParam::Int(*i),
            Value::Float(f) => SqlParam::Float(*f),
            Value::String(s) => SqlParam::Text(s.clone()),
            Value::Bytes(b) if affinity == Affinity::Blob => SqlParam::Blob(b.clone()),
            other => SqlParam::Text(encode_tagged(other).unwrap_or_default()),
        }
    }

    fn bind<'q>(self, query: Query<'q, Any, AnyArguments<'q>>) -> Query<'q, Any, AnyArguments<'q>> {
        match self {
            SqlParam::Null(Affinity::Integer) => query.bind(None::<i64>),
            SqlParam::Null(Affinity::Real) => query.bind(None::<f64>),
            SqlParam::Null(Affinity::Boolean) => query.bind(None::<bool>),
            SqlParam::Null(Affinity::Blob) => query.bind(None::<Vec<u8>>),
            SqlParam::Null(Affinity::Text) => query.bind(None::<String>),
            SqlParam::Bool(b) => query.bind(b),
            SqlParam::Int(i) => query.bind(i),
            SqlParam::Float(f) => query.bind(f),
            SqlParam::Text(s) => query.bind(s),
            SqlParam::Blob(b) => query.bind(b),
        }
    }
}

/// SQL text plus its parameters, built with dialect-correct placeholders.
struct Statement {
    dialect: SqlDialect,
    sql: String,
    params: Vec<SqlParam>,
}

impl Statement {
    fn new(dialect: SqlDialect, sql: impl Into<String>) -> Self {
        Self {
            dialect,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Appends a placeholder for `param`.
    fn param(&mut self, param: SqlParam) -> &mut Self {
        self.params.push(param);
        match self.dialect {
            SqlDialect::Sqlite => self.sql.push('?'),
            SqlDialect::Postgres => {
                let n = self.params.len();
                self.sql.push_str(&format!("${n}"));
            }
        }
        self
    }

    fn query(&self) -> Query<'_, Any, AnyArguments<'_>> {
        self.params
            .iter()
            .cloned()
            .fold(sqlx::query(&self.sql), |query, param| param.bind(query))
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Select-list expression for one column.
///
/// sqlx's `Any` backend only carries SQLite's integer, real, text and blob
/// classes, and types a column by its declared type. Columns declared as
/// booleans or dates are cast so the cell arrives as a plain storage class.
fn select_expr(dialect: SqlDialect, column: &str, declared: &str) -> String {
    let quoted = quote(column);
    if dialect != SqlDialect::Sqlite {
        return quoted;
    }
    let declared = declared.trim().to_ascii_lowercase();
    let cast = match declared.as_str() {
        "bool" | "boolean" => "INTEGER",
        "date" | "time" | "datetime" | "timestamp" => "TEXT",
        _ => return quoted,
    };
    format!("CAST({quoted} AS {cast}) AS {quoted}")
}

fn validate_identifier(kind: &str, name: &str) -> StoreResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidConfiguration(format!(
            "relational: {kind} `{name}` is not a plain SQL identifier"
        )))
    }
}

fn query_failed(context: &str, err: sqlx::Error) -> StoreError {
    StoreError::medium(format!("relational {context}"), err)
}

struct Session {
    conn: AnyConnection,
    in_transaction: bool,
    high_water: u64,
}

/// Relational-table store.
pub struct RelationalDriver {
    session: Mutex<Session>,
    dialect: SqlDialect,
    table: String,
    schema: Schema,
    affinities: Vec<Affinity>,
    column_list: String,
    select_list: String,
}

impl RelationalDriver {
    /// Connects and introspects the configured table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] for malformed identifiers,
    /// unsupported URLs, unreachable databases, or a table that does not
    /// exist or lacks the primary-key column.
    pub async fn open(config: &RelationalConfig) -> StoreResult<Self> {
        validate_identifier("table", &config.table)?;
        validate_identifier("primary key", &config.primary_key)?;
        let dialect = SqlDialect::from_url(&config.url)?;

        sqlx::any::install_default_drivers();
        let mut conn = AnyConnection::connect(&config.url).await.map_err(|e| {
            StoreError::InvalidConfiguration(format!("relational: cannot connect: {e}"))
        })?;

        let columns = introspect(&mut conn, dialect, &config.table).await?;
        if columns.is_empty() {
            return Err(StoreError::InvalidConfiguration(format!(
                "relational: table `{}` does not exist",
                config.table
            )));
        }
        let select_list = columns
            .iter()
            .map(|(name, declared)| select_expr(dialect, name, declared))
            .collect::<Vec<_>>()
            .join(", ");
        let (names, affinities): (Vec<String>, Vec<Affinity>) = columns
            .into_iter()
            .map(|(name, declared)| (name, Affinity::from_declared(&declared)))
            .unzip();
        let schema = Schema::new(names, &config.primary_key)?;
        let column_list = schema
            .fields()
            .iter()
            .map(|f| quote(f))
            .collect::<Vec<_>>()
            .join(", ");

        tracing::info!(
            table = %config.table,
            dialect = ?dialect,
            columns = schema.fields().len(),
            "opened relational store"
        );
        Ok(Self {
            session: Mutex::new(Session {
                conn,
                in_transaction: false,
                high_water: 0,
            }),
            dialect,
            table: config.table.clone(),
            schema,
            affinities,
            column_list,
            select_list,
        })
    }

    /// Introspected schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn pk_index(&self) -> usize {
        self.schema
            .fields()
            .iter()
            .position(|f| f == self.schema.primary_key())
            .unwrap_or_default()
    }

    fn pk_affinity(&self) -> Affinity {
        self.affinities[self.pk_index()]
    }

    fn affinity_of(&self, field: &str) -> Option<Affinity> {
        self.schema
            .fields()
            .iter()
            .position(|f| f == field)
            .map(|i| self.affinities[i])
    }

    /// Bind parameter for an id, or `None` when the key column cannot hold it.
    fn id_param(&self, id: &ResourceId) -> Option<SqlParam> {
        match (self.pk_affinity(), id) {
            (Affinity::Integer, ResourceId::Int(n)) => i64::try_from(*n).ok().map(SqlParam::Int),
            (Affinity::Integer, ResourceId::Str(_)) => None,
            (Affinity::Text, id) => Some(SqlParam::Text(id.to_string())),
            (affinity, id) => Some(SqlParam::for_column(&id.to_value(), affinity)),
        }
    }

    fn select(&self) -> Statement {
        Statement::new(
            self.dialect,
            format!("SELECT {} FROM {}", self.select_list, quote(&self.table)),
        )
    }

    fn where_pk(&self, statement: &mut Statement, param: SqlParam) {
        statement
            .push(" WHERE ")
            .push(&quote(self.schema.primary_key()))
            .push(" = ")
            .param(param);
    }

    fn order_by_pk(&self, statement: &mut Statement, descending: bool) {
        statement
            .push(" ORDER BY ")
            .push(&quote(self.schema.primary_key()))
            .push(if descending { " DESC" } else { " ASC" });
    }

    fn decode_row(&self, row: &AnyRow) -> StoreResult<(ResourceId, Record)> {
        let mut fields = FieldMap::with_capacity(self.schema.fields().len());
        for (index, field) in self.schema.fields().iter().enumerate() {
            let value = decode_cell(row, index, field)?;
            let value = match (self.affinities[index], value) {
                (Affinity::Boolean, Value::Int(i)) => Value::Bool(i != 0),
                (_, value) => value,
            };
            fields.insert(field.clone(), value);
        }
        let id = fields
            .get(self.schema.primary_key())
            .and_then(ResourceId::from_value)
            .ok_or_else(|| {
                StoreError::SchemaViolation(format!(
                    "row in `{}` has an empty `{}`",
                    self.table,
                    self.schema.primary_key()
                ))
            })?;
        Ok((id, Value::Map(fields)))
    }

    async fn fetch(&self, session: &mut Session, statement: &Statement) -> StoreResult<RecordSet> {
        tracing::debug!(sql = %statement.sql, params = statement.params.len(), "relational query");
        let rows = statement
            .query()
            .fetch_all(&mut session.conn)
            .await
            .map_err(|e| query_failed("select", e))?;
        rows.iter().map(|row| self.decode_row(row)).collect()
    }

    async fn fetch_one_by_id(
        &self,
        session: &mut Session,
        id: &ResourceId,
    ) -> StoreResult<Option<Record>> {
        let Some(param) = self.id_param(id) else {
            return Ok(None);
        };
        let mut statement = self.select();
        self.where_pk(&mut statement, param);
        Ok(self
            .fetch(session, &statement)
            .await?
            .into_values()
            .next())
    }

    async fn execute(&self, session: &mut Session, statement: &Statement) -> StoreResult<u64> {
        tracing::debug!(sql = %statement.sql, params = statement.params.len(), "relational statement");
        statement
            .query()
            .execute(&mut session.conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| query_failed("statement", e))
    }

    async fn scalar_count(&self, session: &mut Session, statement: &Statement) -> StoreResult<u64> {
        let row = statement
            .query()
            .fetch_one(&mut session.conn)
            .await
            .map_err(|e| query_failed("count", e))?;
        let n: i64 = row.try_get(0).map_err(|e| query_failed("count", e))?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    async fn raw(&self, session: &mut Session, sql: &str) -> StoreResult<()> {
        sqlx::Executor::execute(&mut session.conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| query_failed(sql, e))?;
        Ok(())
    }

    async fn generate_id(&self, session: &mut Session) -> StoreResult<ResourceId> {
        let mut statement = Statement::new(
            self.dialect,
            format!(
                "SELECT {} FROM {}",
                quote(self.schema.primary_key()),
                quote(&self.table)
            ),
        );
        self.order_by_pk(&mut statement, false);
        let rows = statement
            .query()
            .fetch_all(&mut session.conn)
            .await
            .map_err(|e| query_failed("id scan", e))?;
        let mut existing = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(id) = ResourceId::from_value(&decode_cell(row, 0, self.schema.primary_key())?) {
                existing.push(id);
            }
        }
        let mut sequence = IdSequence::seeded(&existing);
        sequence.raise_high_water(session.high_water);
        let in_use: HashSet<&ResourceId> = existing.iter().collect();
        let id = sequence.next_id(|candidate| in_use.contains(candidate));
        session.high_water = sequence.high_water();
        Ok(id)
    }

    fn row_params(&self, row: &FieldMap) -> Vec<SqlParam> {
        self.schema
            .fields()
            .iter()
            .zip(&self.affinities)
            .map(|(field, affinity)| {
                SqlParam::for_column(row.get(field).unwrap_or(&Value::Null), *affinity)
            })
            .collect()
    }
}

/// Column names and declared types of `table`, in column order.
async fn introspect(
    conn: &mut AnyConnection,
    dialect: SqlDialect,
    table: &str,
) -> StoreResult<Vec<(String, String)>> {
    let rows = match dialect {
        SqlDialect::Sqlite => {
            sqlx::query(&format!("PRAGMA table_info({})", quote(table)))
                .fetch_all(&mut *conn)
                .await
        }
        SqlDialect::Postgres => {
            sqlx::query(
                "SELECT column_name::text AS name, data_type::text AS type \
                 FROM information_schema.columns \
                 WHERE table_name = $1 AND table_schema = current_schema() \
                 ORDER BY ordinal_position",
            )
            .bind(table.to_string())
            .fetch_all(&mut *conn)
            .await
        }
    }
    .map_err(|e| query_failed("introspection", e))?;

    rows.iter()
        .map(|row| {
            let name: String = row.try_get("name").map_err(|e| query_failed("introspection", e))?;
            let declared: Option<String> = row
                .try_get("type")
                .map_err(|e| query_failed("introspection", e))?;
            Ok((name, declared.unwrap_or_default()))
        })
        .collect()
}

/// Decodes one cell by trying each scalar type `Any` can carry.
fn decode_cell(row: &AnyRow, index: usize, field: &str) -> StoreResult<Value> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return Ok(v.map_or(Value::Null, Value::Int));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return Ok(v.map_or(Value::Null, Value::Float));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return Ok(v.map_or(Value::Null, decode_text));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Ok(v.map_or(Value::Null, Value::Bytes));
    }
    match row.try_get::<Option<bool>, _>(index) {
        Ok(v) => Ok(v.map_or(Value::Null, Value::Bool)),
        Err(e) => Err(StoreError::medium(
            format!("relational: column `{field}` has an unsupported type"),
            e,
        )),
    }
}

#[async_trait]
impl StorageDriver for RelationalDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Relational
    }

    async fn begin(&self) -> StoreResult<()> {
        let mut session = self.session.lock().await;
        if session.in_transaction {
            tracing::warn!(table = %self.table, "begin() rolls back an open transaction");
            self.raw(&mut session, "ROLLBACK").await?;
        }
        self.raw(&mut session, "BEGIN").await?;
        session.in_transaction = true;
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        let mut session = self.session.lock().await;
        if !session.in_transaction {
            return Ok(());
        }
        self.raw(&mut session, "COMMIT").await?;
        session.in_transaction = false;
        Ok(())
    }

    async fn rollback(&self) -> StoreResult<()> {
        let mut session = self.session.lock().await;
        if !session.in_transaction {
            return Ok(());
        }
        session.in_transaction = false;
        self.raw(&mut session, "ROLLBACK").await
    }

    async fn create(&self, record: Record, id: Option<ResourceId>) -> StoreResult<ResourceId> {
        let mut row = self.schema.force_to_schema(record)?;
        let embedded = row
            .get(self.schema.primary_key())
            .and_then(ResourceId::from_value);
        let mut session = self.session.lock().await;
        let id = match id.or(embedded) {
            Some(id) => id,
            None => self.generate_id(&mut session).await?,
        };
        if self.id_param(&id).is_none() {
            return Err(StoreError::SchemaViolation(format!(
                "id {id} does not fit key column `{}`",
                self.schema.primary_key()
            )));
        }
        if self.fetch_one_by_id(&mut session, &id).await?.is_some() {
            return Err(StoreError::conflict(&id, "id already exists"));
        }
        row.insert(self.schema.primary_key().to_string(), id.to_value());

        let mut statement = Statement::new(
            self.dialect,
            format!("INSERT INTO {} ({}) VALUES (", quote(&self.table), self.column_list),
        );
        for (i, param) in self.row_params(&row).into_iter().enumerate() {
            if i > 0 {
                statement.push(", ");
            }
            statement.param(param);
        }
        statement.push(")");
        self.execute(&mut session, &statement).await.map_err(|e| match e {
            StoreError::MediumFailure { source, .. }
                if source
                    .downcast_ref::<sqlx::Error>()
                    .and_then(sqlx::Error::as_database_error)
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                StoreError::conflict(&id, "id already exists")
            }
            other => other,
        })?;
        if let ResourceId::Int(n) = id {
            session.high_water = session.high_water.max(n);
        }
        Ok(id)
    }

    async fn read(&self, id: &ResourceId) -> StoreResult<Record> {
        let mut session = self.session.lock().await;
        self.fetch_one_by_id(&mut session, id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn update(&self, partial: Record, id: &ResourceId) -> StoreResult<Record> {
        let mut session = self.session.lock().await;
        let existing = self
            .fetch_one_by_id(&mut session, id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))?;
        let row = self.schema.shape_row(merge(existing, partial), id)?;

        let mut statement = Statement::new(self.dialect, format!("UPDATE {} SET ", quote(&self.table)));
        let mut first = true;
        for (field, param) in self.schema.fields().iter().zip(self.row_params(&row)) {
            if field == self.schema.primary_key() {
                continue;
            }
            if !first {
                statement.push(", ");
            }
            first = false;
            statement.push(&quote(field)).push(" = ").param(param);
        }
        if !first {
            let Some(param) = self.id_param(id) else {
                return Err(StoreError::not_found(id));
            };
            self.where_pk(&mut statement, param);
            self.execute(&mut session, &statement).await?;
        }
        Ok(Value::Map(row))
    }

    async fn delete(&self, id: &ResourceId) -> StoreResult<Record> {
        let mut session = self.session.lock().await;
        let existing = self
            .fetch_one_by_id(&mut session, id)
            .await?
            .ok_or_else(|| StoreError::not_found(id))?;
        let Some(param) = self.id_param(id) else {
            return Err(StoreError::not_found(id));
        };
        let mut statement = Statement::new(self.dialect, format!("DELETE FROM {}", quote(&self.table)));
        self.where_pk(&mut statement, param);
        self.execute(&mut session, &statement).await?;
        Ok(existing)
    }

    async fn exists(&self, id: &ResourceId) -> StoreResult<bool> {
        let Some(param) = self.id_param(id) else {
            return Ok(false);
        };
        let mut session = self.session.lock().await;
        let mut statement = Statement::new(
            self.dialect,
            format!("SELECT COUNT(*) FROM {}", quote(&self.table)),
        );
        self.where_pk(&mut statement, param);
        Ok(self.scalar_count(&mut session, &statement).await? > 0)
    }

    async fn all(&self, page: Option<Page>) -> StoreResult<RecordSet> {
        let mut session = self.session.lock().await;
        let mut statement = self.select();
        self.order_by_pk(&mut statement, false);
        if let Some(page) = page {
            let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
            let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);
            statement
                .push(" LIMIT ")
                .param(SqlParam::Int(limit))
                .push(" OFFSET ")
                .param(SqlParam::Int(offset));
        }
        self.fetch(&mut session, &statement).await
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        let mut session = self.session.lock().await;
        let statement = Statement::new(self.dialect, format!("DELETE FROM {}", quote(&self.table)));
        self.execute(&mut session, &statement).await
    }

    async fn count(&self) -> StoreResult<u64> {
        let mut session = self.session.lock().await;
        let statement = Statement::new(
            self.dialect,
            format!("SELECT COUNT(*) FROM {}", quote(&self.table)),
        );
        self.scalar_count(&mut session, &statement).await
    }

    async fn search(&self, field: &str, value: &Value) -> StoreResult<RecordSet> {
        let Some(affinity) = self.affinity_of(field) else {
            return Ok(RecordSet::new());
        };
        let mut session = self.session.lock().await;
        let mut statement = self.select();
        statement.push(" WHERE ").push(&quote(field));
        match value {
            Value::Null => {
                statement.push(" IS NULL");
            }
            Value::String(needle) if needle.contains('%') => {
                statement.push(" LIKE ").param(SqlParam::Text(needle.clone()));
            }
            other => {
                statement.push(" = ").param(SqlParam::for_column(other, affinity));
            }
        }
        self.order_by_pk(&mut statement, false);
        self.fetch(&mut session, &statement).await
    }

    async fn first(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        let mut session = self.session.lock().await;
        let mut statement = self.select();
        self.order_by_pk(&mut statement, false);
        statement.push(" LIMIT 1");
        Ok(self.fetch(&mut session, &statement).await?.into_iter().next())
    }

    async fn last(&self) -> StoreResult<Option<(ResourceId, Record)>> {
        let mut session = self.session.lock().await;
        let mut statement = self.select();
        self.order_by_pk(&mut statement, true);
        statement.push(" LIMIT 1");
        Ok(self.fetch(&mut session, &statement).await?.into_iter().next())
    }
}
