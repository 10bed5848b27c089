//! Delimited-text table [`StorageDriver`](crate::storage::StorageDriver).
//!
//! The whole table lives in one file: a header row naming the schema fields,
//! then one row per record in schema order. `begin()` parses the file;
//! `commit()` renders the working set and replaces the file through a temp
//! file and rename. Enumeration follows row order; new records append.
//!
//! Cell typing on read: enclosed cells are strings (tagged cells decode to
//! arrays, maps or bytes), bare empty cells are `Null`, other bare cells are
//! integers, floats or booleans when they parse as such and strings
//! otherwise. Strings are always written enclosed so they read back as
//! strings.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use restkit_core::codec::{decode_text, encode_tagged};
use restkit_core::{FieldMap, Record, RecordSet, ResourceId, Schema, StoreError, StoreResult, Value};

use crate::config::DelimitedConfig;
use crate::storage::buffered::{BufferedDriver, Medium, WorkingSet};
use crate::storage::driver::DriverKind;

/// Cell separator and enclosure characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub delimiter: char,
    pub enclosure: char,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: ',',
            enclosure: '"',
        }
    }
}

/// One parsed cell.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cell {
    text: String,
    enclosed: bool,
}

impl Cell {
    fn into_value(self) -> Value {
        if self.enclosed {
            return decode_text(self.text);
        }
        if self.text.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = self.text.parse::<i64>() {
            return Value::Int(i);
        }
        let numeric_start = self
            .text
            .starts_with(|c: char| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
        // Non-finite floats are written as bare `NaN`, `inf` and `-inf`.
        let non_finite = matches!(self.text.as_str(), "NaN" | "inf" | "-inf");
        if numeric_start || non_finite {
            if let Ok(f) = self.text.parse::<f64>() {
                return Value::Float(f);
            }
        }
        match self.text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => decode_text(self.text),
        }
    }
}

impl Dialect {
    /// Splits text into rows of cells. Blank lines are skipped.
    fn parse(self, text: &str) -> StoreResult<Vec<Vec<Cell>>> {
        let mut rows = Vec::new();
        let mut row: Vec<Cell> = Vec::new();
        let mut cell = String::new();
        let mut enclosed = false;
        let mut in_enclosure = false;
        let mut line = 1usize;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if in_enclosure {
                if c == self.enclosure {
                    if chars.peek() == Some(&self.enclosure) {
                        chars.next();
                        cell.push(c);
                    } else {
                        in_enclosure = false;
                    }
                } else {
                    if c == '\n' {
                        line += 1;
                    }
                    cell.push(c);
                }
                continue;
            }
            if c == self.delimiter {
                row.push(Cell {
                    text: std::mem::take(&mut cell),
                    enclosed,
                });
                enclosed = false;
            } else if c == '\n' || (c == '\r' && chars.peek() == Some(&'\n')) {
                if c == '\r' {
                    chars.next();
                }
                row.push(Cell {
                    text: std::mem::take(&mut cell),
                    enclosed,
                });
                enclosed = false;
                finish_row(&mut rows, std::mem::take(&mut row));
                line += 1;
            } else if c == self.enclosure && cell.is_empty() && !enclosed {
                in_enclosure = true;
                enclosed = true;
            } else if enclosed {
                return Err(StoreError::SchemaViolation(format!(
                    "line {line}: unexpected `{c}` after closing enclosure"
                )));
            } else {
                cell.push(c);
            }
        }

        if in_enclosure {
            return Err(StoreError::SchemaViolation(format!(
                "line {line}: unterminated enclosure"
            )));
        }
        if !row.is_empty() || !cell.is_empty() || enclosed {
            row.push(Cell {
                text: cell,
                enclosed,
            });
            finish_row(&mut rows, row);
        }
        Ok(rows)
    }

    fn push_enclosed(self, out: &mut String, text: &str) {
        out.push(self.enclosure);
        for c in text.chars() {
            if c == self.enclosure {
                out.push(c);
            }
            out.push(c);
        }
        out.push(self.enclosure);
    }

    fn push_value(self, out: &mut String, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => out.push_str(&i.to_string()),
            // Debug keeps a fractional part, so 3.0 does not read back as an
            // integer, and spells non-finite values `NaN`, `inf` and `-inf`.
            Value::Float(f) => out.push_str(&format!("{f:?}")),
            Value::String(s) => self.push_enclosed(out, s),
            other => {
                let tagged = encode_tagged(other).unwrap_or_default();
                self.push_enclosed(out, &tagged);
            }
        }
    }

    fn push_header(self, out: &mut String, fields: &[String]) {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            let plain = !field.is_empty()
                && !field.contains([self.delimiter, self.enclosure, '\n', '\r']);
            if plain {
                out.push_str(field);
            } else {
                self.push_enclosed(out, field);
            }
        }
        out.push('\n');
    }

    /// Renders the header plus one line per record.
    fn render(self, schema: &Schema, records: &RecordSet) -> String {
        let mut out = String::new();
        self.push_header(&mut out, schema.fields());
        for record in records.values() {
            for (i, field) in schema.fields().iter().enumerate() {
                if i > 0 {
                    out.push(self.delimiter);
                }
                self.push_value(&mut out, record.get(field).unwrap_or(&Value::Null));
            }
            out.push('\n');
        }
        out
    }
}

fn finish_row(rows: &mut Vec<Vec<Cell>>, row: Vec<Cell>) {
    let blank = matches!(row.as_slice(), [only] if only.text.is_empty() && !only.enclosed);
    if !blank {
        rows.push(row);
    }
}

/// Durable side of the delimited-text driver.
#[derive(Debug, Clone)]
pub struct DelimitedMedium {
    path: PathBuf,
    dialect: Dialect,
    schema: Schema,
}

impl DelimitedMedium {
    /// Binds to a table file, creating it from `columns` when missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] when the file is missing
    /// and no columns are configured, when configured columns disagree with
    /// the file's header, or when the primary key is not a column.
    pub fn open(config: &DelimitedConfig) -> StoreResult<Self> {
        let dialect = Dialect {
            delimiter: config.delimiter,
            enclosure: config.enclosure,
        };
        let path = config.path.clone();
        let header = read_header(&path, dialect)?;

        let fields = match (header, &config.columns) {
            (Some(header), Some(columns)) if header != *columns => {
                return Err(StoreError::InvalidConfiguration(format!(
                    "{}: header {header:?} does not match configured columns {columns:?}",
                    path.display()
                )));
            }
            (Some(header), _) => header,
            (None, Some(columns)) => {
                let schema = Schema::new(columns.clone(), &config.primary_key)?;
                let mut text = String::new();
                dialect.push_header(&mut text, schema.fields());
                fs::write(&path, text).map_err(|e| {
                    StoreError::InvalidConfiguration(format!(
                        "cannot create {}: {e}",
                        path.display()
                    ))
                })?;
                tracing::info!(path = %path.display(), "created delimited table");
                columns.clone()
            }
            (None, None) => {
                return Err(StoreError::InvalidConfiguration(format!(
                    "{} does not exist and no columns are configured",
                    path.display()
                )));
            }
        };

        let schema = Schema::new(fields, &config.primary_key)?;
        tracing::info!(
            path = %path.display(),
            columns = schema.fields().len(),
            "opened delimited store"
        );
        Ok(Self {
            path,
            dialect,
            schema,
        })
    }

    /// Schema taken from the header row.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Table file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rows_to_records(&self, rows: Vec<Vec<Cell>>) -> StoreResult<RecordSet> {
        let mut rows = rows.into_iter();
        let header: Vec<String> = rows
            .next()
            .map(|row| row.into_iter().map(|cell| cell.text).collect())
            .unwrap_or_default();
        if header != self.schema.fields() {
            return Err(StoreError::InvalidConfiguration(format!(
                "{}: header changed to {header:?}",
                self.path.display()
            )));
        }

        let width = self.schema.fields().len();
        let mut records = RecordSet::new();
        for (index, row) in rows.enumerate() {
            let row_number = index + 2;
            if row.len() != width {
                return Err(StoreError::SchemaViolation(format!(
                    "{} row {row_number}: {} cells, header has {width}",
                    self.path.display(),
                    row.len()
                )));
            }
            let fields: FieldMap = self
                .schema
                .fields()
                .iter()
                .cloned()
                .zip(row.into_iter().map(Cell::into_value))
                .collect();
            let id = fields
                .get(self.schema.primary_key())
                .and_then(ResourceId::from_value)
                .ok_or_else(|| {
                    StoreError::SchemaViolation(format!(
                        "{} row {row_number}: empty `{}`",
                        self.path.display(),
                        self.schema.primary_key()
                    ))
                })?;
            if records.insert(id.clone(), Value::Map(fields)).is_some() {
                return Err(StoreError::SchemaViolation(format!(
                    "{} row {row_number}: duplicate id {id}",
                    self.path.display()
                )));
            }
        }
        Ok(records)
    }

    fn write_atomically(path: &Path, text: &str) -> StoreResult<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp = tempfile::Builder::new()
            .prefix(".rk-")
            .tempfile_in(dir)
            .map_err(|e| StoreError::medium(format!("staging in {}", dir.display()), e))?;
        temp.write_all(text.as_bytes())
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| StoreError::medium(format!("staging {}", path.display()), e))?;
        temp.persist(path)
            .map_err(|e| StoreError::medium(format!("replacing {}", path.display()), e.error))?;
        Ok(())
    }
}

fn read_header(path: &Path, dialect: Dialect) -> StoreResult<Option<Vec<String>>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::InvalidConfiguration(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };
    Ok(dialect
        .parse(&text)?
        .into_iter()
        .next()
        .map(|row| row.into_iter().map(|cell| cell.text).collect()))
}

#[async_trait]
impl Medium for DelimitedMedium {
    fn kind(&self) -> DriverKind {
        DriverKind::Delimited
    }

    async fn load(&self) -> StoreResult<RecordSet> {
        let path = self.path.clone();
        let text = tokio::task::spawn_blocking(move || fs::read_to_string(&path))
            .await
            .map_err(|e| StoreError::medium("delimited read task failed", e))?
            .map_err(|e| StoreError::medium(format!("reading {}", self.path.display()), e))?;
        let rows = self.dialect.parse(&text)?;
        self.rows_to_records(rows)
    }

    async fn persist(&self, working: &WorkingSet) -> StoreResult<()> {
        let text = self.dialect.render(&self.schema, working.records());
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write_atomically(&path, &text))
            .await
            .map_err(|e| StoreError::medium("delimited write task failed", e))?
    }

    fn shape(&self, record: Record, id: &ResourceId) -> StoreResult<Record> {
        self.schema.shape_row(record, id).map(Value::Map)
    }

    fn embedded_id(&self, record: &Record) -> Option<ResourceId> {
        let row = self.schema.force_to_schema(record.clone()).ok()?;
        row.get(self.schema.primary_key())
            .and_then(ResourceId::from_value)
    }
}

/// Delimited-text-backed store.
pub type DelimitedDriver = BufferedDriver<DelimitedMedium>;

impl DelimitedDriver {
    /// Opens a delimited-text store.
    ///
    /// # Errors
    ///
    /// See [`DelimitedMedium::open`].
    pub fn open(config: &DelimitedConfig) -> StoreResult<Self> {
        Ok(BufferedDriver::new(DelimitedMedium::open(config)?))
    }
}
