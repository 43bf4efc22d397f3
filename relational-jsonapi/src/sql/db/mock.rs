//! Mock instantiation of the abstract [`db`](super) interface.
//!
//! This instantiation is built on a simple in-memory database. It is useful for testing in
//! isolation from an actual database.
//!
//! Each [`Connection`] is a separate session. A transaction snapshots the whole database when it
//! begins and restores the snapshot on rollback, so concurrent writers in different sessions will
//! clobber each other. Tests use one session at a time.
#![cfg(any(test, feature = "mocks"))]

use super::{
    Boolean, Clause, Column, ConstraintKind, JoinClause, JoinKind, Operand, OrderBy,
    SchemaColumn, SelectColumn, Subquery, Type, Value, WhereClause,
};
use async_std::sync::{Arc, Mutex, RwLock};
use async_trait::async_trait;
use derive_more::From;
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryFutureExt,
};
use itertools::Itertools;
use snafu::Snafu;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::fmt::Display;

/// Errors returned by the in-memory database.
#[derive(Debug, Snafu, From)]
#[snafu(display("mock DB error: {}", message))]
pub struct Error {
    message: String,
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        Self {
            message: msg.to_string(),
        }
    }
}

/// A schema for a set of rows, with every column qualified by the name of its table.
type Schema = Vec<Column<'static>>;

/// The in-memory database.
#[derive(Clone, Debug, Default)]
struct Db {
    tables: HashMap<String, Table>,
}

/// An in-memory table.
#[derive(Clone, Debug)]
struct Table {
    name: String,
    columns: Vec<SchemaColumn<'static>>,
    /// Sets of columns whose values must be unique, from primary key and unique constraints.
    unique: Vec<Vec<usize>>,
    rows: Vec<Row>,
    next_serial: i64,
}

impl Table {
    fn new(name: String, columns: Vec<SchemaColumn<'static>>) -> Self {
        Self {
            name,
            columns,
            unique: vec![],
            rows: vec![],
            next_serial: 1,
        }
    }

    /// The position of the named column.
    fn index(&self, column: &str) -> Result<usize, Error> {
        self.columns
            .iter()
            .position(|col| col.name() == column)
            .ok_or_else(|| Error::from(format!("table {} has no column {column}", self.name)))
    }

    /// The schema of this table, as seen through `alias`.
    fn qualified_schema(&self, alias: &str) -> Schema {
        self.columns
            .iter()
            .map(|col| Column::qualified(alias.to_string(), col.name().into_owned()))
            .collect()
    }

    fn add_constraint(&mut self, kind: ConstraintKind, columns: Vec<String>) -> Result<(), Error> {
        match kind {
            ConstraintKind::PrimaryKey | ConstraintKind::Unique => {
                let columns = columns
                    .iter()
                    .map(|col| self.index(col))
                    .collect::<Result<_, _>>()?;
                self.unique.push(columns);
            }
            // The mock database doesn't enforce foreign keys.
            ConstraintKind::ForeignKey { .. } => {}
        }
        Ok(())
    }

    /// Insert rows, returning the value of the `returning` column of each new row.
    fn insert(
        &mut self,
        columns: &[String],
        rows: Vec<Vec<Value>>,
        returning: Option<&str>,
    ) -> Result<Vec<Value>, Error> {
        let indices = columns
            .iter()
            .map(|col| self.index(col))
            .collect::<Result<Vec<_>, _>>()?;
        let returning = returning.map(|col| self.index(col)).transpose()?;

        let mut new_rows = self.rows.clone();
        let mut next_serial = self.next_serial;
        let mut returned = vec![];
        for values in rows {
            if values.len() != indices.len() {
                return Err(Error::from(format!(
                    "incorrect width for table {} (found {}, expected {})",
                    self.name,
                    values.len(),
                    indices.len()
                )));
            }

            let mut row = vec![Value::Null; self.columns.len()];
            for (i, value) in indices.iter().zip(values) {
                row[*i] = value;
            }

            // Auto-increment the serial columns which were not given explicitly.
            for (i, col) in self.columns.iter().enumerate() {
                if col.ty() != Type::Serial {
                    continue;
                }
                match row[i] {
                    Value::Null => {
                        row[i] = Value::Int8(next_serial);
                        next_serial += 1;
                    }
                    Value::Int8(x) => next_serial = next_serial.max(x + 1),
                    _ => {}
                }
            }

            if let Some(i) = returning {
                returned.push(row[i].clone());
            }
            new_rows.push(Row::new(row));
        }

        self.check_unique(&new_rows)?;
        self.rows = new_rows;
        self.next_serial = next_serial;
        Ok(returned)
    }

    /// Fail if `rows` would violate a primary key or unique constraint.
    fn check_unique(&self, rows: &[Row]) -> Result<(), Error> {
        for key in &self.unique {
            let mut seen = HashSet::new();
            for row in rows {
                let values = key.iter().map(|i| &row.columns[*i]).collect::<Vec<_>>();
                if values.iter().any(|v| v.is_null()) {
                    continue;
                }
                if !seen.insert(format!("{values:?}")) {
                    return Err(Error::from(format!(
                        "UNIQUE constraint failed: {}",
                        key.iter()
                            .map(|i| format!("{}.{}", self.name, self.columns[*i].name()))
                            .join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Db {
    fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::from(format!("no such table {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::from(format!("no such table {name}")))
    }

    /// Load all rows of `table`, joined with other tables according to `joins`.
    fn scan(
        &self,
        table: &str,
        alias: &str,
        joins: &[JoinClause],
    ) -> Result<(Schema, Vec<Vec<Value>>), Error> {
        let base = self.table(table)?;
        let mut schema = base.qualified_schema(alias);
        let mut rows = base
            .rows
            .iter()
            .map(|row| row.columns.clone())
            .collect::<Vec<_>>();

        for JoinClause {
            kind,
            table,
            alias,
            lhs,
            op,
            rhs,
        } in joins
        {
            tracing::info!("{kind} {table} AS {alias} ON {lhs} {op} {rhs}");
            let join_table = self.table(table)?;
            let width = join_table.columns.len();
            schema.extend(join_table.qualified_schema(alias));

            let mut joined = vec![];
            for left in rows {
                let mut matched = false;
                for right in &join_table.rows {
                    let mut row = left.clone();
                    row.extend(right.columns.iter().cloned());
                    let cond = compare(get(&schema, &row, lhs)?, op, get(&schema, &row, rhs)?)?;
                    if cond == Some(true) {
                        matched = true;
                        joined.push(row);
                    }
                }
                if !matched && *kind == JoinKind::Left {
                    let mut row = left;
                    row.extend(std::iter::repeat(Value::Null).take(width));
                    joined.push(row);
                }
            }
            rows = joined;
        }

        Ok((schema, rows))
    }

    /// Evaluate a `WHERE` clause on a row, using three-valued logic.
    ///
    /// [`None`] means the result is unknown, as when comparing against `NULL`.
    fn eval(&self, schema: &[Column], row: &[Value], clause: &WhereClause) -> Result<Option<bool>, Error> {
        Ok(match clause {
            WhereClause::All(clauses) => {
                let mut result = Some(true);
                for clause in clauses.iter() {
                    match self.eval(schema, row, clause)? {
                        Some(false) => return Ok(Some(false)),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            WhereClause::Any(clauses) => {
                let mut result = Some(false);
                for clause in clauses.iter() {
                    match self.eval(schema, row, clause)? {
                        Some(true) => return Ok(Some(true)),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            WhereClause::Not(clause) => self.eval(schema, row, clause)?.map(|b| !b),
            WhereClause::Predicate(b) => test(schema, row, b)?,
            WhereClause::Exists(subquery) => Some(self.exists(schema, row, subquery)?),
        })
    }

    /// Check if a correlated subquery has any results for the outer row `row`.
    fn exists(&self, schema: &[Column], row: &[Value], subquery: &Subquery) -> Result<bool, Error> {
        let Subquery {
            table,
            alias,
            joins,
            filter,
        } = subquery;
        let (mut inner_schema, inner_rows) = self.scan(table, alias, joins)?;

        // Columns of the subquery shadow columns of the enclosing query.
        inner_schema.extend(schema.iter().map(|col| {
            Column {
                table: col.table.as_ref().map(|t| Cow::Owned(t.to_string())),
                name: Cow::Owned(col.name.to_string()),
            }
        }));
        for mut inner in inner_rows {
            inner.extend(row.iter().cloned());
            if self.eval(&inner_schema, &inner, filter)? == Some(true) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Indices of the rows of `table` matching all of `filters`.
    fn matching(&self, table: &str, filters: &[WhereClause]) -> Result<Vec<usize>, Error> {
        let t = self.table(table)?;
        let schema = t.qualified_schema(table);
        let mut matches = vec![];
        for (i, row) in t.rows.iter().enumerate() {
            let mut keep = true;
            for filter in filters {
                if self.eval(&schema, &row.columns, filter)? != Some(true) {
                    keep = false;
                    break;
                }
            }
            if keep {
                matches.push(i);
            }
        }
        Ok(matches)
    }
}

/// Get the value of the named column.
fn get<'r>(schema: &[Column], row: &'r [Value], col: &Column) -> Result<&'r Value, Error> {
    let index = schema
        .iter()
        .position(|schema_col| {
            if let Some(table) = &col.table {
                // Every column in the schema is qualified, so if `col` is also qualified, we
                // want an exact match.
                schema_col.table.as_deref() == Some(&**table) && schema_col.name == col.name
            } else {
                // Otherwise find the first column whose name matches `col`.
                schema_col.name == col.name
            }
        })
        .ok_or_else(|| Error::from(format!("no such column {col}")))?;
    row.get(index)
        .ok_or_else(|| Error::from(format!("column index {index} out of range")))
}

/// Compare two values.
fn compare(lhs: &Value, op: &str, rhs: &Value) -> Result<Option<bool>, Error> {
    let Some(ord) = lhs.sql_cmp(rhs) else { return Ok(None); };
    Ok(Some(match op {
        "=" => ord == Ordering::Equal,
        "!=" | "<>" => ord != Ordering::Equal,
        "<" => ord == Ordering::Less,
        "<=" => ord != Ordering::Greater,
        ">" => ord == Ordering::Greater,
        ">=" => ord != Ordering::Less,
        op => return Err(Error::from(format!("unsupported comparison {op}"))),
    }))
}

/// Test if a row satisfies a boolean expression.
fn test(schema: &[Column], row: &[Value], b: &Boolean) -> Result<Option<bool>, Error> {
    match b {
        Boolean::Cmp { column, op, rhs } => {
            let lhs = get(schema, row, column)?;
            let rhs = match rhs {
                Operand::Param(param) => param,
                Operand::Column(col) => get(schema, row, col)?,
            };
            compare(lhs, op, rhs)
        }
        Boolean::OneOf { column, params } => {
            let value = get(schema, row, column)?;
            // Nothing is in an empty list, not even NULL.
            if params.is_empty() {
                return Ok(Some(false));
            }
            if value.is_null() {
                return Ok(None);
            }
            Ok(Some(
                params
                    .iter()
                    .any(|p| value.sql_cmp(p) == Some(Ordering::Equal)),
            ))
        }
        Boolean::IsNull { column } => Ok(Some(get(schema, row, column)?.is_null())),
        Boolean::Like {
            column,
            pattern,
            case_insensitive,
        } => match get(schema, row, column)? {
            Value::Null => Ok(None),
            Value::Text(text) => Ok(Some(if *case_insensitive {
                like(&text.to_lowercase(), &pattern.to_lowercase())
            } else {
                like(text, pattern)
            })),
            v => Err(Error::from(format!("cannot match pattern against {v}"))),
        },
        Boolean::Matches {
            column,
            query,
            plain,
        } => match get(schema, row, column)? {
            Value::Null => Ok(None),
            Value::Text(text) => Ok(Some(text_search(text, query, *plain))),
            v => Err(Error::from(format!("cannot search text in {v}"))),
        },
    }
}

/// Match `text` against a `LIKE` pattern.
fn like(text: &str, pattern: &str) -> bool {
    fn go(text: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('%', rest)) => (0..=text.len()).any(|i| go(&text[i..], rest)),
            Some(('_', rest)) => !text.is_empty() && go(&text[1..], rest),
            Some((c, rest)) => text.first() == Some(c) && go(&text[1..], rest),
        }
    }
    go(
        &text.chars().collect::<Vec<_>>(),
        &pattern.chars().collect::<Vec<_>>(),
    )
}

/// Lower-cased words in a document or query.
fn words(text: &str) -> impl '_ + Iterator<Item = String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// A crude full-text search.
fn text_search(text: &str, query: &str, plain: bool) -> bool {
    let document = words(text).collect::<HashSet<_>>();
    if plain {
        return words(query).all(|w| document.contains(&w));
    }
    query.split('|').any(|alternative| {
        alternative.split('&').all(|term| {
            let term = term.trim();
            let (negated, term) = match term.strip_prefix('!') {
                Some(term) => (true, term),
                None => (false, term),
            };
            let present = words(term).all(|w| document.contains(&w));
            present != negated
        })
    })
}

/// Compare two rows by a list of `ORDER BY` keys.
fn cmp_keys(l: &[Value], r: &[Value], order: &[OrderBy]) -> Ordering {
    for (i, OrderBy { descending, .. }) in order.iter().enumerate() {
        let ord = match (l[i].is_null(), r[i].is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => {
                let ord = l[i].sql_cmp(&r[i]).unwrap_or(Ordering::Equal);
                if *descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// A connection to the in-memory database.
#[derive(Debug)]
pub struct Connection {
    db: Arc<RwLock<Db>>,
    /// The state of the database when the current transaction began.
    savepoint: Arc<Mutex<Option<Db>>>,
}

impl Clone for Connection {
    /// Open a new session on the same database.
    ///
    /// The new session does not share the transaction state of this one.
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            savepoint: Default::default(),
        }
    }
}

impl Connection {
    /// Create a new database and connect to it.
    ///
    /// This will create a connection to a fresh, empty database. It will not be connected or
    /// related to any previous connection or database. Once the database is created, this
    /// connection can be [cloned](Clone) in order to create multiple simultaneous connections to
    /// the same database.
    pub fn create() -> Self {
        Self {
            db: Default::default(),
            savepoint: Default::default(),
        }
    }

    /// Create a table with the given columns and row values.
    ///
    /// Each row lists values for every column in the schema except the serial columns, which are
    /// assigned automatically.
    pub async fn create_table_with_rows(
        &self,
        table: impl Into<String>,
        columns: Vec<SchemaColumn<'static>>,
        rows: impl IntoIterator<Item = Vec<Value>>,
    ) -> Result<(), Error> {
        let table = table.into();
        let explicit = columns
            .iter()
            .filter(|col| col.ty() != Type::Serial)
            .map(|col| col.name().into_owned())
            .collect::<Vec<_>>();
        self.create_table_with_constraints(table.clone(), columns, vec![])
            .await?;

        let mut db = self.db.write().await;
        db.table_mut(&table)?
            .insert(&explicit, rows.into_iter().collect(), None)
            .map(|_| ())
    }

    async fn create_table_with_constraints(
        &self,
        table: String,
        columns: Vec<SchemaColumn<'static>>,
        constraints: Vec<(ConstraintKind, Vec<String>)>,
    ) -> Result<(), Error> {
        let mut db = self.db.write().await;
        if let Entry::Vacant(e) = db.tables.entry(table.clone()) {
            let mut t = Table::new(table, columns);
            for (kind, columns) in constraints {
                t.add_constraint(kind, columns)?;
            }
            e.insert(t);
        }
        Ok(())
    }

    /// The schema of this database.
    ///
    /// The schema maps table names to the schema for each table. Each table schema consists of a
    /// list of column schemas.
    pub async fn schema(&self) -> HashMap<String, Vec<SchemaColumn<'static>>> {
        self.db
            .read()
            .await
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.columns.clone()))
            .collect()
    }

    /// All the rows of a table, in insertion order.
    pub async fn rows(&self, table: &str) -> Result<Vec<Vec<Value>>, Error> {
        Ok(self
            .db
            .read()
            .await
            .table(table)?
            .rows
            .iter()
            .map(|row| row.columns.clone())
            .collect())
    }
}

#[async_trait]
impl super::Connection for Connection {
    type Error = Error;
    type CreateTable<'a> = CreateTable<'a>;
    type Select<'a> = Select<'a>;
    type Insert<'a> = Insert<'a>;
    type Update<'a> = Update<'a>;
    type Delete<'a> = Delete<'a>;

    fn create_table<'a>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: Vec<SchemaColumn<'a>>,
    ) -> Self::CreateTable<'a> {
        CreateTable {
            db: self,
            table: table.into(),
            columns,
            constraints: vec![],
        }
    }

    fn select<'a>(
        &'a self,
        select: &'a [SelectColumn<'a>],
        table: impl Into<Cow<'a, str>> + Send,
    ) -> Self::Select<'a> {
        Select {
            db: &self.db,
            table: table.into(),
            columns: select,
            joins: vec![],
            filters: vec![],
            order: vec![],
            offset: 0,
            limit: None,
        }
    }

    fn insert<'a, C>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: impl IntoIterator<Item = C>,
    ) -> Self::Insert<'a>
    where
        C: Into<String>,
    {
        Insert {
            db: &self.db,
            table: table.into(),
            columns: columns.into_iter().map(|c| c.into()).collect(),
            rows: vec![],
            returning: None,
        }
    }

    fn update<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Update<'a> {
        Update {
            db: &self.db,
            table: table.into(),
            assignments: vec![],
            filters: vec![],
        }
    }

    fn delete<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Delete<'a> {
        Delete {
            db: &self.db,
            table: table.into(),
            filters: vec![],
        }
    }

    async fn begin(&self) -> Result<(), Self::Error> {
        let mut savepoint = self.savepoint.lock().await;
        if savepoint.is_some() {
            return Err("transaction already in progress".into());
        }
        tracing::info!("BEGIN");
        *savepoint = Some(self.db.read().await.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), Self::Error> {
        tracing::info!("COMMIT");
        self.savepoint
            .lock()
            .await
            .take()
            .map(|_| ())
            .ok_or_else(|| "no transaction in progress".into())
    }

    async fn rollback(&self) -> Result<(), Self::Error> {
        tracing::info!("ROLLBACK");
        let snapshot = self
            .savepoint
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::from("no transaction in progress"))?;
        *self.db.write().await = snapshot;
        Ok(())
    }
}

/// A query against an in-memory database.
pub struct Select<'a> {
    db: &'a RwLock<Db>,
    table: Cow<'a, str>,
    columns: &'a [SelectColumn<'a>],
    joins: Vec<JoinClause<'a>>,
    filters: Vec<WhereClause<'a>>,
    order: Vec<OrderBy<'a>>,
    offset: usize,
    limit: Option<usize>,
}

impl<'a> super::Select<'a> for Select<'a> {
    type Error = Error;
    type Row = Row;
    type Stream = BoxStream<'a, Result<Self::Row, Self::Error>>;

    fn clause(mut self, clause: Clause<'a>) -> Self {
        match clause {
            Clause::Join(join) => self.joins.push(join),
            Clause::Where(filter) => self.filters.push(filter),
            Clause::OrderBy(order) => self.order.push(order),
        }
        self
    }

    fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn stream(self) -> Self::Stream {
        async move {
            let db = self.db.read().await;
            tracing::info!(
                "SELECT {} FROM {}",
                self.columns.iter().join(", "),
                self.table
            );
            let (schema, rows) = db.scan(&self.table, &self.table, &self.joins)?;

            let mut selected = vec![];
            for row in rows {
                let mut keep = true;
                for filter in &self.filters {
                    if db.eval(&schema, &row, filter)? != Some(true) {
                        keep = false;
                        break;
                    }
                }
                if keep {
                    selected.push(row);
                }
            }
            for filter in &self.filters {
                tracing::info!("WHERE {filter}");
            }

            if matches!(self.columns, [SelectColumn::Count]) {
                let count = Value::Int8(selected.len() as i64);
                return Ok(stream::iter(vec![Ok(Row::new(vec![count]))]));
            }

            if !self.order.is_empty() {
                for order in &self.order {
                    tracing::info!("{order}");
                }
                let mut keyed = selected
                    .into_iter()
                    .map(|row| {
                        let key = self
                            .order
                            .iter()
                            .map(|o| get(&schema, &row, &o.column).cloned())
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok((key, row))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                keyed.sort_by(|(l, _), (r, _)| cmp_keys(l, r, &self.order));
                selected = keyed.into_iter().map(|(_, row)| row).collect();
            }

            let rows = selected
                .into_iter()
                .skip(self.offset)
                .take(self.limit.unwrap_or(usize::MAX))
                .map(|row| select(&schema, row, self.columns))
                .collect::<Vec<_>>();
            Ok(stream::iter(rows))
        }
        .try_flatten_stream()
        .boxed()
    }
}

/// Create a new row with just the specified columns, in the specified order.
fn select(schema: &[Column], row: Vec<Value>, columns: &[SelectColumn]) -> Result<Row, Error> {
    let mut selected = vec![];
    for col in columns {
        match col {
            SelectColumn::All => return Ok(Row::new(row)),
            SelectColumn::Column(col) => selected.push(get(schema, &row, col)?.clone()),
            SelectColumn::Count => return Err("COUNT(*) must be selected alone".into()),
        }
    }
    Ok(Row::new(selected))
}

/// An insert statement for an in-memory database.
pub struct Insert<'a> {
    db: &'a RwLock<Db>,
    table: Cow<'a, str>,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    returning: Option<String>,
}

#[async_trait]
impl<'a> super::Insert for Insert<'a> {
    type Error = Error;

    fn rows<R>(mut self, rows: R) -> Self
    where
        R: IntoIterator<Item = Vec<Value>>,
    {
        self.rows.extend(rows);
        self
    }

    fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    async fn execute(self) -> Result<Vec<Value>, Error> {
        tracing::info!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            self.columns.join(", "),
            self.rows
                .iter()
                .map(|row| format!("({})", row.iter().join(", ")))
                .join(", ")
        );
        let mut db = self.db.write().await;
        db.table_mut(&self.table)?
            .insert(&self.columns, self.rows, self.returning.as_deref())
    }
}

/// An update statement for an in-memory database.
pub struct Update<'a> {
    db: &'a RwLock<Db>,
    table: Cow<'a, str>,
    assignments: Vec<(Cow<'a, str>, Value)>,
    filters: Vec<WhereClause<'a>>,
}

#[async_trait]
impl<'a> super::Update<'a> for Update<'a> {
    type Error = Error;

    fn set(mut self, column: impl Into<Cow<'a, str>>, value: Value) -> Self {
        self.assignments.push((column.into(), value));
        self
    }

    fn filter(mut self, clause: impl Into<WhereClause<'a>>) -> Self {
        self.filters.push(clause.into());
        self
    }

    async fn execute(self) -> Result<usize, Error> {
        tracing::info!(
            "UPDATE {} SET {} WHERE {}",
            self.table,
            self.assignments
                .iter()
                .map(|(col, val)| format!("{col} = {val}"))
                .join(", "),
            WhereClause::All(Box::new(self.filters.clone()))
        );
        let mut db = self.db.write().await;
        let matches = db.matching(&self.table, &self.filters)?;

        let table = db.table_mut(&self.table)?;
        let assignments = self
            .assignments
            .into_iter()
            .map(|(col, val)| Ok((table.index(&col)?, val)))
            .collect::<Result<Vec<_>, Error>>()?;
        let mut rows = table.rows.clone();
        for i in &matches {
            for (col, val) in &assignments {
                rows[*i].columns[*col] = val.clone();
            }
        }
        table.check_unique(&rows)?;
        table.rows = rows;
        Ok(matches.len())
    }
}

/// A delete statement for an in-memory database.
pub struct Delete<'a> {
    db: &'a RwLock<Db>,
    table: Cow<'a, str>,
    filters: Vec<WhereClause<'a>>,
}

#[async_trait]
impl<'a> super::Delete<'a> for Delete<'a> {
    type Error = Error;

    fn filter(mut self, clause: impl Into<WhereClause<'a>>) -> Self {
        self.filters.push(clause.into());
        self
    }

    async fn execute(self) -> Result<usize, Error> {
        tracing::info!(
            "DELETE FROM {} WHERE {}",
            self.table,
            WhereClause::All(Box::new(self.filters.clone()))
        );
        let mut db = self.db.write().await;
        let matches = db.matching(&self.table, &self.filters)?;
        let table = db.table_mut(&self.table)?;
        let mut i = 0;
        table.rows.retain(|_| {
            let keep = matches.binary_search(&i).is_err();
            i += 1;
            keep
        });
        Ok(matches.len())
    }
}

/// A create table statement for an in-memory database.
pub struct CreateTable<'a> {
    db: &'a Connection,
    table: Cow<'a, str>,
    columns: Vec<SchemaColumn<'a>>,
    constraints: Vec<(ConstraintKind, Vec<String>)>,
}

#[async_trait]
impl<'a> super::CreateTable for CreateTable<'a> {
    type Error = Error;

    fn constraint<I>(mut self, kind: ConstraintKind, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.constraints
            .push((kind, columns.into_iter().map(|c| c.into()).collect()));
        self
    }

    async fn execute(self) -> Result<(), Self::Error> {
        tracing::info!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            self.columns.iter().join(", ")
        );
        self.db
            .create_table_with_constraints(
                self.table.into_owned(),
                self.columns
                    .into_iter()
                    .map(|col| col.into_static())
                    .collect(),
                self.constraints,
            )
            .await
    }
}

/// A row in an in-memory table.
#[derive(Clone, Debug, Default)]
pub struct Row {
    columns: Vec<Value>,
}

impl Row {
    /// Create a row with the given entries.
    fn new(columns: Vec<Value>) -> Self {
        Self { columns }
    }
}

impl super::Row for Row {
    type Error = Error;

    fn column(&self, column: usize) -> Result<Value, Self::Error> {
        self.columns
            .get(column)
            .cloned()
            .ok_or_else(|| format!("column index {column} out of range").into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        init_logging,
        sql::db::{
            Connection as _, CreateTable as _, Delete as _, Insert as _, Row as _, Select as _,
            SelectExt, Update as _,
        },
    };

    async fn people() -> Connection {
        let db = Connection::create();
        db.create_table("people", vec![
            SchemaColumn::new("id", Type::Serial),
            SchemaColumn::new("name", Type::Text),
            SchemaColumn::new("age", Type::Int8),
        ])
        .constraint(ConstraintKind::PrimaryKey, ["id"])
        .constraint(ConstraintKind::Unique, ["name"])
        .execute()
        .await
        .unwrap();
        db.insert("people", ["name", "age"])
            .rows([
                vec![Value::from("alice"), Value::from(30)],
                vec![Value::from("bob"), Value::Null],
                vec![Value::from("carol"), Value::from(20)],
            ])
            .execute()
            .await
            .unwrap();
        db
    }

    fn ints(rows: &[Row]) -> Vec<Value> {
        rows.iter().map(|row| row.column(0).unwrap()).collect()
    }

    #[async_std::test]
    async fn test_filter_three_valued() {
        init_logging();
        let db = people().await;
        let columns = [SelectColumn::Column(Column::named("id"))];

        // NULL ages match neither the comparison nor its negation.
        let rows = db
            .select(&columns, "people")
            .cmp(Column::named("age"), ">", Value::from(25))
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(1)]);
        let rows = db
            .select(&columns, "people")
            .filter(WhereClause::not(Boolean::cmp(Column::named("age"), ">", 25)))
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(3)]);

        let rows = db
            .select(&columns, "people")
            .filter(Boolean::is_null(Column::named("age")))
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(2)]);

        // A NULL is in neither list, but only the empty list is known not to hold it.
        let rows = db
            .select(&columns, "people")
            .filter(WhereClause::not(Boolean::one_of(
                Column::named("age"),
                Vec::<Value>::new(),
            )))
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(1), Value::Int8(2), Value::Int8(3)]);
        let rows = db
            .select(&columns, "people")
            .filter(WhereClause::not(Boolean::one_of(Column::named("age"), [20])))
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(1)]);
    }

    #[async_std::test]
    async fn test_order_limit_offset() {
        init_logging();
        let db = people().await;
        let columns = [SelectColumn::Column(Column::named("id"))];

        let rows = db
            .select(&columns, "people")
            .order_by(Column::named("age"), true)
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(2), Value::Int8(1), Value::Int8(3)]);

        let rows = db
            .select(&columns, "people")
            .order_by(Column::named("name"), false)
            .offset(1)
            .limit(1)
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(2)]);

        let count = [SelectColumn::Count];
        let row = db.select(&count, "people").one().await.unwrap();
        assert_eq!(row.column(0).unwrap(), Value::Int8(3));
    }

    #[async_std::test]
    async fn test_left_join_and_exists() {
        init_logging();
        let db = people().await;
        db.create_table_with_rows(
            "pets",
            vec![
                SchemaColumn::new("id", Type::Serial),
                SchemaColumn::new("owner", Type::Int8),
            ],
            [vec![Value::from(1)], vec![Value::from(1)], vec![Value::from(3)]],
        )
        .await
        .unwrap();

        let columns = [
            SelectColumn::Column(Column::qualified("people", "id")),
            SelectColumn::Column(Column::qualified("p", "id")),
        ];
        let rows = db
            .select(&columns, "people")
            .join(
                JoinKind::Left,
                "pets",
                "p",
                Column::qualified("p", "owner"),
                Column::qualified("people", "id"),
            )
            .many()
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2].column(0).unwrap(), Value::Int8(2));
        assert_eq!(rows[2].column(1).unwrap(), Value::Null);

        // People with no pets.
        let columns = [SelectColumn::Column(Column::named("id"))];
        let rows = db
            .select(&columns, "people")
            .filter(WhereClause::not(Subquery {
                table: "pets".into(),
                alias: "p".into(),
                joins: vec![],
                filter: Boolean::cmp_columns(
                    Column::qualified("p", "owner"),
                    "=",
                    Column::qualified("people", "id"),
                )
                .into(),
            }))
            .many()
            .await
            .unwrap();
        assert_eq!(ints(&rows), [Value::Int8(2)]);
    }

    #[async_std::test]
    async fn test_patterns() {
        assert!(like("hello", "h%o"));
        assert!(like("hello", "_ello"));
        assert!(!like("hello", "h_o"));
        assert!(text_search("The quick brown fox", "quick fox", true));
        assert!(!text_search("The quick brown fox", "quick dog", true));
        assert!(text_search("The quick brown fox", "dog | fox & !cat", false));
        assert!(!text_search("The quick brown fox", "fox & !quick", false));
    }

    #[async_std::test]
    async fn test_unique_constraint() {
        init_logging();
        let db = people().await;

        let err = db
            .insert("people", ["name"])
            .rows([vec![Value::from("alice")]])
            .execute()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint failed: people.name"), "{err}");

        let err = db
            .update("people")
            .set("name", Value::from("alice"))
            .filter(Boolean::cmp(Column::named("id"), "=", 2))
            .execute()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE constraint failed"), "{err}");
        assert_eq!(db.rows("people").await.unwrap()[1][1], Value::from("bob"));
    }

    #[async_std::test]
    async fn test_insert_returning() {
        init_logging();
        let db = people().await;
        let ids = db
            .insert("people", ["name"])
            .rows([vec![Value::from("dave")], vec![Value::from("erin")]])
            .returning("id")
            .execute()
            .await
            .unwrap();
        assert_eq!(ids, [Value::Int8(4), Value::Int8(5)]);

        // Explicit values for serial columns advance the sequence.
        db.insert("people", ["id", "name"])
            .rows([vec![Value::from(10), Value::from("frank")]])
            .execute()
            .await
            .unwrap();
        let ids = db
            .insert("people", ["name"])
            .rows([vec![Value::from("gina")]])
            .returning("id")
            .execute()
            .await
            .unwrap();
        assert_eq!(ids, [Value::Int8(11)]);
    }

    #[async_std::test]
    async fn test_transactions() {
        init_logging();
        let db = people().await;

        db.begin().await.unwrap();
        assert!(db.begin().await.is_err());
        db.delete("people")
            .filter(Boolean::cmp(Column::named("name"), "=", "alice"))
            .execute()
            .await
            .unwrap();
        assert_eq!(db.rows("people").await.unwrap().len(), 2);
        db.rollback().await.unwrap();
        assert_eq!(db.rows("people").await.unwrap().len(), 3);

        db.begin().await.unwrap();
        let deleted = db
            .delete("people")
            .filter(Boolean::one_of(Column::named("id"), [1, 3]))
            .execute()
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        db.commit().await.unwrap();
        assert_eq!(db.rows("people").await.unwrap().len(), 1);
        assert!(db.commit().await.is_err());

        // A clone is a separate session.
        db.begin().await.unwrap();
        db.clone().begin().await.unwrap();
    }
}
