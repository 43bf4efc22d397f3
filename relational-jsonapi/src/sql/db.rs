//! Abstract interface to a SQL database.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use derive_more::{Display, From, TryInto};
use futures::{Stream, StreamExt, TryStreamExt};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

pub mod mock;

/// Errors returned by the database.
pub trait Error: Sized + Send + Sync + std::error::Error + 'static {
    /// Wrap a custom message into this error type.
    fn custom(msg: impl Display) -> Self;

    /// An error indicating that a query returned more than the `expected` number of rows.
    fn too_many_rows(expected: usize) -> Self {
        Self::custom(format!(
            "query result has more rows than the expected {expected}"
        ))
    }

    /// An error indicating that a query which was expected to return some rows did not.
    fn empty_rows() -> Self {
        Self::custom("query result is empty")
    }
}

/// A column in a list of columns selected from a query.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SelectColumn<'a> {
    /// A single named column.
    #[display(fmt = "{}", _0)]
    Column(Column<'a>),
    /// Select all columns.
    #[display(fmt = "*")]
    All,
    /// The number of rows matching the query.
    #[display(fmt = "COUNT(*)")]
    Count,
}

/// A column in a schema.
///
/// This describes the structure and format of each entry in the column, along with column-level
/// metadata like the name and constraints.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{name} {ty}")]
pub struct SchemaColumn<'a> {
    name: Cow<'a, str>,
    ty: Type,
}

impl<'a> SchemaColumn<'a> {
    /// Create a column given a name and type.
    pub fn new(name: impl Into<Cow<'a, str>>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// The name of this column
    pub fn name(&self) -> Cow<'a, str> {
        self.name.clone()
    }

    /// The type of this column
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// Remove the lifetime requirement from `self` by cloning and taking ownership of borrowed
    /// data.
    pub fn into_static(self) -> SchemaColumn<'static> {
        SchemaColumn {
            name: Cow::Owned(self.name.into_owned()),
            ty: self.ty,
        }
    }
}

/// A connection to the database.
///
/// A connection is also a session: transactions started with [`begin`](Self::begin) apply to
/// statements executed through this connection, and cloning a connection yields a new session on
/// the same database.
#[async_trait]
pub trait Connection: Clone + Send + Sync {
    /// Errors returned from queries.
    type Error: Error;

    /// A `CREATE TABLE` statement which can be executed against the database.
    type CreateTable<'a>: CreateTable<Error = Self::Error>
    where
        Self: 'a;

    /// A `SELECT` query which can be executed against the database.
    type Select<'a>: Select<'a, Error = Self::Error>
    where
        Self: 'a;

    /// An `INSERT` statement which can be executed against the database.
    type Insert<'a>: Insert<Error = Self::Error>
    where
        Self: 'a;

    /// An `UPDATE` statement which can be executed against the database.
    type Update<'a>: Update<'a, Error = Self::Error>
    where
        Self: 'a;

    /// A `DELETE` statement which can be executed against the database.
    type Delete<'a>: Delete<'a, Error = Self::Error>
    where
        Self: 'a;

    /// Start a `CREATE TABLE` statement.
    ///
    /// `table` and `columns` describe the name and the basic structure of the table. More
    /// fine-grained control over the table (such as adding constraints) is available via the
    /// methods on the [`CreateTable`] object.
    fn create_table<'a>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: Vec<SchemaColumn<'a>>,
    ) -> Self::CreateTable<'a>;

    /// Start a `SELECT` query.
    ///
    /// `columns` indicates the columns to include in the query results. The resulting [`Select`]
    /// represents a statement of the form `SELECT columns FROM table`. The query can be refined,
    /// for example by adding a `WHERE` clause, using the approriate methods on the [`Select`]
    /// object before running it.
    fn select<'a>(
        &'a self,
        columns: &'a [SelectColumn<'a>],
        table: impl Into<Cow<'a, str>> + Send,
    ) -> Self::Select<'a>;

    /// Start an `INSERT` query.
    ///
    /// `table` indicates the table to insert into and `columns` the names of the columns in that
    /// table into which values should be inserted. Columns which are not listed get their default
    /// value: the next value of the sequence for serial columns, `NULL` for all others.
    fn insert<'a, C>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: impl IntoIterator<Item = C>,
    ) -> Self::Insert<'a>
    where
        C: Into<String>;

    /// Start an `UPDATE` statement.
    ///
    /// `table indicates the table to update. You can set the values of columns and refine the
    /// statement with a `WHERE` clause and such using the methods on the [`Update`] object.
    fn update<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Update<'a>;

    /// Start a `DELETE` statement.
    fn delete<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Delete<'a>;

    /// Start a transaction in this session.
    ///
    /// # Errors
    ///
    /// Fails if a transaction is already in progress.
    async fn begin(&self) -> Result<(), Self::Error>;

    /// Make the changes from the current transaction permanent.
    async fn commit(&self) -> Result<(), Self::Error>;

    /// Discard all changes made since the current transaction began.
    async fn rollback(&self) -> Result<(), Self::Error>;
}

/// A SQL primitive data type.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    #[display(fmt = "bool")]
    Bool,
    #[display(fmt = "int8")]
    Int8,
    #[display(fmt = "float8")]
    Float8,
    #[display(fmt = "text")]
    Text,
    #[display(fmt = "date")]
    Date,
    #[display(fmt = "timestamp")]
    Timestamp,
    #[display(fmt = "time")]
    Time,
    #[display(fmt = "interval")]
    Interval,
    #[display(fmt = "serial")]
    Serial,
}

/// A primitive value supported by a SQL database.
#[derive(Clone, Debug, Display, PartialEq, From)]
pub enum Value {
    #[display(fmt = "NULL")]
    #[from(ignore)]
    Null,
    #[display(fmt = "{}", _0)]
    Bool(bool),
    /// An 8-byte signed integer.
    #[display(fmt = "{}", _0)]
    Int8(i64),
    /// An 8-byte float.
    #[display(fmt = "{}", _0)]
    Float8(f64),
    /// A text string.
    #[display(fmt = "'{}'", _0)]
    Text(String),
    #[display(fmt = "'{}'", _0)]
    Date(NaiveDate),
    #[display(fmt = "'{}'", _0)]
    Timestamp(NaiveDateTime),
    #[display(fmt = "'{}'", _0)]
    Time(NaiveTime),
    #[display(fmt = "'{}'", _0)]
    Interval(TimeDelta),
}

impl Value {
    pub fn ty(&self) -> Option<Type> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(Type::Bool),
            Self::Int8(_) => Some(Type::Int8),
            Self::Float8(_) => Some(Type::Float8),
            Self::Text(_) => Some(Type::Text),
            Self::Date(_) => Some(Type::Date),
            Self::Timestamp(_) => Some(Type::Timestamp),
            Self::Time(_) => Some(Type::Time),
            Self::Interval(_) => Some(Type::Interval),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Compare two values using SQL semantics.
    ///
    /// The result is [`None`] (unknown) if either value is `NULL` or the types are incompatible.
    pub fn sql_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(l), Self::Bool(r)) => Some(l.cmp(r)),
            (Self::Int8(l), Self::Int8(r)) => Some(l.cmp(r)),
            (Self::Float8(l), Self::Float8(r)) => l.partial_cmp(r),
            (Self::Int8(l), Self::Float8(r)) => (*l as f64).partial_cmp(r),
            (Self::Float8(l), Self::Int8(r)) => l.partial_cmp(&(*r as f64)),
            (Self::Text(l), Self::Text(r)) => Some(l.cmp(r)),
            (Self::Date(l), Self::Date(r)) => Some(l.cmp(r)),
            (Self::Timestamp(l), Self::Timestamp(r)) => Some(l.cmp(r)),
            (Self::Time(l), Self::Time(r)) => Some(l.cmp(r)),
            (Self::Interval(l), Self::Interval(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.into())
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Self {
        Self::Int8(x.into())
    }
}

/// An identifier of a column in a SQL query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column<'a> {
    pub(crate) table: Option<Cow<'a, str>>,
    pub(crate) name: Cow<'a, str>,
}

impl<'a> Column<'a> {
    /// A named column.
    pub fn named(name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            name: name.into(),
            table: None,
        }
    }

    /// A named column, qualified by a table name.
    pub fn qualified(table: impl Into<Cow<'a, str>>, name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Escape this column name for interpolation into a SQL query.
    pub fn escape(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", escape_ident(table), escape_ident(&self.name)),
            None => escape_ident(&self.name),
        }
    }
}

impl<'a> Display for Column<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{table}.")?;
        }
        write!(f, "{}", self.name)
    }
}

impl<'a> From<Cow<'a, str>> for Column<'a> {
    fn from(name: Cow<'a, str>) -> Self {
        Self::named(name)
    }
}

impl<'a> From<&'a str> for Column<'a> {
    fn from(name: &'a str) -> Self {
        Self::named(name)
    }
}

impl<'a> From<String> for Column<'a> {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

/// A clause modifying a SQL statement.
#[derive(Clone, Debug, PartialEq, From, TryInto)]
pub enum Clause<'a> {
    /// A `WHERE` clause.
    Where(WhereClause<'a>),
    /// A `JOIN` clause.
    Join(JoinClause<'a>),
    /// An `ORDER BY` clause.
    OrderBy(OrderBy<'a>),
}

/// A `WHERE` clause.
#[derive(Clone, Debug, PartialEq)]
pub enum WhereClause<'a> {
    /// A `WHERE` clause which holds on any row where all of the sub-clauses hold.
    ///
    /// With no sub-clauses this always holds.
    All(Box<Vec<WhereClause<'a>>>),
    /// A `WHERE` clause which holds on any row where any of the sub-clauses hold.
    ///
    /// With no sub-clauses this never holds.
    Any(Box<Vec<WhereClause<'a>>>),
    /// A `WHERE` clause which holds on any row where the sub-clause does not.
    Not(Box<WhereClause<'a>>),
    /// A `WHERE` clause which holds on any row where a boolean expression is true.
    Predicate(Boolean<'a>),
    /// A `WHERE EXISTS` clause which holds on any row for which a correlated subquery is not
    /// empty.
    Exists(Box<Subquery<'a>>),
}

impl<'a> From<Boolean<'a>> for WhereClause<'a> {
    fn from(b: Boolean<'a>) -> Self {
        Self::Predicate(b)
    }
}

impl<'a> From<Subquery<'a>> for WhereClause<'a> {
    fn from(q: Subquery<'a>) -> Self {
        Self::Exists(Box::new(q))
    }
}

impl<'a> WhereClause<'a> {
    /// A `WHERE` clause which holds on any row where all of the sub-clauses hold.
    pub fn all<I>(clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<WhereClause<'a>>,
    {
        let mut clauses = clauses
            .into_iter()
            .map(|clause| clause.into())
            .collect::<Vec<_>>();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::All(Box::new(clauses))
        }
    }

    /// A `WHERE` clause which holds on any row where any of the sub-clauses hold.
    pub fn any<I>(clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<WhereClause<'a>>,
    {
        let mut clauses = clauses
            .into_iter()
            .map(|clause| clause.into())
            .collect::<Vec<_>>();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::Any(Box::new(clauses))
        }
    }

    /// A `WHERE` clause which holds on any row where `clause` does not.
    pub fn not(clause: impl Into<WhereClause<'a>>) -> Self {
        Self::Not(Box::new(clause.into()))
    }
}

impl<'a> Display for WhereClause<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::All(clauses) if clauses.is_empty() => write!(f, "TRUE"),
            Self::Any(clauses) if clauses.is_empty() => write!(f, "FALSE"),
            Self::All(clauses) => write!(f, "({})", join_display(clauses.iter(), " AND ")),
            Self::Any(clauses) => write!(f, "({})", join_display(clauses.iter(), " OR ")),
            Self::Not(clause) => write!(f, "NOT {clause}"),
            Self::Predicate(b) => write!(f, "{b}"),
            Self::Exists(q) => write!(f, "EXISTS ({q})"),
        }
    }
}

/// The right-hand side of a comparison.
#[derive(Clone, Debug, Display, PartialEq, From)]
pub enum Operand<'a> {
    /// A literal parameter.
    #[display(fmt = "{}", _0)]
    Param(Value),
    /// Another column from the same row.
    #[display(fmt = "{}", _0)]
    Column(Column<'a>),
}

/// A boolean expression in a `WHERE` clause.
#[derive(Clone, Debug, PartialEq)]
pub enum Boolean<'a> {
    Cmp {
        /// The column to filter.
        column: Column<'a>,
        /// The operation used to filter values of `column`.
        op: Cow<'a, str>,
        /// Parameter to `op`.
        rhs: Operand<'a>,
    },
    OneOf {
        /// The column to filter.
        column: Column<'a>,
        /// Values to match `column` against.
        params: Vec<Value>,
    },
    IsNull { column: Column<'a> },
    Like {
        column: Column<'a>,
        pattern: String,
        case_insensitive: bool,
    },
    /// Full-text search.
    ///
    /// If `plain` is set, `query` is a list of words which must all appear. Otherwise it is a
    /// `tsquery` expression, where terms are combined with `&`, `|` and `!`.
    Matches {
        column: Column<'a>,
        query: String,
        plain: bool,
    },
}

impl<'a> Display for Boolean<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Cmp { column, op, rhs } => write!(f, "{column} {op} {rhs}"),
            Self::OneOf { column, params } => {
                write!(f, "{column} IN ({})", join_display(params.iter(), ", "))
            }
            Self::IsNull { column } => write!(f, "{column} IS NULL"),
            Self::Like {
                column,
                pattern,
                case_insensitive,
            } => {
                let op = if *case_insensitive { "ILIKE" } else { "LIKE" };
                write!(f, "{column} {op} '{pattern}'")
            }
            Self::Matches {
                column,
                query,
                plain,
            } => {
                let func = if *plain { "plainto_tsquery" } else { "to_tsquery" };
                write!(f, "{column} @@ {func}('{query}')")
            }
        }
    }
}

impl<'a> Boolean<'a> {
    /// A boolean expression which compares the value of a column to a constant.
    pub fn cmp(
        column: impl Into<Column<'a>>,
        op: impl Into<Cow<'a, str>>,
        param: impl Into<Value>,
    ) -> Self {
        Self::Cmp {
            column: column.into(),
            op: op.into(),
            rhs: Operand::Param(param.into()),
        }
    }

    /// A boolean expression which compares the values of two columns.
    pub fn cmp_columns(
        lhs: impl Into<Column<'a>>,
        op: impl Into<Cow<'a, str>>,
        rhs: impl Into<Column<'a>>,
    ) -> Self {
        Self::Cmp {
            column: lhs.into(),
            op: op.into(),
            rhs: Operand::Column(rhs.into()),
        }
    }

    /// A boolean expression which checks if the value of a column is one of a list of constants.
    pub fn one_of<I>(column: impl Into<Column<'a>>, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self::OneOf {
            column: column.into(),
            params: params.into_iter().map(|p| p.into()).collect(),
        }
    }

    /// A boolean expression which checks if a column is `NULL`.
    pub fn is_null(column: impl Into<Column<'a>>) -> Self {
        Self::IsNull {
            column: column.into(),
        }
    }
}

/// A correlated subquery `SELECT * FROM table AS alias joins WHERE filter`.
///
/// Columns of the enclosing query can be referenced in `joins` and `filter`.
#[derive(Clone, Debug, PartialEq)]
pub struct Subquery<'a> {
    pub table: Cow<'a, str>,
    pub alias: Cow<'a, str>,
    pub joins: Vec<JoinClause<'a>>,
    pub filter: WhereClause<'a>,
}

impl<'a> Display for Subquery<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "SELECT * FROM {} AS {}", self.table, self.alias)?;
        for join in &self.joins {
            write!(f, " {join}")?;
        }
        write!(f, " WHERE {}", self.filter)
    }
}

/// The kind of a `JOIN`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JoinKind {
    /// Keep only rows with a match in the joined table.
    #[display(fmt = "JOIN")]
    Inner,
    /// Keep every row, filling the joined columns with `NULL` when there is no match.
    #[display(fmt = "LEFT JOIN")]
    Left,
}

/// A `JOIN` clause.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{kind} {table} AS {alias} ON {lhs} {op} {rhs}")]
pub struct JoinClause<'a> {
    pub kind: JoinKind,
    /// The table to join with.
    pub table: Cow<'a, str>,
    /// The name by which columns of the joined table are qualified.
    pub alias: Cow<'a, str>,
    /// The LHS in the join condition.
    pub lhs: Column<'a>,
    /// The operation in the join condition.
    pub op: Cow<'a, str>,
    /// The RHS in the join condition.
    pub rhs: Column<'a>,
}

/// An `ORDER BY` clause.
///
/// `NULL` sorts before every other value, regardless of the direction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderBy<'a> {
    pub column: Column<'a>,
    pub descending: bool,
}

impl<'a> Display for OrderBy<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let dir = if self.descending { "DESC" } else { "ASC" };
        write!(f, "ORDER BY {} {dir}", self.column)
    }
}

/// A constraint on a set of columns in a table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey { table: String },
}

/// A `CREATE TABLE` statement which can be executed against the database.
#[async_trait]
pub trait CreateTable: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Add a constraint to the table.
    fn constraint<I>(self, kind: ConstraintKind, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>;

    /// Create the table.
    ///
    /// This will execute a statement of the form
    /// `CREATE TABLE IF NOT EXISTS table (columns constraints)`.
    ///
    /// # Errors
    ///
    /// This method will fail if any of the specified constraints were invalid.
    async fn execute(self) -> Result<(), Self::Error>;
}

/// An extension trait for [`CreateTable`] that provides some higher-level functions.
pub trait CreateTableExt: CreateTable {
    /// Add a list of constraints to the table.
    fn constraints<I, C>(self, constraints: I) -> Self
    where
        I: IntoIterator<Item = (ConstraintKind, C)>,
        C: IntoIterator,
        C::Item: Into<String>;
}

impl<T: CreateTable> CreateTableExt for T {
    fn constraints<I, C>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = (ConstraintKind, C)>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        for (kind, columns) in constraints {
            self = self.constraint(kind, columns);
        }
        self
    }
}

/// A `SELECT` query which can be executed against the database.
pub trait Select<'a>: Send {
    /// Errors returned by this query.
    type Error: Error;
    /// Rows returned by this query.
    type Row: Row<Error = Self::Error>;
    /// An asynchronous stream of rows.
    type Stream: Stream<Item = Result<Self::Row, Self::Error>> + Unpin + Send;

    /// Add a clause to the query.
    fn clause(self, clause: Clause<'a>) -> Self;

    /// Skip the first `offset` rows of the results.
    fn offset(self, offset: usize) -> Self;

    /// Return at most `limit` rows.
    fn limit(self, limit: usize) -> Self;

    /// Run the query and get a stream of results.
    fn stream(self) -> Self::Stream;
}

/// An extension trait for [`Select`] that provides some higher-level functions.
#[async_trait]
pub trait SelectExt<'a>: Select<'a> {
    /// Add a `WHERE` clause to the query.
    fn filter(self, clause: impl Into<WhereClause<'a>>) -> Self;

    /// Add a `WHERE` clause based on a column comparison.
    fn cmp(self, column: impl Into<Column<'a>>, op: impl Into<Cow<'a, str>>, param: Value) -> Self;

    /// Add a `WHERE` clause based on an `IN` operator.
    fn one_of(self, column: impl Into<Column<'a>>, params: impl IntoIterator<Item = Value>)
        -> Self;

    /// Add a `JOIN` clause to the query.
    fn join(
        self,
        kind: JoinKind,
        table: impl Into<Cow<'a, str>>,
        alias: impl Into<Cow<'a, str>>,
        lhs: impl Into<Column<'a>>,
        rhs: impl Into<Column<'a>>,
    ) -> Self;

    /// Add an `ORDER BY` clause to the query.
    ///
    /// Rows are sorted by the first `ORDER BY` clause, with ties broken by subsequent ones.
    fn order_by(self, column: impl Into<Column<'a>>, descending: bool) -> Self;

    /// Add multiple clauses to the query.
    fn clauses<I>(self, clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Clause<'a>>;

    /// Run a query which is expected to return a single row.
    ///
    /// # Errors
    ///
    /// This method will fail if the query does not return exactly one row.
    async fn one(self) -> Result<Self::Row, Self::Error>;

    /// Run a query and collect the results.
    async fn many(self) -> Result<Vec<Self::Row>, Self::Error>;

    /// Run a query which is expected to return either 0 or 1 rows.
    ///
    /// # Errors
    ///
    /// This method will fail if the query does not return exactly 0 or 1 rows.
    async fn opt(self) -> Result<Option<Self::Row>, Self::Error>;
}

#[async_trait]
impl<'a, T: Select<'a>> SelectExt<'a> for T {
    fn filter(self, clause: impl Into<WhereClause<'a>>) -> Self {
        self.clause(clause.into().into())
    }

    fn cmp(self, column: impl Into<Column<'a>>, op: impl Into<Cow<'a, str>>, param: Value) -> Self {
        self.filter(Boolean::cmp(column, op, param))
    }

    fn one_of(
        self,
        column: impl Into<Column<'a>>,
        params: impl IntoIterator<Item = Value>,
    ) -> Self {
        self.filter(Boolean::OneOf {
            column: column.into(),
            params: params.into_iter().collect(),
        })
    }

    fn join(
        self,
        kind: JoinKind,
        table: impl Into<Cow<'a, str>>,
        alias: impl Into<Cow<'a, str>>,
        lhs: impl Into<Column<'a>>,
        rhs: impl Into<Column<'a>>,
    ) -> Self {
        self.clause(Clause::Join(JoinClause {
            kind,
            table: table.into(),
            alias: alias.into(),
            lhs: lhs.into(),
            op: "=".into(),
            rhs: rhs.into(),
        }))
    }

    fn order_by(self, column: impl Into<Column<'a>>, descending: bool) -> Self {
        self.clause(Clause::OrderBy(OrderBy {
            column: column.into(),
            descending,
        }))
    }

    fn clauses<I>(mut self, clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Clause<'a>>,
    {
        for clause in clauses {
            self = self.clause(clause.into());
        }
        self
    }

    async fn opt(self) -> Result<Option<Self::Row>, Self::Error> {
        let mut rows = self.stream();
        let Some(row) = rows.next().await else { return Ok(None); };
        if rows.next().await.is_some() {
            return Err(Self::Error::too_many_rows(1));
        }
        row.map(Some)
    }

    async fn one(self) -> Result<Self::Row, Self::Error> {
        self.opt().await?.ok_or_else(Self::Error::empty_rows)
    }

    async fn many(self) -> Result<Vec<Self::Row>, Self::Error> {
        self.stream().try_collect().await
    }
}

/// An `INSERT` statement which can be executed against the database.
#[async_trait]
pub trait Insert: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Add rows to insert.
    ///
    /// Each row must have one value for each column named when the statement was created.
    fn rows<R>(self, rows: R) -> Self
    where
        R: IntoIterator<Item = Vec<Value>>;

    /// Report the value of `column` in each inserted row.
    fn returning(self, column: impl Into<String>) -> Self;

    /// Do the insertion.
    ///
    /// This will execute a statement of the form
    /// `INSERT INTO table (columns) VALUES (rows) RETURNING column`, and yield the values of the
    /// `RETURNING` column, if there is one.
    ///
    /// # Errors
    ///
    /// This method will fail if any of the items in `rows` conflict with an existing row in `table`
    /// at a column which is defined as a unique or primary key.
    async fn execute(self) -> Result<Vec<Value>, Self::Error>;
}

/// An `UPDATE` statement which can be executed against the database.
#[async_trait]
pub trait Update<'a>: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Set the value of a column in the affected rows.
    fn set(self, column: impl Into<Cow<'a, str>>, value: Value) -> Self;

    /// Add a `WHERE` clause to the statement.
    ///
    /// The statement will only apply to rows where all of the filters hold.
    fn filter(self, clause: impl Into<WhereClause<'a>>) -> Self;

    /// Do the update.
    ///
    /// This will execute a statement of the form `UPDATE table SET column = value WHERE filter`
    /// and yield the number of rows updated.
    ///
    /// # Errors
    ///
    /// This method will fail if the new values conflict with another row at a column which is
    /// defined as a unique or primary key.
    async fn execute(self) -> Result<usize, Self::Error>;
}

/// A `DELETE` statement which can be executed against the database.
#[async_trait]
pub trait Delete<'a>: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Add a `WHERE` clause to the statement.
    fn filter(self, clause: impl Into<WhereClause<'a>>) -> Self;

    /// Delete matching rows, yielding the number of rows deleted.
    async fn execute(self) -> Result<usize, Self::Error>;
}

/// A row in a database table.
pub trait Row: Sized + Send {
    /// Errors returned by row operations.
    type Error: Error;

    /// Get the value of `column` in this row.
    ///
    /// `column` is an index corresponding to the order in which columns were requested in the
    /// `SELECT` statement.
    ///
    /// # Errors
    ///
    /// This method will fail if the specified column does not exist.
    fn column(&self, column: usize) -> Result<Value, Self::Error>;
}

/// Escape an identifier (table name, column name, etc.) for inclusion in a SQL query.
pub fn escape_ident(s: impl AsRef<str>) -> String {
    format!("\"{}\"", s.as_ref().replace('"', "\"\""))
}

fn join_display<T: Display>(items: impl Iterator<Item = T>, sep: &str) -> String {
    items.map(|item| item.to_string()).collect::<Vec<_>>().join(sep)
}
