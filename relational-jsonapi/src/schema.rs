//! Description of the entity types exposed through the API.
//!
//! A [`Schema`] is built once, when the API is set up, and is shared read-only by every request
//! after that. It describes, for each entity type, the fields which become the attributes of a
//! resource and the relationships which link it to other resources. Both directions of a
//! relationship are declared independently: if `article` has a to-one `author` relationship to
//! `person`, and `person` should expose the inverse `articles` relationship, `person` must declare
//! it too.
//!
//! The schema also carries a minimal amount of storage information (table names, foreign key
//! columns and join tables) so that backends can locate the data behind each relationship without
//! any further configuration.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use derive_more::{Display, From};
use serde::Serialize;
use serde_json::{Number, Value as Json};
use snafu::Snafu;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Formatter};

/// Errors detected while building a [`Schema`].
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum SchemaError {
    #[snafu(display("entity type {ty} is defined more than once"))]
    DuplicateType { ty: String },

    #[snafu(display("entity type {ty} has more than one member named {name}"))]
    DuplicateMember { ty: String, name: String },

    #[snafu(display("primary key of {ty} names unknown field {field}"))]
    UnknownPrimaryKey { ty: String, field: String },

    #[snafu(display("relationship {ty}.{relationship} targets unknown type {target}"))]
    UnknownTarget {
        ty: String,
        relationship: String,
        target: String,
    },
}

/// The semantic type of a field.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum FieldType {
    #[display(fmt = "string")]
    String,
    #[display(fmt = "int")]
    Int,
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "bool")]
    Bool,
    #[display(fmt = "date")]
    Date,
    #[display(fmt = "datetime")]
    DateTime,
    #[display(fmt = "time")]
    Time,
    /// A time interval, exchanged with clients as a number of seconds.
    #[display(fmt = "duration")]
    Duration,
    /// One of a fixed set of labels.
    #[display(fmt = "enum")]
    Enum(Vec<String>),
}

impl FieldType {
    /// An enumeration with the given labels.
    pub fn enumeration<I>(labels: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::Enum(labels.into_iter().map(|l| l.into()).collect())
    }

    /// Is this one of the date and time types?
    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Date | Self::DateTime | Self::Time)
    }
}

/// A field of an entity type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    name: String,
    ty: FieldType,
    unique: bool,
}

impl Field {
    /// A field with a given name and type.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            unique: false,
        }
    }

    /// Require values of this field to be unique across all instances.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &FieldType {
        &self.ty
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

/// The number of resources a relationship can link to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Cardinality {
    #[display(fmt = "to-one")]
    ToOne,
    #[display(fmt = "to-many")]
    ToMany,
}

/// Where the linkage of a relationship is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Storage {
    /// A column on the owner's table holding the ID of the target.
    OwnerKey { column: String },
    /// A column on the target's table holding the ID of the owner.
    TargetKey { column: String },
    /// A separate table pairing owner IDs with target IDs.
    JoinTable {
        table: String,
        owner_column: String,
        target_column: String,
    },
}

impl Storage {
    pub fn owner_key(column: impl Into<String>) -> Self {
        Self::OwnerKey {
            column: column.into(),
        }
    }

    pub fn target_key(column: impl Into<String>) -> Self {
        Self::TargetKey {
            column: column.into(),
        }
    }

    pub fn join_table(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self::JoinTable {
            table: table.into(),
            owner_column: owner_column.into(),
            target_column: target_column.into(),
        }
    }
}

/// A named link from one entity type to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    name: String,
    cardinality: Cardinality,
    target: String,
    nullable: bool,
    storage: Storage,
}

impl Relationship {
    /// A relationship linking each owner to at most one target.
    pub fn to_one(name: impl Into<String>, target: impl Into<String>, storage: Storage) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::ToOne,
            target: target.into(),
            nullable: true,
            storage,
        }
    }

    /// A relationship linking each owner to any number of targets.
    pub fn to_many(name: impl Into<String>, target: impl Into<String>, storage: Storage) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::ToMany,
            target: target.into(),
            nullable: false,
            storage,
        }
    }

    /// Forbid clearing a to-one relationship.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }

    /// The name of the entity type this relationship links to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

/// A named collection of resources sharing the same fields and relationships.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityType {
    name: String,
    table: Option<String>,
    // The first field is always the ID field.
    fields: Vec<Field>,
    relationships: Vec<Relationship>,
    primary_key: Vec<String>,
}

impl EntityType {
    /// An entity type whose resources are identified by the field `id`.
    pub fn new(name: impl Into<String>, id: Field) -> Self {
        let primary_key = vec![id.name.clone()];
        Self {
            name: name.into(),
            table: None,
            fields: vec![id],
            relationships: vec![],
            primary_key,
        }
    }

    /// Store this entity in a specific table, rather than one named after the type.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Add a field.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a relationship.
    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Extend the primary key with another field, after the ID field.
    pub fn primary_key_field(mut self, field: impl Into<String>) -> Self {
        self.primary_key.push(field.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table name given explicitly with [`table`](Self::table), if any.
    pub fn table_name(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The field whose value is the `id` of each resource.
    pub fn id_field(&self) -> &Field {
        &self.fields[0]
    }

    /// Fields rendered as attributes (every field except the ID).
    pub fn attributes(&self) -> &[Field] {
        &self.fields[1..]
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn get_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Parse an ID from a URL or a linkage object into a value of the ID field's type.
    pub fn parse_id(&self, id: &str) -> Option<Value> {
        Value::parse(self.id_field().ty(), id)
    }
}

/// The registered entity types.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    types: BTreeMap<String, EntityType>,
}

impl Schema {
    /// Build a schema from a list of entity types.
    ///
    /// # Errors
    ///
    /// Fails if a type is defined twice, a type reuses a name for two of its fields or
    /// relationships, a primary key names a field which does not exist, or a relationship targets
    /// a type which is not in the list.
    pub fn new<I>(types: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = EntityType>,
    {
        let mut schema = Self::default();
        for ty in types {
            if schema.types.contains_key(&ty.name) {
                return Err(SchemaError::DuplicateType { ty: ty.name });
            }
            let mut names = HashSet::new();
            for name in ty
                .fields
                .iter()
                .map(|f| &f.name)
                .chain(ty.relationships.iter().map(|r| &r.name))
            {
                if !names.insert(name) {
                    return Err(SchemaError::DuplicateMember {
                        ty: ty.name.clone(),
                        name: name.clone(),
                    });
                }
            }
            if let Some(field) = ty.primary_key.iter().find(|f| ty.get_field(f).is_none()) {
                return Err(SchemaError::UnknownPrimaryKey {
                    ty: ty.name.clone(),
                    field: field.clone(),
                });
            }
            schema.types.insert(ty.name.clone(), ty);
        }

        for ty in schema.types.values() {
            for rel in &ty.relationships {
                if !schema.types.contains_key(&rel.target) {
                    return Err(SchemaError::UnknownTarget {
                        ty: ty.name.clone(),
                        relationship: rel.name.clone(),
                        target: rel.target.clone(),
                    });
                }
            }
        }

        Ok(schema)
    }

    /// Look up an entity type by name.
    pub fn entity(&self, ty: &str) -> Option<&EntityType> {
        self.types.get(ty)
    }

    /// All of the registered entity types, ordered by name.
    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.types.values()
    }

    pub fn fields_of(&self, ty: &str) -> Option<&[Field]> {
        self.entity(ty).map(EntityType::fields)
    }

    pub fn relationships_of(&self, ty: &str) -> Option<&[Relationship]> {
        self.entity(ty).map(EntityType::relationships)
    }

    /// The type of resource linked to by the relationship `relationship` of `ty`.
    pub fn target_type_of(&self, ty: &str, relationship: &str) -> Option<&EntityType> {
        let rel = self.entity(ty)?.get_relationship(relationship)?;
        self.entity(&rel.target)
    }

    pub fn primary_key_fields_of(&self, ty: &str) -> Option<Vec<&Field>> {
        let entity = self.entity(ty)?;
        entity
            .primary_key
            .iter()
            .map(|name| entity.get_field(name))
            .collect()
    }
}

/// The value of a field in a particular instance.
#[derive(Clone, Debug, PartialEq, From)]
pub enum Value {
    #[from(ignore)]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Duration(TimeDelta),
    /// The label of an enumeration.
    #[from(ignore)]
    Enum(String),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.into())
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Self {
        Self::Int(x.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Parse a string into a value of type `ty`.
    pub fn parse(ty: &FieldType, s: &str) -> Option<Self> {
        match ty {
            FieldType::String => Some(Self::String(s.into())),
            FieldType::Int => s.parse().ok().map(Self::Int),
            FieldType::Float => s.parse().ok().map(Self::Float),
            FieldType::Bool => s.parse().ok().map(Self::Bool),
            FieldType::Date => parse_date(s).map(Self::Date),
            FieldType::DateTime => parse_datetime(s).map(Self::DateTime),
            FieldType::Time => parse_time(s).map(Self::Time),
            FieldType::Duration => s
                .parse::<f64>()
                .ok()
                .and_then(duration_from_secs)
                .map(Self::Duration),
            FieldType::Enum(labels) => labels
                .iter()
                .any(|l| l == s)
                .then(|| Self::Enum(s.into())),
        }
    }

    /// Convert a JSON value into a value of type `ty`.
    ///
    /// `null` converts to [`Value::Null`] for every type. Dates and times are expected as strings,
    /// durations as a number of seconds.
    pub fn from_json(ty: &FieldType, json: &Json) -> Option<Self> {
        match (ty, json) {
            (_, Json::Null) => Some(Self::Null),
            (FieldType::String, Json::String(s)) => Some(Self::String(s.clone())),
            (FieldType::Int, Json::Number(n)) => n.as_i64().map(Self::Int),
            (FieldType::Float, Json::Number(n)) => n.as_f64().map(Self::Float),
            (FieldType::Bool, Json::Bool(b)) => Some(Self::Bool(*b)),
            (FieldType::Duration, Json::Number(n)) => n
                .as_f64()
                .and_then(duration_from_secs)
                .map(Self::Duration),
            (
                FieldType::Date | FieldType::DateTime | FieldType::Time | FieldType::Enum(_),
                Json::String(s),
            ) => Self::parse(ty, s),
            _ => None,
        }
    }

    /// Render this value as JSON.
    ///
    /// Returns [`None`] for floats which have no JSON representation (infinities and NaN).
    pub fn to_json(&self) -> Option<Json> {
        match self {
            Self::Null => Some(Json::Null),
            Self::Bool(b) => Some(Json::Bool(*b)),
            Self::Int(x) => Some(Json::from(*x)),
            Self::Float(x) => Number::from_f64(*x).map(Json::Number),
            Self::Duration(d) => Number::from_f64(duration_secs(d)).map(Json::Number),
            Self::String(s) | Self::Enum(s) => Some(Json::String(s.clone())),
            Self::Date(_) | Self::DateTime(_) | Self::Time(_) => Some(Json::String(self.to_string())),
        }
    }

    /// Compare two values of the same type.
    ///
    /// Returns [`None`] if either value is null or if the values have different types.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(l), Self::Bool(r)) => Some(l.cmp(r)),
            (Self::Int(l), Self::Int(r)) => Some(l.cmp(r)),
            (Self::Float(l), Self::Float(r)) => l.partial_cmp(r),
            (Self::Int(l), Self::Float(r)) => (*l as f64).partial_cmp(r),
            (Self::Float(l), Self::Int(r)) => l.partial_cmp(&(*r as f64)),
            (Self::String(l), Self::String(r)) | (Self::Enum(l), Self::Enum(r)) => Some(l.cmp(r)),
            (Self::Date(l), Self::Date(r)) => Some(l.cmp(r)),
            (Self::DateTime(l), Self::DateTime(r)) => Some(l.cmp(r)),
            (Self::Time(l), Self::Time(r)) => Some(l.cmp(r)),
            (Self::Duration(l), Self::Duration(r)) => Some(l.cmp(r)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(x) => write!(f, "{x}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) | Self::Enum(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::DateTime(d) => write!(f, "{}", d.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
            Self::Duration(d) => write!(f, "{}", duration_secs(d)),
        }
    }
}

/// The length of a duration in (fractional) seconds.
pub fn duration_secs(d: &TimeDelta) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

/// A duration of `secs` (fractional) seconds.
pub fn duration_from_secs(secs: f64) -> Option<TimeDelta> {
    if !secs.is_finite() {
        return None;
    }
    let us = secs * 1e6;
    if us.abs() > i64::MAX as f64 {
        return None;
    }
    Some(TimeDelta::microseconds(us.round() as i64))
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

pub(crate) fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub(crate) fn parse_time(s: &str) -> Option<NaiveTime> {
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
}

/// The identity of a resource: its type and its ID, rendered as a string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub ty: String,
    pub id: String,
}

impl Identifier {
    pub fn new(ty: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ty, self.id)
    }
}

/// A resource loaded from a backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    identifier: Identifier,
    values: BTreeMap<String, Value>,
}

impl Instance {
    /// An instance of `ty` with the given field values.
    ///
    /// The identifier is derived from the value of the ID field.
    pub fn new(ty: &EntityType, values: BTreeMap<String, Value>) -> Self {
        let id = values
            .get(ty.id_field().name())
            .map(|id| id.to_string())
            .unwrap_or_default();
        Self {
            identifier: Identifier::new(ty.name(), id),
            values,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn ty(&self) -> &str {
        &self.identifier.ty
    }

    pub fn id(&self) -> &str {
        &self.identifier.id
    }

    /// The value of a field, or [`None`] if the backend did not load it.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}
