//! The filter expression language.
//!
//! Clients describe filters as JSON objects. A filter is either a junction,
//!
//! ```json
//! {"or": [{"name": "age", "op": "lt", "val": 18}, {"name": "name", "op": "like", "val": "A%"}]}
//! ```
//!
//! or a leaf comparing a field to a literal (`val`), to a sibling field (`field`), or, for the
//! relationship operators `has` and `any`, to a nested filter on the related type. Descriptions
//! are first parsed into a [`FilterNode`] tree, and then [compiled](compile) against the schema
//! into a [`Predicate`] which backends know how to execute.

use crate::schema::{Cardinality, EntityType, FieldType, Schema, Value};
use chrono::{Local, NaiveDateTime};
use derive_more::Display;
use serde_json::{Map, Value as Json};
use snafu::Snafu;
use std::str::FromStr;

/// Errors encountered while parsing or compiling a filter.
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum FilterError {
    #[snafu(display("Invalid filter object: No such field \"{name}\""))]
    UnknownField { name: String },

    #[snafu(display("To compare a value to NULL, use the is_null/is_not_null operators."))]
    ComparisonToNull,

    #[snafu(display("Invalid filter object: No such operator \"{op}\""))]
    UnknownOperator { op: String },

    #[snafu(display("Invalid filter object: {value} is not a valid {ty} for field \"{field}\""))]
    InvalidValue {
        field: String,
        value: String,
        ty: String,
    },

    #[snafu(display("Invalid filter object: {reason}"))]
    Malformed { reason: String },
}

impl FilterError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// The number and kind of arguments an [`Operator`] takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    /// Only the field, as in `is_null`.
    Unary,
    /// The field and a value or a sibling field.
    Binary,
    /// A relationship and a nested filter on the related type.
    Relation,
}

/// The fixed set of filter operators.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Operator {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "ne")]
    Ne,
    #[display(fmt = "gt")]
    Gt,
    #[display(fmt = "lt")]
    Lt,
    #[display(fmt = "ge")]
    Ge,
    #[display(fmt = "le")]
    Le,
    #[display(fmt = "like")]
    Like,
    #[display(fmt = "ilike")]
    ILike,
    #[display(fmt = "not_like")]
    NotLike,
    #[display(fmt = "in")]
    In,
    #[display(fmt = "not_in")]
    NotIn,
    #[display(fmt = "is_null")]
    IsNull,
    #[display(fmt = "is_not_null")]
    IsNotNull,
    #[display(fmt = "to_tsquery")]
    ToTsQuery,
    #[display(fmt = "plainto_tsquery")]
    PlainToTsQuery,
    #[display(fmt = "has")]
    Has,
    #[display(fmt = "any")]
    Any,
}

impl Operator {
    pub fn arity(self) -> Arity {
        match self {
            Self::IsNull | Self::IsNotNull => Arity::Unary,
            Self::Has | Self::Any => Arity::Relation,
            _ => Arity::Binary,
        }
    }

    /// The comparison this operator performs, if it is an ordinary comparison operator.
    fn comparison(self) -> Option<Comparison> {
        Some(match self {
            Self::Eq => Comparison::Eq,
            Self::Ne => Comparison::Ne,
            Self::Gt => Comparison::Gt,
            Self::Lt => Comparison::Lt,
            Self::Ge => Comparison::Ge,
            Self::Le => Comparison::Le,
            _ => return None,
        })
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "==" | "eq" | "equals" | "equal_to" => Self::Eq,
            "!=" | "ne" | "neq" | "not_equal_to" | "does_not_equal" | "<>" => Self::Ne,
            ">" | "gt" => Self::Gt,
            "<" | "lt" => Self::Lt,
            ">=" | "ge" | "gte" | "geq" => Self::Ge,
            "<=" | "le" | "lte" | "leq" => Self::Le,
            "like" => Self::Like,
            "ilike" => Self::ILike,
            "not_like" => Self::NotLike,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "is_null" => Self::IsNull,
            "is_not_null" => Self::IsNotNull,
            "to_tsquery" => Self::ToTsQuery,
            "plainto_tsquery" => Self::PlainToTsQuery,
            "has" => Self::Has,
            "any" => Self::Any,
            op => return Err(FilterError::UnknownOperator { op: op.into() }),
        })
    }
}

/// The right-hand side of a leaf filter.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    /// No argument was given (or the argument was `null`).
    None,
    /// A literal value.
    Value(Json),
    /// The name of another field of the same resource.
    Field(String),
    /// A filter on the resources at the other end of a relationship.
    Filter(Box<FilterNode>),
}

/// A parsed, but not yet resolved, filter description.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Leaf {
        name: String,
        op: Operator,
        arg: Argument,
    },
}

impl FilterNode {
    /// Parse a JSON filter description.
    pub fn parse(json: &Json) -> Result<Self, FilterError> {
        let Json::Object(obj) = json else {
            return Err(FilterError::malformed(format!("expected an object, got {json}")));
        };
        if let Some(children) = obj.get("and") {
            Ok(Self::And(Self::parse_junction("and", obj, children)?))
        } else if let Some(children) = obj.get("or") {
            Ok(Self::Or(Self::parse_junction("or", obj, children)?))
        } else {
            Self::parse_leaf(obj)
        }
    }

    fn parse_junction(
        key: &str,
        obj: &Map<String, Json>,
        children: &Json,
    ) -> Result<Vec<Self>, FilterError> {
        if obj.len() != 1 {
            return Err(FilterError::malformed(format!(
                "\"{key}\" must be the only key in its object"
            )));
        }
        let Json::Array(children) = children else {
            return Err(FilterError::malformed(format!("\"{key}\" must be a list")));
        };
        children.iter().map(Self::parse).collect()
    }

    fn parse_leaf(obj: &Map<String, Json>) -> Result<Self, FilterError> {
        if let Some(key) = obj
            .keys()
            .find(|key| !["name", "op", "val", "field"].contains(&key.as_str()))
        {
            return Err(FilterError::malformed(format!("unexpected key \"{key}\"")));
        }
        let name = match obj.get("name") {
            Some(Json::String(name)) => name.clone(),
            _ => return Err(FilterError::malformed("\"name\" must be a string")),
        };
        let op: Operator = match obj.get("op") {
            Some(Json::String(op)) => op.parse()?,
            _ => return Err(FilterError::malformed("\"op\" must be a string")),
        };

        let arg = match (obj.get("val"), obj.get("field")) {
            (Some(_), Some(_)) => {
                return Err(FilterError::malformed(
                    "\"val\" and \"field\" can not be used together",
                ))
            }
            (None | Some(Json::Null), None) => Argument::None,
            (None, Some(Json::String(field))) => Argument::Field(field.clone()),
            (None, Some(_)) => return Err(FilterError::malformed("\"field\" must be a string")),
            (Some(val), None) if op.arity() == Arity::Relation => {
                Argument::Filter(Box::new(Self::parse(val)?))
            }
            (Some(val), None) => Argument::Value(val.clone()),
        };

        Ok(Self::Leaf { name, op, arg })
    }
}

/// An ordinary comparison between two values.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Comparison {
    #[display(fmt = "=")]
    Eq,
    #[display(fmt = "!=")]
    Ne,
    #[display(fmt = ">")]
    Gt,
    #[display(fmt = "<")]
    Lt,
    #[display(fmt = ">=")]
    Ge,
    #[display(fmt = "<=")]
    Le,
}

/// The right-hand side of a [`Comparison`].
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Value(Value),
    Field(String),
}

/// A compiled filter, resolved against the schema.
///
/// Field names refer to fields of the type the predicate was compiled against. Relationship
/// predicates switch to the target type of the relationship.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// Holds when all of the sub-predicates hold, or always when there are none.
    All(Vec<Predicate>),
    /// Holds when any of the sub-predicates holds, or never when there are none.
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        field: String,
        op: Comparison,
        rhs: Operand,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Like {
        field: String,
        pattern: String,
        case_insensitive: bool,
    },
    IsNull {
        field: String,
    },
    /// Full-text search. See [`Boolean::Matches`](crate::sql::db::Boolean::Matches).
    Search {
        field: String,
        query: String,
        plain: bool,
    },
    /// Holds when some resource related through `relationship` satisfies `predicate`.
    Related {
        relationship: String,
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    /// The predicate which always holds.
    pub fn always() -> Self {
        Self::All(vec![])
    }

    /// The conjunction of a list of predicates.
    pub fn all(preds: impl IntoIterator<Item = Predicate>) -> Self {
        let mut preds = preds.into_iter().collect::<Vec<_>>();
        if preds.len() == 1 {
            preds.remove(0)
        } else {
            Self::All(preds)
        }
    }

    fn not(pred: Predicate) -> Self {
        Self::Not(Box::new(pred))
    }

    /// Holds when `relationship` is not empty.
    fn related(relationship: &str) -> Self {
        Self::Related {
            relationship: relationship.into(),
            predicate: Box::new(Self::always()),
        }
    }
}

/// Compile a list of filter descriptions against the type `ty`.
///
/// The filters are combined conjunctively.
pub fn compile_all<'a>(
    schema: &Schema,
    ty: &EntityType,
    filters: impl IntoIterator<Item = &'a FilterNode>,
) -> Result<Predicate, FilterError> {
    let compiler = Compiler::new(schema);
    let preds = filters
        .into_iter()
        .map(|filter| compiler.compile(ty, filter))
        .collect::<Result<Vec<_>, _>>()?;
    let pred = Predicate::all(preds);
    tracing::debug!("compiled filter for {}: {:?}", ty.name(), pred);
    Ok(pred)
}

/// Compile a filter description against the type `ty`.
pub fn compile(schema: &Schema, ty: &EntityType, filter: &FilterNode) -> Result<Predicate, FilterError> {
    compile_all(schema, ty, [filter])
}

struct Compiler<'s> {
    schema: &'s Schema,
    /// The time substituted for the current-time markers.
    now: NaiveDateTime,
}

impl<'s> Compiler<'s> {
    fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            now: Local::now().naive_local(),
        }
    }

    fn compile(&self, ty: &EntityType, node: &FilterNode) -> Result<Predicate, FilterError> {
        match node {
            FilterNode::And(children) => Ok(Predicate::All(
                children
                    .iter()
                    .map(|child| self.compile(ty, child))
                    .collect::<Result<_, _>>()?,
            )),
            FilterNode::Or(children) => Ok(Predicate::Any(
                children
                    .iter()
                    .map(|child| self.compile(ty, child))
                    .collect::<Result<_, _>>()?,
            )),
            FilterNode::Leaf { name, op, arg } => {
                if ty.get_field(name).is_some() {
                    self.compile_field(ty, name, *op, arg)
                } else if ty.get_relationship(name).is_some() {
                    self.compile_relationship(ty, name, *op, arg)
                } else {
                    Err(FilterError::UnknownField { name: name.clone() })
                }
            }
        }
    }

    fn compile_field(
        &self,
        ty: &EntityType,
        name: &str,
        op: Operator,
        arg: &Argument,
    ) -> Result<Predicate, FilterError> {
        let field = name.to_string();
        let field_ty = ty
            .get_field(name)
            .ok_or_else(|| FilterError::UnknownField { name: name.into() })?
            .ty();

        match (op, arg) {
            (Operator::IsNull, _) => return Ok(Predicate::IsNull { field }),
            (Operator::IsNotNull, _) => return Ok(Predicate::not(Predicate::IsNull { field })),
            (_, Argument::None) => return Err(FilterError::ComparisonToNull),
            (Operator::Has | Operator::Any, _) => {
                return Err(FilterError::malformed(format!(
                    "operator \"{op}\" requires a relationship, but \"{name}\" is a field"
                )))
            }
            (_, Argument::Filter(_)) => {
                return Err(FilterError::malformed(format!(
                    "operator \"{op}\" does not take a nested filter"
                )))
            }
            _ => {}
        }

        if let Argument::Field(other) = arg {
            if ty.get_field(other).is_none() {
                return Err(FilterError::UnknownField { name: other.clone() });
            }
            let op = op.comparison().ok_or_else(|| {
                FilterError::malformed(format!("operator \"{op}\" can not compare two fields"))
            })?;
            return Ok(Predicate::Compare {
                field,
                op,
                rhs: Operand::Field(other.clone()),
            });
        }
        let Argument::Value(val) = arg else {
            return Err(FilterError::ComparisonToNull);
        };

        if let Some(cmp) = op.comparison() {
            return Ok(Predicate::Compare {
                rhs: Operand::Value(self.coerce(&field, field_ty, val)?),
                field,
                op: cmp,
            });
        }
        match op {
            Operator::Like | Operator::ILike | Operator::NotLike => {
                let pattern = self.string(&field, val)?;
                let like = Predicate::Like {
                    field,
                    pattern,
                    case_insensitive: op == Operator::ILike,
                };
                Ok(if op == Operator::NotLike {
                    Predicate::not(like)
                } else {
                    like
                })
            }
            Operator::In | Operator::NotIn => {
                let Json::Array(items) = val else {
                    return Err(FilterError::malformed(format!(
                        "operator \"{op}\" requires a list"
                    )));
                };
                let values = items
                    .iter()
                    .map(|item| self.coerce(&field, field_ty, item))
                    .collect::<Result<_, _>>()?;
                let pred = Predicate::In { field, values };
                Ok(if op == Operator::NotIn {
                    Predicate::not(pred)
                } else {
                    pred
                })
            }
            Operator::ToTsQuery | Operator::PlainToTsQuery => Ok(Predicate::Search {
                query: self.string(&field, val)?,
                field,
                plain: op == Operator::PlainToTsQuery,
            }),
            _ => Err(FilterError::malformed(format!("unsupported operator \"{op}\""))),
        }
    }

    fn compile_relationship(
        &self,
        ty: &EntityType,
        name: &str,
        op: Operator,
        arg: &Argument,
    ) -> Result<Predicate, FilterError> {
        let rel = ty
            .get_relationship(name)
            .ok_or_else(|| FilterError::UnknownField { name: name.into() })?;
        match op {
            Operator::IsNull => return Ok(Predicate::not(Predicate::related(name))),
            Operator::IsNotNull => return Ok(Predicate::related(name)),
            Operator::Has if rel.cardinality() != Cardinality::ToOne => {
                return Err(FilterError::malformed(format!(
                    "\"{name}\" is a to-many relationship; use \"any\" instead of \"has\""
                )))
            }
            Operator::Any if rel.cardinality() != Cardinality::ToMany => {
                return Err(FilterError::malformed(format!(
                    "\"{name}\" is a to-one relationship; use \"has\" instead of \"any\""
                )))
            }
            Operator::Has | Operator::Any => {}
            op => {
                return Err(FilterError::malformed(format!(
                    "operator \"{op}\" can not be applied to relationship \"{name}\""
                )))
            }
        }

        let Argument::Filter(filter) = arg else {
            return Err(FilterError::ComparisonToNull);
        };
        let target = self
            .schema
            .entity(rel.target())
            .ok_or_else(|| FilterError::UnknownField { name: name.into() })?;
        Ok(Predicate::Related {
            relationship: name.into(),
            predicate: Box::new(self.compile(target, filter)?),
        })
    }

    fn string(&self, field: &str, val: &Json) -> Result<String, FilterError> {
        match val {
            Json::String(s) => Ok(s.clone()),
            val => Err(FilterError::InvalidValue {
                field: field.into(),
                value: val.to_string(),
                ty: "string".into(),
            }),
        }
    }

    /// Convert a JSON value to a value of the type of `field`.
    fn coerce(&self, field: &str, ty: &FieldType, val: &Json) -> Result<Value, FilterError> {
        let invalid = || FilterError::InvalidValue {
            field: field.into(),
            value: val.to_string(),
            ty: ty.to_string(),
        };
        if val.is_null() {
            return Err(FilterError::ComparisonToNull);
        }
        let coerced = match val {
            Json::String(marker) if ty.is_temporal() => self.current(ty, marker),
            _ => None,
        };
        coerced
            .or_else(|| Value::from_json(ty, val))
            .ok_or_else(invalid)
    }

    /// The current server time as a value of type `ty`, if `marker` names it.
    fn current(&self, ty: &FieldType, marker: &str) -> Option<Value> {
        match (ty, marker) {
            (FieldType::Date, "CURRENT_DATE" | "CURRENT_TIMESTAMP" | "LOCALTIMESTAMP") => {
                Some(Value::Date(self.now.date()))
            }
            (FieldType::DateTime, "CURRENT_TIMESTAMP" | "LOCALTIMESTAMP") => {
                Some(Value::DateTime(self.now))
            }
            (FieldType::DateTime, "CURRENT_DATE") => {
                self.now.date().and_hms_opt(0, 0, 0).map(Value::DateTime)
            }
            (FieldType::Time, "CURRENT_TIME" | "CURRENT_TIMESTAMP" | "LOCALTIMESTAMP") => {
                Some(Value::Time(self.now.time()))
            }
            _ => None,
        }
    }
}
