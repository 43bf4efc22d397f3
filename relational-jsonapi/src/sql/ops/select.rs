//! Compilation of resource queries into SQL `SELECT` statements.

use super::{
    super::db::{
        self, Boolean, Column, Connection, JoinClause, JoinKind, Operand, Row, Select,
        SelectColumn, SelectExt, Subquery, WhereClause,
    },
    field_column, field_columns, id_column, lift_value, lower_value, parse_ids, parse_row,
    relationship, table_name, Error,
};
use crate::{
    jsonapi::{
        backend::Query,
        filter::{self, Predicate},
        sort::OrderBy,
    },
    schema::{EntityType, Instance, Relationship, Schema, Storage},
};
use itertools::{Either, Itertools};
use std::collections::HashMap;

/// Load the resources of type `ty` selected by `query`.
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    query: &Query,
) -> Result<Vec<Instance>, Error> {
    let table = table_name(ty);
    let columns = field_columns(ty, &table);
    let filter = compile_predicate(schema, ty, &table, &query.predicate)?;
    let (joins, order) = compile_ordering(schema, ty, &table, &query.ordering)?;

    let mut select = conn
        .select(&columns, &table)
        .clauses(joins)
        .filter(filter)
        .clauses(order);
    if let Some(window) = query.window {
        select = select.offset(window.offset).limit(window.limit);
    }
    let rows = select.many().await.map_err(Error::sql)?;
    rows.iter().map(|row| parse_row(ty, row, 0)).collect()
}

/// Count the resources of type `ty` satisfying `predicate`.
pub async fn count<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    predicate: &Predicate,
) -> Result<usize, Error> {
    let table = table_name(ty);
    let columns = [SelectColumn::Count];
    let filter = compile_predicate(schema, ty, &table, predicate)?;
    let row = conn
        .select(&columns, &table)
        .filter(filter)
        .one()
        .await
        .map_err(Error::sql)?;
    match row.column(0).map_err(Error::sql)? {
        db::Value::Int8(n) => usize::try_from(n).map_err(Error::sql),
        val => Err(Error::TypeMismatch {
            error: format!("expected a count, got {val}"),
        }),
    }
}

/// Load resources of type `ty` by ID, ordered by ID.
pub async fn get<C: Connection>(
    conn: &C,
    ty: &EntityType,
    ids: &[String],
) -> Result<Vec<Instance>, Error> {
    let ids = parse_ids(ty, ids);
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let table = table_name(ty);
    let columns = field_columns(ty, &table);
    let rows = conn
        .select(&columns, &table)
        .one_of(id_column(ty, &table), ids)
        .order_by(id_column(ty, &table), false)
        .many()
        .await
        .map_err(Error::sql)?;
    rows.iter().map(|row| parse_row(ty, row, 0)).collect()
}

/// Load the targets of `rel` for each of the `owners`.
///
/// Each row of the query holds the ID of the owner, followed by the fields of the target.
pub async fn load_relation<C: Connection>(
    conn: &C,
    schema: &Schema,
    ty: &EntityType,
    rel: &Relationship,
    owners: &[String],
) -> Result<HashMap<String, Vec<Instance>>, Error> {
    let (_, target) = relationship(schema, ty, rel.name())?;
    let owner_ids = parse_ids(ty, owners);
    if owner_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let table = table_name(target);
    let (owner_key, joins) = match rel.storage() {
        // The key is on the owner's table, so we have to join it to find the owner of each target.
        Storage::OwnerKey { column } => (
            id_column(ty, "rel_owner"),
            vec![JoinClause {
                kind: JoinKind::Inner,
                table: table_name(ty).into(),
                alias: "rel_owner".into(),
                lhs: Column::qualified("rel_owner", column.clone()),
                op: "=".into(),
                rhs: id_column(target, &table),
            }],
        ),
        Storage::TargetKey { column } => (Column::qualified(table.clone(), column.clone()), vec![]),
        Storage::JoinTable {
            table: join_table,
            owner_column,
            target_column,
        } => (
            Column::qualified("rel_link", owner_column.clone()),
            vec![JoinClause {
                kind: JoinKind::Inner,
                table: join_table.clone().into(),
                alias: "rel_link".into(),
                lhs: Column::qualified("rel_link", target_column.clone()),
                op: "=".into(),
                rhs: id_column(target, &table),
            }],
        ),
    };

    let columns = [SelectColumn::Column(owner_key.clone())]
        .into_iter()
        .chain(field_columns(target, &table))
        .collect::<Vec<_>>();
    let rows = conn
        .select(&columns, &table)
        .clauses(joins)
        .one_of(owner_key, owner_ids)
        .order_by(id_column(target, &table), false)
        .many()
        .await
        .map_err(Error::sql)?;

    let mut targets: HashMap<String, Vec<Instance>> = HashMap::new();
    for row in rows {
        let owner = lift_value(
            ty.id_field().ty(),
            row.column(0).map_err(Error::sql)?,
        )?;
        targets
            .entry(owner.to_string())
            .or_default()
            .push(parse_row(target, &row, 1)?);
    }
    Ok(targets)
}

/// Compile a predicate on resources of type `ty` into a `WHERE` clause on a query where the table
/// of `ty` is named `alias`.
pub(super) fn compile_predicate(
    schema: &Schema,
    ty: &EntityType,
    alias: &str,
    pred: &Predicate,
) -> Result<WhereClause<'static>, Error> {
    PredicateCompiler { schema, aliases: 0 }.compile(ty, alias, pred)
}

struct PredicateCompiler<'s> {
    schema: &'s Schema,
    /// The number of subquery aliases generated so far.
    aliases: usize,
}

impl<'s> PredicateCompiler<'s> {
    fn fresh(&mut self, prefix: &str) -> String {
        self.aliases += 1;
        format!("{prefix}_{}", self.aliases)
    }

    fn column(&self, ty: &EntityType, alias: &str, field: &str) -> Result<Column<'static>, Error> {
        if ty.get_field(field).is_none() {
            return Err(Error::UnknownField {
                ty: ty.name().into(),
                field: field.into(),
            });
        }
        Ok(field_column(alias, field))
    }

    fn compile(
        &mut self,
        ty: &EntityType,
        alias: &str,
        pred: &Predicate,
    ) -> Result<WhereClause<'static>, Error> {
        Ok(match pred {
            Predicate::All(preds) => WhereClause::All(Box::new(
                preds
                    .iter()
                    .map(|pred| self.compile(ty, alias, pred))
                    .collect::<Result<_, _>>()?,
            )),
            Predicate::Any(preds) => self.compile_any(ty, alias, preds)?,
            Predicate::Not(pred) => WhereClause::not(self.compile(ty, alias, pred)?),
            Predicate::Compare { field, op, rhs } => {
                let column = self.column(ty, alias, field)?;
                match rhs {
                    filter::Operand::Value(val) => {
                        Boolean::cmp(column, op.to_string(), lower_value(val))
                    }
                    filter::Operand::Field(other) => {
                        Boolean::cmp_columns(column, op.to_string(), self.column(ty, alias, other)?)
                    }
                }
                .into()
            }
            Predicate::In { field, values } => {
                Boolean::one_of(self.column(ty, alias, field)?, values.iter().map(lower_value))
                    .into()
            }
            Predicate::Like {
                field,
                pattern,
                case_insensitive,
            } => Boolean::Like {
                column: self.column(ty, alias, field)?,
                pattern: pattern.clone(),
                case_insensitive: *case_insensitive,
            }
            .into(),
            Predicate::IsNull { field } => Boolean::is_null(self.column(ty, alias, field)?).into(),
            Predicate::Search { field, query, plain } => Boolean::Matches {
                column: self.column(ty, alias, field)?,
                query: query.clone(),
                plain: *plain,
            }
            .into(),
            Predicate::Related {
                relationship: name,
                predicate,
            } => self.compile_related(ty, alias, name, predicate)?,
        })
    }

    fn compile_any(
        &mut self,
        ty: &EntityType,
        alias: &str,
        preds: &[Predicate],
    ) -> Result<WhereClause<'static>, Error> {
        let clauses = preds
            .iter()
            .map(|pred| self.compile(ty, alias, pred))
            .collect::<Result<Vec<_>, _>>()?;

        // Coalesce disjunctions of equality comparisons on the same column into a single `IN`
        // operation.
        let (comparisons, mut clauses): (Vec<_>, Vec<_>) =
            clauses.into_iter().partition_map(|clause| match clause {
                WhereClause::Predicate(Boolean::Cmp {
                    column,
                    op,
                    rhs: Operand::Param(param),
                }) if op == "=" => Either::Left((column, param)),
                clause => Either::Right(clause),
            });
        for (column, params) in comparisons
            .into_iter()
            .into_group_map()
            .into_iter()
            .sorted_by(|(l, _), (r, _)| l.cmp(r))
        {
            clauses.push(Boolean::one_of(column, params).into());
        }

        // Keep an empty disjunction as an always-false clause.
        if clauses.is_empty() {
            return Ok(WhereClause::Any(Box::default()));
        }
        Ok(WhereClause::any(clauses))
    }

    /// Compile a predicate on the targets of a relationship into a correlated `EXISTS` subquery.
    fn compile_related(
        &mut self,
        ty: &EntityType,
        alias: &str,
        name: &str,
        pred: &Predicate,
    ) -> Result<WhereClause<'static>, Error> {
        let (rel, target) = relationship(self.schema, ty, name)?;
        let sub = self.fresh("sub");

        let (joins, link) = match rel.storage() {
            Storage::OwnerKey { column } => (
                vec![],
                Boolean::cmp_columns(
                    id_column(target, &sub),
                    "=",
                    Column::qualified(alias.to_string(), column.clone()),
                ),
            ),
            Storage::TargetKey { column } => (
                vec![],
                Boolean::cmp_columns(
                    Column::qualified(sub.clone(), column.clone()),
                    "=",
                    id_column(ty, alias),
                ),
            ),
            Storage::JoinTable {
                table,
                owner_column,
                target_column,
            } => {
                let link = self.fresh("link");
                (
                    vec![JoinClause {
                        kind: JoinKind::Inner,
                        table: table.clone().into(),
                        alias: link.clone().into(),
                        lhs: Column::qualified(link.clone(), target_column.clone()),
                        op: "=".into(),
                        rhs: id_column(target, &sub),
                    }],
                    Boolean::cmp_columns(
                        Column::qualified(link, owner_column.clone()),
                        "=",
                        id_column(ty, alias),
                    ),
                )
            }
        };

        let filter = self.compile(target, &sub, pred)?;
        Ok(Subquery {
            table: table_name(target).into(),
            alias: sub.into(),
            joins,
            filter: WhereClause::all([WhereClause::from(link), filter]),
        }
        .into())
    }
}

/// Compile an ordering of resources of type `ty` (whose table is named `alias`) into `JOIN` and
/// `ORDER BY` clauses.
///
/// Each relationship path in the ordering is joined once, with a `LEFT JOIN` so that resources
/// without a related resource are still included.
fn compile_ordering(
    schema: &Schema,
    ty: &EntityType,
    alias: &str,
    ordering: &[OrderBy],
) -> Result<(Vec<JoinClause<'static>>, Vec<db::OrderBy<'static>>), Error> {
    let mut joins = vec![];
    let mut joined: HashMap<Vec<String>, (String, &EntityType)> = HashMap::new();
    let mut order = vec![];

    for key in ordering {
        let mut cur_ty = ty;
        let mut cur_alias = alias.to_string();
        for (i, name) in key.path.iter().enumerate() {
            let prefix = key.path[..=i].to_vec();
            if let Some((joined_alias, joined_ty)) = joined.get(&prefix) {
                cur_alias = joined_alias.clone();
                cur_ty = *joined_ty;
                continue;
            }

            let (rel, target) = relationship(schema, cur_ty, name)?;
            if rel.is_to_many() {
                return Err(Error::Unsupported {
                    ty: cur_ty.name().into(),
                    relationship: name.clone(),
                    operation: "sorting",
                });
            }
            let next = format!("sort_{}", joined.len() + 1);
            match rel.storage() {
                Storage::OwnerKey { column } => joins.push(JoinClause {
                    kind: JoinKind::Left,
                    table: table_name(target).into(),
                    alias: next.clone().into(),
                    lhs: id_column(target, &next),
                    op: "=".into(),
                    rhs: Column::qualified(cur_alias.clone(), column.clone()),
                }),
                Storage::TargetKey { column } => joins.push(JoinClause {
                    kind: JoinKind::Left,
                    table: table_name(target).into(),
                    alias: next.clone().into(),
                    lhs: Column::qualified(next.clone(), column.clone()),
                    op: "=".into(),
                    rhs: id_column(cur_ty, &cur_alias),
                }),
                Storage::JoinTable {
                    table,
                    owner_column,
                    target_column,
                } => {
                    let link = format!("{next}_link");
                    joins.push(JoinClause {
                        kind: JoinKind::Left,
                        table: table.clone().into(),
                        alias: link.clone().into(),
                        lhs: Column::qualified(link.clone(), owner_column.clone()),
                        op: "=".into(),
                        rhs: id_column(cur_ty, &cur_alias),
                    });
                    joins.push(JoinClause {
                        kind: JoinKind::Left,
                        table: table_name(target).into(),
                        alias: next.clone().into(),
                        lhs: id_column(target, &next),
                        op: "=".into(),
                        rhs: Column::qualified(link, target_column.clone()),
                    });
                }
            }
            joined.insert(prefix, (next.clone(), target));
            cur_alias = next;
            cur_ty = target;
        }

        if cur_ty.get_field(&key.field).is_none() {
            return Err(Error::UnknownField {
                ty: cur_ty.name().into(),
                field: key.field.clone(),
            });
        }
        order.push(db::OrderBy {
            column: field_column(&cur_alias, &key.field),
            descending: key.descending,
        });
    }

    Ok((joins, order))
}
