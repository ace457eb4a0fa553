//! Relation planning and replacement.
//!
//! Every `state` / `state_all` reference in a FROM position is replaced by a
//! derived table. With exactly one proven schema key the derived table reads
//! that schema's cache table; otherwise it is the generic graph walk with
//! whatever schema/version restrictions the WHERE clause proves.

use super::classify::VirtualRelation;
use super::filters::{self, RelationFilter};
use super::params::Placeholders;
use super::ParseCache;
use crate::state::cache::{cache_table_name, CacheScope};
use crate::state::sql::{
    cache_read_sql, committed_state_sql, overlay_sql, StateSqlFilter, VersionFilter,
    MANDATORY_COLUMNS, STATE_COLUMNS,
};
use crate::types::Value;
use sqlparser::ast::{
    Expr, Ident, ObjectNamePart, Query, Select, SelectItem, SetExpr, Statement, TableAlias,
    TableFactor, Visit, Visitor, VisitorMut,
};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// How one reference was physically planned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationPlan {
    /// Direct read of a per-schema cache table.
    CacheTable { schema_key: String, table: String },
    /// Generic graph-walk subquery.
    Generic { schema_keys: Option<Vec<String>> },
}

/// Columns the statement can observe.
#[derive(Debug, Default)]
pub(crate) struct ColumnUsage {
    referenced: BTreeSet<String>,
    wildcard: bool,
}

impl ColumnUsage {
    pub fn scan(statement: &Statement) -> Self {
        let mut usage = ColumnUsage::default();
        let _ = Visit::visit(statement, &mut usage);
        usage
    }

    pub fn prunable(&self) -> bool {
        !self.wildcard
    }

    /// Referenced state columns plus the mandatory ones, in relation order.
    pub fn projection(&self) -> Vec<&'static str> {
        STATE_COLUMNS
            .iter()
            .copied()
            .filter(|column| MANDATORY_COLUMNS.contains(column) || self.referenced.contains(*column))
            .collect()
    }
}

fn projects_wildcard(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| {
            matches!(
                item,
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _)
            )
        }),
        SetExpr::SetOperation { left, right, .. } => {
            projects_wildcard(left) || projects_wildcard(right)
        }
        _ => false,
    }
}

impl Visitor for ColumnUsage {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if projects_wildcard(&query.body) {
            self.wildcard = true;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                self.referenced.insert(ident.value.to_ascii_lowercase());
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    self.referenced.insert(last.value.to_ascii_lowercase());
                }
            }
            Expr::Wildcard(_) | Expr::QualifiedWildcard(_, _) => self.wildcard = true,
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// What a referencing SELECT tells us about its sources.
struct SelectContext {
    selection: Option<Expr>,
    has_joins: bool,
}

impl SelectContext {
    fn of(select: &Select) -> Self {
        Self {
            selection: select.selection.clone(),
            has_joins: select.from.len() > 1 || select.from.iter().any(|from| !from.joins.is_empty()),
        }
    }
}

/// Replaces virtual relations query by query, innermost first.
pub(crate) struct RelationRewriter<'a> {
    pub parser: &'a mut ParseCache,
    pub params: &'a [Value],
    pub placeholders: &'a Placeholders,
    pub overlay: bool,
    pub columns: &'a ColumnUsage,
    pub plans: Vec<RelationPlan>,
    pub scopes: Vec<CacheScope>,
    pub pruned: bool,
    pub handled: usize,
    pub error: Option<String>,
}

impl<'a> RelationRewriter<'a> {
    pub fn new(
        parser: &'a mut ParseCache,
        params: &'a [Value],
        placeholders: &'a Placeholders,
        overlay: bool,
        columns: &'a ColumnUsage,
    ) -> Self {
        Self {
            parser,
            params,
            placeholders,
            overlay,
            columns,
            plans: Vec::new(),
            scopes: Vec::new(),
            pruned: false,
            handled: 0,
            error: None,
        }
    }

    fn rewrite_body(&mut self, body: &mut SetExpr) -> Result<(), String> {
        match body {
            SetExpr::Select(select) => {
                let context = SelectContext::of(select);
                for from in &mut select.from {
                    self.rewrite_factor(&mut from.relation, &context)?;
                    for join in &mut from.joins {
                        self.rewrite_factor(&mut join.relation, &context)?;
                    }
                }
                Ok(())
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.rewrite_body(left)?;
                self.rewrite_body(right)
            }
            _ => Ok(()),
        }
    }

    fn rewrite_factor(&mut self, factor: &mut TableFactor, context: &SelectContext) -> Result<(), String> {
        let (relation, ident, alias) = match factor {
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.rewrite_factor(&mut table_with_joins.relation, context)?;
                for join in &mut table_with_joins.joins {
                    self.rewrite_factor(&mut join.relation, context)?;
                }
                return Ok(());
            }
            TableFactor::Table {
                name,
                alias,
                args: None,
                ..
            } => {
                let Some(relation) = VirtualRelation::from_object_name(name) else {
                    return Ok(());
                };
                let ident = name
                    .0
                    .first()
                    .and_then(ObjectNamePart::as_ident)
                    .cloned()
                    .ok_or_else(|| format!("unsupported relation name {name}"))?;
                (relation, ident, alias.clone())
            }
            _ => return Ok(()),
        };

        let relation_name = alias
            .as_ref()
            .map(|alias| alias.name.value.clone())
            .unwrap_or_else(|| ident.value.clone());
        let filter = filters::extract(
            context.selection.as_ref(),
            &relation_name,
            !context.has_joins,
            relation == VirtualRelation::StateAll,
            self.params,
            self.placeholders,
        );
        let prune = self.columns.prunable()
            && !context.has_joins
            && alias.as_ref().map_or(true, |alias| alias.columns.is_empty());
        let columns = if prune {
            self.columns.projection()
        } else {
            STATE_COLUMNS.to_vec()
        };
        if columns.len() < STATE_COLUMNS.len() {
            self.pruned = true;
        }

        let inner = self.plan(relation, &filter, &columns);
        *factor = self.derived(&inner, &ident, alias)?;
        self.handled += 1;
        Ok(())
    }

    /// Build the replacement subquery and record its plan.
    fn plan(&mut self, relation: VirtualRelation, filter: &RelationFilter, columns: &[&str]) -> String {
        let versions = match (relation, &filter.version_ids) {
            (VirtualRelation::State, _) => VersionFilter::Active,
            (VirtualRelation::StateAll, Some(ids)) => VersionFilter::Only(ids.iter().cloned().collect()),
            (VirtualRelation::StateAll, None) => VersionFilter::Any,
        };
        let state_filter = StateSqlFilter {
            schema_keys: filter
                .schema_keys
                .as_ref()
                .map(|keys| keys.iter().cloned().collect()),
            version: versions.clone(),
        };

        let base = match filter.single_schema() {
            Some(schema_key) => {
                let table = cache_table_name(schema_key);
                let sql = cache_read_sql(&table, &versions, columns);
                self.scopes.push(CacheScope {
                    schema_key: schema_key.to_string(),
                    versions,
                });
                self.plans.push(RelationPlan::CacheTable {
                    schema_key: schema_key.to_string(),
                    table,
                });
                sql
            }
            None => {
                self.plans.push(RelationPlan::Generic {
                    schema_keys: state_filter.schema_keys.clone(),
                });
                committed_state_sql(&state_filter, columns)
            }
        };

        if self.overlay {
            overlay_sql(&base, &state_filter, columns)
        } else {
            base
        }
    }

    /// Parse `inner` as a derived table named like the reference it replaces.
    fn derived(&mut self, inner: &str, ident: &Ident, alias: Option<TableAlias>) -> Result<TableFactor, String> {
        let wrapper = format!("SELECT * FROM ({inner}) AS {ident}");
        let statements = self.parser.parse(&wrapper)?;
        let mut factor = match statements.as_slice() {
            [Statement::Query(query)] => match query.body.as_ref() {
                SetExpr::Select(select) => select.from.first().map(|from| from.relation.clone()),
                _ => None,
            },
            _ => None,
        }
        .ok_or_else(|| "replacement did not parse as a derived table".to_string())?;

        if let (Some(original), TableFactor::Derived { alias: derived_alias, .. }) = (alias, &mut factor) {
            *derived_alias = Some(original);
        }
        Ok(factor)
    }
}

impl VisitorMut for RelationRewriter<'_> {
    type Break = ();

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        match self.rewrite_body(&mut query.body) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }
}
