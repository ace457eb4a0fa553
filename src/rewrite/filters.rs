//! Pushdown analysis over the WHERE clause of the referencing SELECT.
//!
//! Only top-level `AND` conjuncts are inspected. A conjunct constrains the
//! virtual relation when its column is qualified with the relation's name
//! (alias if present), or unqualified and the SELECT has a single source.
//! The WHERE clause itself is left in place, so pushdown only ever narrows
//! rows the outer predicate would drop anyway.

use super::params::{text_value, Placeholders};
use crate::types::Value;
use sqlparser::ast::{BinaryOperator, Expr};
use std::collections::BTreeSet;

/// Values a column is proven to be restricted to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationFilter {
    pub schema_keys: Option<BTreeSet<String>>,
    pub version_ids: Option<BTreeSet<String>>,
}

impl RelationFilter {
    /// The single schema key, if exactly one is proven.
    pub fn single_schema(&self) -> Option<&str> {
        match &self.schema_keys {
            Some(keys) if keys.len() == 1 => keys.iter().next().map(String::as_str),
            _ => None,
        }
    }
}

fn narrow(current: &mut Option<BTreeSet<String>>, values: BTreeSet<String>) {
    *current = Some(match current.take() {
        Some(existing) => existing.intersection(&values).cloned().collect(),
        None => values,
    });
}

/// Which relation a column expression belongs to.
struct Target<'a> {
    relation_name: &'a str,
    allow_unqualified: bool,
}

impl Target<'_> {
    fn column(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier(ident) if self.allow_unqualified => Some(ident.value.to_ascii_lowercase()),
            Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
                if parts[0].value.eq_ignore_ascii_case(self.relation_name) {
                    Some(parts[1].value.to_ascii_lowercase())
                } else {
                    None
                }
            }
            Expr::Nested(inner) => self.column(inner),
            _ => None,
        }
    }
}

fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, out);
            conjuncts(right, out);
        }
        Expr::Nested(inner) => conjuncts(inner, out),
        other => out.push(other),
    }
}

/// Extract schema/version restrictions for one relation reference.
///
/// `version_id` is only considered when `with_versions` is set (the
/// all-versions relation); the active-version relation is already pinned.
pub fn extract(
    selection: Option<&Expr>,
    relation_name: &str,
    allow_unqualified: bool,
    with_versions: bool,
    params: &[Value],
    placeholders: &Placeholders,
) -> RelationFilter {
    let mut filter = RelationFilter::default();
    let Some(selection) = selection else {
        return filter;
    };
    let target = Target {
        relation_name,
        allow_unqualified,
    };

    let mut parts = Vec::new();
    conjuncts(selection, &mut parts);
    for conjunct in parts {
        let Some((column, values)) = constraint(conjunct, &target, params, placeholders) else {
            continue;
        };
        match column.as_str() {
            "schema_key" => narrow(&mut filter.schema_keys, values),
            "version_id" if with_versions => narrow(&mut filter.version_ids, values),
            _ => {}
        }
    }
    filter
}

fn constraint(
    expr: &Expr,
    target: &Target<'_>,
    params: &[Value],
    placeholders: &Placeholders,
) -> Option<(String, BTreeSet<String>)> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if let (Some(column), Some(value)) =
                (target.column(left), text_value(right, params, placeholders))
            {
                return Some((column, BTreeSet::from([value])));
            }
            let column = target.column(right)?;
            let value = text_value(left, params, placeholders)?;
            Some((column, BTreeSet::from([value])))
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let column = target.column(expr)?;
            let values = list
                .iter()
                .map(|item| text_value(item, params, placeholders))
                .collect::<Option<BTreeSet<_>>>()?;
            Some((column, values))
        }
        _ => None,
    }
}
