//! Positional parameter handling.
//!
//! Bare `?` placeholders are renumbered to `?N` in source order, so the
//! rewritten text keeps binding the same values even though the rewriter
//! moves and duplicates SQL around them. Explicit `?N` placeholders are kept
//! as they are. Statements mixing bare `?` with other placeholder styles
//! keep their placeholders and are treated as having no resolvable values.

use crate::types::Value;
use sqlparser::ast::{Expr, Statement, Value as AstValue, ValueWithSpan, Visit, VisitMut, Visitor, VisitorMut};
use std::collections::HashMap;
use std::ops::ControlFlow;

#[derive(Default)]
struct PlaceholderScan {
    /// (line, column, token) in visitation order.
    found: Vec<(u64, u64, String)>,
}

impl Visitor for PlaceholderScan {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Value(ValueWithSpan {
            value: AstValue::Placeholder(token),
            span,
        }) = expr
        {
            self.found
                .push((span.start.line, span.start.column, token.clone()));
        }
        ControlFlow::Continue(())
    }
}

struct PlaceholderNumbering {
    /// Source position to assigned number.
    by_position: HashMap<(u64, u64), usize>,
    /// Fallback when positions are unknown: visitation order.
    use_position: bool,
    next: usize,
}

impl VisitorMut for PlaceholderNumbering {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if let Expr::Value(ValueWithSpan {
            value: AstValue::Placeholder(token),
            span,
        }) = expr
        {
            if token.as_str() == "?" {
                let number = if self.use_position {
                    self.by_position
                        .get(&(span.start.line, span.start.column))
                        .copied()
                        .unwrap_or(0)
                } else {
                    self.next += 1;
                    self.next
                };
                *token = format!("?{number}");
            }
        }
        ControlFlow::Continue(())
    }
}

/// How placeholders in a statement map to bound values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placeholders {
    /// Every placeholder is `?N`; values can be resolved.
    Numbered,
    /// Placeholder styles the rewriter does not resolve.
    Opaque,
}

/// Rewrite bare `?` to `?N` in source order.
pub fn number_placeholders(statement: &mut Statement) -> Placeholders {
    let mut scan = PlaceholderScan::default();
    let _ = Visit::visit(&*statement, &mut scan);

    let bare = scan.found.iter().filter(|(_, _, token)| token == "?").count();
    let numbered = scan
        .found
        .iter()
        .filter(|(_, _, token)| numbered_index(token).is_some())
        .count();
    if bare + numbered != scan.found.len() || (bare > 0 && numbered > 0) {
        return Placeholders::Opaque;
    }
    if bare == 0 {
        return Placeholders::Numbered;
    }

    let mut positions: Vec<(u64, u64)> = scan
        .found
        .iter()
        .map(|(line, column, _)| (*line, *column))
        .collect();
    positions.sort_unstable();
    positions.dedup();
    let use_position = positions.len() == scan.found.len() && positions.iter().all(|(line, _)| *line > 0);
    let by_position = positions
        .into_iter()
        .enumerate()
        .map(|(index, position)| (position, index + 1))
        .collect();

    let mut numbering = PlaceholderNumbering {
        by_position,
        use_position,
        next: 0,
    };
    let _ = VisitMut::visit(statement, &mut numbering);
    Placeholders::Numbered
}

fn numbered_index(token: &str) -> Option<usize> {
    token.strip_prefix('?')?.parse::<usize>().ok().filter(|n| *n > 0)
}

/// Resolve a literal or numbered placeholder to a text value.
pub fn text_value(expr: &Expr, params: &[Value], placeholders: &Placeholders) -> Option<String> {
    match expr {
        Expr::Value(ValueWithSpan {
            value: AstValue::SingleQuotedString(text),
            ..
        }) => Some(text.clone()),
        Expr::Value(ValueWithSpan {
            value: AstValue::Placeholder(token),
            ..
        }) if *placeholders == Placeholders::Numbered => {
            let index = numbered_index(token)?;
            params.get(index - 1)?.as_text().map(str::to_string)
        }
        Expr::Nested(inner) => text_value(inner, params, placeholders),
        _ => None,
    }
}
