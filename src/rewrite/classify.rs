//! Statement classification.
//!
//! Every parsed statement lands in exactly one [`Classification`] before any
//! rewriting happens. Anything the rewriter cannot prove it handles maps to
//! an explicit [`UntouchedReason`].

use crate::schema::{STATE_ALL_VIEW, STATE_VIEW};
use sqlparser::ast::{ObjectName, ObjectNamePart, Query, Statement, TableFactor, Visit, Visitor};
use std::fmt;
use std::ops::ControlFlow;

/// The virtual relations the rewriter replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualRelation {
    /// Current state of the active version.
    State,
    /// Current state of every version.
    StateAll,
}

impl VirtualRelation {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case(STATE_VIEW) {
            Some(VirtualRelation::State)
        } else if name.eq_ignore_ascii_case(STATE_ALL_VIEW) {
            Some(VirtualRelation::StateAll)
        } else {
            None
        }
    }

    /// Only single-part names refer to the virtual relations.
    pub fn from_object_name(name: &ObjectName) -> Option<Self> {
        match name.0.as_slice() {
            [part] => ObjectNamePart::as_ident(part).and_then(|ident| Self::from_name(&ident.value)),
            _ => None,
        }
    }
}

/// Why a statement was passed through unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UntouchedReason {
    /// The statement does not mention `state` or `state_all`.
    NoVirtualRelation,
    ParseFailure(String),
    MultipleStatements,
    /// DML, DDL or anything else that is not a query.
    NonQueryStatement,
    /// A CTE named like a virtual relation shadows it.
    ShadowingCte,
    /// `state(...)` used as a table-valued function.
    TableValuedCall,
    /// A reference appears somewhere the rewriter does not walk.
    ReferenceOutsideFrom { found: usize, handled: usize },
    /// Building the replacement failed; the statement runs as written.
    RewriteFailed(String),
}

impl fmt::Display for UntouchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntouchedReason::NoVirtualRelation => f.write_str("no virtual relation"),
            UntouchedReason::ParseFailure(e) => write!(f, "parse failure: {e}"),
            UntouchedReason::MultipleStatements => f.write_str("multiple statements"),
            UntouchedReason::NonQueryStatement => f.write_str("not a query"),
            UntouchedReason::ShadowingCte => f.write_str("shadowing CTE"),
            UntouchedReason::TableValuedCall => f.write_str("table-valued call"),
            UntouchedReason::ReferenceOutsideFrom { found, handled } => {
                write!(f, "{found} references found, {handled} handled")
            }
            UntouchedReason::RewriteFailed(e) => write!(f, "rewrite failed: {e}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    NoVirtualRelation,
    /// A query whose `references` virtual-relation references may be rewritten.
    Supported { references: usize },
    Unhandled(UntouchedReason),
}

#[derive(Default)]
struct ReferenceScan {
    references: usize,
    shadowing_cte: bool,
    table_valued: bool,
}

impl Visitor for ReferenceScan {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if VirtualRelation::from_object_name(relation).is_some() {
            self.references += 1;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table {
            name,
            args: Some(_),
            ..
        } = table_factor
        {
            if VirtualRelation::from_object_name(name).is_some() {
                self.table_valued = true;
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            if with
                .cte_tables
                .iter()
                .any(|cte| VirtualRelation::from_name(&cte.alias.name.value).is_some())
            {
                self.shadowing_cte = true;
            }
        }
        ControlFlow::Continue(())
    }
}

/// Number of virtual-relation references anywhere in the statement.
pub fn count_references(statement: &Statement) -> usize {
    let mut scan = ReferenceScan::default();
    let _ = statement.visit(&mut scan);
    scan.references
}

/// Classify a parsed statement list.
pub fn classify(statements: &[Statement]) -> Classification {
    let [statement] = statements else {
        let mentions = statements.iter().map(count_references).sum::<usize>();
        return if mentions == 0 {
            Classification::NoVirtualRelation
        } else {
            Classification::Unhandled(UntouchedReason::MultipleStatements)
        };
    };

    let mut scan = ReferenceScan::default();
    let _ = statement.visit(&mut scan);
    if scan.references == 0 && !scan.table_valued {
        return Classification::NoVirtualRelation;
    }
    if !matches!(statement, Statement::Query(_)) {
        return Classification::Unhandled(UntouchedReason::NonQueryStatement);
    }
    if scan.shadowing_cte {
        return Classification::Unhandled(UntouchedReason::ShadowingCte);
    }
    if scan.table_valued {
        return Classification::Unhandled(UntouchedReason::TableValuedCall);
    }
    Classification::Supported {
        references: scan.references,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::SQLiteDialect;
    use sqlparser::parser::Parser;

    fn classify_sql(sql: &str) -> Classification {
        classify(&Parser::parse_sql(&SQLiteDialect {}, sql).unwrap())
    }

    #[test]
    fn test_plain_reference_is_supported() {
        assert_eq!(
            classify_sql("SELECT * FROM state WHERE schema_key = 'todo'"),
            Classification::Supported { references: 1 }
        );
        assert_eq!(
            classify_sql("SELECT a.entity_id FROM STATE_ALL a JOIN state b ON a.entity_id = b.entity_id"),
            Classification::Supported { references: 2 }
        );
    }

    #[test]
    fn test_unrelated_statement() {
        assert_eq!(
            classify_sql("SELECT * FROM lix_internal_change"),
            Classification::NoVirtualRelation
        );
        assert_eq!(classify_sql("SELECT 'state'"), Classification::NoVirtualRelation);
    }

    #[test]
    fn test_unhandled_shapes() {
        assert_eq!(
            classify_sql("DELETE FROM state WHERE entity_id = 'x'"),
            Classification::Unhandled(UntouchedReason::NonQueryStatement)
        );
        assert_eq!(
            classify_sql("WITH state AS (SELECT 1 AS entity_id) SELECT * FROM state"),
            Classification::Unhandled(UntouchedReason::ShadowingCte)
        );
        assert_eq!(
            classify_sql("SELECT 1; SELECT * FROM state"),
            Classification::Unhandled(UntouchedReason::MultipleStatements)
        );
    }

    #[test]
    fn test_qualified_names_are_not_virtual() {
        assert_eq!(
            classify_sql("SELECT * FROM main.state"),
            Classification::NoVirtualRelation
        );
    }
}
