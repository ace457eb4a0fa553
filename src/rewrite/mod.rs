//! Query rewriting for the virtual `state` / `state_all` relations.
//!
//! A statement is parsed (through an LRU cache keyed by SQL text),
//! classified, and either rewritten or passed through unchanged:
//!
//! ```text
//! SELECT entity_id FROM state WHERE schema_key = ?
//!   -> SELECT entity_id FROM (SELECT entity_id, schema_key, ... FROM
//!        lix_internal_state_cache_v1_todo WHERE version_id = (...)) AS state
//!      WHERE schema_key = ?1
//! ```
//!
//! Rewriting never changes what a statement returns; anything the rewriter
//! cannot prove it handles runs as written against the views.

mod classify;
mod filters;
mod params;
mod plan;

pub use classify::{classify, count_references, Classification, UntouchedReason, VirtualRelation};
pub use filters::RelationFilter;
pub use params::{number_placeholders, Placeholders};
pub use plan::RelationPlan;

use crate::state::cache::CacheScope;
use crate::types::Value;
use lru::LruCache;
use plan::{ColumnUsage, RelationRewriter};
use sqlparser::ast::{Statement, VisitMut};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::num::NonZeroUsize;
use tracing::{debug, trace};

/// Default number of parsed statements kept.
pub const DEFAULT_PARSE_CACHE_SIZE: usize = 256;

/// LRU of parse results keyed by SQL text.
pub struct ParseCache {
    entries: LruCache<String, Result<Vec<Statement>, String>>,
    hits: u64,
    misses: u64,
}

impl ParseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Parse `sql`, reusing a previous result for identical text.
    pub fn parse(&mut self, sql: &str) -> Result<Vec<Statement>, String> {
        if let Some(parsed) = self.entries.get(sql) {
            self.hits += 1;
            return parsed.clone();
        }
        self.misses += 1;
        let parsed = Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|e| e.to_string());
        self.entries.put(sql.to_string(), parsed.clone());
        parsed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

/// Per-call rewrite context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RewriteContext {
    /// Union transaction-local pending rows into every reference.
    pub overlay: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewrittenStatement {
    pub sql: String,
    /// Cache scopes that must be fresh before `sql` runs.
    pub cache_scopes: Vec<CacheScope>,
    /// One plan per replaced reference, in replacement order.
    pub plans: Vec<RelationPlan>,
    /// True when at least one reference projects fewer than all columns.
    pub pruned: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten(RewrittenStatement),
    Untouched(UntouchedReason),
}

impl RewriteOutcome {
    /// SQL to execute: the rewrite, or `original` byte-for-byte.
    pub fn sql<'a>(&'a self, original: &'a str) -> &'a str {
        match self {
            RewriteOutcome::Rewritten(rewritten) => &rewritten.sql,
            RewriteOutcome::Untouched(_) => original,
        }
    }

    pub fn is_rewritten(&self) -> bool {
        matches!(self, RewriteOutcome::Rewritten(_))
    }

    pub fn cache_scopes(&self) -> &[CacheScope] {
        match self {
            RewriteOutcome::Rewritten(rewritten) => &rewritten.cache_scopes,
            RewriteOutcome::Untouched(_) => &[],
        }
    }
}

/// Statement rewriter with its parse cache.
pub struct Rewriter {
    parse_cache: ParseCache,
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new(DEFAULT_PARSE_CACHE_SIZE)
    }
}

impl Rewriter {
    pub fn new(parse_cache_size: usize) -> Self {
        Self {
            parse_cache: ParseCache::new(parse_cache_size),
        }
    }

    pub fn parse_cache(&self) -> &ParseCache {
        &self.parse_cache
    }

    /// Rewrite one statement. Never fails; problems become `Untouched`.
    pub fn rewrite(&mut self, sql: &str, params: &[Value], context: &RewriteContext) -> RewriteOutcome {
        let outcome = self.rewrite_inner(sql, params, context);
        match &outcome {
            RewriteOutcome::Rewritten(rewritten) => {
                debug!(plans = ?rewritten.plans, pruned = rewritten.pruned, "rewrote statement");
                trace!(sql = %rewritten.sql, "rewritten sql");
            }
            RewriteOutcome::Untouched(UntouchedReason::NoVirtualRelation) => {}
            RewriteOutcome::Untouched(reason) => debug!(%reason, "statement left untouched"),
        }
        outcome
    }

    fn rewrite_inner(&mut self, sql: &str, params: &[Value], context: &RewriteContext) -> RewriteOutcome {
        let statements = match self.parse_cache.parse(sql) {
            Ok(statements) => statements,
            Err(e) => return RewriteOutcome::Untouched(UntouchedReason::ParseFailure(e)),
        };
        let references = match classify(&statements) {
            Classification::NoVirtualRelation => {
                return RewriteOutcome::Untouched(UntouchedReason::NoVirtualRelation)
            }
            Classification::Unhandled(reason) => return RewriteOutcome::Untouched(reason),
            Classification::Supported { references } => references,
        };
        let Some(mut statement) = statements.into_iter().next() else {
            return RewriteOutcome::Untouched(UntouchedReason::NoVirtualRelation);
        };

        let placeholders = number_placeholders(&mut statement);
        let columns = ColumnUsage::scan(&statement);
        let mut rewriter = RelationRewriter::new(
            &mut self.parse_cache,
            params,
            &placeholders,
            context.overlay,
            &columns,
        );
        let _ = VisitMut::visit(&mut statement, &mut rewriter);

        if let Some(e) = rewriter.error {
            return RewriteOutcome::Untouched(UntouchedReason::RewriteFailed(e));
        }
        let remaining = count_references(&statement);
        if rewriter.handled != references || remaining != 0 {
            return RewriteOutcome::Untouched(UntouchedReason::ReferenceOutsideFrom {
                found: references,
                handled: rewriter.handled,
            });
        }

        RewriteOutcome::Rewritten(RewrittenStatement {
            sql: statement.to_string(),
            cache_scopes: rewriter.scopes,
            plans: rewriter.plans,
            pruned: rewriter.pruned,
        })
    }
}
