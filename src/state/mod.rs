//! Reading current entity state.
//!
//! Three renditions of the same function live here: the graph-walking
//! resolver (ground truth), the generic state SQL (its relational twin) and
//! the per-schema cache populated from that SQL.

pub mod cache;
pub mod resolver;
pub mod sql;

pub use cache::CacheScope;
pub use resolver::{resolve, resolve_at_commits, resolve_schema};
pub use sql::{StateSqlFilter, VersionFilter};
