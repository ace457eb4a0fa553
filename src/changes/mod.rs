//! Append-only change store.
//!
//! Every mutation of a tracked entity is one immutable row. Updates never
//! touch an existing row; they append a new change that the commit graph
//! makes reachable instead.

mod store;

pub(crate) use store::{
    change_count, changes_in_change_set, get_change, insert_change, insert_change_with_id,
    validate_schema_key, RESERVED_SCHEMA_KEY,
};
