//! The commit graph.
//!
//! Commits form a DAG stored as rows with ordered parent edges. Traversal is
//! by id lookup; nothing holds references between nodes.

mod commits;
mod history;

pub use commits::{
    add_to_change_set, change_set_count, change_set_elements, commit_change_set_id, commit_count,
    commit_exists, commits_since, create_commit, create_empty_change_set, get_commit,
    import_commit, is_ancestor, max_commit_seq, parents, set_parents,
};
pub use history::{
    commit_history, create_checkpoint, create_undo_commit, graft_commit, merge_version,
    seal_working_commit,
};
