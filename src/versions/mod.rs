//! Versions: named pointers into the commit graph.
//!
//! A version tracks a sealed head commit and an open working commit whose
//! first parent is the head. Switching versions only moves the active
//! pointer; entity data is never copied.

mod protocol;
mod registry;

pub(crate) use protocol::stage_existing;
pub(crate) use registry::insert_version;
pub use protocol::{commit_version, delete_entity, stage_change};
pub use registry::{
    active_version_id, create_version, get_version, hide_version, inheritors, lineage,
    list_versions, require_version, set_active_version, set_inherits_from, update_pointers,
    version_by_name, version_count, MAIN_VERSION_NAME,
};
