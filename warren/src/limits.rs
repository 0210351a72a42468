//! Hard ceilings on meta-data artifacts, checked before anything is
//! fetched or pinned.
//!
//! A hostile or broken channel can only hurt its own followers, so these
//! exist mainly to catch incorrectly published references before they pull
//! gigabytes of the wrong data into the local store.  The same ceilings
//! apply on the followee and explicit-cache paths.

/// The root index document.  Tiny by construction.
pub const MAX_INDEX_SIZE_BYTES: u64 = 1024;

/// The channel description.  Largely human-written text.
pub const MAX_DESCRIPTION_SIZE_BYTES: u64 = 64 * 1024;

/// List-shaped meta-data (recommendations, record list).  Unbounded in
/// principle, tiny in practice.
pub const MAX_META_LIST_SIZE_BYTES: u64 = 128 * 1024;

/// A single post record, including all its attachment references.
pub const MAX_RECORD_SIZE_BYTES: u64 = 128 * 1024;

/// The user picture referenced by the description.
pub const MAX_USER_PIC_SIZE_BYTES: u64 = 2 * 1024 * 1024;
