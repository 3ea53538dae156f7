//! Repository layer
//!
//! Repositories abstract the durable store of work items. The scheduler
//! only ever reads unassigned rows and advances their `job` field; the rows
//! themselves are created by the ingest side.
//!
//! Repositories are trait-based so the pipeline can be exercised against an
//! in-memory queue in tests.

mod work_items;

// Re-export traits
pub use work_items::WorkQueue;

// Re-export implementations
pub use work_items::PgWorkQueue;
