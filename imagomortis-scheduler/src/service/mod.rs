//! Service layer
//!
//! Everything that happens to a claimed item once it leaves the queue:
//! staging files on the shared volume, running the ephemeral job, watching
//! it, streaming its progress and reconciling the result.
//!
//! Platform access goes through the [`JobPlatform`] trait so the services
//! can be exercised without a cluster.

pub mod orchestrator;
pub mod platform;
pub mod progress;
pub mod reconciler;
pub mod storage;
pub mod watcher;

pub use platform::{JobPlatform, KubePlatform};
pub use reconciler::Reconciler;
pub use storage::SharedVolume;
