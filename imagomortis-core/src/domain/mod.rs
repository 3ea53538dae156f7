//! Core domain types
//!
//! These types describe a work item as it moves through the scheduler:
//! unassigned, acquired by one scheduler instance, then completed or failed.
//! They are shared between the work queue (persistence) and the reconciler
//! (execution).

pub mod job;
pub mod progress;
pub mod work_item;
