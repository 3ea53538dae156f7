//! Scheduler layer
//!
//! Drives the claim, process, repeat cycle. One item is in flight at a
//! time per scheduler instance; run more instances to scale out.

pub mod control_loop;

pub use control_loop::ControlLoop;
