//! Imagomortis Core
//!
//! Core types shared by the imagomortis scheduler components.
//!
//! This crate contains:
//! - Work item types: the `images` row and the lifecycle of its `job` field
//! - Claim and outcome types exchanged between the queue and the reconciler
//! - Progress records emitted by the image task worker

pub mod domain;
