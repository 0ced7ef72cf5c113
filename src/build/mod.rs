//! Build utilities for the kernel tree.
//!
//! This module provides:
//! - [`context`] - Run directory layout and work directory locking
//! - [`kernel`] - Config seeding, kernel/module/header builds

pub mod context;
pub mod kernel;
