//! Filesystem setup for node isolation.
//!
//! Provides the pseudo-filesystem mount table of a node and `pivot_root`
//! for switching into its root filesystem.

pub mod mount;
pub mod pivot_root;
