//! Node lifecycle management for the Nexus runtime.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backend;
pub mod claim;
pub mod engine;
pub mod isolation;
pub mod process;
pub mod state;
