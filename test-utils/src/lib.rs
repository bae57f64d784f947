//! Test utilities for the block-sync workspace
//!
//! Builders for headers and transactions, failure injection and assertion macros used by
//! the integration tests. Engine collaborators (chain, clock, transport) live behind the
//! `test-utils` feature of `block-sync` itself.

pub mod builders;
pub mod helpers;
pub mod macros;

pub use builders::*;
pub use helpers::*;
