//! Reusable test utilities: temporary locker trees, descriptor and
//! instance-record writers, and a fully wired manager stack.

// Allow unused code in test fixtures - they are utilities shared
// across test binaries that each use a subset.
#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;
