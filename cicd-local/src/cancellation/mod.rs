//! Scoped cleanup for run-owned resources: a registry of named actions run
//! LIFO on every exit path, including interrupts and drop.

mod cleanup;

pub use cleanup::CleanupRegistry;
