//! Testing utilities for strata migrations.
//!
//! [`MemoryDatabase`] implements [`Connection`](crate::driver::Connection)
//! without a server, so runner behaviour can be checked in unit tests and
//! in downstream crates that ship their own migration sets.

mod memory;

pub use memory::{MemoryConnection, MemoryDatabase, MemoryDialect, MemoryRow};

use strata_core::schema::MigrationScript;

use crate::migrations::MigrationRegistry;

/// Build a registry from scripts, failing the test on duplicate ids.
pub fn registry_of(scripts: impl IntoIterator<Item = MigrationScript>) -> MigrationRegistry {
    match MigrationRegistry::from_scripts(scripts) {
        Ok(registry) => registry,
        Err(e) => panic!("invalid test registry: {}", e),
    }
}
