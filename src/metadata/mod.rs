//! Metadata index layer.
//!
//! The index records when each cached object was last used.  The
//! [`store::MetadataIndex`] trait defines the interface;
//! [`sqlite::SqliteMetadataIndex`] is the default implementation and
//! [`memory::MemoryMetadataIndex`] backs tests and ephemeral setups.

pub mod memory;
pub mod sqlite;
pub mod store;
