//! Blob store backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Implementations include local disk and memory.

pub mod backend;
pub mod local;
pub mod memory;
