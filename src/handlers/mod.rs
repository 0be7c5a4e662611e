//! HTTP handlers for the cache namespaces.

pub mod cache;
