//! Request classification and object naming.
//!
//! Only two path shapes mean anything: `/ac/<key>` and `/cas/<key>`, read
//! with `GET` or written with `PUT`.  The backing-store key is the request
//! path minus its leading `/`, so the namespace prefix is part of the key.

use axum::http::{Method, Uri};

/// Logical namespace of a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Action cache: small result records keyed by action digest.
    Ac,
    /// Content-addressed store: blobs keyed by content digest.
    Cas,
}

impl Namespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Namespace::Ac => "ac/",
            Namespace::Cas => "cas/",
        }
    }

    pub const ALL: [Namespace; 2] = [Namespace::Ac, Namespace::Cas];
}

/// Operation requested on a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Retrieve,
    Upload,
}

/// A request that names a cache object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub operation: Operation,
    pub namespace: Namespace,
    /// Backing-store key, namespace prefix included.
    pub object_key: String,
}

/// Map a request URI to its backing-store key: the path with its single
/// leading `/` removed.  Scheme, host and query are ignored.  No
/// normalization is applied.
pub fn to_object_key(uri: &Uri) -> String {
    let path = uri.path();
    path.strip_prefix('/').unwrap_or(path).to_string()
}

/// Classify a request; `None` means the route does not exist.
pub fn classify(method: &Method, uri: &Uri) -> Option<Route> {
    let operation = if method == Method::GET {
        Operation::Retrieve
    } else if method == Method::PUT {
        Operation::Upload
    } else {
        return None;
    };

    let object_key = to_object_key(uri);
    let namespace = Namespace::ALL.into_iter().find(|ns| {
        object_key
            .strip_prefix(ns.prefix())
            .is_some_and(|rest| !rest.is_empty())
    })?;

    Some(Route {
        operation,
        namespace,
        object_key,
    })
}
