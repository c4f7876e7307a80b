//! A replication endpoint: either a live CouchDB-protocol peer reachable
//! over HTTP, or any local [`Adapter`] (memory, redb, or even another
//! [`HttpAdapter`] handed in generically). Keeping the HTTP case distinct
//! lets the engine use the wire-level machinery — backoff retries,
//! `_bulk_get`, `multipart/related` dispatch — when it's actually talking
//! to a remote CouchDB, while falling back to plain, in-process `Adapter`
//! calls for adapter-to-adapter transfers that never touch the network.

use std::sync::Arc;

use burrow_adapter_http::HttpAdapter;
use burrow_core::adapter::Adapter;

#[derive(Clone)]
pub enum Peer {
    Http(Arc<HttpAdapter>),
    Local(Arc<dyn Adapter>),
}

impl Peer {
    pub fn adapter(&self) -> Arc<dyn Adapter> {
        match self {
            Peer::Http(a) => a.clone(),
            Peer::Local(a) => a.clone(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Peer::Http(a) => a.name(),
            Peer::Local(a) => a.name(),
        }
    }
}
