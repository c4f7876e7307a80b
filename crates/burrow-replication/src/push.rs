//! Push replicator: a local-first store needs to send its own edits
//! somewhere too, not just pull remote ones in. Mirror image of
//! [`crate::pull::PullReplicator`]: the
//! local adapter plays `source`, the remote CouchDB-protocol peer plays
//! `target`. Same [`crate::engine`] underneath.
//!
//! No separate conflict-resolution step exists here (`DESIGN.md` Open
//! Question 1): both directions transfer every branch via `force_insert`,
//! and the deterministic winner algorithm alone brings source and target to
//! the same answer once their trees match.

use std::sync::Arc;

use burrow_adapter_http::HttpAdapter;
use burrow_core::adapter::Adapter;
use burrow_core::error::Result;

use crate::peer::Peer;
use crate::{ReplicationOptions, ReplicationResult};

/// Pushes revisions from a local [`Adapter`] to a remote CouchDB-protocol
/// target.
pub struct PushReplicator {
    source: Arc<dyn Adapter>,
    target: Arc<HttpAdapter>,
}

impl PushReplicator {
    pub fn new(source: Arc<dyn Adapter>, target: Arc<HttpAdapter>) -> Self {
        Self { source, target }
    }

    pub async fn run(&self, opts: &ReplicationOptions) -> Result<ReplicationResult> {
        crate::engine::run(&Peer::Local(self.source.clone()), &Peer::Http(self.target.clone()), opts).await
    }
}
