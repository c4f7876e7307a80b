//! Pull replicator: drains a remote `_changes` feed,
//! fetches whatever the target doesn't already have, and grafts it in with
//! `force_insert` so every branch survives for the winner algorithm to
//! settle later.
//!
//! Collapsed to a single bounded [`PullReplicator::run`] call rather than a
//! backgrounded, cancellable task (see `DESIGN.md`): the facade's tests
//! always await one `ReplicationResult`, and repeated calls are how
//! "continuous" replication is expressed here. The actual batch loop lives
//! in [`crate::engine`], shared with [`crate::push::PushReplicator`] and
//! the fully generic [`crate::replicate`].

use std::sync::Arc;

use burrow_adapter_http::HttpAdapter;
use burrow_core::adapter::Adapter;
use burrow_core::error::Result;

use crate::peer::Peer;
use crate::{ReplicationOptions, ReplicationResult};

/// Pulls revisions from a remote CouchDB-protocol source into any local
/// [`Adapter`].
pub struct PullReplicator {
    source: Arc<HttpAdapter>,
    target: Arc<dyn Adapter>,
}

impl PullReplicator {
    pub fn new(source: Arc<HttpAdapter>, target: Arc<dyn Adapter>) -> Self {
        Self { source, target }
    }

    pub async fn run(&self, opts: &ReplicationOptions) -> Result<ReplicationResult> {
        crate::engine::run(&Peer::Http(self.source.clone()), &Peer::Local(self.target.clone()), opts).await
    }
}
