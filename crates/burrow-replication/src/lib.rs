//! CouchDB replication protocol implementation for Burrow.
//!
//! Two bounded, one-shot replicators: [`pull::PullReplicator`] drains a
//! remote `_changes` feed into a local [`burrow_core::adapter::Adapter`];
//! [`push::PushReplicator`] is its mirror image, driving a local adapter's
//! own `changes_since` against a remote target. Both transfer every branch
//! of a document's revision tree via `force_insert` rather than resolving
//! conflicts themselves — see `DESIGN.md` Open Question 1.

mod engine;
pub mod multipart;
mod peer;
mod pending;
pub mod pull;
pub mod push;

pub use peer::Peer;
pub use pull::PullReplicator;
pub use push::PushReplicator;

/// Tuning knobs for one replication run. `Default` matches what a bare
/// `replicate_to`/`replicate_from` call on the facade uses.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Number of changes requested per `_changes`/`changes_since` batch.
    pub batch_size: u64,
    /// Restrict replication to these document ids only, if set.
    pub doc_ids: Option<Vec<String>>,
    /// Mango-style selector filtering which changes are replicated.
    pub selector: Option<serde_json::Value>,
    /// Override the derived `_local/<id>` checkpoint document id — lets
    /// two independent replication pairings between the same two peers
    /// (e.g. filtered vs. unfiltered) keep separate checkpoints.
    pub checkpoint_id: Option<String>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self { batch_size: 1000, doc_ids: None, selector: None, checkpoint_id: None }
    }
}

/// Summary of one completed replication run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationResult {
    pub ok: bool,
    pub docs_read: u64,
    pub docs_written: u64,
    /// Revisions the target's `validate_doc_update` rejected (`Forbidden`);
    /// skipped rather than aborting the run.
    pub docs_failed: u64,
}

/// Stable `_local/<id>` checkpoint document id for a (source, target)
/// pairing, derived from a SHA-1 of their names and the direction so a
/// push and a pull between the same two peers never share a checkpoint.
pub(crate) fn derive_checkpoint_id(source_name: &str, target_name: &str, direction: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(source_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(target_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(direction.as_bytes());
    format!("burrow-{}", hex::encode(hasher.finalize()))
}

/// Replicate one direction between any two peers — a remote CouchDB over
/// HTTP or a plain local [`burrow_core::adapter::Adapter`] on either side.
/// [`PullReplicator`]/[`PushReplicator`] are typed convenience wrappers
/// around this for the common remote-source/remote-target cases; this is
/// what a local-to-local transfer (memory to redb, say) goes through
/// directly.
pub async fn replicate(
    source: Peer,
    target: Peer,
    opts: &ReplicationOptions,
) -> burrow_core::error::Result<ReplicationResult> {
    engine::run(&source, &target, opts).await
}

/// Push `a`'s edits into `b`, then pull `b`'s edits into `a`.
pub async fn sync(
    a: Peer,
    b: Peer,
    opts: &ReplicationOptions,
) -> burrow_core::error::Result<(ReplicationResult, ReplicationResult)> {
    let push = engine::run(&a, &b, opts).await?;
    let pull = engine::run(&b, &a, opts).await?;
    Ok((push, pull))
}
