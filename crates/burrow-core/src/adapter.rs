//! The `Adapter` trait: the contract every storage backend (in-memory,
//! redb-backed, HTTP) implements. This is the boundary between the
//! datastore facade and the concrete storage engine.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::document::{
    AllDocsOptions, AllDocsResponse, AttachmentMeta, AttachmentPutResult, ChangesOptions,
    ChangesResponse, DbInfo, Document, GetAttachmentOptions, GetOptions,
};
use crate::error::{BurrowError, Result};
use crate::revision::{Revision, compute_suffix};

/// One entry of a document's history as carried on the wire by
/// `_revisions`/`force_insert`: newest revision first, down to the oldest
/// ancestor the sender still knows about.
pub type History = Vec<Revision>;

/// Options for a local, new-edits write (`put`/`delete`).
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Permit writing a new leaf alongside an existing one instead of
    /// failing with `Conflict`. Used by `force_insert`-adjacent local flows;
    /// ordinary client writes leave this `false`.
    pub allow_conflict: bool,
}

/// Storage-backend contract.
///
/// `put`/`delete` are the new-edits path: generation and suffix are
/// computed by the caller's wrapper (the facade), conflict rules enforced
/// here. `force_insert` is the replication path: the full history arrives
/// with the revision, validation is structural only, and it is idempotent.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Insert `rev` as a child of `prev_rev` (or as a new tree root if
    /// `prev_rev` is `None`). Fails with `Conflict` if `prev_rev` is not a
    /// current leaf (or, when `prev_rev` is `None`, if a non-deleted leaf
    /// already exists) unless `opts.allow_conflict`.
    async fn put(
        &self,
        doc_id: &str,
        rev: Revision,
        body: serde_json::Value,
        attachments: HashMap<String, AttachmentMeta>,
        prev_rev: Option<Revision>,
        opts: PutOptions,
    ) -> Result<Revision>;

    /// Tombstone the named leaf. Equivalent to `put` with `deleted=true` and
    /// an empty body; tombstones never carry attachments.
    async fn delete(&self, doc_id: &str, prev_rev: Revision) -> Result<Revision>;

    /// Tombstone every current non-deleted leaf of `doc_id` in one
    /// transaction, returning the new tombstone revisions.
    async fn delete_by_id(&self, doc_id: &str) -> Result<Vec<Revision>>;

    /// Fetch a document. Without `opts.rev`, returns the winner.
    async fn get(&self, doc_id: &str, opts: GetOptions) -> Result<Document>;

    /// Graft `doc` onto the existing tree using `history` (newest to
    /// oldest, `doc.rev` included). Missing ancestors are created as
    /// body-less stubs. Idempotent: re-applying an already-present revision
    /// succeeds without changing anything.
    async fn force_insert(
        &self,
        doc: Document,
        history: History,
        source: Option<String>,
    ) -> Result<()>;

    /// Of the `(doc_id, rev)` pairs offered by a peer, return the subset not
    /// already present locally (by revision, not just by id).
    async fn find_missing(&self, revs: &[(String, Revision)]) -> Result<Vec<(String, Revision)>>;

    async fn changes_since(&self, options: ChangesOptions) -> Result<ChangesResponse>;

    async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse>;

    /// Every revision from `rev` up to its tree root, newest first.
    async fn revision_history(&self, doc_id: &str, rev: &Revision) -> Result<Vec<Revision>>;

    /// Ancestor candidates of `doc_id`'s current leaf with bodies still
    /// present, decreasing by revision. Used to build `atts_since` so a
    /// puller doesn't re-fetch attachments it already has.
    async fn possible_ancestors(&self, doc_id: &str, limit: usize) -> Result<Vec<Revision>>;

    /// Null out bodies of non-leaf, non-deleted revisions, then garbage
    /// collect attachment blobs no surviving leaf references.
    async fn compact(&self) -> Result<()>;

    async fn info(&self) -> Result<DbInfo>;

    /// All document ids in the store, ignoring conflicts/deletions at the
    /// leaf level (used by extension/diagnostic tooling, not replication).
    async fn all_document_ids(&self) -> Result<Vec<String>>;

    async fn get_local(&self, doc_id: &str) -> Result<Option<serde_json::Value>>;

    async fn put_local(&self, doc_id: &str, data: serde_json::Value) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Stream raw bytes straight into this adapter's content-addressed blob
    /// store, returning the SHA-1 key. Used by the multipart reader so a
    /// `follows: true` attachment part never has to be base64-inlined into
    /// a document body just to cross the adapter boundary; the returned
    /// key is then carried on
    /// [`crate::document::AttachmentMeta::resolved_key`] into `force_insert`.
    async fn store_attachment_bytes(&self, bytes: &[u8]) -> Result<[u8; 20]>;

    /// Read back bytes previously handed to [`Adapter::store_attachment_bytes`]
    /// by content-addressed key. Backends with no local blob store of their
    /// own (the HTTP adapter) fail with [`BurrowError::Upstream`]; such
    /// backends are expected to override [`Adapter::get_attachment`] instead
    /// of relying on the default implementation built on this method.
    async fn read_attachment_bytes(&self, key: &[u8; 20]) -> Result<Vec<u8>>;

    /// Attach `data` under `filename` to the revision named by `rev`,
    /// producing a new child revision that carries every attachment the
    /// parent had (as stubs) plus this one. Mirrors a CouchDB
    /// `PUT /db/doc/filename?rev=...` attachment upload.
    async fn put_attachment(
        &self,
        doc_id: &str,
        filename: &str,
        rev: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<AttachmentPutResult> {
        let parent: Revision = rev.parse()?;
        let doc = self
            .get(doc_id, GetOptions { rev: Some(rev.to_string()), attachments: true, ..Default::default() })
            .await?;
        let key = self.store_attachment_bytes(&data).await?;

        let mut attachments = doc.attachments.clone();
        attachments.insert(
            filename.to_string(),
            AttachmentMeta {
                content_type: content_type.to_string(),
                digest: AttachmentMeta::digest_from_key(&key),
                length: data.len() as u64,
                encoding: Default::default(),
                encoded_length: None,
                revpos: 0,
                stub: false,
                follows: false,
                data: None,
                resolved_key: Some(key),
            },
        );

        let suffix = compute_suffix(Some(&parent), &doc.data);
        let new_rev = Revision::child_of(Some(&parent), suffix);
        let result_rev = self
            .put(doc_id, new_rev, doc.data, attachments, Some(parent), PutOptions::default())
            .await?;
        Ok(AttachmentPutResult { ok: true, id: doc_id.to_string(), rev: result_rev.to_string() })
    }

    /// Read the bytes of `filename` as attached to `doc_id` (the winner, or
    /// `opts.rev` if given).
    async fn get_attachment(
        &self,
        doc_id: &str,
        filename: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>> {
        let doc = self
            .get(doc_id, GetOptions { rev: opts.rev.clone(), attachments: true, ..Default::default() })
            .await?;
        let meta = doc.attachments.get(filename).ok_or_else(|| {
            BurrowError::NotFound(format!("attachment {filename} not found on {doc_id}"))
        })?;
        let key = meta.digest_key()?;
        self.read_attachment_bytes(&key).await
    }
}
