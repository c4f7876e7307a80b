//! Persistent local storage engine for Burrow, backed by
//! `redb` — a pure-Rust, single-file, crash-safe B-tree store with ACID
//! transactions. This is the durable counterpart to `burrow-adapter-memory`:
//! same [`Adapter`] contract, same revision-tree algorithm from
//! `burrow-core`, persisted across restarts.
//!
//! Schema (every table is byte-keyed/valued so one small set of tables
//! carries every document shape, a relational design reprojected onto a
//! KV store):
//!
//! - `docs`: `doc_id -> json(RevTree)` — the revision tree per document.
//! - `bodies`: `"doc_id\0rev" -> json(StoredBody)` — body + attachment
//!   metadata per revision; absent or `json: null` for tombstones and
//!   compacted ancestors.
//! - `localdocs`: `doc_id -> json(Value)` — `_local/` documents.
//! - `by_seq`: `seq -> doc_id` — the by-sequence index `changes_since` walks.
//! - `info`: `key -> bytes` — `seq_counter`, `privateUUID`, `publicUUID`,
//!   `schema_version`, `encryption_fingerprint`.
//! - `replicators`: `remote -> json(Checkpoint)` — pull checkpoints.
//! - `blob_filenames`: `key(20 bytes) -> filename` — the blob store's index,
//!   passed to `burrow_blobstore::BlobStore` as its [`BlobIndex`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use burrow_blobstore::{BlobIndex, BlobKey, BlobStore};
use burrow_core::adapter::{Adapter, History, PutOptions};
use burrow_core::document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, AttachmentMeta, AttachmentRecord,
    ChangeEvent, ChangeRev, ChangesOptions, ChangesResponse, DbInfo, Document, GetOptions, Seq,
};
use burrow_core::error::{BurrowError, Result};
use burrow_core::merge::{is_deleted, merge_tree, winning_rev};
use burrow_core::rev_tree::{self, NodeOpts, RevPath, RevStatus, RevTree};
use burrow_core::revision::{Revision, is_valid_doc_id};

const DOCS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("docs");
const BODIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bodies");
const LOCALS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("localdocs");
const SEQ_TABLE: TableDefinition<u64, &str> = TableDefinition::new("by_seq");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("info");
const REPLICATORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("replicators");
const BLOB_FILENAMES_TABLE: TableDefinition<&[u8], &str> = TableDefinition::new("blob_filenames");

/// Bumped whenever the on-disk shape of the tables above changes: base
/// schema, the `replicators` JSON rewrite, and the `blob_filenames` table
/// each bumped it in turn. This crate is written fresh against the end
/// state, so "migrating" an empty store just means stamping this.
const SCHEMA_VERSION: u64 = 6;

fn body_key(doc_id: &str, rev: &Revision) -> String {
    format!("{doc_id}\0{rev}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredBody {
    json: Option<serde_json::Value>,
    attachments: HashMap<String, AttachmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    #[serde(default)]
    push: bool,
    /// `{"seq": <opaque>}`, an opaque checkpoint cursor.
    last_sequence: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Closed,
    Open,
}

/// The key -> filename index for `burrow_blobstore::BlobStore`, backed by
/// `blob_filenames`. Each call opens its own short-lived transaction: the
/// blob store's own `install()` already scopes filename assignment to a
/// single atomic rename-then-register, so this doesn't need to share the
/// document write's transaction to keep that contract.
struct RedbBlobIndex {
    db: Arc<Database>,
}

#[async_trait]
impl BlobIndex for RedbBlobIndex {
    async fn lookup(&self, key: &BlobKey) -> Result<Option<String>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(BLOB_FILENAMES_TABLE).map_err(storage_err)?;
        Ok(table
            .get(key.as_slice())
            .map_err(storage_err)?
            .map(|v| v.value().to_string()))
    }

    async fn insert(&self, key: &BlobKey, filename: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(BLOB_FILENAMES_TABLE).map_err(storage_err)?;
            table.insert(key.as_slice(), filename).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn remove(&self, key: &BlobKey) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(BLOB_FILENAMES_TABLE).map_err(storage_err)?;
            table.remove(key.as_slice()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn all(&self) -> Result<Vec<(BlobKey, String)>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(BLOB_FILENAMES_TABLE).map_err(storage_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (k, v) = entry.map_err(storage_err)?;
            let mut key = [0u8; 20];
            key.copy_from_slice(k.value());
            out.push((key, v.value().to_string()));
        }
        Ok(out)
    }
}

fn storage_err(e: impl std::fmt::Display) -> BurrowError {
    BurrowError::Storage(e.to_string())
}

/// Durable, `redb`-backed [`Adapter`].
pub struct RedbAdapter {
    name: String,
    db: Arc<Database>,
    blob_store: BlobStore,
    write_lock: Mutex<()>,
    state: Mutex<EngineState>,
}

impl RedbAdapter {
    /// Open (creating if absent) a store rooted at `base_dir`: `base_dir/db.redb`
    /// holds the tables above, `base_dir/blobs/` holds attachment content.
    ///
    /// `encryption_key` gates the state machine's reopen check: it is
    /// not itself applied to data at rest here — encrypting blob content is
    /// left to an external collaborator — but reopening an already-`Open`
    /// store with a different key is still rejected.
    ///
    /// Synchronous: `redb` itself has no async API, and this lets
    /// `burrow`'s facade offer a plain, non-async `Database::open`.
    pub fn open(base_dir: impl Into<PathBuf>, encryption_key: Option<&[u8]>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let db_path = base_dir.join("db.redb");
        let db = Database::create(&db_path).map_err(storage_err)?;

        Self::run_migrations(&db, encryption_key)?;

        let db = Arc::new(db);
        let blob_store = BlobStore::new(
            base_dir.join("blobs"),
            Arc::new(RedbBlobIndex { db: db.clone() }),
        )?;

        let name = base_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "redb".to_string());

        Ok(Self {
            name,
            db,
            blob_store,
            write_lock: Mutex::new(()),
            state: Mutex::new(EngineState::Open),
        })
    }

    fn run_migrations(db: &Database, encryption_key: Option<&[u8]>) -> Result<()> {
        let txn = db.begin_write().map_err(storage_err)?;
        {
            let mut meta = txn.open_table(META_TABLE).map_err(storage_err)?;

            let stored_version = meta
                .get("schema_version")
                .map_err(storage_err)?
                .map(|v| u64::from_le_bytes(v.value().try_into().unwrap_or_default()));
            if stored_version.is_none() {
                meta.insert("schema_version", SCHEMA_VERSION.to_le_bytes().as_slice())
                    .map_err(storage_err)?;
                meta.insert("seq_counter", 0u64.to_le_bytes().as_slice())
                    .map_err(storage_err)?;
                meta.insert(
                    "privateUUID",
                    uuid::Uuid::new_v4().to_string().as_bytes(),
                )
                .map_err(storage_err)?;
                meta.insert("publicUUID", uuid::Uuid::new_v4().to_string().as_bytes())
                    .map_err(storage_err)?;
            }

            let stored_fingerprint = meta
                .get("encryption_fingerprint")
                .map_err(storage_err)?
                .map(|v| v.value().to_vec());
            let fingerprint = encryption_key.map(fingerprint_of);
            match (&stored_fingerprint, &fingerprint) {
                (Some(stored), Some(given)) if stored != given => {
                    return Err(BurrowError::BadRequest(
                        "cannot reopen store with a different encryption key".into(),
                    ));
                }
                (None, Some(given)) => {
                    meta.insert("encryption_fingerprint", given.as_slice())
                        .map_err(storage_err)?;
                }
                _ => {}
            }
        }
        // Ensure every other table exists even on a brand-new file.
        txn.open_table(DOCS_TABLE).map_err(storage_err)?;
        txn.open_table(BODIES_TABLE).map_err(storage_err)?;
        txn.open_table(LOCALS_TABLE).map_err(storage_err)?;
        txn.open_table(SEQ_TABLE).map_err(storage_err)?;
        txn.open_table(REPLICATORS_TABLE).map_err(storage_err)?;
        txn.open_table(BLOB_FILENAMES_TABLE).map_err(storage_err)?;
        txn.commit().map_err(storage_err)
    }

    async fn ensure_open(&self) -> Result<()> {
        if *self.state.lock().await != EngineState::Open {
            return Err(BurrowError::Closed);
        }
        Ok(())
    }

    /// Transition to `Closed`. Subsequent operations fail with
    /// [`BurrowError::Closed`] until [`Self::open`] is called again.
    pub async fn close(&self) {
        *self.state.lock().await = EngineState::Closed;
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    /// Override the name derived from `base_dir`'s final path component —
    /// useful when the directory name isn't a meaningful identity (a
    /// temp-dir path, say) and the caller has a better one in hand.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn read_tree(&self, doc_id: &str) -> Result<RevTree> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
        match table.get(doc_id).map_err(storage_err)? {
            Some(bytes) => Ok(serde_json::from_slice(bytes.value())?),
            None => Ok(Vec::new()),
        }
    }

    fn read_body(&self, doc_id: &str, rev: &Revision) -> Result<Option<StoredBody>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(BODIES_TABLE).map_err(storage_err)?;
        match table.get(body_key(doc_id, rev).as_str()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Resolve a write's attachments: stub attachments are copied from the
    /// parent revision's stored record; non-stub attachments are streamed
    /// into the blob store.
    async fn resolve_attachments(
        &self,
        doc_id: &str,
        parent: Option<&Revision>,
        revpos: u64,
        incoming: HashMap<String, AttachmentMeta>,
    ) -> Result<HashMap<String, AttachmentRecord>> {
        let mut out = HashMap::new();
        for (name, meta) in incoming {
            if meta.stub {
                let parent_rev = parent.ok_or_else(|| {
                    BurrowError::BadRequest(format!("stub attachment {name} has no parent revision"))
                })?;
                let parent_body = self.read_body(doc_id, parent_rev)?.ok_or_else(|| {
                    BurrowError::NotFound(format!("attachment {name} not present on parent revision"))
                })?;
                let record = parent_body.attachments.get(&name).cloned().ok_or_else(|| {
                    BurrowError::NotFound(format!("attachment {name} not present on parent revision"))
                })?;
                out.insert(name, record);
                continue;
            }

            if let Some(key) = meta.resolved_key {
                out.insert(
                    name.clone(),
                    AttachmentRecord {
                        filename: name,
                        content_type: meta.content_type,
                        length: meta.length,
                        revpos,
                        encoding: meta.encoding,
                        encoded_length: meta.encoded_length,
                        key,
                    },
                );
                continue;
            }

            let key = meta.digest_key()?;
            let bytes = meta.decode_inline_data()?;
            let computed = sha1_of(&bytes);
            if computed != key {
                return Err(BurrowError::BadRequest(format!(
                    "attachment {name} digest does not match its content"
                )));
            }
            if bytes.len() as u64 != meta.length {
                return Err(BurrowError::BadRequest(format!(
                    "attachment {name} length does not match its content"
                )));
            }
            self.blob_store.store(&bytes).await?;
            out.insert(
                name.clone(),
                AttachmentRecord {
                    filename: name,
                    content_type: meta.content_type,
                    length: meta.length,
                    revpos,
                    encoding: meta.encoding,
                    encoded_length: meta.encoded_length,
                    key,
                },
            );
        }
        Ok(out)
    }

    fn next_seq(&self, txn: &redb::WriteTransaction) -> Result<u64> {
        let mut meta = txn.open_table(META_TABLE).map_err(storage_err)?;
        let current = meta
            .get("seq_counter")
            .map_err(storage_err)?
            .map(|v| u64::from_le_bytes(v.value().try_into().unwrap_or_default()))
            .unwrap_or(0);
        let next = current + 1;
        meta.insert("seq_counter", next.to_le_bytes().as_slice())
            .map_err(storage_err)?;
        Ok(next)
    }

    fn attachment_record_to_meta(record: &AttachmentRecord) -> AttachmentMeta {
        AttachmentMeta {
            content_type: record.content_type.clone(),
            digest: AttachmentMeta::digest_from_key(&record.key),
            length: record.length,
            encoding: record.encoding,
            encoded_length: record.encoded_length,
            revpos: record.revpos,
            stub: true,
            follows: false,
            data: None,
            resolved_key: None,
        }
    }
}

fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut key = [0u8; 20];
    key.copy_from_slice(&digest);
    key
}

fn fingerprint_of(key: &[u8]) -> Vec<u8> {
    sha1_of(key).to_vec()
}

fn tombstone_suffix(doc_id: &str, parent: &Revision) -> String {
    use md5::{Digest as _, Md5};
    let mut hasher = Md5::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(parent.to_string().as_bytes());
    hasher.update(b"deleted");
    hex::encode(hasher.finalize())
}

#[async_trait]
impl Adapter for RedbAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        doc_id: &str,
        rev: Revision,
        body: serde_json::Value,
        attachments: HashMap<String, AttachmentMeta>,
        prev_rev: Option<Revision>,
        opts: PutOptions,
    ) -> Result<Revision> {
        self.ensure_open().await?;
        Document::validate_body(&body)?;
        if !is_valid_doc_id(doc_id) {
            return Err(BurrowError::BadRequest(format!("invalid document id {doc_id}")));
        }
        let expected_gen = prev_rev.as_ref().map(|r| r.generation + 1).unwrap_or(1);
        if rev.generation != expected_gen {
            return Err(BurrowError::BadRequest(
                "revision generation does not follow its parent".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;

        let tree = self.read_tree(doc_id)?;
        match &prev_rev {
            Some(parent) => {
                let node = rev_tree::find_node(&tree, parent.generation, &parent.suffix)
                    .ok_or(BurrowError::Conflict)?;
                if !node.is_leaf() && !opts.allow_conflict {
                    return Err(BurrowError::Conflict);
                }
            }
            None => {
                if !opts.allow_conflict {
                    let has_leaf = rev_tree::collect_leaves(&tree).iter().any(|l| !l.deleted);
                    if has_leaf {
                        return Err(BurrowError::Conflict);
                    }
                }
            }
        }

        let resolved = self
            .resolve_attachments(doc_id, prev_rev.as_ref(), rev.generation, attachments)
            .await?;

        let new_path = RevPath {
            pos: rev.generation,
            tree: rev_tree::RevNode {
                hash: rev.suffix.clone(),
                status: RevStatus::Available,
                opts: NodeOpts { deleted: false },
                children: vec![],
            },
        };
        let (merged, _) = merge_tree(&tree, &new_path, 1000);
        let stored_body = StoredBody {
            json: Some(body),
            attachments: resolved,
        };

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut docs = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
            docs.insert(doc_id, serde_json::to_vec(&merged)?.as_slice())
                .map_err(storage_err)?;
            let mut bodies = txn.open_table(BODIES_TABLE).map_err(storage_err)?;
            bodies
                .insert(
                    body_key(doc_id, &rev).as_str(),
                    serde_json::to_vec(&stored_body)?.as_slice(),
                )
                .map_err(storage_err)?;
            let seq = self.next_seq(&txn)?;
            let mut seq_table = txn.open_table(SEQ_TABLE).map_err(storage_err)?;
            seq_table.insert(seq, doc_id).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        Ok(rev)
    }

    async fn delete(&self, doc_id: &str, prev_rev: Revision) -> Result<Revision> {
        self.ensure_open().await?;
        let _guard = self.write_lock.lock().await;

        let tree = self.read_tree(doc_id)?;
        if tree.is_empty() {
            return Err(BurrowError::NotFound(doc_id.to_string()));
        }
        let node = rev_tree::find_node(&tree, prev_rev.generation, &prev_rev.suffix)
            .ok_or(BurrowError::Conflict)?;
        if !node.is_leaf() || node.opts.deleted {
            return Err(BurrowError::Conflict);
        }

        let new_rev = Revision::child_of(Some(&prev_rev), tombstone_suffix(doc_id, &prev_rev));
        let new_path = RevPath {
            pos: new_rev.generation,
            tree: rev_tree::RevNode {
                hash: new_rev.suffix.clone(),
                status: RevStatus::Available,
                opts: NodeOpts { deleted: true },
                children: vec![],
            },
        };
        let (merged, _) = merge_tree(&tree, &new_path, 1000);

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut docs = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
            docs.insert(doc_id, serde_json::to_vec(&merged)?.as_slice())
                .map_err(storage_err)?;
            let mut bodies = txn.open_table(BODIES_TABLE).map_err(storage_err)?;
            bodies
                .insert(
                    body_key(doc_id, &new_rev).as_str(),
                    serde_json::to_vec(&StoredBody::default())?.as_slice(),
                )
                .map_err(storage_err)?;
            let seq = self.next_seq(&txn)?;
            let mut seq_table = txn.open_table(SEQ_TABLE).map_err(storage_err)?;
            seq_table.insert(seq, doc_id).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        Ok(new_rev)
    }

    async fn delete_by_id(&self, doc_id: &str) -> Result<Vec<Revision>> {
        self.ensure_open().await?;
        let _guard = self.write_lock.lock().await;

        let tree = self.read_tree(doc_id)?;
        if tree.is_empty() {
            return Err(BurrowError::NotFound(doc_id.to_string()));
        }
        let leaves = rev_tree::collect_leaves(&tree);
        let mut working = tree;
        let mut tombstones = Vec::new();
        let mut bodies_to_write = Vec::new();

        for leaf in leaves.iter().filter(|l| !l.deleted) {
            let parent = leaf.revision();
            let new_rev = Revision::child_of(Some(&parent), tombstone_suffix(doc_id, &parent));
            let new_path = RevPath {
                pos: new_rev.generation,
                tree: rev_tree::RevNode {
                    hash: new_rev.suffix.clone(),
                    status: RevStatus::Available,
                    opts: NodeOpts { deleted: true },
                    children: vec![],
                },
            };
            let (merged, _) = merge_tree(&working, &new_path, 1000);
            working = merged;
            bodies_to_write.push(new_rev.clone());
            tombstones.push(new_rev);
        }

        if tombstones.is_empty() {
            return Ok(tombstones);
        }

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut docs = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
            docs.insert(doc_id, serde_json::to_vec(&working)?.as_slice())
                .map_err(storage_err)?;
            let mut bodies = txn.open_table(BODIES_TABLE).map_err(storage_err)?;
            for rev in &bodies_to_write {
                bodies
                    .insert(
                        body_key(doc_id, rev).as_str(),
                        serde_json::to_vec(&StoredBody::default())?.as_slice(),
                    )
                    .map_err(storage_err)?;
            }
            let seq = self.next_seq(&txn)?;
            let mut seq_table = txn.open_table(SEQ_TABLE).map_err(storage_err)?;
            seq_table.insert(seq, doc_id).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        Ok(tombstones)
    }

    async fn get(&self, doc_id: &str, opts: GetOptions) -> Result<Document> {
        self.ensure_open().await?;
        let tree = self.read_tree(doc_id)?;
        if tree.is_empty() {
            return Err(BurrowError::NotFound(doc_id.to_string()));
        }

        let target = match &opts.rev {
            Some(rev_str) => rev_str.parse::<Revision>()?,
            None => winning_rev(&tree).ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?,
        };
        let node = rev_tree::find_node(&tree, target.generation, &target.suffix)
            .ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?;
        if node.opts.deleted && opts.rev.is_none() {
            return Err(BurrowError::Deleted(doc_id.to_string()));
        }

        let stored = self.read_body(doc_id, &target)?.ok_or_else(|| {
            BurrowError::NotFound(format!("{doc_id}@{target} body unavailable"))
        })?;
        let mut data = stored.json.unwrap_or_else(|| serde_json::json!({}));

        if opts.conflicts {
            let conflicts: Vec<String> = rev_tree::collect_leaves(&tree)
                .into_iter()
                .map(|l| l.revision())
                .filter(|r| *r != target && !rev_tree::find_node(&tree, r.generation, &r.suffix).is_some_and(|n| n.opts.deleted))
                .map(|r| r.to_string())
                .collect();
            if !conflicts.is_empty() {
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("_conflicts".to_string(), serde_json::Value::Array(
                        conflicts.into_iter().map(serde_json::Value::String).collect(),
                    ));
                }
            }
        }

        let mut doc = Document::new(doc_id, data);
        doc.rev = Some(target);
        doc.deleted = node.opts.deleted;
        if opts.attachments || !stored.attachments.is_empty() {
            doc.attachments = stored
                .attachments
                .values()
                .map(|r| (r.filename.clone(), Self::attachment_record_to_meta(r)))
                .collect();
        }
        Ok(doc)
    }

    async fn force_insert(&self, doc: Document, history: History, _source: Option<String>) -> Result<()> {
        self.ensure_open().await?;
        if history.is_empty() {
            return Err(BurrowError::BadRequest("force_insert requires a non-empty history".into()));
        }
        let leaf_rev = doc
            .rev
            .clone()
            .ok_or_else(|| BurrowError::BadRequest("force_insert requires the document to carry its revision".into()))?;
        if history[0] != leaf_rev {
            return Err(BurrowError::BadRequest(
                "force_insert history must start with the document's own revision".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let tree = self.read_tree(&doc.id)?;
        if rev_tree::find_node(&tree, leaf_rev.generation, &leaf_rev.suffix).is_some() {
            return Ok(());
        }

        let hashes: Vec<String> = history.iter().map(|r| r.suffix.clone()).collect();
        let new_path = rev_tree::build_stub_chain(
            leaf_rev.generation,
            &hashes,
            RevStatus::Available,
            NodeOpts { deleted: doc.deleted },
        );
        let (merged, _) = merge_tree(&tree, &new_path, 1000);

        let immediate_parent = history.get(1);
        let resolved = self
            .resolve_attachments(&doc.id, immediate_parent, leaf_rev.generation, doc.attachments.clone())
            .await?;
        let stored_body = StoredBody {
            json: Some(doc.data.clone()),
            attachments: resolved,
        };

        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut docs = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
            docs.insert(doc.id.as_str(), serde_json::to_vec(&merged)?.as_slice())
                .map_err(storage_err)?;
            let mut bodies = txn.open_table(BODIES_TABLE).map_err(storage_err)?;
            bodies
                .insert(
                    body_key(&doc.id, &leaf_rev).as_str(),
                    serde_json::to_vec(&stored_body)?.as_slice(),
                )
                .map_err(storage_err)?;
            let seq = self.next_seq(&txn)?;
            let mut seq_table = txn.open_table(SEQ_TABLE).map_err(storage_err)?;
            seq_table.insert(seq, doc.id.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;

        Ok(())
    }

    async fn find_missing(&self, revs: &[(String, Revision)]) -> Result<Vec<(String, Revision)>> {
        self.ensure_open().await?;
        let mut missing = Vec::new();
        for (doc_id, rev) in revs {
            let tree = self.read_tree(doc_id)?;
            if rev_tree::find_node(&tree, rev.generation, &rev.suffix).is_none() {
                missing.push((doc_id.clone(), rev.clone()));
            }
        }
        Ok(missing)
    }

    async fn changes_since(&self, options: ChangesOptions) -> Result<ChangesResponse> {
        self.ensure_open().await?;
        let since = options.since.as_num();
        let mut results = Vec::new();
        let mut last_seq = options.since.clone();

        let txn = self.db.begin_read().map_err(storage_err)?;
        let seq_table = txn.open_table(SEQ_TABLE).map_err(storage_err)?;
        for entry in seq_table
            .range((since + 1)..)
            .map_err(storage_err)?
        {
            let (seq_guard, doc_id_guard) = entry.map_err(storage_err)?;
            let seq = seq_guard.value();
            let doc_id = doc_id_guard.value().to_string();

            if let Some(ids) = &options.doc_ids {
                if !ids.contains(&doc_id) {
                    continue;
                }
            }

            let tree = self.read_tree(&doc_id)?;
            let leaves = rev_tree::collect_leaves(&tree);
            let winner = match leaves.first() {
                Some(w) => w,
                None => continue,
            };

            let changes = if options.style_all_docs {
                leaves.iter().map(|l| ChangeRev { rev: l.revision().to_string() }).collect()
            } else {
                vec![ChangeRev { rev: winner.revision().to_string() }]
            };

            let body = self.read_body(&doc_id, &winner.revision())?.and_then(|b| b.json);

            if let Some(selector) = &options.selector {
                match &body {
                    Some(json) if burrow_core::selector::matches(json, selector) => {}
                    _ => continue,
                }
            }

            let doc_json = if options.include_docs { body } else { None };

            results.push(ChangeEvent {
                seq: Seq::Num(seq),
                id: doc_id,
                changes,
                deleted: winner.deleted,
                doc: doc_json,
            });
            last_seq = Seq::Num(seq);

            if let Some(limit) = options.limit {
                if results.len() as u64 >= limit {
                    break;
                }
            }
        }

        Ok(ChangesResponse { results, last_seq })
    }

    async fn all_docs(&self, options: AllDocsOptions) -> Result<AllDocsResponse> {
        self.ensure_open().await?;
        let txn = self.db.begin_read().map_err(storage_err)?;
        let docs_table = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
        let total_rows = docs_table.len().map_err(storage_err)?;

        if let Some(keys) = &options.keys {
            let mut rows = Vec::new();
            for key in keys {
                let tree = self.read_tree(key)?;
                let leaves = rev_tree::collect_leaves(&tree);
                match leaves.first() {
                    Some(winner) if !winner.deleted || options.include_docs => {
                        rows.push(self.all_docs_row(key, winner, options.include_docs)?);
                    }
                    _ => rows.push(AllDocsRow {
                        id: key.clone(),
                        key: key.clone(),
                        value: None,
                        doc: None,
                        error: Some("not_found".into()),
                    }),
                }
            }
            return Ok(AllDocsResponse { total_rows, offset: 0, rows });
        }

        let mut ids: Vec<String> = docs_table
            .iter()
            .map_err(storage_err)?
            .map(|e| e.map(|(k, _)| k.value().to_string()))
            .collect::<std::result::Result<_, _>>()
            .map_err(storage_err)?;
        ids.sort();
        if options.descending {
            ids.reverse();
        }

        let mut rows = Vec::new();
        for id in &ids {
            if let Some(start) = &options.start_key {
                if (!options.descending && id < start) || (options.descending && id > start) {
                    continue;
                }
            }
            if let Some(end) = &options.end_key {
                let past_end = if options.descending { id < end } else { id > end };
                let at_end = id == end;
                if past_end || (at_end && !options.inclusive_end) {
                    continue;
                }
            }

            let tree = self.read_tree(id)?;
            let leaves = rev_tree::collect_leaves(&tree);
            if let Some(winner) = leaves.first() {
                if !winner.deleted {
                    rows.push(self.all_docs_row(id, winner, options.include_docs)?);
                }
            }
        }

        let offset = options.skip.min(rows.len() as u64);
        let mut rows: Vec<_> = rows.into_iter().skip(offset as usize).collect();
        if let Some(limit) = options.limit {
            rows.truncate(limit as usize);
        }

        Ok(AllDocsResponse { total_rows, offset, rows })
    }

    async fn revision_history(&self, doc_id: &str, rev: &Revision) -> Result<Vec<Revision>> {
        self.ensure_open().await?;
        let tree = self.read_tree(doc_id)?;
        rev_tree::path_to_root(&tree, rev.generation, &rev.suffix)
            .ok_or_else(|| BurrowError::NotFound(format!("{doc_id}@{rev}")))
    }

    async fn possible_ancestors(&self, doc_id: &str, limit: usize) -> Result<Vec<Revision>> {
        self.ensure_open().await?;
        let tree = self.read_tree(doc_id)?;
        let mut candidates = Vec::new();
        for (rev, _, status, _) in rev_tree::collect_all(&tree) {
            if status != RevStatus::Available {
                continue;
            }
            if self.read_body(doc_id, &rev)?.map(|b| b.json.is_some()).unwrap_or(false) {
                candidates.push(rev);
            }
        }
        candidates.sort_by(|a, b| b.cmp(a));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn compact(&self) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.write_lock.lock().await;

        let doc_ids: Vec<String> = {
            let txn = self.db.begin_read().map_err(storage_err)?;
            let docs_table = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
            docs_table
                .iter()
                .map_err(storage_err)?
                .map(|e| e.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(storage_err)?
        };

        let mut keep_keys: HashSet<BlobKey> = HashSet::new();
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut bodies = txn.open_table(BODIES_TABLE).map_err(storage_err)?;
            for doc_id in &doc_ids {
                let tree = self.read_tree(doc_id)?;
                let leaf_revs: HashSet<Revision> =
                    rev_tree::collect_leaves(&tree).into_iter().map(|l| l.revision()).collect();
                for (rev, _, _, _) in rev_tree::collect_all(&tree) {
                    let key = body_key(doc_id, &rev);
                    let Some(bytes) = bodies.get(key.as_str()).map_err(storage_err)?.map(|v| v.value().to_vec()) else {
                        continue;
                    };
                    let mut stored: StoredBody = serde_json::from_slice(&bytes)?;
                    if leaf_revs.contains(&rev) {
                        keep_keys.extend(stored.attachments.values().map(|a| a.key));
                    } else if stored.json.is_some() || !stored.attachments.is_empty() {
                        stored.json = None;
                        stored.attachments.clear();
                        bodies
                            .insert(key.as_str(), serde_json::to_vec(&stored)?.as_slice())
                            .map_err(storage_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(storage_err)?;

        self.blob_store.gc(&keep_keys).await?;
        Ok(())
    }

    async fn info(&self) -> Result<DbInfo> {
        self.ensure_open().await?;
        let txn = self.db.begin_read().map_err(storage_err)?;
        let docs_table = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
        let meta = txn.open_table(META_TABLE).map_err(storage_err)?;
        let seq_counter = meta
            .get("seq_counter")
            .map_err(storage_err)?
            .map(|v| u64::from_le_bytes(v.value().try_into().unwrap_or_default()))
            .unwrap_or(0);

        let mut doc_count = 0u64;
        for entry in docs_table.iter().map_err(storage_err)? {
            let (_, bytes) = entry.map_err(storage_err)?;
            let tree: RevTree = serde_json::from_slice(bytes.value())?;
            if !is_deleted(&tree) {
                doc_count += 1;
            }
        }

        Ok(DbInfo {
            db_name: self.name.clone(),
            doc_count,
            update_seq: Seq::Num(seq_counter),
        })
    }

    async fn all_document_ids(&self) -> Result<Vec<String>> {
        self.ensure_open().await?;
        let txn = self.db.begin_read().map_err(storage_err)?;
        let docs_table = txn.open_table(DOCS_TABLE).map_err(storage_err)?;
        docs_table
            .iter()
            .map_err(storage_err)?
            .map(|e| e.map(|(k, _)| k.value().to_string()))
            .collect::<std::result::Result<_, _>>()
            .map_err(storage_err)
    }

    async fn get_local(&self, doc_id: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_open().await?;
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(LOCALS_TABLE).map_err(storage_err)?;
        match table.get(doc_id).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn put_local(&self, doc_id: &str, data: serde_json::Value) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.write_lock.lock().await;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(LOCALS_TABLE).map_err(storage_err)?;
            table
                .insert(doc_id, serde_json::to_vec(&data)?.as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn destroy(&self) -> Result<()> {
        if *self.state.lock().await == EngineState::Open {
            return Err(BurrowError::BadRequest(
                "destroy is only allowed on a closed store".into(),
            ));
        }
        Ok(())
    }

    async fn store_attachment_bytes(&self, bytes: &[u8]) -> Result<[u8; 20]> {
        self.ensure_open().await?;
        self.blob_store.store(bytes).await
    }

    async fn read_attachment_bytes(&self, key: &[u8; 20]) -> Result<Vec<u8>> {
        self.ensure_open().await?;
        let reader = self.blob_store.read(key).await?;
        reader.read_to_end().await
    }
}

impl RedbAdapter {
    fn all_docs_row(&self, id: &str, winner: &rev_tree::LeafInfo, include_docs: bool) -> Result<AllDocsRow> {
        let doc = if include_docs {
            self.read_body(id, &winner.revision())?.and_then(|b| b.json).map(|data| {
                let mut doc = Document::new(id, data);
                doc.rev = Some(winner.revision());
                doc.to_json()
            })
        } else {
            None
        };
        Ok(AllDocsRow {
            id: id.to_string(),
            key: id.to_string(),
            value: Some(AllDocsRowValue {
                rev: winner.revision().to_string(),
                deleted: if winner.deleted { Some(true) } else { None },
            }),
            doc,
            error: None,
        })
    }

    /// Read a replication checkpoint, `{"seq": <opaque>}`, for `remote`.
    pub async fn get_checkpoint(&self, remote: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_open().await?;
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(REPLICATORS_TABLE).map_err(storage_err)?;
        match table.get(remote).map_err(storage_err)? {
            Some(bytes) => {
                let checkpoint: Checkpoint = serde_json::from_slice(bytes.value())?;
                Ok(Some(checkpoint.last_sequence))
            }
            None => Ok(None),
        }
    }

    /// Persist a replication checkpoint for `remote`, keyed stably by the
    /// replicator's own checkpoint id.
    pub async fn put_checkpoint(&self, remote: &str, seq: serde_json::Value, push: bool) -> Result<()> {
        self.ensure_open().await?;
        let _guard = self.write_lock.lock().await;
        let checkpoint = Checkpoint { push, last_sequence: seq };
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(REPLICATORS_TABLE).map_err(storage_err)?;
            table
                .insert(remote, serde_json::to_vec(&checkpoint)?.as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn adapter() -> (tempfile::TempDir, RedbAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let a = RedbAdapter::open(dir.path(), None).unwrap();
        (dir, a)
    }

    fn rev(gen: u64, suffix: &str) -> Revision {
        Revision::new(gen, suffix)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_dir, a) = adapter().await;
        let r = a
            .put("d1", rev(1, "a"), serde_json::json!({"x": 1}), HashMap::new(), None, PutOptions::default())
            .await
            .unwrap();
        let doc = a.get("d1", GetOptions::default()).await.unwrap();
        assert_eq!(doc.rev.unwrap(), r);
        assert_eq!(doc.data["x"], 1);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let a = RedbAdapter::open(dir.path(), None).unwrap();
            a.put("d1", rev(1, "a"), serde_json::json!({"x": 1}), HashMap::new(), None, PutOptions::default())
                .await
                .unwrap();
        }
        let a2 = RedbAdapter::open(dir.path(), None).unwrap();
        let doc = a2.get("d1", GetOptions::default()).await.unwrap();
        assert_eq!(doc.data["x"], 1);
    }

    #[tokio::test]
    async fn put_conflict_on_stale_parent() {
        let (_dir, a) = adapter().await;
        a.put("d1", rev(1, "a"), serde_json::json!({}), HashMap::new(), None, PutOptions::default())
            .await
            .unwrap();
        a.put(
            "d1",
            rev(2, "b"),
            serde_json::json!({}),
            HashMap::new(),
            Some(rev(1, "a")),
            PutOptions::default(),
        )
        .await
        .unwrap();

        let err = a
            .put(
                "d1",
                rev(2, "c"),
                serde_json::json!({}),
                HashMap::new(),
                Some(rev(1, "a")),
                PutOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BurrowError::Conflict));
    }

    #[tokio::test]
    async fn delete_tombstones_leaf() {
        let (_dir, a) = adapter().await;
        let r1 = a
            .put("d1", rev(1, "a"), serde_json::json!({}), HashMap::new(), None, PutOptions::default())
            .await
            .unwrap();
        let tomb = a.delete("d1", r1).await.unwrap();
        let err = a.get("d1", GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, BurrowError::Deleted(_)));
        let doc = a.get("d1", GetOptions { rev: Some(tomb.to_string()), ..Default::default() }).await.unwrap();
        assert!(doc.deleted);
    }

    #[tokio::test]
    async fn force_insert_is_idempotent() {
        let (_dir, a) = adapter().await;
        let mut doc = Document::new("d1", serde_json::json!({"a": 1}));
        doc.rev = Some(rev(1, "a"));
        let history = vec![rev(1, "a")];

        a.force_insert(doc.clone(), history.clone(), None).await.unwrap();
        a.force_insert(doc, history, None).await.unwrap();

        let stored = a.get("d1", GetOptions::default()).await.unwrap();
        assert_eq!(stored.data["a"], 1);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let (_dir, a) = adapter().await;
        a.close().await;
        let err = a.get("d1", GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, BurrowError::Closed));
    }

    #[tokio::test]
    async fn compact_preserves_leaf_attachment_blobs() {
        let (_dir, a) = adapter().await;
        let bytes = b"attachment body".to_vec();
        let key = a.blob_store().store(&bytes).await.unwrap();
        let digest = AttachmentMeta::digest_from_key(&key);

        let mut attachments = HashMap::new();
        attachments.insert(
            "a.txt".to_string(),
            AttachmentMeta {
                content_type: "text/plain".into(),
                digest,
                length: bytes.len() as u64,
                encoding: burrow_core::document::AttachmentEncoding::None,
                encoded_length: None,
                revpos: 1,
                stub: false,
                follows: false,
                data: Some(base64_encode(&bytes)),
                resolved_key: None,
            },
        );

        a.put("d1", rev(1, "a"), serde_json::json!({}), attachments, None, PutOptions::default())
            .await
            .unwrap();
        a.compact().await.unwrap();

        assert!(a.blob_store().read(&key).await.is_ok());
    }

    fn base64_encode(bytes: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}
