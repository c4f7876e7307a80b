//! Pure in-memory [`Adapter`] implementation.
//!
//! Keeps every document's revision tree, revision bodies, local documents,
//! and attachment blobs in process memory behind a single async mutex. Used
//! as the reference backend for unit tests and for ephemeral, non-durable
//! databases; `burrow-adapter-redb` implements the same contract durably.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use burrow_core::adapter::{Adapter, History, PutOptions};
use burrow_core::document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, AttachmentMeta, AttachmentRecord,
    ChangeEvent, ChangeRev, ChangesOptions, ChangesResponse, DbInfo, Document, GetOptions, Seq,
};
use burrow_core::error::{BurrowError, Result};
use burrow_core::merge::{is_deleted, merge_tree, winning_rev};
use burrow_core::rev_tree::{self, NodeOpts, RevPath, RevStatus, RevTree};
use burrow_core::revision::{is_valid_doc_id, Revision};

#[derive(Debug, Clone, Default)]
struct RevBody {
    json: Option<serde_json::Value>,
    attachments: HashMap<String, AttachmentRecord>,
}

#[derive(Debug, Default)]
struct DocEntry {
    tree: RevTree,
    bodies: HashMap<Revision, RevBody>,
    last_seq: u64,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, DocEntry>,
    locals: HashMap<String, serde_json::Value>,
    blobs: HashMap<[u8; 20], Vec<u8>>,
    seq_counter: u64,
    /// Dedicated by-seq index: a write replaces the document's prior entry,
    /// matching CouchDB's by_seq btree semantics.
    seq_to_doc: BTreeMap<u64, String>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq_counter += 1;
        self.seq_counter
    }

    fn bump_doc_seq(&mut self, doc_id: &str, seq: u64, prior: Option<u64>) {
        if let Some(old) = prior {
            self.seq_to_doc.remove(&old);
        }
        self.seq_to_doc.insert(seq, doc_id.to_string());
    }
}

pub struct MemoryAdapter {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new("memory")
    }
}

fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut key = [0u8; 20];
    key.copy_from_slice(&digest);
    key
}

/// Resolve the attachments carried on a new write: stub attachments are
/// copied forward from the parent revision's record; non-stub attachments
/// are written to the blob map (decoding inline `data` if present).
fn resolve_attachments(
    inner: &mut Inner,
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
            let record = inner
                .docs
                .get(doc_id)
                .and_then(|e| e.bodies.get(parent_rev))
                .and_then(|b| b.attachments.get(&name))
                .cloned()
                .ok_or_else(|| {
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
        inner.blobs.entry(key).or_insert(bytes);
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

#[async_trait]
impl Adapter for MemoryAdapter {
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

        let mut inner = self.inner.lock().await;

        match &prev_rev {
            Some(parent) => {
                let entry = inner.docs.get(doc_id).ok_or(BurrowError::Conflict)?;
                let node = rev_tree::find_node(&entry.tree, parent.generation, &parent.suffix)
                    .ok_or(BurrowError::Conflict)?;
                if !node.is_leaf() && !opts.allow_conflict {
                    return Err(BurrowError::Conflict);
                }
            }
            None => {
                if !opts.allow_conflict {
                    let has_leaf = inner
                        .docs
                        .get(doc_id)
                        .map(|e| rev_tree::collect_leaves(&e.tree).iter().any(|l| !l.deleted))
                        .unwrap_or(false);
                    if has_leaf {
                        return Err(BurrowError::Conflict);
                    }
                }
            }
        }

        let resolved = resolve_attachments(&mut inner, doc_id, prev_rev.as_ref(), rev.generation, attachments)?;

        let entry = inner.docs.entry(doc_id.to_string()).or_default();
        let new_path = RevPath {
            pos: rev.generation,
            tree: rev_tree::RevNode {
                hash: rev.suffix.clone(),
                status: RevStatus::Available,
                opts: NodeOpts { deleted: false },
                children: vec![],
            },
        };
        let (merged, _) = merge_tree(&entry.tree, &new_path, 1000);
        entry.tree = merged;
        entry.bodies.insert(
            rev.clone(),
            RevBody {
                json: Some(body),
                attachments: resolved,
            },
        );

        let prior = if entry.last_seq > 0 { Some(entry.last_seq) } else { None };
        let seq = inner.next_seq();
        let entry = inner.docs.get_mut(doc_id).unwrap();
        entry.last_seq = seq;
        inner.bump_doc_seq(doc_id, seq, prior);

        Ok(rev)
    }

    async fn delete(&self, doc_id: &str, prev_rev: Revision) -> Result<Revision> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?;
        let node = rev_tree::find_node(&entry.tree, prev_rev.generation, &prev_rev.suffix)
            .ok_or(BurrowError::Conflict)?;
        if !node.is_leaf() {
            return Err(BurrowError::Conflict);
        }
        if node.opts.deleted {
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

        let entry = inner.docs.get_mut(doc_id).unwrap();
        let (merged, _) = merge_tree(&entry.tree, &new_path, 1000);
        entry.tree = merged;
        entry.bodies.insert(new_rev.clone(), RevBody::default());

        let prior = Some(entry.last_seq);
        let seq = inner.next_seq();
        let entry = inner.docs.get_mut(doc_id).unwrap();
        entry.last_seq = seq;
        inner.bump_doc_seq(doc_id, seq, prior);

        Ok(new_rev)
    }

    async fn delete_by_id(&self, doc_id: &str) -> Result<Vec<Revision>> {
        let mut inner = self.inner.lock().await;
        let leaves = {
            let entry = inner
                .docs
                .get(doc_id)
                .ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?;
            rev_tree::collect_leaves(&entry.tree)
        };

        let mut tombstones = Vec::new();
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
            let entry = inner.docs.get_mut(doc_id).unwrap();
            let (merged, _) = merge_tree(&entry.tree, &new_path, 1000);
            entry.tree = merged;
            entry.bodies.insert(new_rev.clone(), RevBody::default());
            tombstones.push(new_rev);
        }

        if !tombstones.is_empty() {
            let entry = inner.docs.get_mut(doc_id).unwrap();
            let prior = Some(entry.last_seq);
            let seq = inner.next_seq();
            entry.last_seq = seq;
            inner.bump_doc_seq(doc_id, seq, prior);
        }

        Ok(tombstones)
    }

    async fn get(&self, doc_id: &str, opts: GetOptions) -> Result<Document> {
        let inner = self.inner.lock().await;
        let entry = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?;

        let target = match &opts.rev {
            Some(rev_str) => rev_str.parse::<Revision>()?,
            None => winning_rev(&entry.tree).ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?,
        };

        let node = rev_tree::find_node(&entry.tree, target.generation, &target.suffix)
            .ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?;

        if node.opts.deleted && opts.rev.is_none() {
            return Err(BurrowError::Deleted(doc_id.to_string()));
        }

        let body = entry
            .bodies
            .get(&target)
            .ok_or_else(|| BurrowError::NotFound(format!("{doc_id}@{target} body unavailable")))?;

        let mut data = body.json.clone().unwrap_or_else(|| serde_json::json!({}));

        if opts.conflicts {
            let conflicts: Vec<String> = rev_tree::collect_leaves(&entry.tree)
                .into_iter()
                .map(|l| l.revision())
                .filter(|r| *r != target && !rev_tree::find_node(&entry.tree, r.generation, &r.suffix).is_some_and(|n| n.opts.deleted))
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
        doc.rev = Some(target.clone());
        doc.deleted = node.opts.deleted;

        if opts.attachments || !body.attachments.is_empty() {
            doc.attachments = body
                .attachments
                .values()
                .map(|r| (r.filename.clone(), attachment_record_to_meta(r)))
                .collect();
        }

        Ok(doc)
    }

    async fn force_insert(&self, doc: Document, history: History, _source: Option<String>) -> Result<()> {
        if history.is_empty() {
            return Err(BurrowError::BadRequest("force_insert requires a non-empty history".into()));
        }
        let leaf_rev = doc.rev.clone().ok_or_else(|| {
            BurrowError::BadRequest("force_insert requires the document to carry its revision".into())
        })?;
        if history[0] != leaf_rev {
            return Err(BurrowError::BadRequest(
                "force_insert history must start with the document's own revision".into(),
            ));
        }

        let mut inner = self.inner.lock().await;
        let doc_id = doc.id.clone();
        let entry = inner.docs.entry(doc_id.clone()).or_default();

        if rev_tree::find_node(&entry.tree, leaf_rev.generation, &leaf_rev.suffix).is_some() {
            // Idempotent: revision already present.
            return Ok(());
        }

        let hashes: Vec<String> = history.iter().map(|r| r.suffix.clone()).collect();
        let new_path = rev_tree::build_stub_chain(
            leaf_rev.generation,
            &hashes,
            RevStatus::Available,
            NodeOpts { deleted: doc.deleted },
        );
        let (merged, _) = merge_tree(&entry.tree, &new_path, 1000);
        entry.tree = merged;

        let immediate_parent = history.get(1);
        let resolved = resolve_attachments(
            &mut inner,
            &doc_id,
            immediate_parent,
            leaf_rev.generation,
            doc.attachments.clone(),
        )?;
        let entry = inner.docs.get_mut(&doc_id).unwrap();
        entry.bodies.insert(
            leaf_rev.clone(),
            RevBody {
                json: Some(doc.data.clone()),
                attachments: resolved,
            },
        );

        let prior = if entry.last_seq > 0 { Some(entry.last_seq) } else { None };
        let seq = inner.next_seq();
        let entry = inner.docs.get_mut(&doc_id).unwrap();
        entry.last_seq = seq;
        inner.bump_doc_seq(&doc_id, seq, prior);

        Ok(())
    }

    async fn find_missing(&self, revs: &[(String, Revision)]) -> Result<Vec<(String, Revision)>> {
        let inner = self.inner.lock().await;
        let mut missing = Vec::new();
        for (doc_id, rev) in revs {
            let present = inner
                .docs
                .get(doc_id)
                .map(|e| rev_tree::find_node(&e.tree, rev.generation, &rev.suffix).is_some())
                .unwrap_or(false);
            if !present {
                missing.push((doc_id.clone(), rev.clone()));
            }
        }
        Ok(missing)
    }

    async fn changes_since(&self, options: ChangesOptions) -> Result<ChangesResponse> {
        let inner = self.inner.lock().await;
        let since = options.since.as_num();
        let mut results = Vec::new();
        let mut last_seq = options.since.clone();

        for (&seq, doc_id) in inner.seq_to_doc.range(since + 1..) {
            if let Some(ids) = &options.doc_ids {
                if !ids.contains(doc_id) {
                    continue;
                }
            }
            let entry = match inner.docs.get(doc_id) {
                Some(e) => e,
                None => continue,
            };

            let leaves = rev_tree::collect_leaves(&entry.tree);
            let winner = match leaves.first() {
                Some(w) => w,
                None => continue,
            };

            let changes = if options.style_all_docs {
                leaves.iter().map(|l| ChangeRev { rev: l.revision().to_string() }).collect()
            } else {
                vec![ChangeRev { rev: winner.revision().to_string() }]
            };

            let winner_rev = winner.revision();
            let body = inner.docs.get(doc_id).and_then(|e| e.bodies.get(&winner_rev)).and_then(|b| b.json.clone());

            if let Some(selector) = &options.selector {
                match &body {
                    Some(json) if burrow_core::selector::matches(json, selector) => {}
                    _ => continue,
                }
            }

            let doc_json = if options.include_docs { body } else { None };

            results.push(ChangeEvent {
                seq: Seq::Num(seq),
                id: doc_id.clone(),
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
        let inner = self.inner.lock().await;
        let total_rows = inner.docs.len() as u64;

        let mut rows = Vec::new();
        if let Some(keys) = &options.keys {
            for key in keys {
                match inner.docs.get(key) {
                    Some(entry) => {
                        let leaves = rev_tree::collect_leaves(&entry.tree);
                        match leaves.first() {
                            Some(winner) if !winner.deleted || options.include_docs => {
                                rows.push(all_docs_row(key, winner, entry, options.include_docs));
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
                    None => rows.push(AllDocsRow {
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

        let mut ids: Vec<&String> = inner.docs.keys().collect();
        if options.descending {
            ids.reverse();
        }

        for id in ids {
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

            let entry = inner.docs.get(id).unwrap();
            let leaves = rev_tree::collect_leaves(&entry.tree);
            if let Some(winner) = leaves.first() {
                if !winner.deleted {
                    rows.push(all_docs_row(id, winner, entry, options.include_docs));
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
        let inner = self.inner.lock().await;
        let entry = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| BurrowError::NotFound(doc_id.to_string()))?;
        rev_tree::path_to_root(&entry.tree, rev.generation, &rev.suffix)
            .ok_or_else(|| BurrowError::NotFound(format!("{doc_id}@{rev}")))
    }

    async fn possible_ancestors(&self, doc_id: &str, limit: usize) -> Result<Vec<Revision>> {
        let inner = self.inner.lock().await;
        let entry = match inner.docs.get(doc_id) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };

        let mut candidates: Vec<Revision> = rev_tree::collect_all(&entry.tree)
            .into_iter()
            .filter(|(_, _, status, _)| *status == RevStatus::Available)
            .map(|(rev, _, _, _)| rev)
            .filter(|rev| entry.bodies.contains_key(rev))
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let mut keep_keys = std::collections::HashSet::new();
        let doc_ids: Vec<String> = inner.docs.keys().cloned().collect();
        for doc_id in &doc_ids {
            let entry = inner.docs.get_mut(doc_id).unwrap();
            let leaf_revs: std::collections::HashSet<Revision> = rev_tree::collect_leaves(&entry.tree)
                .into_iter()
                .map(|l| l.revision())
                .collect();

            for (rev, body) in entry.bodies.iter_mut() {
                if leaf_revs.contains(rev) {
                    for record in body.attachments.values() {
                        keep_keys.insert(record.key);
                    }
                } else {
                    body.json = None;
                    body.attachments.clear();
                }
            }
        }

        inner.blobs.retain(|key, _| keep_keys.contains(key));
        Ok(())
    }

    async fn info(&self) -> Result<DbInfo> {
        let inner = self.inner.lock().await;
        let doc_count = inner
            .docs
            .values()
            .filter(|e| !is_deleted(&e.tree))
            .count() as u64;
        Ok(DbInfo {
            db_name: self.name.clone(),
            doc_count,
            update_seq: Seq::Num(inner.seq_counter),
        })
    }

    async fn all_document_ids(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.docs.keys().cloned().collect())
    }

    async fn get_local(&self, doc_id: &str) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.locals.get(doc_id).cloned())
    }

    async fn put_local(&self, doc_id: &str, data: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.locals.insert(doc_id.to_string(), data);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
        Ok(())
    }

    async fn store_attachment_bytes(&self, bytes: &[u8]) -> Result<[u8; 20]> {
        let key = sha1_of(bytes);
        let mut inner = self.inner.lock().await;
        inner.blobs.entry(key).or_insert_with(|| bytes.to_vec());
        Ok(key)
    }

    async fn read_attachment_bytes(&self, key: &[u8; 20]) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .blobs
            .get(key)
            .cloned()
            .ok_or_else(|| BurrowError::NotFound("attachment blob not found".to_string()))
    }
}

fn all_docs_row(
    id: &str,
    winner: &rev_tree::LeafInfo,
    entry: &DocEntry,
    include_docs: bool,
) -> AllDocsRow {
    let doc = if include_docs {
        entry.bodies.get(&winner.revision()).and_then(|b| b.json.clone()).map(|data| {
            let mut doc = Document::new(id, data);
            doc.rev = Some(winner.revision());
            doc.to_json()
        })
    } else {
        None
    };
    AllDocsRow {
        id: id.to_string(),
        key: id.to_string(),
        value: Some(AllDocsRowValue {
            rev: winner.revision().to_string(),
            deleted: if winner.deleted { Some(true) } else { None },
        }),
        doc,
        error: None,
    }
}

/// Deterministic child suffix, matching the facade's own `generation - 1`
/// derivation scheme: an MD5 of the parent suffix plus a marker, so replicas
/// that perform the same tombstone independently converge on the same id.
fn tombstone_suffix(doc_id: &str, parent: &Revision) -> String {
    use md5::{Digest as _, Md5};
    let mut hasher = Md5::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(parent.to_string().as_bytes());
    hasher.update(b"deleted");
    hex::encode(hasher.finalize())
}
