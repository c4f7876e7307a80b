//! The replication state machine shared by [`crate::pull::PullReplicator`]
//! and [`crate::push::PushReplicator`]: drain a changes feed in batches,
//! route each candidate revision to a bulk fetch path when one's available,
//! fall back to a single-document fetch otherwise, and `force_insert` the
//! result — every branch, no local conflict resolution (`DESIGN.md` Open
//! Question 1).
//!
//! Pull and push are the same algorithm with the roles of `source` and
//! `target` swapped; a local-to-local transfer (memory to redb, say) is
//! the same algorithm again with neither side speaking HTTP. One engine
//! covers all three.

use std::collections::HashMap;

use base64::Engine as _;
use burrow_adapter_http::{ChangeTracker, ChangesRequest};
use burrow_core::adapter::{Adapter, History};
use burrow_core::document::{BulkGetRequestDoc, ChangesOptions, Document, GetOptions, Seq};
use burrow_core::error::{BurrowError, Result};
use burrow_core::revision::Revision;

use crate::multipart::parse_document_response;
use crate::pending::PendingSequences;
use crate::peer::Peer;
use crate::{ReplicationOptions, ReplicationResult};

/// Revisions per `_bulk_get`/`_all_docs?include_docs=true` request.
const BULK_CHUNK: usize = 50;

/// A changes-feed candidate, carrying the fake sequence
/// [`PendingSequences`] assigned it so completion can be reported back in
/// any order the dispatch happens to finish in.
struct Queued {
    doc_id: String,
    rev: Revision,
    fake_seq: u64,
    deleted: bool,
}

pub async fn run(source: &Peer, target: &Peer, opts: &ReplicationOptions) -> Result<ReplicationResult> {
    let target_adapter = target.adapter();
    let checkpoint_id = opts
        .checkpoint_id
        .clone()
        .unwrap_or_else(|| crate::derive_checkpoint_id(source.name(), target.name(), "replicate"));

    let mut since = target_adapter
        .get_local(&checkpoint_id)
        .await?
        .and_then(|v| v.get("seq").cloned())
        .map(|v| serde_json::from_value(v).unwrap_or(Seq::zero()))
        .unwrap_or(Seq::zero());

    let tracker = match source {
        Peer::Http(h) => Some(ChangeTracker::new(h.clone())),
        Peer::Local(_) => None,
    };
    let supports_bulk_get = match source {
        Peer::Http(h) => h.probe_bulk_get().await.unwrap_or(false),
        Peer::Local(_) => false,
    };

    tracing::debug!(source = source.name(), target = target.name(), since = %since.to_query_string(), "starting replication batch loop");

    let mut docs_read: u64 = 0;
    let mut docs_written: u64 = 0;
    let mut docs_failed: u64 = 0;
    let mut pending = PendingSequences::new();

    loop {
        let batch = match (&tracker, source) {
            (Some(tracker), Peer::Http(_)) => {
                tracker
                    .poll(&ChangesRequest {
                        since: since.clone(),
                        limit: Some(opts.batch_size),
                        doc_ids: opts.doc_ids.clone(),
                        selector: opts.selector.clone(),
                        ..Default::default()
                    })
                    .await?
            }
            (None, Peer::Local(a)) => {
                a.changes_since(ChangesOptions {
                    since: since.clone(),
                    limit: Some(opts.batch_size),
                    style_all_docs: true,
                    doc_ids: opts.doc_ids.clone(),
                    selector: opts.selector.clone(),
                    ..Default::default()
                })
                .await?
            }
            _ => unreachable!("tracker is Some iff source is Peer::Http"),
        };

        if batch.results.is_empty() {
            break;
        }
        let batch_exhausted = (batch.results.len() as u64) < opts.batch_size;

        // Every candidate gets a fake sequence, not just the ones that
        // survive `find_missing` below — otherwise a batch that turns out
        // to be entirely already present on the target never advances the
        // checkpoint, since nothing would ever complete.
        let mut queued = Vec::new();
        for change in &batch.results {
            for c in &change.changes {
                let Ok(rev) = c.rev.parse::<Revision>() else { continue };
                let fake_seq = pending.assign(change.seq.clone());
                queued.push(Queued { doc_id: change.id.clone(), rev, fake_seq, deleted: change.deleted });
            }
        }

        let candidates: Vec<(String, Revision)> =
            queued.iter().map(|q| (q.doc_id.clone(), q.rev.clone())).collect();
        let missing = target_adapter.find_missing(&candidates).await?;
        let missing_set: std::collections::HashSet<(String, Revision)> = missing.into_iter().collect();

        let mut bulk_get_queue = Vec::new();
        let mut all_docs_queue = Vec::new();
        let mut single_queue = Vec::new();
        for q in queued {
            if !missing_set.contains(&(q.doc_id.clone(), q.rev.clone())) {
                // Already present on the target; nothing to fetch.
                pending.complete(q.fake_seq);
                continue;
            }
            if supports_bulk_get {
                bulk_get_queue.push(q);
            } else if q.rev.generation == 1 && !q.deleted {
                all_docs_queue.push(q);
            } else {
                single_queue.push(q);
            }
        }

        let mut downloads: Vec<(u64, Document, History)> = Vec::new();

        if !bulk_get_queue.is_empty() {
            let (fetched, rest) = dispatch_bulk_get(source, bulk_get_queue).await?;
            downloads.extend(fetched);
            single_queue.extend(rest);
        }
        if !all_docs_queue.is_empty() {
            let (fetched, rest) = dispatch_all_docs(source, all_docs_queue).await?;
            downloads.extend(fetched);
            single_queue.extend(rest);
        }
        for q in single_queue {
            let (doc, history) = fetch_one(source, target, target_adapter.as_ref(), &q.doc_id, &q.rev).await?;
            downloads.push((q.fake_seq, doc, history));
        }
        docs_read += downloads.len() as u64;

        downloads.sort_by_key(|(fake_seq, _, _)| *fake_seq);
        for (fake_seq, doc, history) in downloads {
            match target_adapter.force_insert(doc, history, Some(source.name().to_string())).await {
                Ok(()) => {
                    docs_written += 1;
                    pending.complete(fake_seq);
                }
                Err(BurrowError::Forbidden(reason)) => {
                    tracing::warn!(fake_seq, reason = %reason, "target rejected revision via validate_doc_update, skipping");
                    docs_failed += 1;
                    pending.complete(fake_seq);
                }
                Err(err) => return Err(err),
            }

            if let Some(advanced) = pending.advance() {
                target_adapter.put_local(&checkpoint_id, serde_json::json!({ "seq": advanced })).await?;
            }
        }

        since = batch.last_seq.clone();
        target_adapter
            .put_local(&checkpoint_id, serde_json::json!({ "seq": since }))
            .await?;

        if batch_exhausted {
            break;
        }
    }

    tracing::debug!(source = source.name(), target = target.name(), docs_read, docs_written, docs_failed, "replication batch loop finished");
    Ok(ReplicationResult { ok: true, docs_read, docs_written, docs_failed })
}

/// Fetch a chunk of same-peer revisions via `_bulk_get`, in groups of
/// [`BULK_CHUNK`]. Anything the response didn't actually resolve (not
/// present, or a parse failure) is returned as `leftover` for the
/// single-document fallback.
async fn dispatch_bulk_get(source: &Peer, queue: Vec<Queued>) -> Result<(Vec<(u64, Document, History)>, Vec<Queued>)> {
    let Peer::Http(http) = source else {
        return Ok((Vec::new(), queue));
    };

    let mut fetched = Vec::new();
    let mut leftover = Vec::new();
    for chunk in queue.chunks(BULK_CHUNK) {
        let request_docs: Vec<BulkGetRequestDoc> = chunk
            .iter()
            .map(|q| BulkGetRequestDoc { id: q.doc_id.clone(), rev: Some(q.rev.to_string()), atts_since: vec![] })
            .collect();
        let resp = http.bulk_get(request_docs).await?;

        let mut by_id: HashMap<String, serde_json::Value> = HashMap::new();
        for result in resp.results {
            for bulk_doc in result.docs {
                if let Some(value) = bulk_doc.ok {
                    by_id.insert(result.id.clone(), value);
                }
            }
        }

        for q in chunk {
            match by_id.remove(&q.doc_id) {
                Some(mut value) => {
                    let history = crate::multipart::take_history(&mut value, &q.rev);
                    match Document::from_json(value) {
                        Ok(doc) => fetched.push((q.fake_seq, doc, history)),
                        Err(_) => leftover.push(requeue(q)),
                    }
                }
                None => leftover.push(requeue(q)),
            }
        }
    }
    Ok((fetched, leftover))
}

/// Fetch a chunk of generation-1, non-deleted revisions via
/// `_all_docs?include_docs=true`, in groups of [`BULK_CHUNK`]. Only rows
/// whose `_rev` matches the requested revision and that carry no
/// attachments are accepted from this path — anything else falls back to
/// a single-document fetch, which can resolve stub attachments properly.
async fn dispatch_all_docs(source: &Peer, queue: Vec<Queued>) -> Result<(Vec<(u64, Document, History)>, Vec<Queued>)> {
    let Peer::Http(http) = source else {
        return Ok((Vec::new(), queue));
    };

    let mut fetched = Vec::new();
    let mut leftover = Vec::new();
    for chunk in queue.chunks(BULK_CHUNK) {
        let keys: Vec<String> = chunk.iter().map(|q| q.doc_id.clone()).collect();
        let resp = http.all_docs_by_keys(&keys).await?;
        let mut by_id: HashMap<String, serde_json::Value> = HashMap::new();
        if let Some(rows) = resp.get("rows").and_then(|v| v.as_array()) {
            for row in rows {
                let Some(doc) = row.get("doc") else { continue };
                if doc.is_null() {
                    continue;
                }
                if let Some(id) = row.get("id").and_then(|v| v.as_str()) {
                    by_id.insert(id.to_string(), doc.clone());
                }
            }
        }

        for q in chunk {
            let accepted = by_id.get(&q.doc_id).filter(|doc| {
                let rev_matches = doc.get("_rev").and_then(|v| v.as_str()) == Some(q.rev.to_string().as_str());
                let no_attachments = doc.get("_attachments").map(|v| v.is_null()).unwrap_or(true);
                rev_matches && no_attachments
            });
            match accepted {
                Some(value) => match Document::from_json(value.clone()) {
                    Ok(doc) => fetched.push((q.fake_seq, doc, vec![q.rev.clone()])),
                    Err(_) => leftover.push(requeue(q)),
                },
                None => leftover.push(requeue(q)),
            }
        }
    }
    Ok((fetched, leftover))
}

fn requeue(q: &Queued) -> Queued {
    Queued { doc_id: q.doc_id.clone(), rev: q.rev.clone(), fake_seq: q.fake_seq, deleted: q.deleted }
}

/// Fetch one document's current body plus its full ancestor history from
/// `source`, resolving any stub attachments in a way `target` can accept.
/// Only reached for a revision the batched dispatch above already gave up
/// on (or never tried, when bulk fetching isn't available at all), so it
/// never attempts `_bulk_get` itself.
async fn fetch_one(
    source: &Peer,
    target: &Peer,
    target_adapter: &dyn Adapter,
    doc_id: &str,
    rev: &Revision,
) -> Result<(Document, History)> {
    match source {
        Peer::Http(http) => {
            let ancestors: Vec<String> = target_adapter
                .possible_ancestors(doc_id, 32)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|r| r.to_string())
                .collect();
            let (content_type, body) = http.get_doc_raw(doc_id, &rev.to_string(), &ancestors).await?;
            parse_document_response(&content_type, &body, rev, target_adapter).await
        }
        Peer::Local(source_adapter) => {
            let history = source_adapter.revision_history(doc_id, rev).await?;
            let mut doc = source_adapter
                .get(doc_id, GetOptions { rev: Some(rev.to_string()), attachments: true, ..Default::default() })
                .await?;
            doc.rev = Some(rev.clone());

            let names: Vec<String> = doc
                .attachments
                .iter()
                .filter(|(_, meta)| meta.stub)
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                let key = doc.attachments[&name].digest_key()?;
                let bytes = source_adapter.read_attachment_bytes(&key).await?;
                let meta = doc.attachments.get_mut(&name).expect("checked above");
                match target {
                    Peer::Http(_) => {
                        meta.data = Some(base64::engine::general_purpose::STANDARD.encode(&bytes));
                        meta.stub = false;
                    }
                    Peer::Local(_) => {
                        let resolved = target_adapter.store_attachment_bytes(&bytes).await?;
                        meta.resolved_key = Some(resolved);
                        meta.stub = false;
                    }
                }
            }

            Ok((doc, history))
        }
    }
}
