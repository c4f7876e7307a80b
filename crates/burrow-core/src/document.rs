//! JSON document shape and the request/response option structs shared by
//! every storage adapter and by the replication crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};
use crate::revision::Revision;

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// How an attachment's bytes are stored relative to its logical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentEncoding {
    None,
    Gzip,
}

impl Default for AttachmentEncoding {
    fn default() -> Self {
        AttachmentEncoding::None
    }
}

/// Wire-format attachment metadata, as it appears inside a document's
/// `_attachments` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub content_type: String,
    /// `sha1-<base64>`, CouchDB's wire digest format.
    pub digest: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "is_none_encoding")]
    pub encoding: AttachmentEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_length: Option<u64>,
    #[serde(default)]
    pub revpos: u64,
    #[serde(default)]
    pub stub: bool,
    #[serde(default)]
    pub follows: bool,
    /// Inline base64 body, present only for small attachments sent whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Set internally once the attachment's bytes have already been written
    /// to the destination adapter's blob store (by the multipart reader
    /// streaming a `follows: true` part straight through). Never appears on
    /// the wire; when present, `force_insert`/`put` skip both the stub-copy
    /// and inline-decode paths and record this key directly.
    #[serde(skip)]
    pub resolved_key: Option<[u8; 20]>,
}

fn is_none_encoding(e: &AttachmentEncoding) -> bool {
    matches!(e, AttachmentEncoding::None)
}

impl AttachmentMeta {
    /// Decode the inline `data` field (base64), for small attachments sent
    /// whole inside the document body instead of `follows: true`.
    pub fn decode_inline_data(&self) -> Result<Vec<u8>> {
        use base64::Engine;
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| BurrowError::BadRequest("attachment has no inline data".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| BurrowError::BadRequest(format!("invalid attachment data: {e}")))
    }

    /// Parse the wire digest (`sha1-<base64>`) into the raw 20-byte key.
    pub fn digest_key(&self) -> Result<[u8; 20]> {
        use base64::Engine;
        let b64 = self.digest.strip_prefix("sha1-").ok_or_else(|| {
            BurrowError::BadRequest(format!("unsupported attachment digest {}", self.digest))
        })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| BurrowError::BadRequest(format!("invalid attachment digest: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| BurrowError::BadRequest("attachment digest is not 20 bytes".into()))
    }

    /// Format a blob key as the wire digest (`sha1-<base64>`).
    pub fn digest_from_key(key: &[u8; 20]) -> String {
        use base64::Engine;
        format!("sha1-{}", base64::engine::general_purpose::STANDARD.encode(key))
    }
}

/// The engine's internal record of a stored attachment: `(sequence,
/// filename)` identifies it; `key` is the SHA-1 of the decoded content and
/// is what addresses the blob in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub filename: String,
    pub content_type: String,
    pub length: u64,
    pub revpos: u64,
    pub encoding: AttachmentEncoding,
    pub encoded_length: Option<u64>,
    pub key: [u8; 20],
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A document as exchanged with callers: JSON body plus the CouchDB-style
/// underscore-prefixed metadata pulled out into typed fields.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub rev: Option<Revision>,
    pub deleted: bool,
    pub data: serde_json::Value,
    pub attachments: HashMap<String, AttachmentMeta>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Document {
            id: id.into(),
            rev: None,
            deleted: false,
            data,
            attachments: HashMap::new(),
        }
    }

    /// Parse `_id`/`_rev`/`_deleted`/`_attachments` out of a JSON object,
    /// leaving the remaining fields as `data`. Fails if the value isn't an
    /// object, or if a remaining field starts with `_`.
    pub fn from_json(mut value: serde_json::Value) -> Result<Self> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| BurrowError::BadRequest("document must be a JSON object".into()))?;

        let id = obj
            .remove("_id")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();

        let rev = obj
            .remove("_rev")
            .and_then(|v| v.as_str().map(String::from))
            .map(|s| s.parse::<Revision>())
            .transpose()?;

        let deleted = obj
            .remove("_deleted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let attachments: HashMap<String, AttachmentMeta> = obj
            .remove("_attachments")
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        if let Some(bad) = obj.keys().find(|k| k.starts_with('_')) {
            return Err(BurrowError::BadRequest(format!(
                "document body may not contain reserved field {bad}"
            )));
        }

        Ok(Document {
            id,
            rev,
            deleted,
            data: value,
            attachments,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = match &self.data {
            serde_json::Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };

        obj.insert("_id".into(), serde_json::Value::String(self.id.clone()));

        if let Some(rev) = &self.rev {
            obj.insert("_rev".into(), serde_json::Value::String(rev.to_string()));
        }

        if self.deleted {
            obj.insert("_deleted".into(), serde_json::Value::Bool(true));
        }

        if !self.attachments.is_empty() {
            obj.insert(
                "_attachments".into(),
                serde_json::to_value(&self.attachments).unwrap(),
            );
        }

        serde_json::Value::Object(obj)
    }

    /// Validate the body in isolation from id/rev handling: must be a JSON
    /// object, and no key may begin with `_`.
    pub fn validate_body(body: &serde_json::Value) -> Result<()> {
        let obj = body
            .as_object()
            .ok_or_else(|| BurrowError::BadRequest("document body must be a JSON object".into()))?;
        if let Some(bad) = obj.keys().find(|k| k.starts_with('_')) {
            return Err(BurrowError::BadRequest(format!(
                "document body may not contain reserved field {bad}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sequence — numeric locally, opaque remotely
// ---------------------------------------------------------------------------

/// A database sequence identifier.
///
/// Local adapters assign monotonically increasing numeric sequences. Remote
/// CouchDB-style peers hand back opaque tokens (strings, sometimes arrays or
/// objects) that must be forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    Num(u64),
    Opaque(serde_json::Value),
}

impl Seq {
    pub fn zero() -> Self {
        Seq::Num(0)
    }

    pub fn as_num(&self) -> u64 {
        match self {
            Seq::Num(n) => *n,
            Seq::Opaque(v) => v
                .as_str()
                .and_then(|s| s.split('-').next())
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Format for use in an HTTP query parameter: a bare number for `Num`,
    /// the string form otherwise (the caller percent-escapes as needed).
    pub fn to_query_string(&self) -> String {
        match self {
            Seq::Num(n) => n.to_string(),
            Seq::Opaque(serde_json::Value::String(s)) => s.clone(),
            Seq::Opaque(v) => v.to_string(),
        }
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::Num(0)
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Num(n)
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Seq::Num(n) => write!(f, "{n}"),
            Seq::Opaque(serde_json::Value::String(s)) => write!(f, "{s}"),
            Seq::Opaque(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CRUD option / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub rev: Option<String>,
    pub attachments: bool,
    pub conflicts: bool,
    pub revs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

/// Options for [`crate::adapter::Adapter::get_attachment`]; a `None` rev
/// reads off the winning revision.
#[derive(Debug, Clone, Default)]
pub struct GetAttachmentOptions {
    pub rev: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPutResult {
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocResult {
    pub ok: bool,
    pub id: String,
    pub rev: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub keys: Option<Vec<String>>,
    pub include_docs: bool,
    pub descending: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    pub inclusive_end: bool,
}

impl AllDocsOptions {
    pub fn new() -> Self {
        Self {
            inclusive_end: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsRowValue {
    pub rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<AllDocsRowValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsResponse {
    pub total_rows: u64,
    pub offset: u64,
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: Seq,
}

// ---------------------------------------------------------------------------
// Changes feed types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub since: Seq,
    pub limit: Option<u64>,
    pub include_docs: bool,
    /// Include every conflicting leaf, not just the winner (`?style=all_docs`).
    pub style_all_docs: bool,
    pub doc_ids: Option<Vec<String>>,
    /// A Mango-style equality/containment selector evaluated client-side
    /// against each candidate document's body; only matching changes are
    /// returned. `None` means no filtering.
    pub selector: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: Seq,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeEvent>,
    pub last_seq: Seq,
}

// ---------------------------------------------------------------------------
// Local documents
// ---------------------------------------------------------------------------

/// A `_local/`-style document: id alone, single revision, never replicated.
/// Used for replication checkpoints and other client-side bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDocument {
    pub id: String,
    pub rev: u64,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Replication wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkGetRequestDoc {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub atts_since: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkGetResponse {
    pub results: Vec<BulkGetResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkGetResult {
    pub id: String,
    pub docs: Vec<BulkGetDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkGetDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BulkGetError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkGetError {
    pub id: String,
    pub rev: String,
    pub error: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_from_json_roundtrip() {
        let json = serde_json::json!({
            "_id": "doc1",
            "_rev": "1-abc",
            "name": "Alice",
            "age": 30
        });

        let doc = Document::from_json(json).unwrap();
        assert_eq!(doc.id, "doc1");
        assert_eq!(doc.rev.as_ref().unwrap().to_string(), "1-abc");
        assert_eq!(doc.data["name"], "Alice");
        assert!(!doc.data.as_object().unwrap().contains_key("_id"));

        let back = doc.to_json();
        assert_eq!(back["_id"], "doc1");
        assert_eq!(back["_rev"], "1-abc");
        assert_eq!(back["name"], "Alice");
    }

    #[test]
    fn document_from_json_minimal() {
        let json = serde_json::json!({"hello": "world"});
        let doc = Document::from_json(json).unwrap();
        assert!(doc.id.is_empty());
        assert!(doc.rev.is_none());
        assert!(!doc.deleted);
    }

    #[test]
    fn document_rejects_underscore_fields() {
        let json = serde_json::json!({"_weird": 1});
        assert!(Document::from_json(json).is_err());
    }

    #[test]
    fn validate_body_rejects_non_object() {
        assert!(Document::validate_body(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn validate_body_accepts_empty_object() {
        assert!(Document::validate_body(&serde_json::json!({})).is_ok());
    }

    #[test]
    fn seq_query_string_formats_opaque_string() {
        let seq = Seq::Opaque(serde_json::json!("13-g1AAAA"));
        assert_eq!(seq.to_query_string(), "13-g1AAAA");
        assert_eq!(seq.as_num(), 13);
    }

    #[test]
    fn seq_default_is_zero() {
        assert_eq!(Seq::default(), Seq::Num(0));
    }

    #[test]
    fn attachment_digest_key_round_trips() {
        let key = [7u8; 20];
        let digest = AttachmentMeta::digest_from_key(&key);
        assert!(digest.starts_with("sha1-"));
        let meta = AttachmentMeta {
            content_type: "text/plain".into(),
            digest,
            length: 0,
            encoding: AttachmentEncoding::None,
            encoded_length: None,
            revpos: 1,
            stub: true,
            follows: false,
            data: None,
            resolved_key: None,
        };
        assert_eq!(meta.digest_key().unwrap(), key);
    }

    #[test]
    fn attachment_inline_data_decodes_base64() {
        let meta = AttachmentMeta {
            content_type: "text/plain".into(),
            digest: "sha1-deadbeef".into(),
            length: 5,
            encoding: AttachmentEncoding::None,
            encoded_length: None,
            revpos: 1,
            stub: false,
            follows: false,
            data: Some("aGVsbG8=".into()),
            resolved_key: None,
        };
        assert_eq!(meta.decode_inline_data().unwrap(), b"hello");
    }
}
