//! Core types, the revision tree algorithm, and the `Adapter` trait shared
//! by every Burrow storage backend.

pub mod adapter;
pub mod document;
pub mod error;
pub mod merge;
pub mod rev_tree;
pub mod revision;
pub mod selector;

pub use adapter::{Adapter, History, PutOptions};
pub use document::{AttachmentPutResult, Document, GetAttachmentOptions};
pub use error::{BurrowError, Result};
pub use revision::{Revision, compute_suffix, is_valid_doc_id};
